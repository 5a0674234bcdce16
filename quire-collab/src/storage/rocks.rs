//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: Latest snapshot per document (bincode + LZ4)
//! - `oplog`    : Canonical operations (bincode + LZ4, keyed by doc_id:revision)
//! - `metadata` : Document metadata (bincode: revision, op count, sizes, timestamps)
//!
//! Op-log keys are `<doc_id:16 bytes><revision:8 bytes big-endian>` so a
//! forward iterator from `<doc_id><revision>` yields one document's log
//! in revision order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use quire_core::Operation;

use super::{decode, encode, Snapshot, SnapshotStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every op-log append (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quire_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Document metadata stored alongside snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: Uuid,
    /// Revision of the latest logged operation or snapshot
    pub revision: u64,
    /// Revision of the latest snapshot
    pub snapshot_revision: u64,
    /// Operations appended since the document was created
    pub op_count: u64,
    /// Encoded snapshot size in bytes (compressed)
    pub snapshot_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            revision: 0,
            snapshot_revision: 0,
            op_count: 0,
            snapshot_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::borrow_decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`SnapshotStore`].
pub struct DocumentStore {
    /// Single-threaded mode: column families are fixed at open time.
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed by us
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPLOG => {
                // Many small appends, prefix-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    fn metadata_or_new(&self, doc_id: Uuid) -> Result<DocumentMetadata, StoreError> {
        match self.load_metadata(doc_id) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound(_)) => Ok(DocumentMetadata::new(doc_id)),
            Err(e) => Err(e),
        }
    }

    pub fn document_exists(&self, doc_id: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, doc_id.as_bytes())?.is_some())
    }

    /// All document IDs with metadata in the store.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key[..]
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID key".into()))?;
            doc_ids.push(Uuid::from_bytes(bytes));
        }

        Ok(doc_ids)
    }

    // ─── Op log ───────────────────────────────────────────────────────

    /// Keys of `doc_id`'s op log within `(after, up_to]`.
    fn op_keys(&self, doc_id: Uuid, after: u64, up_to: u64) -> Result<Vec<Box<[u8]>>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start = Self::op_key(doc_id, after.saturating_add(1));
        let end = Self::op_key(doc_id, up_to);

        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, _) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() || &key[..] > end.as_slice() {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Number of logged operations currently held for `doc_id`.
    pub fn op_log_len(&self, doc_id: Uuid) -> Result<usize, StoreError> {
        Ok(self.op_keys(doc_id, 0, u64::MAX)?.len())
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn op_key(doc_id: Uuid, revision: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&revision.to_be_bytes());
        key
    }
}

impl SnapshotStore for DocumentStore {
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Snapshot and metadata are written in one batch.
    fn save_snapshot(&self, doc_id: Uuid, snapshot: &Snapshot) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode(snapshot)?;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.revision = meta.revision.max(snapshot.revision);
        meta.snapshot_revision = snapshot.revision;
        meta.snapshot_size = encoded.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, doc_id.as_bytes(), &encoded);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        log::debug!(
            "Saved snapshot for doc {doc_id} at rev {} ({} bytes)",
            snapshot.revision,
            encoded.len()
        );
        Ok(())
    }

    fn append_op_log(&self, doc_id: Uuid, op: &Operation) -> Result<(), StoreError> {
        let cf_log = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode(op)?;

        let mut meta = self.metadata_or_new(doc_id)?;
        meta.revision = op.revision();
        meta.op_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_log, Self::op_key(doc_id, op.revision()), &encoded);
        batch.put_cf(cf_meta, doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn load_op_log_since(&self, doc_id: Uuid, revision: u64) -> Result<Vec<Operation>, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let start = Self::op_key(doc_id, revision.saturating_add(1));

        let mut ops = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            ops.push(decode(&value)?);
        }
        Ok(ops)
    }

    fn compact_op_log(&self, doc_id: Uuid, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPLOG)?;
        let keys = self.op_keys(doc_id, 0, up_to)?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete_cf(cf, key);
        }
        self.db.write(batch)?;
        Ok(keys.len() as u64)
    }

    fn delete_document(&self, doc_id: Uuid) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_log = self.cf(CF_OPLOG)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_docs, doc_id.as_bytes());
        batch.delete_cf(cf_meta, doc_id.as_bytes());
        for key in self.op_keys(doc_id, 0, u64::MAX)? {
            batch.delete_cf(cf_log, key);
        }
        self.db.write_opt(batch, &self.write_options())?;

        log::info!("Deleted doc {doc_id} from store");
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

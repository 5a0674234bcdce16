//! Single-writer document state.
//!
//! A [`Document`] only ever accepts canonical operations: operations whose
//! base revision equals the current revision and whose span equals the
//! current length. Transforming late operations into that shape is the
//! session's job.

use uuid::Uuid;

use crate::clock::VersionVector;
use crate::error::OtError;
use crate::operation::{char_len, Operation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: Uuid,
    content: String,
    /// Length in chars, cached.
    len: usize,
    revision: u64,
    versions: VersionVector,
}

impl Document {
    /// Empty document at revision 0.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            content: String::new(),
            len: 0,
            revision: 0,
            versions: VersionVector::new(),
        }
    }

    /// Rebuild a document from persisted state.
    pub fn from_snapshot(
        id: Uuid,
        content: String,
        revision: u64,
        versions: VersionVector,
    ) -> Self {
        let len = char_len(&content);
        Self {
            id,
            content,
            len,
            revision,
            versions,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn versions(&self) -> &VersionVector {
        &self.versions
    }

    /// Validate `op` as the next canonical operation without applying it.
    pub fn check(&self, op: &Operation) -> Result<(), OtError> {
        if op.doc_id() != self.id {
            return Err(OtError::malformed(format!(
                "operation targets document {} but this is {}",
                op.doc_id(),
                self.id
            )));
        }
        if op.base_revision() != self.revision {
            return Err(OtError::BaseRevisionMismatch {
                expected: self.revision,
                found: op.base_revision(),
            });
        }
        if op.changes().len() != self.len {
            return Err(OtError::malformed(format!(
                "operation spans {} units but document has {}",
                op.changes().len(),
                self.len
            )));
        }
        Ok(())
    }

    /// Apply a canonical operation.
    ///
    /// On error the document is left untouched.
    pub fn apply(&mut self, op: &Operation) -> Result<u64, OtError> {
        self.check(op)?;

        self.content = op.changes().apply(&self.content)?;
        self.len = op.changes().len_after();
        self.revision += 1;
        self.versions.observe(op.participant_id(), op.seq());

        log::trace!(
            "doc {} -> rev {} (peer {}, seq {}, len {})",
            self.id,
            self.revision,
            op.participant_id(),
            op.seq(),
            self.len
        );
        Ok(self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ChangeSet, Primitive};

    fn insert(doc: &Document, peer: Uuid, seq: u64, at: usize, text: &str) -> Operation {
        let mut changes = ChangeSet::new();
        changes.retain(at).insert(text).retain(doc.len() - at);
        Operation::new(doc.id(), peer, seq, doc.revision(), changes)
    }

    #[test]
    fn test_apply_advances_revision_and_clock() {
        let peer = Uuid::new_v4();
        let mut doc = Document::new(Uuid::new_v4());

        let op = insert(&doc, peer, 1, 0, "héllo");
        assert_eq!(doc.apply(&op).unwrap(), 1);
        assert_eq!(doc.content(), "héllo");
        assert_eq!(doc.len(), 5);
        assert_eq!(doc.versions().get(&peer), 1);

        let op = insert(&doc, peer, 2, 5, "!");
        assert_eq!(doc.apply(&op).unwrap(), 2);
        assert_eq!(doc.content(), "héllo!");
        assert_eq!(doc.versions().get(&peer), 2);
    }

    #[test]
    fn test_stale_base_rejected() {
        let peer = Uuid::new_v4();
        let mut doc = Document::new(Uuid::new_v4());
        let first = insert(&doc, peer, 1, 0, "a");
        doc.apply(&first).unwrap();

        let stale = Operation::new(doc.id(), peer, 2, 0, ChangeSet::try_from(vec![Primitive::Retain(1)]).unwrap());
        assert_eq!(
            doc.apply(&stale).unwrap_err(),
            OtError::BaseRevisionMismatch {
                expected: 1,
                found: 0
            }
        );
        assert_eq!(doc.revision(), 1);
        assert_eq!(doc.content(), "a");
    }

    #[test]
    fn test_wrong_span_rejected_without_mutation() {
        let mut doc = Document::from_snapshot(Uuid::new_v4(), "abc".into(), 4, VersionVector::new());
        let op = Operation::new(
            doc.id(),
            Uuid::new_v4(),
            1,
            4,
            ChangeSet::try_from(vec![Primitive::Delete(5)]).unwrap(),
        );

        assert!(matches!(doc.apply(&op), Err(OtError::MalformedOperation(_))));
        assert_eq!(doc.content(), "abc");
        assert_eq!(doc.revision(), 4);
    }

    #[test]
    fn test_other_document_rejected() {
        let mut doc = Document::new(Uuid::new_v4());
        let op = Operation::new(Uuid::new_v4(), Uuid::new_v4(), 1, 0, ChangeSet::new());
        assert!(doc.apply(&op).is_err());
    }
}

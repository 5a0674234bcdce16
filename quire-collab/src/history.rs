//! Bounded ring of recent canonical operations.
//!
//! Late operations are transformed against the ops retained here, and
//! reconnecting clients are caught up by replaying them. Once an op is
//! evicted, anything based before it can only be served by a snapshot.

use std::collections::{vec_deque, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

use quire_core::Operation;

#[derive(Debug)]
pub struct History {
    ops: VecDeque<Arc<Operation>>,
    capacity: usize,
    /// Revision reached after the newest retained op.
    head: u64,
}

impl History {
    /// Empty history for a document currently at `revision`.
    pub fn new(capacity: usize, revision: u64) -> Self {
        Self {
            ops: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            head: revision,
        }
    }

    /// Append the next canonical op, evicting the oldest when full.
    pub fn push(&mut self, op: Arc<Operation>) {
        self.head = op.revision();
        if self.ops.len() == self.capacity {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    /// Oldest revision a client may still be caught up from.
    pub fn oldest_base(&self) -> u64 {
        self.ops.front().map_or(self.head, |op| op.base_revision())
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Canonical ops applied after `base`, oldest first.
    ///
    /// `None` if some of them were evicted or `base` is in the future.
    pub fn since(&self, base: u64) -> Option<vec_deque::Iter<'_, Arc<Operation>>> {
        let oldest = self.oldest_base();
        if base < oldest || base > self.head {
            return None;
        }
        let skip = (base - oldest) as usize;
        Some(self.ops.range(skip..))
    }

    /// Find the canonical form of `participant`'s op number `seq`.
    pub fn find(&self, participant: Uuid, seq: u64) -> Option<&Arc<Operation>> {
        self.ops
            .iter()
            .rev()
            .find(|op| op.participant_id() == participant && op.seq() == seq)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

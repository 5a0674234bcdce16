//! Version vector: participant → last applied sequence number.
//!
//! The document session observes every canonical operation here so that an
//! operation re-sent after a reconnect is recognised instead of applied twice.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Causal clock for one document.
///
/// Entries are kept ordered so two equal vectors serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<Uuid, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number observed for `participant` (0 = none).
    pub fn get(&self, participant: &Uuid) -> u64 {
        self.0.get(participant).copied().unwrap_or(0)
    }

    /// Record that `participant` has had `seq` applied.
    ///
    /// Returns `false` (and leaves the vector untouched) if `seq` is not
    /// newer than what was already observed.
    pub fn observe(&mut self, participant: Uuid, seq: u64) -> bool {
        if seq == 0 {
            return false;
        }
        let entry = self.0.entry(participant).or_insert(0);
        if seq <= *entry {
            return false;
        }
        *entry = seq;
        true
    }

    /// Whether `seq` from `participant` is already covered by this vector.
    ///
    /// Sequence number 0 marks an unsequenced operation and is never "seen".
    pub fn has_seen(&self, participant: &Uuid, seq: u64) -> bool {
        seq != 0 && seq <= self.get(participant)
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &VersionVector) {
        for (peer, seq) in &other.0 {
            let entry = self.0.entry(*peer).or_insert(0);
            *entry = (*entry).max(*seq);
        }
    }

    /// True if every entry of `other` is ≤ the matching entry here.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(peer, seq)| self.get(peer) >= *seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Uuid, &u64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialOrd for VersionVector {
    /// Causal order. Concurrent vectors are incomparable.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominates(other), other.dominates(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_only_advances() {
        let peer = Uuid::new_v4();
        let mut vv = VersionVector::new();

        assert!(vv.observe(peer, 3));
        assert!(!vv.observe(peer, 2));
        assert!(!vv.observe(peer, 3));
        assert_eq!(vv.get(&peer), 3);
    }

    #[test]
    fn test_has_seen_ignores_unsequenced() {
        let peer = Uuid::new_v4();
        let mut vv = VersionVector::new();
        vv.observe(peer, 5);

        assert!(vv.has_seen(&peer, 5));
        assert!(vv.has_seen(&peer, 1));
        assert!(!vv.has_seen(&peer, 6));
        assert!(!vv.has_seen(&peer, 0));
        assert!(!vv.has_seen(&Uuid::new_v4(), 1));
    }

    #[test]
    fn test_merge_is_pointwise_max() {
        let a_peer = Uuid::new_v4();
        let b_peer = Uuid::new_v4();

        let mut left = VersionVector::new();
        left.observe(a_peer, 4);
        left.observe(b_peer, 1);

        let mut right = VersionVector::new();
        right.observe(a_peer, 2);
        right.observe(b_peer, 7);

        left.merge(&right);
        assert_eq!(left.get(&a_peer), 4);
        assert_eq!(left.get(&b_peer), 7);
    }

    #[test]
    fn test_causal_ordering() {
        let a_peer = Uuid::new_v4();
        let b_peer = Uuid::new_v4();

        let mut base = VersionVector::new();
        base.observe(a_peer, 1);

        let mut ahead = base.clone();
        ahead.observe(a_peer, 2);
        assert!(ahead > base);
        assert!(base < ahead);

        let mut concurrent = base.clone();
        concurrent.observe(b_peer, 1);
        assert_eq!(ahead.partial_cmp(&concurrent), None);
        assert_eq!(base.partial_cmp(&base.clone()), Some(Ordering::Equal));
    }

    #[test]
    fn test_serializes_as_map() {
        let peer = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let mut vv = VersionVector::new();
        vv.observe(peer, 9);

        let json = serde_json::to_string(&vv).unwrap();
        assert_eq!(json, r#"{"550e8400-e29b-41d4-a716-446655440000":9}"#);
        let back: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vv);
    }
}

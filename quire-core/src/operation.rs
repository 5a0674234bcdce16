//! Edit primitives and operations.
//!
//! A [`ChangeSet`] is a normalised walk over the base document:
//!
//! ```text
//!  base:    a b c d e f
//!           ├─┤ ├─┤      retain(2)  insert("XY")  delete(2)  retain(2)
//!  result:  a b X Y e f
//! ```
//!
//! `len` is the span of the base document the walk consumes (retains +
//! deletes), `len_after` the span it produces (retains + inserts). A change
//! set accepted by a document always has `len == document length`.
//!
//! An [`Operation`] wraps a change set with its provenance (document,
//! participant, sequence number, base revision). Operations are immutable;
//! transforming one produces a new value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OtError;

/// A single edit primitive as sent over the wire.
///
/// Serialized externally tagged: `{"retain":2}`, `{"insert":"X"}`, `{"delete":1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    /// Keep the next `n` units.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` units.
    Delete(usize),
}

impl Primitive {
    /// Number of units this primitive spans (output units for inserts).
    pub fn span(&self) -> usize {
        match self {
            Primitive::Retain(n) | Primitive::Delete(n) => *n,
            Primitive::Insert(text) => char_len(text),
        }
    }
}

/// Which side of an insertion a position sticks to when the insertion
/// happens exactly at that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    /// Stay before the inserted text.
    Left,
    /// Move after the inserted text.
    Right,
}

/// Normalised sequence of retain/insert/delete primitives.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Primitive>", into = "Vec<Primitive>")]
pub struct ChangeSet {
    changes: Vec<Primitive>,
    len: usize,
    len_after: usize,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change set that keeps a document of `len` units untouched.
    pub fn identity(len: usize) -> Self {
        let mut cs = Self::new();
        cs.retain(len);
        cs
    }

    /// Input span (units of the base document consumed).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Output span (units of the resulting document produced).
    pub fn len_after(&self) -> usize {
        self.len_after
    }

    /// True if there are no primitives at all.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// True if applying this change set leaves any document unchanged.
    pub fn is_noop(&self) -> bool {
        self.changes.iter().all(|p| matches!(p, Primitive::Retain(_)))
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.changes
    }

    /// Append a retain, merging with a trailing retain.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.len += n;
        self.len_after += n;

        if let Some(Primitive::Retain(count)) = self.changes.last_mut() {
            *count += n;
        } else {
            self.changes.push(Primitive::Retain(n));
        }
        self
    }

    /// Append a delete, merging with a trailing delete.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.len += n;

        if let Some(Primitive::Delete(count)) = self.changes.last_mut() {
            *count += n;
        } else {
            self.changes.push(Primitive::Delete(n));
        }
        self
    }

    /// Append an insert.
    ///
    /// Inserts are kept in front of an adjacent delete so that every
    /// position has a single canonical encoding.
    pub fn insert(&mut self, text: impl Into<String>) -> &mut Self {
        let text = text.into();
        if text.is_empty() {
            return self;
        }
        self.len_after += char_len(&text);

        match self.changes.as_mut_slice() {
            [.., Primitive::Insert(prev)] | [.., Primitive::Insert(prev), Primitive::Delete(_)] => {
                prev.push_str(&text);
            }
            [.., last @ Primitive::Delete(_)] => {
                let del = std::mem::replace(last, Primitive::Insert(text));
                self.changes.push(del);
            }
            _ => self.changes.push(Primitive::Insert(text)),
        }
        self
    }

    /// Pad with a trailing retain so the change set spans exactly `doc_len`.
    ///
    /// Fails if the change set already reaches past the end of the document.
    pub fn extend_to(&mut self, doc_len: usize) -> Result<(), OtError> {
        if self.len > doc_len {
            return Err(OtError::malformed(format!(
                "operation spans {} units but document has {doc_len}",
                self.len
            )));
        }
        let missing = doc_len - self.len;
        self.retain(missing);
        Ok(())
    }

    /// Apply to `text`, returning the new content.
    ///
    /// `text` must be exactly `len()` units long.
    pub fn apply(&self, text: &str) -> Result<String, OtError> {
        let doc_len = char_len(text);
        if doc_len != self.len {
            return Err(OtError::malformed(format!(
                "operation spans {} units but document has {doc_len}",
                self.len
            )));
        }

        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars();
        for op in &self.changes {
            match op {
                Primitive::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Primitive::Delete(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                }
                Primitive::Insert(ins) => out.push_str(ins),
            }
        }
        Ok(out)
    }

    /// Change set that undoes this one.
    ///
    /// `original` is the document this change set was applied to.
    pub fn invert(&self, original: &str) -> Result<ChangeSet, OtError> {
        if char_len(original) != self.len {
            return Err(OtError::malformed("inverse needs the original document"));
        }

        let mut result = ChangeSet::new();
        let mut chars = original.chars();
        for op in &self.changes {
            match op {
                Primitive::Retain(n) => {
                    result.retain(*n);
                    chars.by_ref().take(*n).for_each(drop);
                }
                Primitive::Delete(n) => {
                    let deleted: String = chars.by_ref().take(*n).collect();
                    result.insert(deleted);
                }
                Primitive::Insert(ins) => {
                    result.delete(char_len(ins));
                }
            }
        }
        Ok(result)
    }

    /// Map a position in the base document to the resulting document.
    ///
    /// Positions inside a deleted range collapse to the start of the deletion.
    pub fn map_pos(&self, pos: usize, bias: Bias) -> usize {
        let mut old_pos = 0;
        let mut new_pos = 0;

        for op in &self.changes {
            if old_pos > pos {
                break;
            }

            match op {
                Primitive::Retain(n) => {
                    if old_pos + n > pos {
                        return new_pos + (pos - old_pos);
                    }
                    old_pos += n;
                    new_pos += n;
                }
                Primitive::Delete(n) => {
                    if old_pos + n > pos {
                        return new_pos;
                    }
                    old_pos += n;
                }
                Primitive::Insert(ins) => {
                    if old_pos == pos && bias == Bias::Left {
                        // stays in front of the insertion
                    } else {
                        new_pos += char_len(ins);
                    }
                }
            }
        }

        new_pos + pos.saturating_sub(old_pos)
    }

    /// Whether the base range `start..end` is removed by this change set.
    ///
    /// A non-empty range must be covered entirely by deletions. An empty range
    /// (a point) counts as removed when it sits strictly inside a deletion.
    pub fn deletes_range(&self, start: usize, end: usize) -> bool {
        let mut old_pos = 0;
        let mut covered_until = start;

        for op in &self.changes {
            if old_pos >= end.max(start + 1) {
                break;
            }
            match op {
                Primitive::Retain(n) => old_pos += n,
                Primitive::Insert(_) => {}
                Primitive::Delete(n) => {
                    let (del_start, del_end) = (old_pos, old_pos + n);
                    if start == end {
                        if del_start < start && start < del_end {
                            return true;
                        }
                    } else if del_start <= covered_until && del_end > covered_until {
                        covered_until = del_end;
                    }
                    old_pos = del_end;
                }
            }
        }

        start < end && covered_until >= end
    }

    /// Compose `self` followed by `other` into a single change set.
    ///
    /// Requires `self.len_after() == other.len()`.
    pub fn compose(&self, other: &ChangeSet) -> Result<ChangeSet, OtError> {
        if self.len_after != other.len {
            return Err(OtError::malformed(format!(
                "cannot compose: first produces {} units, second expects {}",
                self.len_after, other.len
            )));
        }

        let mut result = ChangeSet::new();
        let mut a_iter = self.changes.iter().cloned();
        let mut b_iter = other.changes.iter().cloned();
        let mut a = a_iter.next();
        let mut b = b_iter.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Primitive::Delete(n)), rest) => {
                    result.delete(n);
                    a = a_iter.next();
                    b = rest;
                }
                (rest, Some(Primitive::Insert(text))) => {
                    result.insert(text);
                    a = rest;
                    b = b_iter.next();
                }
                (None, _) | (_, None) => {
                    return Err(OtError::malformed("compose ran past the end of an operation"));
                }
                (Some(Primitive::Retain(n)), Some(Primitive::Retain(m))) => {
                    let step = n.min(m);
                    result.retain(step);
                    a = remainder(Primitive::Retain(n - step), &mut a_iter);
                    b = remainder(Primitive::Retain(m - step), &mut b_iter);
                }
                (Some(Primitive::Retain(n)), Some(Primitive::Delete(m))) => {
                    let step = n.min(m);
                    result.delete(step);
                    a = remainder(Primitive::Retain(n - step), &mut a_iter);
                    b = remainder(Primitive::Delete(m - step), &mut b_iter);
                }
                (Some(Primitive::Insert(text)), Some(Primitive::Retain(m))) => {
                    let (head, tail) = split_chars(&text, m);
                    let step = char_len(&head);
                    result.insert(head);
                    a = remainder(Primitive::Insert(tail), &mut a_iter);
                    b = remainder(Primitive::Retain(m - step), &mut b_iter);
                }
                (Some(Primitive::Insert(text)), Some(Primitive::Delete(m))) => {
                    let (head, tail) = split_chars(&text, m);
                    let step = char_len(&head);
                    a = remainder(Primitive::Insert(tail), &mut a_iter);
                    b = remainder(Primitive::Delete(m - step), &mut b_iter);
                }
            }
        }

        Ok(result)
    }
}

/// Builds a change set from untrusted primitives.
///
/// Fails if the consumed or produced span does not fit in a `usize`.
impl TryFrom<Vec<Primitive>> for ChangeSet {
    type Error = OtError;

    fn try_from(primitives: Vec<Primitive>) -> Result<Self, Self::Error> {
        let mut cs = ChangeSet::new();
        for p in primitives {
            let (consumed, produced) = match &p {
                Primitive::Retain(n) => (*n, *n),
                Primitive::Delete(n) => (*n, 0),
                Primitive::Insert(text) => (0, char_len(text)),
            };
            if cs.len.checked_add(consumed).is_none() || cs.len_after.checked_add(produced).is_none() {
                return Err(OtError::malformed("primitive lengths overflow"));
            }
            // Merged counts never exceed `len`, so they cannot overflow either
            match p {
                Primitive::Retain(n) => cs.retain(n),
                Primitive::Insert(text) => cs.insert(text),
                Primitive::Delete(n) => cs.delete(n),
            };
        }
        Ok(cs)
    }
}

impl From<ChangeSet> for Vec<Primitive> {
    fn from(cs: ChangeSet) -> Self {
        cs.changes
    }
}

/// An edit submitted by one participant against one revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    doc_id: Uuid,
    participant_id: Uuid,
    seq: u64,
    base_revision: u64,
    #[serde(default)]
    priority: u32,
    changes: ChangeSet,
}

impl Operation {
    pub fn new(
        doc_id: Uuid,
        participant_id: Uuid,
        seq: u64,
        base_revision: u64,
        changes: ChangeSet,
    ) -> Self {
        Self {
            doc_id,
            participant_id,
            seq,
            base_revision,
            priority: 0,
            changes,
        }
    }

    /// Same operation with an explicit same-offset insert priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// New operation with the same provenance but different changes and base.
    pub fn rebased(&self, changes: ChangeSet, base_revision: u64) -> Self {
        Self {
            changes,
            base_revision,
            ..self.clone()
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    /// Revision the document reaches once this operation is applied.
    pub fn revision(&self) -> u64 {
        self.base_revision + 1
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    pub fn primitives(&self) -> &[Primitive] {
        self.changes.primitives()
    }
}

/// Length in units (chars).
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` after `n` chars.
fn split_chars(text: &str, n: usize) -> (String, String) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => (text[..idx].to_string(), text[idx..].to_string()),
        None => (text.to_string(), String::new()),
    }
}

/// Leftover of a partially consumed primitive, or the next one if it was used up.
fn remainder<I: Iterator<Item = Primitive>>(rest: Primitive, iter: &mut I) -> Option<Primitive> {
    if rest.span() == 0 {
        iter.next()
    } else {
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(primitives: Vec<Primitive>) -> ChangeSet {
        ChangeSet::try_from(primitives).unwrap()
    }

    #[test]
    fn test_builder_merges_and_drops_empty() {
        let mut changes = ChangeSet::new();
        changes.retain(2).retain(0).retain(1).insert("").delete(1).delete(2);

        assert_eq!(
            changes.primitives(),
            &[Primitive::Retain(3), Primitive::Delete(3)]
        );
        assert_eq!(changes.len(), 6);
        assert_eq!(changes.len_after(), 3);
    }

    #[test]
    fn test_insert_moves_before_delete() {
        let mut changes = ChangeSet::new();
        changes.delete(2).insert("ab").insert("c");

        assert_eq!(
            changes.primitives(),
            &[Primitive::Insert("abc".into()), Primitive::Delete(2)]
        );
    }

    #[test]
    fn test_apply() {
        let changes = cs(vec![
            Primitive::Retain(2),
            Primitive::Insert("XY".into()),
            Primitive::Delete(2),
            Primitive::Retain(2),
        ]);
        assert_eq!(changes.apply("abcdef").unwrap(), "abXYef");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let changes = cs(vec![Primitive::Retain(1), Primitive::Delete(1), Primitive::Retain(1)]);
        assert_eq!(changes.apply("héo").unwrap(), "ho");
    }

    #[test]
    fn test_apply_rejects_wrong_length() {
        let changes = cs(vec![Primitive::Retain(5)]);
        assert!(matches!(
            changes.apply("abc"),
            Err(OtError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_extend_to() {
        let mut changes = cs(vec![Primitive::Insert("X".into())]);
        changes.extend_to(2).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.apply("ab").unwrap(), "Xab");

        let mut too_long = cs(vec![Primitive::Retain(3), Primitive::Insert("Y".into())]);
        assert!(too_long.extend_to(2).is_err());
    }

    #[test]
    fn test_invert_restores_original() {
        let original = "hello world";
        let changes = cs(vec![
            Primitive::Retain(6),
            Primitive::Delete(5),
            Primitive::Insert("there".into()),
        ]);
        let edited = changes.apply(original).unwrap();
        assert_eq!(edited, "hello there");

        let inverse = changes.invert(original).unwrap();
        assert_eq!(inverse.apply(&edited).unwrap(), original);
    }

    #[test]
    fn test_map_pos() {
        // "abcdef" -> retain 2, insert "XY", delete 2, retain 2 -> "abXYef"
        let changes = cs(vec![
            Primitive::Retain(2),
            Primitive::Insert("XY".into()),
            Primitive::Delete(2),
            Primitive::Retain(2),
        ]);

        assert_eq!(changes.map_pos(0, Bias::Right), 0);
        assert_eq!(changes.map_pos(1, Bias::Right), 1);
        assert_eq!(changes.map_pos(2, Bias::Left), 2);
        assert_eq!(changes.map_pos(2, Bias::Right), 4);
        // inside the deleted range collapses to the deletion point
        assert_eq!(changes.map_pos(3, Bias::Right), 4);
        assert_eq!(changes.map_pos(4, Bias::Right), 4);
        assert_eq!(changes.map_pos(5, Bias::Right), 5);
        assert_eq!(changes.map_pos(6, Bias::Right), 6);
    }

    #[test]
    fn test_map_pos_insert_shifts_cursor_at_or_after() {
        // insert 3 units at offset 4 of a 10-unit document
        let changes = cs(vec![
            Primitive::Retain(4),
            Primitive::Insert("abc".into()),
            Primitive::Retain(6),
        ]);
        for c in 0..4 {
            assert_eq!(changes.map_pos(c, Bias::Right), c);
        }
        for c in 4..=10 {
            assert_eq!(changes.map_pos(c, Bias::Right), c + 3);
        }
    }

    #[test]
    fn test_deletes_range() {
        // delete [2, 5) of a 8-unit document
        let changes = cs(vec![Primitive::Retain(2), Primitive::Delete(3), Primitive::Retain(3)]);

        assert!(changes.deletes_range(2, 5));
        assert!(changes.deletes_range(3, 4));
        assert!(!changes.deletes_range(1, 3));
        assert!(!changes.deletes_range(4, 6));
        // points
        assert!(changes.deletes_range(3, 3));
        assert!(!changes.deletes_range(2, 2));
        assert!(!changes.deletes_range(5, 5));
    }

    #[test]
    fn test_deletes_range_across_merged_insert() {
        let mut changes = ChangeSet::new();
        changes.delete(2).insert("Z").delete(2);
        assert!(changes.deletes_range(0, 4));
    }

    #[test]
    fn test_compose() {
        let doc = "abc";
        let first = cs(vec![Primitive::Retain(1), Primitive::Insert("XY".into()), Primitive::Retain(2)]);
        let second = cs(vec![
            Primitive::Retain(2),
            Primitive::Delete(2),
            Primitive::Insert("Q".into()),
            Primitive::Retain(1),
        ]);

        let step = second.apply(&first.apply(doc).unwrap()).unwrap();
        let composed = first.compose(&second).unwrap();
        assert_eq!(composed.apply(doc).unwrap(), step);
        assert_eq!(composed.len(), 3);
        assert_eq!(composed.len_after(), char_len(&step));
    }

    #[test]
    fn test_compose_length_mismatch() {
        let first = cs(vec![Primitive::Retain(2)]);
        let second = cs(vec![Primitive::Retain(3)]);
        assert!(first.compose(&second).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let changes = cs(vec![
            Primitive::Retain(2),
            Primitive::Insert("X".into()),
            Primitive::Delete(1),
        ]);
        let json = serde_json::to_string(&changes).unwrap();
        assert_eq!(json, r#"[{"retain":2},{"insert":"X"},{"delete":1}]"#);

        let parsed: ChangeSet = serde_json::from_str(r#"[{"retain":1},{"retain":1},{"delete":0}]"#).unwrap();
        assert_eq!(parsed.primitives(), &[Primitive::Retain(2)]);
    }

    #[test]
    fn test_wire_rejects_overflowing_spans() {
        // Retain + delete overflows the consumed span
        let err = serde_json::from_str::<ChangeSet>(r#"[{"retain":18446744073709551615},{"delete":1}]"#);
        assert!(err.is_err());

        // Two retains overflow both spans
        let err = serde_json::from_str::<ChangeSet>(r#"[{"retain":18446744073709551615},{"retain":2}]"#);
        assert!(err.is_err());

        // Retain + insert overflows only the produced span
        let err = ChangeSet::try_from(vec![Primitive::Retain(usize::MAX), Primitive::Insert("x".into())]);
        assert!(matches!(err, Err(OtError::MalformedOperation(_))));

        // The largest representable span is still accepted
        let max = serde_json::from_str::<ChangeSet>(r#"[{"retain":18446744073709551614},{"delete":1}]"#).unwrap();
        assert_eq!(max.len(), usize::MAX);
        assert_eq!(max.len_after(), usize::MAX - 1);
    }

    #[test]
    fn test_operation_rebased_keeps_provenance() {
        let doc = Uuid::new_v4();
        let peer = Uuid::new_v4();
        let op = Operation::new(doc, peer, 7, 3, ChangeSet::identity(4)).with_priority(2);

        let rebased = op.rebased(ChangeSet::identity(5), 4);
        assert_eq!(rebased.participant_id(), peer);
        assert_eq!(rebased.seq(), 7);
        assert_eq!(rebased.priority(), 2);
        assert_eq!(rebased.base_revision(), 4);
        assert_eq!(rebased.revision(), 5);
        // original untouched
        assert_eq!(op.base_revision(), 3);
        assert_eq!(op.changes().len(), 4);
    }
}

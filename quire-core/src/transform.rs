//! Concurrent operation transform.
//!
//! Given two operations `a` and `b` made against the same document,
//! [`transform`] returns `(a', b')` such that
//!
//! ```text
//! apply(apply(doc, b), a') == apply(apply(doc, a), b')
//! ```
//!
//! Rules:
//!
//! | a \ b    | retain        | insert           | delete            |
//! |----------|---------------|------------------|-------------------|
//! | retain   | both retain   | b inserts        | b' deletes        |
//! | insert   | a inserts     | ordered by key   | a inserts         |
//! | delete   | a' deletes    | b inserts        | nobody (merged)   |
//!
//! Inserts always survive a concurrent delete. Two inserts at the same
//! offset are ordered by `(priority, participant_id, seq)` ascending.

use std::cmp::Ordering;

use crate::error::OtError;
use crate::operation::{char_len, ChangeSet, Operation, Primitive};

/// Which side's insert lands first when both insert at the same offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOrder {
    LeftFirst,
    RightFirst,
}

/// Order between two operations' same-offset inserts.
pub fn insert_order(a: &Operation, b: &Operation) -> InsertOrder {
    let key_a = (a.priority(), a.participant_id(), a.seq());
    let key_b = (b.priority(), b.participant_id(), b.seq());
    match key_a.cmp(&key_b) {
        Ordering::Greater => InsertOrder::RightFirst,
        Ordering::Less | Ordering::Equal => InsertOrder::LeftFirst,
    }
}

/// Transform two operations made against the same base revision.
///
/// `a'` applies after `b`, `b'` applies after `a`. Both outputs sit one
/// revision above the shared base.
pub fn transform(a: &Operation, b: &Operation) -> Result<(Operation, Operation), OtError> {
    if a.doc_id() != b.doc_id() {
        return Err(OtError::malformed(format!(
            "operations target different documents ({} vs {})",
            a.doc_id(),
            b.doc_id()
        )));
    }
    if a.base_revision() != b.base_revision() {
        return Err(OtError::BaseRevisionMismatch {
            expected: a.base_revision(),
            found: b.base_revision(),
        });
    }

    let (a_changes, b_changes) = transform_changes(a.changes(), b.changes(), insert_order(a, b))?;
    let next = a.base_revision() + 1;
    Ok((a.rebased(a_changes, next), b.rebased(b_changes, next)))
}

/// Bring `op` up to date with `concurrent`, a run of canonical operations
/// applied in order starting at `op`'s base revision.
pub fn transform_against<'a, I>(op: &Operation, concurrent: I) -> Result<Operation, OtError>
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut current = op.clone();
    for canonical in concurrent {
        let (rebased, _) = transform(&current, canonical)?;
        current = rebased;
    }
    Ok(current)
}

/// Change-set level transform.
///
/// Both change sets must span the same base document.
pub fn transform_changes(
    a: &ChangeSet,
    b: &ChangeSet,
    order: InsertOrder,
) -> Result<(ChangeSet, ChangeSet), OtError> {
    if a.len() != b.len() {
        return Err(OtError::malformed(format!(
            "operations span different documents ({} vs {} units)",
            a.len(),
            b.len()
        )));
    }

    let mut a_prime = ChangeSet::new();
    let mut b_prime = ChangeSet::new();

    let mut a_iter = a.primitives().iter().cloned();
    let mut b_iter = b.primitives().iter().cloned();
    let mut a_head = a_iter.next();
    let mut b_head = b_iter.next();

    loop {
        match (a_head.take(), b_head.take()) {
            (None, None) => break,
            (Some(Primitive::Insert(a_text)), Some(Primitive::Insert(b_text))) => {
                if order == InsertOrder::LeftFirst {
                    b_prime.retain(char_len(&a_text));
                    a_prime.insert(a_text);
                    a_head = a_iter.next();
                    b_head = Some(Primitive::Insert(b_text));
                } else {
                    a_prime.retain(char_len(&b_text));
                    b_prime.insert(b_text);
                    a_head = Some(Primitive::Insert(a_text));
                    b_head = b_iter.next();
                }
            }
            (Some(Primitive::Insert(text)), other) => {
                b_prime.retain(char_len(&text));
                a_prime.insert(text);
                a_head = a_iter.next();
                b_head = other;
            }
            (other, Some(Primitive::Insert(text))) => {
                a_prime.retain(char_len(&text));
                b_prime.insert(text);
                a_head = other;
                b_head = b_iter.next();
            }
            (None, Some(_)) | (Some(_), None) => {
                return Err(OtError::malformed("operation ran past the end of the document"));
            }
            (Some(Primitive::Retain(n)), Some(Primitive::Retain(m))) => {
                let step = n.min(m);
                a_prime.retain(step);
                b_prime.retain(step);
                a_head = advance(Primitive::Retain(n - step), &mut a_iter);
                b_head = advance(Primitive::Retain(m - step), &mut b_iter);
            }
            (Some(Primitive::Delete(n)), Some(Primitive::Delete(m))) => {
                let step = n.min(m);
                a_head = advance(Primitive::Delete(n - step), &mut a_iter);
                b_head = advance(Primitive::Delete(m - step), &mut b_iter);
            }
            (Some(Primitive::Delete(n)), Some(Primitive::Retain(m))) => {
                let step = n.min(m);
                a_prime.delete(step);
                a_head = advance(Primitive::Delete(n - step), &mut a_iter);
                b_head = advance(Primitive::Retain(m - step), &mut b_iter);
            }
            (Some(Primitive::Retain(n)), Some(Primitive::Delete(m))) => {
                let step = n.min(m);
                b_prime.delete(step);
                a_head = advance(Primitive::Retain(n - step), &mut a_iter);
                b_head = advance(Primitive::Delete(m - step), &mut b_iter);
            }
        }
    }

    Ok((a_prime, b_prime))
}

fn advance<I: Iterator<Item = Primitive>>(rest: Primitive, iter: &mut I) -> Option<Primitive> {
    if rest.span() == 0 {
        iter.next()
    } else {
        Some(rest)
    }
}

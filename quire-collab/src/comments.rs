//! Comments anchored to document ranges.
//!
//! Anchors are re-mapped through every canonical operation:
//!
//! - a zero-width anchor behaves like a cursor (`Bias::Right`),
//! - a range maps its start with `Bias::Right` and its end with
//!   `Bias::Left`, so text typed at either edge stays outside it.
//!
//! When the anchored text disappears (the whole range is deleted, or the
//! point sits strictly inside a deletion) the comment is flagged
//! `orphaned`. Orphaned comments are kept; clients decide how to show them.

use quire_core::{Bias, ChangeSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub start: usize,
    pub end: usize,
}

impl Anchor {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn is_point(&self) -> bool {
        self.start == self.end
    }

    /// Map through one operation. Returns the new anchor and whether the
    /// anchored text was removed by it.
    pub fn map(self, changes: &ChangeSet) -> (Anchor, bool) {
        let removed = changes.deletes_range(self.start, self.end);
        let anchor = if self.is_point() {
            let at = changes.map_pos(self.start, Bias::Right);
            Anchor::new(at, at)
        } else {
            let start = changes.map_pos(self.start, Bias::Right);
            let end = changes.map_pos(self.end, Bias::Left).max(start);
            Anchor::new(start, end)
        };
        (anchor, removed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: Uuid,
    pub author: Uuid,
    pub body: String,
    pub anchor: Anchor,
    pub resolved: bool,
    pub orphaned: bool,
    pub created_revision: u64,
}

impl Comment {
    pub fn new(author: Uuid, body: impl Into<String>, anchor: Anchor, created_revision: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            body: body.into(),
            anchor,
            resolved: false,
            orphaned: false,
            created_revision,
        }
    }

    /// Map the anchor through one operation.
    ///
    /// Returns `true` if this made the comment orphaned.
    pub fn map(&mut self, changes: &ChangeSet) -> bool {
        let (anchor, removed) = self.anchor.map(changes);
        self.anchor = anchor;
        if removed && !self.orphaned {
            self.orphaned = true;
            return true;
        }
        false
    }
}

/// Every comment of one document, ordered by id.
#[derive(Debug, Default, Clone)]
pub struct CommentAnchors {
    comments: BTreeMap<Uuid, Comment>,
}

impl CommentAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_comments(comments: Vec<Comment>) -> Self {
        Self {
            comments: comments.into_iter().map(|c| (c.id, c)).collect(),
        }
    }

    pub fn insert(&mut self, comment: Comment) {
        self.comments.insert(comment.id, comment);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Comment> {
        self.comments.get(id)
    }

    /// Set the resolved flag. `None` if the comment does not exist.
    pub fn set_resolved(&mut self, id: &Uuid, resolved: bool) -> Option<&Comment> {
        let comment = self.comments.get_mut(id)?;
        comment.resolved = resolved;
        Some(comment)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Comment> {
        self.comments.remove(id)
    }

    /// Re-anchor every comment. Returns the comments that just became orphaned.
    pub fn transform(&mut self, changes: &ChangeSet) -> Vec<Comment> {
        let mut orphaned = Vec::new();
        for comment in self.comments.values_mut() {
            if comment.map(changes) {
                log::debug!("comment {} orphaned", comment.id);
                orphaned.push(comment.clone());
            }
        }
        orphaned
    }

    pub fn iter(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values()
    }

    pub fn to_vec(&self) -> Vec<Comment> {
        self.comments.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

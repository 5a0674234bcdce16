//! Presence protocol for real-time cursor & selection awareness.
//!
//! Cursors are plain character offsets into the document. Every canonical
//! operation moves them with the same rule a text editor uses:
//!
//! ```text
//! insert k units at o   → cursor c ≥ o becomes c + k
//! delete [o, o + k)     → cursor inside the range collapses to o,
//!                         cursor after it becomes c - k
//! ```
//!
//! Presence is ephemeral and last-write-wins per participant. It never
//! forces a resync: updates composed against an evicted revision are
//! clamped as-is.
//!
//! ## Architecture
//!
//! ```text
//! Local cursor move
//!       │
//!       ▼
//! PresenceThrottle::should_send()   (rate-limited: 30Hz)
//!       │
//!       ▼
//! ClientMessage::Presence { … }
//!       │
//!       ▼   (WebSocket)
//! DocumentSession → PresenceTracker::update()
//!       │
//!       ▼
//! SessionEvent::PresenceChanged → every other connection
//! ```

use quire_core::{Bias, ChangeSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Generate a stable, visually distinct color from a UUID.
    ///
    /// Hue comes from the UUID so a participant keeps the same color across
    /// reconnects. Saturation and lightness are fixed for vivid cursors.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A selection: `anchor` is where it started, `head` is where the caret is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    fn map(self, changes: &ChangeSet) -> Self {
        Self {
            anchor: changes.map_pos(self.anchor, Bias::Right),
            head: changes.map_pos(self.head, Bias::Right),
        }
    }

    fn clamp(self, len: usize) -> Self {
        Self {
            anchor: self.anchor.min(len),
            head: self.head.min(len),
        }
    }
}

/// One participant's cursor state as tracked by the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub participant_id: Uuid,
    pub cursor: usize,
    pub selection: Option<Selection>,
    pub color: CursorColor,
    pub label: Option<String>,
}

impl PresenceState {
    /// Fresh presence at the start of the document.
    pub fn new(participant_id: Uuid, label: Option<String>) -> Self {
        Self {
            participant_id,
            cursor: 0,
            selection: None,
            color: CursorColor::from_uuid(participant_id),
            label,
        }
    }

    /// Move the cursor and selection through one operation.
    pub fn map(&mut self, changes: &ChangeSet) {
        self.cursor = changes.map_pos(self.cursor, Bias::Right);
        self.selection = self.selection.map(|s| s.map(changes));
    }

    /// Pull all offsets back inside a document of `len` units.
    pub fn clamp(&mut self, len: usize) {
        self.cursor = self.cursor.min(len);
        self.selection = self.selection.map(|s| s.clamp(len));
    }
}

// ───────────────────────────────────────────────────────────────────
// Session-side tracker
// ───────────────────────────────────────────────────────────────────

/// Presence of every participant in one document.
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    states: HashMap<Uuid, PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state` (clamped to `doc_len`), replacing any previous state.
    pub fn update(&mut self, mut state: PresenceState, doc_len: usize) -> PresenceState {
        state.clamp(doc_len);
        self.states.insert(state.participant_id, state.clone());
        log::trace!(
            "presence {} -> cursor {} selection {:?}",
            state.participant_id,
            state.cursor,
            state.selection
        );
        state
    }

    pub fn remove(&mut self, participant_id: &Uuid) -> Option<PresenceState> {
        self.states.remove(participant_id)
    }

    pub fn get(&self, participant_id: &Uuid) -> Option<&PresenceState> {
        self.states.get(participant_id)
    }

    /// Apply one canonical operation to every tracked cursor.
    pub fn transform(&mut self, changes: &ChangeSet) {
        for state in self.states.values_mut() {
            state.map(changes);
        }
    }

    /// Everyone except `participant_id`.
    pub fn others(&self, participant_id: &Uuid) -> Vec<PresenceState> {
        self.states
            .values()
            .filter(|s| &s.participant_id != participant_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client-side rate limiting
// ───────────────────────────────────────────────────────────────────

/// Rate limiter for outgoing presence updates (30Hz by default).
#[derive(Debug, Clone)]
pub struct PresenceThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl PresenceThrottle {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(33))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether an update may go out now. Records the send when it may.
    pub fn should_send(&mut self) -> bool {
        let now = Instant::now();
        match self.last_sent {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Forget the last send so the next update goes out immediately.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for PresenceThrottle {
    fn default() -> Self {
        Self::new()
    }
}

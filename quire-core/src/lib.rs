//! # quire-core — Operational transform engine for Quire
//!
//! Pure, I/O-free building blocks for convergent text editing.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   primitives   ┌──────────────┐
//! │ Operation     │ ─────────────► │ ChangeSet    │
//! │ (doc, peer,   │                │ retain/ins/  │
//! │  seq, base)   │                │ delete       │
//! └──────┬────────┘                └──────┬───────┘
//!        │                                │
//!        ▼                                ▼
//! ┌───────────────┐                ┌──────────────┐
//! │ transform()   │                │ Document     │
//! │ (a, b) →      │ ─────────────► │ content +    │
//! │ (a', b')      │   canonical op │ revision +   │
//! └───────────────┘                │ VersionVector│
//!                                  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`clock`]: Per-participant version vector
//! - [`operation`]: Edit primitives, `ChangeSet`, `Operation`
//! - [`transform`]: Concurrent operation transform
//! - [`document`]: Single-writer document state
//!
//! Offsets are counted in Unicode scalar values (Rust `char`s), never bytes.

pub mod clock;
pub mod document;
pub mod error;
pub mod operation;
pub mod transform;

// Re-exports for convenience
pub use clock::VersionVector;
pub use document::Document;
pub use error::OtError;
pub use operation::{Bias, ChangeSet, Operation, Primitive};
pub use transform::{insert_order, transform, transform_against, transform_changes, InsertOrder};

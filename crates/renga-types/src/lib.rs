//! Shared block and output-event types for renga.
//!
//! This crate is the data foundation: the monotonic ID source, blocks,
//! output events, and the state snapshot the engine broadcasts to
//! observers. It has **no internal renga dependencies** — a pure leaf
//! crate that the engine builds on.
//!
//! # Model Overview
//!
//! ```text
//! Document (one open file, one interpreter session)
//!     └── IdSource ← one counter, shared by blocks and events
//!     └── Block (id, code, status, msgs, prev_msgs)
//!         └── OutputEvent (id, payload)
//!     └── DocumentSnapshot ← done ++ [now?] ++ scheduled, published
//!         to observers on every broadcast-worthy change
//! ```
//!
//! A `Block` is one schedulable unit: a blank-line-delimited slice of the
//! document. `msgs` is the output it produced on its own run; `prev_msgs`
//! carries the last known good output of the block it replaced, kept only
//! for display continuity across edits.

pub mod block;
pub mod ids;

// Re-export primary types at crate root for convenience.
pub use block::{Block, BlockStatus, DocumentSnapshot, MimeBundle, OutputEvent, OutputPayload};
pub use ids::IdSource;

/// Mime type key for plain-text payloads, the one every frontend can render.
pub const TEXT_PLAIN: &str = "text/plain";

//! The renga document engine.
//!
//! Keeps a long-lived interpreter session attached to an editable document
//! and incrementally re-executes only the blank-line-delimited blocks that
//! changed since the last run, preempting in-flight work when a newer edit
//! arrives.
//!
//! # Architecture
//!
//! ```text
//!   Document (stable handle)          DocumentActor (one task per doc)
//!   ┌──────────────────────┐   mpsc   ┌──────────────────────────────┐
//!   │ .submit()            │ ───────▶ │ ordered inbox                │
//!   │ .complete()/.inspect │ ◀─────── │ diff → schedule → dispatch   │
//!   │ .close()/.restart()  │  oneshot │ preemption + cancellation    │
//!   └──────────┬───────────┘          └───────┬──────────────────────┘
//!              │ liveness watcher             │ KernelBackend
//!              ▼ (restart on death)           ▼ execute/interrupt/events
//! ```
//!
//! Edits, backend output, and interactive requests all enter the actor
//! through one strictly-ordered inbox; only the actor task mutates document
//! state. The supervisor wraps the actor behind a stable handle and swaps
//! in a fresh actor + session when the backend dies. Observers implement
//! [`Connection`] and receive a [`DocumentSnapshot`] after every
//! broadcast-worthy change, in production order.

mod actor;

pub mod backend;
pub mod config;
pub mod connection;
pub mod diff;
pub mod document;
pub mod error;
pub mod mock;

pub use backend::{
    CompletionReply, InspectReply, KernelBackend, KernelError, KernelEvent, KernelLauncher,
};
pub use config::DocumentConfig;
pub use connection::{Connection, LogConnection};
pub use diff::{Partition, diff};
pub use document::Document;
pub use error::DocError;
pub use mock::{MockKernel, MockLauncher};

// Re-export the data types engine users always need alongside the handle.
pub use renga_types::{Block, BlockStatus, DocumentSnapshot, IdSource, OutputEvent, OutputPayload};

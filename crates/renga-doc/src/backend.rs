//! The interpreter-session seam.
//!
//! [`KernelBackend`] is everything the engine needs from a stateful
//! execution backend: execute/interrupt/liveness, completion and
//! inspection, and an asynchronous event stream. The concrete transport
//! (a Jupyter kernel over ZMQ, a subprocess, the in-process
//! [`MockKernel`](crate::MockKernel)) lives behind this trait.
//!
//! Events fan out over a `tokio::sync::broadcast` channel so the actor can
//! subscribe before issuing its first execute call and a second consumer
//! (logging, a debugger) can tap the same stream without coordination.

use std::sync::Arc;

use async_trait::async_trait;
use renga_types::{MimeBundle, OutputPayload};
use tokio::sync::broadcast;

/// Errors from a backend session.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The session process is gone; the supervisor will replace it.
    #[error("kernel session is dead")]
    Dead,
    /// An execute call failed before completing.
    #[error("execute failed: {0}")]
    Execute(String),
    /// An interrupt signal could not be delivered.
    #[error("interrupt failed: {0}")]
    Interrupt(String),
    /// A completion/inspection request failed.
    #[error("introspection failed: {0}")]
    Introspect(String),
}

/// One event on a backend's output stream.
#[derive(Clone, Debug)]
pub enum KernelEvent {
    /// Output produced by the currently executing code.
    Output(OutputPayload),
    /// Execution-state transition reported by the backend.
    Status { busy: bool },
    /// The current execute call finished. Emitted in-stream, after every
    /// output of that call, so completion cannot overtake output.
    ExecuteDone,
}

/// Reply to a completion request. Forwarded verbatim to the caller; the
/// engine never interprets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionReply {
    pub matches: Vec<String>,
    /// Byte offset where the matched fragment starts in the submitted code.
    pub cursor_start: usize,
    /// Byte offset where the matched fragment ends.
    pub cursor_end: usize,
}

/// Reply to an inspection request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InspectReply {
    pub found: bool,
    pub data: MimeBundle,
}

/// A live interpreter session.
///
/// One session is exclusively owned by one document actor; the supervisor
/// may swap in a new session but never shares one between actors.
#[async_trait]
pub trait KernelBackend: Send + Sync {
    /// Execute one block of code. Resolves when the backend has finished
    /// processing the call (normally, with an error, or interrupted).
    /// Output arrives on the event stream, not in the return value, and
    /// the call is terminated in-stream by [`KernelEvent::ExecuteDone`].
    async fn execute(&self, code: &str) -> Result<(), KernelError>;

    /// Signal the backend to interrupt the current execution. Cooperative:
    /// completion is still reported through `execute` / the event stream.
    async fn interrupt(&self) -> Result<(), KernelError>;

    /// Check whether the session is still alive.
    async fn is_alive(&self) -> bool;

    /// Request code completion at a byte cursor.
    async fn complete(&self, code: &str, cursor: usize) -> Result<CompletionReply, KernelError>;

    /// Request an object description at a byte cursor.
    async fn inspect(&self, code: &str, cursor: usize) -> Result<InspectReply, KernelError>;

    /// Subscribe to the output-event stream. Must be callable before the
    /// first `execute`.
    fn subscribe(&self) -> broadcast::Receiver<KernelEvent>;

    /// Tear the session down. Liveness turns false afterwards.
    async fn shutdown(&self) -> Result<(), KernelError>;
}

/// Factory for backend sessions — the supervisor's way to replace a dead
/// one without knowing the transport.
#[async_trait]
pub trait KernelLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Arc<dyn KernelBackend>>;
}

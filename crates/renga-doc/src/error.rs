//! Engine-level error types.

use crate::backend::KernelError;

/// Errors surfaced to callers of the [`Document`](crate::Document) handle.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    /// The document was closed, or the actor for the current session is gone.
    #[error("document closed")]
    Closed,
    /// The backend rejected or failed an introspection call.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    /// Launching a fresh backend session failed.
    #[error("failed to launch kernel session: {0}")]
    Launch(#[source] anyhow::Error),
}

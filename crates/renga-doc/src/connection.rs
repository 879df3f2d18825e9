//! Snapshot observers.
//!
//! A [`Connection`] receives every published [`DocumentSnapshot`] of a
//! document. The actor delivers sequentially and awaits each observer
//! before pulling its next inbox message, so a slow observer backpressures
//! the whole document rather than seeing snapshots out of order.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use renga_types::DocumentSnapshot;

/// An observer of document state.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Deliver one snapshot. Snapshots for the same document arrive in the
    /// order they were produced.
    async fn notify(&self, document_id: &str, snapshot: DocumentSnapshot);
}

/// Logs newly appeared block output through `tracing`.
///
/// Snapshots overlap heavily, so output-event ids already reported are
/// remembered and skipped. Errors log at warn level with their traceback,
/// everything else at info.
#[derive(Default)]
pub struct LogConnection {
    seen: Mutex<HashSet<u64>>,
}

impl LogConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Connection for LogConnection {
    async fn notify(&self, document_id: &str, snapshot: DocumentSnapshot) {
        let mut seen = self.seen.lock();
        for block in &snapshot.all {
            for event in &block.msgs {
                if !seen.insert(event.id) {
                    continue;
                }
                let Some(text) = event.payload.text_plain() else {
                    continue;
                };
                if event.payload.is_error() {
                    tracing::warn!(document = %document_id, block = block.id, output = %text, "block failed");
                } else {
                    tracing::info!(document = %document_id, block = block.id, output = %text);
                }
            }
        }
    }
}

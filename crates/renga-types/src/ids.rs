//! The per-document monotonic ID source.
//!
//! Blocks and output events draw from one shared counter per open document.
//! IDs start at 1, never repeat, and never decrease — they double as a
//! dedup key for observers that render incrementally. The counter is an
//! explicit object injected at actor construction rather than a global,
//! so two open documents never contend or interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cheaply clonable handle over a shared monotonic counter.
///
/// Clones share the underlying counter: the differ and the actor hold
/// clones of the same source, so block IDs and event IDs interleave in
/// allocation order. Mutation is a single atomic fetch-add; the engine's
/// single-writer discipline means ordering is only ever observed from one
/// task at a time.
#[derive(Clone, Debug)]
pub struct IdSource(Arc<AtomicU64>);

impl IdSource {
    /// New counter starting at 1. Zero is never allocated, so `0` is safe
    /// as a "no id" sentinel in wire formats that lack `Option`.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Allocate the next ID.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The next ID that would be allocated, without allocating it.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for IdSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_start_at_one() {
        let ids = IdSource::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_ids_monotonic() {
        let ids = IdSource::new();
        let mut last = 0;
        for _ in 0..100 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_clones_share_counter() {
        let ids = IdSource::new();
        let other = ids.clone();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(other.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_peek_does_not_allocate() {
        let ids = IdSource::new();
        assert_eq!(ids.peek(), 1);
        assert_eq!(ids.peek(), 1);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.peek(), 2);
    }
}

//! Block and output-event types.
//!
//! A block is one schedulable unit of opaque source text, produced by
//! splitting the document at blank-line boundaries. Blocks are immutable
//! once they reach `Done` or `Cancelled`; they are retained for historical
//! diffing and display continuity, never mutated in place afterwards.
//!
//! ## msgs vs prev_msgs
//!
//! `msgs` is output the block produced on its own run. `prev_msgs` is
//! output captured from the block this one replaced — the "last known good
//! output" an editor keeps showing while the replacement is still queued
//! or running. The differ propagates `prev_msgs` forward through chains of
//! edits even when intermediate blocks never actually ran.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Mime-type → content mapping for rich display payloads.
///
/// Ordered so snapshots serialize deterministically.
pub type MimeBundle = BTreeMap<String, String>;

/// Scheduling status of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum BlockStatus {
    /// Queued, waiting for dispatch.
    #[default]
    Scheduled,
    /// Currently running on the backend. At most one block per document.
    Executing,
    /// Completed, or reused from an earlier run without re-executing.
    Done,
    /// Superseded by a higher-priority body before it could finish.
    Cancelled,
}

impl BlockStatus {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Scheduled => "scheduled",
            BlockStatus::Executing => "executing",
            BlockStatus::Done => "done",
            BlockStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this status is final (Done or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(self, BlockStatus::Done | BlockStatus::Cancelled)
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of backend output, tagged by kind.
///
/// `status` events from the backend are not payloads — they update the
/// document's busy flag and are never appended to a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputPayload {
    /// Rich display data (execute results, display calls).
    Data { data: MimeBundle },
    /// A chunk of a named output stream (stdout, stderr).
    Stream { name: String, text: String },
    /// An execution error with traceback.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl OutputPayload {
    /// The plain-text rendering of this payload, if it has one.
    pub fn text_plain(&self) -> Option<String> {
        match self {
            OutputPayload::Data { data } => data.get(crate::TEXT_PLAIN).cloned(),
            OutputPayload::Stream { text, .. } => Some(text.clone()),
            OutputPayload::Error { traceback, .. } => Some(traceback.join("\n")),
        }
    }

    /// Check if this is an error payload.
    pub fn is_error(&self) -> bool {
        matches!(self, OutputPayload::Error { .. })
    }
}

/// One unit of backend output with its document-wide ID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Monotonic ID drawn from the document's shared [`IdSource`](crate::IdSource).
    pub id: u64,
    /// The payload, tagged by kind.
    pub payload: OutputPayload,
}

impl OutputEvent {
    pub fn new(id: u64, payload: OutputPayload) -> Self {
        Self { id, payload }
    }
}

/// One schedulable unit of code.
///
/// Created only inside the differ; transitions `Scheduled → Executing →
/// Done` on the happy path, or to `Cancelled` when a higher-priority body
/// supersedes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Monotonic ID from the document's shared counter. Stable identity —
    /// a re-diffed block at the same position gets a fresh ID.
    pub id: u64,
    /// Opaque source text slice, split boundaries included.
    pub code: String,
    /// Scheduling status.
    pub status: BlockStatus,
    /// Output produced while this block was executing. Append-only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub msgs: Vec<OutputEvent>,
    /// Output inherited from the block this one replaced, for display
    /// continuity only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prev_msgs: Vec<OutputEvent>,
}

impl Block {
    /// A fresh block in the given status with no output.
    pub fn new(id: u64, code: impl Into<String>, status: BlockStatus) -> Self {
        Self {
            id,
            code: code.into(),
            status,
            msgs: Vec::new(),
            prev_msgs: Vec::new(),
        }
    }

    /// Convert into a cancelled block, retaining whichever of
    /// `msgs`/`prev_msgs` is non-empty so prior output stays visible.
    pub fn into_cancelled(mut self) -> Self {
        if self.msgs.is_empty() {
            self.msgs = std::mem::take(&mut self.prev_msgs);
        } else {
            self.prev_msgs.clear();
        }
        self.status = BlockStatus::Cancelled;
        self
    }
}

/// State snapshot published to observers.
///
/// `all` is `done ++ [now?] ++ scheduled` in document order; the scalar
/// fields mirror the actor's own. Snapshots are complete and consistent —
/// a partial or torn state is never broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Every block of the applied body, in document order.
    pub all: Vec<Block>,
    /// Whether a block is currently dispatched to the backend.
    pub running: bool,
    /// Backend-reported busy/idle state.
    pub busy: bool,
    /// Priority of the currently applied body. Monotonically non-decreasing
    /// within one actor instance.
    pub body_prio: u64,
    /// ID of the block that most recently finished executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<u64>,
}

impl DocumentSnapshot {
    /// Plain-text outputs of all non-cancelled blocks, in document order,
    /// trimmed. The shape the concrete test scenarios assert on.
    pub fn outputs(&self) -> Vec<String> {
        self.all
            .iter()
            .filter(|b| b.status != BlockStatus::Cancelled)
            .flat_map(|b| b.msgs.iter())
            .filter_map(|m| m.payload.text_plain())
            .map(|t| t.trim().to_string())
            .collect()
    }

    /// Plain-text prior outputs (`prev_msgs`) of all blocks, in document
    /// order, trimmed.
    pub fn prev_outputs(&self) -> Vec<String> {
        self.all
            .iter()
            .flat_map(|b| b.prev_msgs.iter())
            .filter_map(|m| m.payload.text_plain())
            .map(|t| t.trim().to_string())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn data_event(id: u64, text: &str) -> OutputEvent {
        let mut data = MimeBundle::new();
        data.insert(crate::TEXT_PLAIN.to_string(), text.to_string());
        OutputEvent::new(id, OutputPayload::Data { data })
    }

    fn stream_event(id: u64, text: &str) -> OutputEvent {
        OutputEvent::new(
            id,
            OutputPayload::Stream {
                name: "stdout".to_string(),
                text: text.to_string(),
            },
        )
    }

    // ── BlockStatus ─────────────────────────────────────────────────────

    #[test]
    fn test_status_parsing() {
        assert_eq!(BlockStatus::from_str("scheduled"), Some(BlockStatus::Scheduled));
        assert_eq!(BlockStatus::from_str("EXECUTING"), Some(BlockStatus::Executing));
        assert_eq!(BlockStatus::from_str("Done"), Some(BlockStatus::Done));
        assert_eq!(BlockStatus::from_str("cancelled"), Some(BlockStatus::Cancelled));
        assert_eq!(BlockStatus::from_str("invalid"), None);
    }

    #[test]
    fn test_status_terminal() {
        assert!(BlockStatus::Done.is_terminal());
        assert!(BlockStatus::Cancelled.is_terminal());
        assert!(!BlockStatus::Scheduled.is_terminal());
        assert!(!BlockStatus::Executing.is_terminal());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&BlockStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    // ── OutputPayload ───────────────────────────────────────────────────

    #[test]
    fn test_text_plain_extraction() {
        assert_eq!(data_event(1, "42").payload.text_plain().as_deref(), Some("42"));
        assert_eq!(stream_event(2, "hi\n").payload.text_plain().as_deref(), Some("hi\n"));

        let err = OutputPayload::Error {
            ename: "ValueError".into(),
            evalue: "boom".into(),
            traceback: vec!["line 1".into(), "line 2".into()],
        };
        assert_eq!(err.text_plain().as_deref(), Some("line 1\nline 2"));
        assert!(err.is_error());
    }

    #[test]
    fn test_payload_serde_tagging() {
        let ev = stream_event(7, "out");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"stream\""));
        let parsed: OutputEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ev);
    }

    #[test]
    fn test_payload_postcard_roundtrip() {
        let ev = data_event(3, "x");
        let bytes = postcard::to_stdvec(&ev).unwrap();
        let parsed: OutputEvent = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, ev);
    }

    // ── Block ───────────────────────────────────────────────────────────

    #[test]
    fn test_block_new_is_empty() {
        let b = Block::new(1, "print('a')", BlockStatus::Scheduled);
        assert!(b.msgs.is_empty());
        assert!(b.prev_msgs.is_empty());
        assert_eq!(b.status, BlockStatus::Scheduled);
    }

    #[test]
    fn test_cancel_keeps_own_output() {
        let mut b = Block::new(1, "code", BlockStatus::Executing);
        b.msgs.push(stream_event(2, "partial"));
        b.prev_msgs.push(stream_event(1, "old"));
        let b = b.into_cancelled();
        assert_eq!(b.status, BlockStatus::Cancelled);
        assert_eq!(b.msgs.len(), 1);
        assert_eq!(b.msgs[0].payload.text_plain().as_deref(), Some("partial"));
        assert!(b.prev_msgs.is_empty());
    }

    #[test]
    fn test_cancel_falls_back_to_prev_output() {
        let mut b = Block::new(1, "code", BlockStatus::Scheduled);
        b.prev_msgs.push(stream_event(1, "old"));
        let b = b.into_cancelled();
        assert_eq!(b.msgs[0].payload.text_plain().as_deref(), Some("old"));
        assert!(b.prev_msgs.is_empty());
    }

    #[test]
    fn test_block_serde_skips_empty_output() {
        let b = Block::new(1, "code", BlockStatus::Done);
        let json = serde_json::to_string(&b).unwrap();
        assert!(!json.contains("msgs"));
        let parsed: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, b);
    }

    // ── DocumentSnapshot ────────────────────────────────────────────────

    fn snapshot(blocks: Vec<Block>) -> DocumentSnapshot {
        DocumentSnapshot {
            all: blocks,
            running: false,
            busy: false,
            body_prio: 1,
            finished: None,
        }
    }

    #[test]
    fn test_outputs_skip_cancelled() {
        let mut a = Block::new(1, "a", BlockStatus::Done);
        a.msgs.push(stream_event(2, "a\n"));
        let mut b = Block::new(3, "b", BlockStatus::Cancelled);
        b.msgs.push(stream_event(4, "b\n"));
        let s = snapshot(vec![a, b]);
        assert_eq!(s.outputs(), vec!["a"]);
    }

    #[test]
    fn test_prev_outputs_cover_all_blocks() {
        let mut a = Block::new(1, "a", BlockStatus::Done);
        a.prev_msgs.push(data_event(2, "1"));
        let mut b = Block::new(3, "b", BlockStatus::Cancelled);
        b.prev_msgs.push(data_event(4, "2"));
        let s = snapshot(vec![a, b]);
        assert_eq!(s.prev_outputs(), vec!["1", "2"]);
    }

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let mut a = Block::new(1, "a", BlockStatus::Done);
        a.msgs.push(data_event(2, "1"));
        let s = snapshot(vec![a]);
        let json = serde_json::to_string(&s).unwrap();
        let parsed: DocumentSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, s);
    }
}

//! Block splitter and positional differ.
//!
//! `diff` turns the new document text plus the previous block list into a
//! reusable/rescheduled partition. It is a pure function: fresh blocks are
//! created here (nowhere else), IDs come from the injected
//! [`IdSource`], and no global state is touched.
//!
//! The walk is positional with a sticky `changed` flag: once any position
//! differs, every later position is rescheduled even if textually
//! identical to its old counterpart. Without the flag, an edit that shifts
//! block boundaries would spuriously re-match unrelated later blocks.

use std::collections::VecDeque;
use std::sync::OnceLock;

use regex::Regex;
use renga_types::{Block, BlockStatus, IdSource, OutputEvent};

/// Result of diffing a new body against the previous blocks.
#[derive(Clone, Debug, Default)]
pub struct Partition {
    /// Blocks considered already computed, in document order.
    pub done: Vec<Block>,
    /// Blocks that need (re-)execution, in dispatch order.
    pub scheduled: VecDeque<Block>,
}

fn boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{2,}").expect("static regex"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#[^\n]*").expect("static regex"))
}

fn trailing_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*\n").expect("static regex"))
}

/// Split a body into block slices.
///
/// A boundary sits before a run of two-or-more newlines that follows a
/// non-newline character and is itself followed by a non-whitespace
/// character. The newlines stay with the following slice, so
/// concatenating the slices reproduces the body exactly.
pub fn split_blocks(body: &str) -> Vec<&str> {
    let mut cuts = Vec::new();
    for m in boundary_re().find_iter(body) {
        if m.start() == 0 {
            // leading blank lines belong to the first slice
            continue;
        }
        match body[m.end()..].chars().next() {
            Some(c) if !c.is_whitespace() => cuts.push(m.start()),
            _ => {}
        }
    }
    let mut slices = Vec::with_capacity(cuts.len() + 1);
    let mut start = 0;
    for cut in cuts {
        slices.push(&body[start..cut]);
        start = cut;
    }
    slices.push(&body[start..]);
    slices
}

/// Normalize a slice for comparison: trim, strip line comments, collapse
/// trailing whitespace (including blank lines) before each newline. The
/// final trim catches whitespace a stripped last-line comment leaves
/// behind, so a comment-only edit still compares equal.
pub fn normalize(code: &str) -> String {
    let stripped = comment_re().replace_all(code.trim(), "");
    trailing_ws_re()
        .replace_all(&stripped, "\n")
        .trim_end()
        .to_owned()
}

/// Output to carry forward into a rescheduled block's `prev_msgs`.
///
/// A previous `Done` block contributes its own `msgs`; any other block
/// contributes its `msgs` if it produced some, else whatever it had
/// inherited — so "last known good output" survives a chain of edits even
/// when intermediate blocks never ran.
fn carry_forward(prev: &Block) -> Vec<OutputEvent> {
    if prev.status == BlockStatus::Done || !prev.msgs.is_empty() {
        prev.msgs.clone()
    } else {
        prev.prev_msgs.clone()
    }
}

/// Diff a new body against the previous block list.
pub fn diff(new_body: &str, prevs: &[Block], ids: &IdSource) -> Partition {
    let mut out = Partition::default();
    let mut changed = false;

    for (i, code) in split_blocks(new_body).into_iter().enumerate() {
        let prev = prevs.get(i);
        match prev {
            Some(p)
                if !changed
                    && p.status != BlockStatus::Cancelled
                    && normalize(&p.code) == normalize(code) =>
            {
                let mut block = Block::new(ids.next_id(), code, BlockStatus::Done);
                block.msgs = p.msgs.clone();
                out.done.push(block);
            }
            _ => {
                changed = true;
                let mut block = Block::new(ids.next_id(), code, BlockStatus::Scheduled);
                if let Some(p) = prev {
                    block.prev_msgs = carry_forward(p);
                }
                out.scheduled.push_back(block);
            }
        }
    }
    // positions with no new slice (document shrank) are dropped

    out
}

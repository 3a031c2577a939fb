//! Choosing where history may be truncated.
//!
//! A cut index splits a branch into "summarize" (before) and "keep
//! verbatim" (from the cut on). Tool results are never valid cuts: they
//! must stay attached to the assistant call that produced them. When the
//! only acceptable cut falls inside a turn, the turn is flagged as split so
//! its prefix can be summarized separately.

use super::tokens::TokenEstimator;
use crate::AgentMessage;
use crate::session::{Entry, EntryKind};

/// Where to cut, and whether the cut splits a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutPoint {
    /// Index of the first entry kept verbatim.
    pub cut_index: usize,
    /// Start of the turn containing the cut, when the turn is split.
    pub turn_start_index: Option<usize>,
    pub is_split_turn: bool,
}

/// Indices in `[start, end)` at which kept history may begin.
///
/// Candidates are non-tool-result messages, branch summaries, and custom
/// messages.
pub fn valid_cut_points(entries: &[Entry], start: usize, end: usize) -> Vec<usize> {
    let end = end.min(entries.len());
    (start..end)
        .filter(|&i| match &entries[i].kind {
            EntryKind::Message { message } => !message.is_tool_result(),
            EntryKind::BranchSummary(_) | EntryKind::CustomMessage { .. } => true,
            EntryKind::Compaction(_)
            | EntryKind::ModelChange { .. }
            | EntryKind::ThinkingLevelChange { .. }
            | EntryKind::Label { .. }
            | EntryKind::Custom { .. } => false,
        })
        .collect()
}

/// Whether `entry` opens a turn.
fn is_turn_start(entry: &Entry) -> bool {
    match &entry.kind {
        EntryKind::BranchSummary(_) | EntryKind::CustomMessage { .. } => true,
        EntryKind::Message { message } => matches!(
            message,
            AgentMessage::User { .. } | AgentMessage::BashExecution { .. }
        ),
        _ => false,
    }
}

/// Select the cut index for `[start, end)` keeping at least
/// `keep_recent_tokens` of recent history where possible.
pub fn select_cut_point(
    entries: &[Entry],
    start: usize,
    end: usize,
    keep_recent_tokens: u64,
    estimator: &TokenEstimator,
) -> CutPoint {
    let end = end.min(entries.len());
    let candidates = valid_cut_points(entries, start, end);
    let Some(&earliest) = candidates.first() else {
        return CutPoint {
            cut_index: start,
            turn_start_index: None,
            is_split_turn: false,
        };
    };

    // Walk backward until the recent span reaches the budget, then take
    // the first candidate at or after that point.
    let mut cut_index = earliest;
    let mut accumulated: u64 = 0;
    for i in (start..end).rev() {
        let Some(message) = entries[i].to_message() else {
            continue;
        };
        accumulated += estimator.estimate(&message);
        if accumulated >= keep_recent_tokens {
            if let Some(&c) = candidates.iter().find(|&&c| c >= i) {
                cut_index = c;
            }
            break;
        }
    }

    // Back up over non-message scaffolding preceding the cut.
    while cut_index > start {
        let prev = &entries[cut_index - 1];
        if matches!(
            prev.kind,
            EntryKind::Compaction(_) | EntryKind::Message { .. }
        ) {
            break;
        }
        cut_index -= 1;
    }

    // Scaffolding in front of a turn start belongs to that turn.
    let opens_turn = (cut_index..end)
        .find(|&i| entries[i].is_model_visible())
        .is_some_and(|i| is_turn_start(&entries[i]));
    if opens_turn {
        return CutPoint {
            cut_index,
            turn_start_index: None,
            is_split_turn: false,
        };
    }

    match (start..cut_index).rev().find(|&i| is_turn_start(&entries[i])) {
        Some(t) => CutPoint {
            cut_index,
            turn_start_index: Some(t),
            is_split_turn: true,
        },
        None => CutPoint {
            cut_index,
            turn_start_index: None,
            is_split_turn: false,
        },
    }
}

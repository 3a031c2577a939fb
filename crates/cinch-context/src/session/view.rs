//! Rebuild the model-facing conversation from a branch.

use super::{Entry, EntryKind};
use crate::AgentMessage;

/// Conversation records the model sees for `branch`.
///
/// With a compaction on the branch, the latest one wins: its summary comes
/// first, then the kept entries from `first_kept_entry_id` up to the
/// compaction, then everything after it. Metadata markers never appear.
pub fn build_session_context(branch: &[Entry]) -> Vec<AgentMessage> {
    let last_compaction = branch.iter().rposition(Entry::is_compaction);

    let Some(compaction_idx) = last_compaction else {
        return branch.iter().filter_map(Entry::to_message).collect();
    };

    let mut messages = Vec::new();
    if let Some(summary) = branch[compaction_idx].to_message() {
        messages.push(summary);
    }

    let first_kept = match &branch[compaction_idx].kind {
        EntryKind::Compaction(c) => branch[..compaction_idx]
            .iter()
            .position(|e| e.id == c.first_kept_entry_id),
        _ => None,
    };
    if let Some(start) = first_kept {
        messages.extend(branch[start..compaction_idx].iter().filter_map(Entry::to_message));
    }

    messages.extend(
        branch[compaction_idx + 1..]
            .iter()
            .filter_map(Entry::to_message),
    );
    messages
}

//! Reduction plans for history compaction.
//!
//! [`prepare_compaction`] turns a branch into an immutable
//! [`CompactionPreparation`]: which records get summarized, which turn
//! prefix (if any) needs its own summary, where kept history starts, and
//! the file provenance to carry forward. It is pure and synchronous; the
//! model calls happen later in [`summarizer`](super::summarizer).

use super::cut_point::select_cut_point;
use super::file_tracker::FileOperations;
use super::tokens::TokenEstimator;
use crate::AgentMessage;
use crate::session::{CompactionDetails, Entry, EntryKind, build_session_context};
use serde::{Deserialize, Serialize};

/// Default tokens kept free for the next model response.
pub const DEFAULT_RESERVE_TOKENS: u32 = 16_384;

/// Default minimum recent history kept verbatim.
pub const DEFAULT_KEEP_RECENT_TOKENS: u32 = 20_000;

/// Budget settings for history compaction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Space to keep free for the next model response.
    pub reserve_tokens: u32,
    /// Minimum recent-history budget to preserve verbatim.
    pub keep_recent_tokens: u32,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: DEFAULT_RESERVE_TOKENS,
            keep_recent_tokens: DEFAULT_KEEP_RECENT_TOKENS,
        }
    }
}

impl CompactionSettings {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_reserve_tokens(mut self, tokens: u32) -> Self {
        self.reserve_tokens = tokens;
        self
    }

    pub fn with_keep_recent_tokens(mut self, tokens: u32) -> Self {
        self.keep_recent_tokens = tokens;
        self
    }
}

/// Immutable plan for one compaction attempt.
#[derive(Debug, Clone)]
pub struct CompactionPreparation {
    /// First entry kept verbatim after the reduction.
    pub first_kept_entry_id: String,
    /// Records summarized into the history summary, oldest first.
    pub messages_to_summarize: Vec<AgentMessage>,
    /// Start of a turn split by the cut, summarized separately.
    pub turn_prefix_messages: Vec<AgentMessage>,
    pub is_split_turn: bool,
    /// Estimated context size before the reduction.
    pub tokens_before: u64,
    /// Summary of the previous compaction, for incremental updates.
    pub previous_summary: Option<String>,
    pub file_ops: FileOperations,
    pub settings: CompactionSettings,
}

/// Output of a summary generator or an override hook.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    #[serde(default)]
    pub details: CompactionDetails,
}

/// Whether a context of `context_tokens` has outgrown its window.
pub fn should_compact(context_tokens: u64, context_window: u64, settings: &CompactionSettings) -> bool {
    settings.enabled
        && context_tokens > context_window.saturating_sub(u64::from(settings.reserve_tokens))
}

/// Estimated context size of `messages`.
///
/// Anchors on the last successful assistant usage figure and adds estimates
/// for the records after it. Without any usage figure the whole span is
/// estimated.
pub fn estimate_context_tokens(messages: &[AgentMessage], estimator: &TokenEstimator) -> u64 {
    let last_usage = messages
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, m)| m.assistant_usage().map(|u| (i, u)));

    match last_usage {
        Some((i, usage)) => usage
            .context_tokens()
            .saturating_add(estimator.estimate_all(&messages[i + 1..])),
        None => estimator.estimate_all(messages),
    }
}

/// Estimated context size of the model-facing view of `branch`.
///
/// Usage figures recorded before the latest compaction describe the
/// context as it was before reduction, so only assistant usage from
/// entries after that compaction is trusted. Until such a response exists
/// the whole view is estimated from its characters.
pub fn estimate_branch_context_tokens(branch: &[Entry], estimator: &TokenEstimator) -> u64 {
    let view = build_session_context(branch);
    let Some(compaction_idx) = branch.iter().rposition(Entry::is_compaction) else {
        return estimate_context_tokens(&view, estimator);
    };

    let fresh: Vec<AgentMessage> = branch[compaction_idx + 1..]
        .iter()
        .filter_map(Entry::to_message)
        .collect();
    let last_usage = fresh
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, m)| m.assistant_usage().map(|u| (i, u)));

    match last_usage {
        Some((i, usage)) => usage
            .context_tokens()
            .saturating_add(estimator.estimate_all(&fresh[i + 1..])),
        None => estimator.estimate_all(&view),
    }
}

/// Build a compaction plan for `branch`, or `None` if there is nothing to do.
///
/// Returns `None` when the branch is empty, when its last entry is already
/// a compaction, or when the span after the previous compaction holds
/// nothing worth summarizing.
pub fn prepare_compaction(
    branch: &[Entry],
    settings: &CompactionSettings,
    estimator: &TokenEstimator,
) -> Option<CompactionPreparation> {
    let last = branch.last()?;
    if last.is_compaction() {
        return None;
    }

    let prev_compaction = branch.iter().rposition(Entry::is_compaction);
    let boundary_start = prev_compaction.map_or(0, |i| i + 1);
    let boundary_end = branch.len();

    // The previous compaction's summary is part of the current context.
    let usage_messages: Vec<AgentMessage> = branch[prev_compaction.unwrap_or(0)..]
        .iter()
        .filter_map(Entry::to_message)
        .collect();
    let tokens_before = estimate_context_tokens(&usage_messages, estimator);

    let cut = select_cut_point(
        branch,
        boundary_start,
        boundary_end,
        u64::from(settings.keep_recent_tokens),
        estimator,
    );
    let first_kept_entry_id = branch[cut.cut_index].id.clone();

    let history_end = match (cut.is_split_turn, cut.turn_start_index) {
        (true, Some(turn_start)) => turn_start,
        _ => cut.cut_index,
    };
    let messages_to_summarize: Vec<AgentMessage> = branch[boundary_start..history_end]
        .iter()
        .filter_map(Entry::to_message)
        .collect();
    let turn_prefix_messages: Vec<AgentMessage> = if cut.is_split_turn {
        branch[history_end..cut.cut_index]
            .iter()
            .filter_map(Entry::to_message)
            .collect()
    } else {
        Vec::new()
    };

    if messages_to_summarize.is_empty() && turn_prefix_messages.is_empty() {
        return None;
    }

    let mut file_ops = FileOperations::new();
    let mut previous_summary = None;
    if let Some(EntryKind::Compaction(prev)) = prev_compaction.map(|i| &branch[i].kind) {
        previous_summary = Some(prev.summary.clone());
        // Hook-produced provenance is not trusted; tracking restarts.
        if !prev.from_hook
            && let Some(details) = &prev.details
        {
            file_ops.seed(details);
        }
    }
    file_ops.extend_all(&messages_to_summarize);
    file_ops.extend_all(&turn_prefix_messages);

    Some(CompactionPreparation {
        first_kept_entry_id,
        messages_to_summarize,
        turn_prefix_messages,
        is_split_turn: cut.is_split_turn,
        tokens_before,
        previous_summary,
        file_ops,
        settings: settings.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CompactionEntry, EntryStore, SessionLog};
    use crate::{ContentBlock, StopReason, Usage};
    use serde_json::json;

    fn read_call(path: &str) -> AgentMessage {
        AgentMessage::assistant(vec![ContentBlock::tool_call(
            "c",
            "read",
            json!({"path": path}),
        )])
    }

    fn edit_call(path: &str) -> AgentMessage {
        AgentMessage::assistant(vec![ContentBlock::tool_call(
            "c",
            "edit",
            json!({"path": path}),
        )])
    }

    fn with_usage(total: u64, stop_reason: StopReason) -> AgentMessage {
        let mut msg = AgentMessage::assistant_text("ok");
        if let AgentMessage::Assistant(ref mut a) = msg {
            a.usage = Usage {
                total_tokens: total,
                ..Default::default()
            };
            a.stop_reason = stop_reason;
        }
        msg
    }

    /// Ten turns of ~100-token user question, file read, result, answer.
    fn session(turns: usize) -> SessionLog {
        let mut log = SessionLog::new();
        for t in 0..turns {
            log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
            log.append_message(read_call(&format!("src/f{t}.rs"))).unwrap();
            log.append_message(AgentMessage::tool_result("c", "read", "r".repeat(400), false))
                .unwrap();
            log.append_message(AgentMessage::assistant_text("a".repeat(400)))
                .unwrap();
        }
        log
    }

    fn settings(keep_recent: u32) -> CompactionSettings {
        CompactionSettings::default().with_keep_recent_tokens(keep_recent)
    }

    #[test]
    fn should_compact_threshold() {
        let s = CompactionSettings::default().with_reserve_tokens(1000);
        assert!(!should_compact(9_000, 10_000, &s));
        assert!(!should_compact(9_000, 10_000, &CompactionSettings::disabled()));
        assert!(should_compact(9_001, 10_000, &s));
        assert!(should_compact(1, 500, &s));
    }

    #[test]
    fn context_estimate_anchors_on_last_successful_usage() {
        let est = TokenEstimator::default();
        let messages = vec![
            with_usage(1_000, StopReason::Stop),
            AgentMessage::user("abcd"),
            with_usage(9_999, StopReason::Error),
            AgentMessage::user("abcdefgh"),
        ];
        // 1000 + user(1) + errored assistant text "ok"(1) + user(2)
        assert_eq!(estimate_context_tokens(&messages, &est), 1_004);
        assert_eq!(
            estimate_context_tokens(&[AgentMessage::user("abcd")], &est),
            1
        );
    }

    #[test]
    fn branch_estimate_ignores_usage_from_before_the_compaction() {
        let est = TokenEstimator::default();
        let mut log = SessionLog::new();
        log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
        log.append_message(with_usage(120_000, StopReason::Stop)).unwrap();
        log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
        let kept = log
            .append_message(with_usage(120_000, StopReason::Stop))
            .unwrap();
        log.append_compaction("summary".into(), kept, 120_000, None, false)
            .unwrap();

        // The kept assistant still reports the pre-compaction total.
        let view = build_session_context(&log.branch_entries(None));
        assert_eq!(estimate_context_tokens(&view, &est), 120_000);
        assert_eq!(
            estimate_branch_context_tokens(&log.branch_entries(None), &est),
            est.estimate_all(&view)
        );

        // A failed response carries no trusted figure either.
        log.append_message(AgentMessage::user("hi")).unwrap();
        log.append_message(with_usage(9_999, StopReason::Error)).unwrap();
        log.append_message(AgentMessage::user("u".repeat(800))).unwrap();
        let branch = log.branch_entries(None);
        let estimate = estimate_branch_context_tokens(&branch, &est);
        assert_eq!(estimate, est.estimate_all(&build_session_context(&branch)));
        assert!(estimate < 1_000, "estimate {estimate}");

        // A fresh successful response becomes the anchor.
        log.append_message(with_usage(3_000, StopReason::Stop)).unwrap();
        log.append_message(AgentMessage::user("abcd")).unwrap();
        assert_eq!(
            estimate_branch_context_tokens(&log.branch_entries(None), &est),
            3_001
        );
    }

    #[test]
    fn branch_estimate_without_compaction_matches_view_estimate() {
        let est = TokenEstimator::default();
        let mut log = SessionLog::new();
        log.append_message(with_usage(1_000, StopReason::Stop)).unwrap();
        log.append_message(AgentMessage::user("abcd")).unwrap();
        assert_eq!(
            estimate_branch_context_tokens(&log.branch_entries(None), &est),
            1_001
        );
    }

    #[test]
    fn empty_branch_has_no_plan() {
        assert!(prepare_compaction(&[], &settings(0), &TokenEstimator::default()).is_none());
    }

    #[test]
    fn branch_ending_in_compaction_has_no_plan() {
        let mut log = session(3);
        let kept = log.branch_entries(None)[8].id.clone();
        log.append_compaction("s".into(), kept, 10, None, false)
            .unwrap();
        let plan = prepare_compaction(
            &log.branch_entries(None),
            &settings(0),
            &TokenEstimator::default(),
        );
        assert!(plan.is_none());
    }

    #[test]
    fn clean_cut_summarizes_everything_before_it() {
        let log = session(4);
        let branch = log.branch_entries(None);
        // One full turn (~306 tokens) kept.
        let plan = prepare_compaction(&branch, &settings(300), &TokenEstimator::default()).unwrap();
        assert_eq!(plan.first_kept_entry_id, branch[12].id);
        assert!(!plan.is_split_turn);
        assert_eq!(plan.messages_to_summarize.len(), 12);
        assert!(plan.turn_prefix_messages.is_empty());
        assert!(plan.previous_summary.is_none());

        let (read_only, modified) = plan.file_ops.finalize();
        assert_eq!(read_only, vec!["src/f0.rs", "src/f1.rs", "src/f2.rs"]);
        assert!(modified.is_empty());
    }

    #[test]
    fn split_turn_separates_the_prefix() {
        let log = session(4);
        let branch = log.branch_entries(None);
        let plan = prepare_compaction(&branch, &settings(50), &TokenEstimator::default()).unwrap();
        assert!(plan.is_split_turn);
        assert_eq!(plan.first_kept_entry_id, branch[15].id);
        assert_eq!(plan.messages_to_summarize.len(), 12);
        assert_eq!(plan.turn_prefix_messages.len(), 3);
        // The turn prefix contributes provenance too.
        assert!(plan.file_ops.read.contains("src/f3.rs"));
    }

    #[test]
    fn kept_span_never_starts_at_a_tool_result() {
        let log = session(6);
        let branch = log.branch_entries(None);
        for keep in [0, 1, 50, 99, 100, 101, 150, 305, 306, 307, 700, 5_000] {
            let Some(plan) =
                prepare_compaction(&branch, &settings(keep), &TokenEstimator::default())
            else {
                continue;
            };
            let first = branch
                .iter()
                .find(|e| e.id == plan.first_kept_entry_id)
                .unwrap();
            assert!(
                !first.as_message().is_some_and(AgentMessage::is_tool_result),
                "keep={keep} starts at a tool result"
            );
        }
    }

    #[test]
    fn larger_keep_budget_never_keeps_fewer_records() {
        let log = session(6);
        let branch = log.branch_entries(None);
        let kept = |keep: u32| {
            prepare_compaction(&branch, &settings(keep), &TokenEstimator::default())
                .map(|p| {
                    branch.len()
                        - branch
                            .iter()
                            .position(|e| e.id == p.first_kept_entry_id)
                            .unwrap()
                })
                .unwrap_or(branch.len())
        };
        let mut previous = 0;
        for keep in (0..2_000).step_by(37) {
            let now = kept(keep);
            assert!(now >= previous, "keep={keep}: {now} < {previous}");
            previous = now;
        }
    }

    #[test]
    fn second_pass_starts_after_previous_compaction() {
        let mut log = session(3);
        let branch = log.branch_entries(None);
        let first = prepare_compaction(&branch, &settings(300), &TokenEstimator::default()).unwrap();
        assert_eq!(first.file_ops.to_details().read_files, vec!["src/f0.rs", "src/f1.rs"]);
        log.append_compaction(
            "first summary".into(),
            first.first_kept_entry_id.clone(),
            first.tokens_before,
            Some(first.file_ops.to_details()),
            false,
        )
        .unwrap();

        // Immediately re-preparing is a no-op.
        assert!(
            prepare_compaction(
                &log.branch_entries(None),
                &settings(300),
                &TokenEstimator::default()
            )
            .is_none()
        );

        for path in ["src/f0.rs", "src/new.rs", "src/kept.rs"] {
            log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
            log.append_message(edit_call(path)).unwrap();
            log.append_message(AgentMessage::assistant_text("a".repeat(400)))
                .unwrap();
        }
        let second = prepare_compaction(
            &log.branch_entries(None),
            &settings(200),
            &TokenEstimator::default(),
        )
        .unwrap();
        assert_eq!(second.previous_summary.as_deref(), Some("first summary"));
        // Only records after the compaction are summarized.
        assert!(second.messages_to_summarize.iter().all(|m| !matches!(
            m,
            AgentMessage::CompactionSummary { .. }
        )));

        // Read provenance survives unless the file was later modified.
        // The last turn is kept, so its edit is not recorded yet.
        let (read_only, modified) = second.file_ops.finalize();
        assert_eq!(read_only, vec!["src/f1.rs"]);
        assert_eq!(modified, vec!["src/f0.rs", "src/new.rs"]);
    }

    #[test]
    fn hook_produced_provenance_is_not_seeded() {
        let mut log = session(2);
        let branch = log.branch_entries(None);
        log.insert(Entry::new(
            "hooked",
            log.current_leaf_id(),
            EntryKind::Compaction(CompactionEntry {
                summary: "from a hook".into(),
                first_kept_entry_id: branch[4].id.clone(),
                tokens_before: 10,
                details: Some(CompactionDetails {
                    read_files: vec!["untrusted.rs".into()],
                    modified_files: vec![],
                }),
                from_hook: true,
            }),
        ))
        .unwrap();
        log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
        log.append_message(AgentMessage::assistant_text("a".repeat(400)))
            .unwrap();
        log.append_message(AgentMessage::user("q".repeat(400))).unwrap();

        let plan = prepare_compaction(
            &log.branch_entries(None),
            &settings(50),
            &TokenEstimator::default(),
        )
        .unwrap();
        assert!(!plan.file_ops.read.contains("untrusted.rs"));
        assert_eq!(plan.previous_summary.as_deref(), Some("from a hook"));
    }

    #[test]
    fn tokens_before_uses_usage_after_previous_compaction() {
        let mut log = SessionLog::new();
        log.append_message(AgentMessage::user("q".repeat(400))).unwrap();
        log.append_message(with_usage(5_000, StopReason::Stop)).unwrap();
        log.append_message(AgentMessage::user("abcd")).unwrap();
        log.append_message(AgentMessage::assistant_text("b".repeat(40)))
            .unwrap();
        let plan = prepare_compaction(
            &log.branch_entries(None),
            &settings(0),
            &TokenEstimator::default(),
        )
        .unwrap();
        assert_eq!(plan.tokens_before, 5_000 + 1 + 10);
    }
}

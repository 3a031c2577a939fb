//! Summaries of abandoned conversation branches.
//!
//! When the user navigates from one leaf to another, the entries between
//! the old leaf and the common ancestor drop out of the active context.
//! [`summarize_branch`] captures them in a short summary that is attached
//! to the new position.
//!
//! Unlike compaction there is no structural cut: the span is trimmed
//! newest-first against a token budget and tool results are dropped, since
//! no later turn depends on them.

use super::file_tracker::{FileOperations, format_file_operations};
use super::summarizer::{SUMMARIZATION_SYSTEM_PROMPT, build_prompt, request_summary};
use super::tokens::TokenEstimator;
use crate::AgentMessage;
use crate::api::{CompletionRequest, LlmTransport, SummaryModel};
use crate::error::ReductionError;
use crate::session::{Entry, EntryKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Summary returned when the abandoned span has nothing to summarize.
pub const EMPTY_BRANCH_SUMMARY: &str = "No conversation to summarize.";

/// Output ceiling for branch summary calls.
pub const BRANCH_SUMMARY_MAX_TOKENS: u32 = 2048;

/// Prepended to every generated branch summary.
pub const BRANCH_SUMMARY_PREAMBLE: &str = "\
Before returning to this point, the user explored another branch of the conversation. \
What happened there:\n\n";

pub const BRANCH_SUMMARY_PROMPT: &str = "\
Summarize the conversation branch above. The user has left it to continue \
from an earlier point, so capture what was attempted and learned:

## Goal
[What the user wanted from this branch]

## Constraints & Preferences
- [Requirements the user stated, or \"(none)\"]

## Progress
### Done
- [x] [Finished work]

### In Progress
- [ ] [Unfinished work]

### Blocked
- [Problems hit, if any]

## Key Decisions
- **[Decision]**: [Short reason]

## Next Steps
1. [What would have come next]

Be brief. Keep file paths, function names and error messages verbatim.";

/// Budget settings for branch summaries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BranchSummarySettings {
    pub reserve_tokens: u32,
    pub context_window_tokens: u32,
}

impl Default for BranchSummarySettings {
    fn default() -> Self {
        Self {
            reserve_tokens: 16_384,
            context_window_tokens: 128_000,
        }
    }
}

impl BranchSummarySettings {
    /// Tokens of the abandoned span to send: the window minus the reserve.
    pub fn token_budget(&self) -> u64 {
        u64::from(
            self.context_window_tokens
                .saturating_sub(self.reserve_tokens),
        )
    }
}

/// Records selected for a branch summary.
#[derive(Debug, Clone, Default)]
pub struct BranchSummaryPreparation {
    /// Oldest first.
    pub messages: Vec<AgentMessage>,
    pub file_ops: FileOperations,
    pub total_tokens: u64,
}

/// Select the records of `entries` to summarize within `token_budget`.
///
/// Walks newest-first and stops at the first record that would exceed the
/// budget. A compaction or branch summary that does not fit is still taken
/// while the span is under 90% of the budget. A budget of 0 is unlimited.
/// Provenance covers every entry, including the ones trimmed away.
pub fn prepare_branch_entries(
    entries: &[Entry],
    token_budget: u64,
    estimator: &TokenEstimator,
) -> BranchSummaryPreparation {
    let mut file_ops = FileOperations::new();
    for entry in entries {
        if let EntryKind::BranchSummary(summary) = &entry.kind
            && !summary.from_hook
            && let Some(details) = &summary.details
        {
            file_ops.seed(details);
        }
        if let Some(message) = entry.as_message() {
            file_ops.extend(message);
        }
    }

    let mut messages = Vec::new();
    let mut total_tokens: u64 = 0;
    for entry in entries.iter().rev() {
        let Some(message) = entry.to_message() else {
            continue;
        };
        if message.is_tool_result() {
            continue;
        }
        let tokens = estimator.estimate(&message);
        if token_budget > 0 && total_tokens + tokens > token_budget {
            let is_summary = matches!(
                entry.kind,
                EntryKind::Compaction(_) | EntryKind::BranchSummary(_)
            );
            if is_summary && total_tokens * 10 < token_budget * 9 {
                messages.push(message);
                total_tokens += tokens;
            }
            break;
        }
        messages.push(message);
        total_tokens += tokens;
    }
    messages.reverse();

    BranchSummaryPreparation {
        messages,
        file_ops,
        total_tokens,
    }
}

/// Options for [`summarize_branch`].
#[derive(Debug, Clone, Default)]
pub struct BranchSummaryOptions {
    /// Estimated tokens of the span to send (0 = unlimited).
    pub token_budget: u64,
    pub custom_instructions: Option<String>,
    pub estimator: TokenEstimator,
}

/// Result of a branch summary attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchSummaryOutcome {
    Summary {
        summary: String,
        read_files: Vec<String>,
        modified_files: Vec<String>,
    },
    /// The cancellation token fired before or during the call.
    Aborted,
    Error(String),
}

/// Summarize the abandoned span `entries` (oldest first).
pub async fn summarize_branch(
    entries: &[Entry],
    options: &BranchSummaryOptions,
    transport: &dyn LlmTransport,
    model: &SummaryModel,
    cancel: &CancellationToken,
) -> BranchSummaryOutcome {
    let prep = prepare_branch_entries(entries, options.token_budget, &options.estimator);
    let (read_files, modified_files) = prep.file_ops.finalize();

    if prep.messages.is_empty() {
        return BranchSummaryOutcome::Summary {
            summary: EMPTY_BRANCH_SUMMARY.into(),
            read_files,
            modified_files,
        };
    }

    debug!(
        messages = prep.messages.len(),
        tokens = prep.total_tokens,
        "Summarizing abandoned branch"
    );
    let prompt = build_prompt(
        &prep.messages,
        None,
        BRANCH_SUMMARY_PROMPT,
        options.custom_instructions.as_deref(),
    );
    let request = CompletionRequest::single_prompt(
        model,
        SUMMARIZATION_SYSTEM_PROMPT,
        prompt,
        BRANCH_SUMMARY_MAX_TOKENS,
    );

    match request_summary(transport, request, cancel).await {
        Ok(text) => {
            let mut summary = format!("{BRANCH_SUMMARY_PREAMBLE}{text}");
            summary.push_str(&format_file_operations(&read_files, &modified_files));
            BranchSummaryOutcome::Summary {
                summary,
                read_files,
                modified_files,
            }
        }
        Err(ReductionError::Cancelled) => BranchSummaryOutcome::Aborted,
        Err(e) => BranchSummaryOutcome::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Completion, TransportFuture};
    use crate::session::{BranchSummaryEntry, CompactionDetails};
    use crate::{ContentBlock, StopReason};
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies with a fixed completion and records prompts.
    struct FixedTransport {
        reply: Completion,
        prompts: Mutex<Vec<String>>,
    }

    impl FixedTransport {
        fn new(reply: Completion) -> Self {
            Self {
                reply,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl LlmTransport for FixedTransport {
        fn complete<'a>(
            &'a self,
            request: CompletionRequest,
            _cancel: &'a CancellationToken,
        ) -> TransportFuture<'a> {
            Box::pin(async move {
                if let Some(AgentMessage::User { content, .. }) = request.messages.first() {
                    self.prompts
                        .lock()
                        .unwrap()
                        .push(crate::collect_text(content));
                }
                Ok(self.reply.clone())
            })
        }
    }

    fn entry(id: &str, message: AgentMessage) -> Entry {
        Entry::message(id, None, message)
    }

    fn branch_summary(id: &str, from_hook: bool, read: &str) -> Entry {
        Entry::new(
            id,
            None,
            EntryKind::BranchSummary(BranchSummaryEntry {
                from_id: "old".into(),
                summary: "s".repeat(40),
                details: Some(CompactionDetails {
                    read_files: vec![read.into()],
                    modified_files: vec![],
                }),
                from_hook,
            }),
        )
    }

    fn model() -> SummaryModel {
        SummaryModel::new("m", "k")
    }

    #[test]
    fn budget_keeps_the_newest_records() {
        let entries: Vec<Entry> = (0..5)
            .map(|i| entry(&format!("e{i}"), AgentMessage::user(format!("{i}").repeat(40))))
            .collect();
        // Each record is 10 tokens.
        let prep = prepare_branch_entries(&entries, 25, &TokenEstimator::default());
        assert_eq!(prep.messages.len(), 2);
        assert_eq!(prep.total_tokens, 20);
        assert_eq!(
            prep.messages[0],
            entries[3].to_message().unwrap(),
            "oldest kept record comes first"
        );

        let unlimited = prepare_branch_entries(&entries, 0, &TokenEstimator::default());
        assert_eq!(unlimited.messages.len(), 5);
    }

    #[test]
    fn tool_results_are_excluded() {
        let entries = vec![
            entry("a", AgentMessage::user("look")),
            entry("b", AgentMessage::tool_result("c", "read", "x".repeat(4000), false)),
            entry("c", AgentMessage::assistant_text("done")),
        ];
        let prep = prepare_branch_entries(&entries, 100, &TokenEstimator::default());
        assert_eq!(prep.messages.len(), 2);
        assert!(prep.messages.iter().all(|m| !m.is_tool_result()));
    }

    #[test]
    fn oversized_summary_is_kept_below_ninety_percent() {
        let mut entries = vec![branch_summary("bs", false, "a.rs")];
        entries.push(entry("u", AgentMessage::user("x".repeat(40))));
        // Summary is 10 tokens, user 10 tokens, budget 15: the summary
        // overflows but 10 < 13.5.
        let prep = prepare_branch_entries(&entries, 15, &TokenEstimator::default());
        assert_eq!(prep.messages.len(), 2);
        assert!(matches!(prep.messages[0], AgentMessage::BranchSummary { .. }));

        // A plain record that overflows is dropped.
        let entries = vec![
            entry("a", AgentMessage::user("x".repeat(40))),
            entry("b", AgentMessage::user("y".repeat(40))),
        ];
        let prep = prepare_branch_entries(&entries, 15, &TokenEstimator::default());
        assert_eq!(prep.messages.len(), 1);
    }

    #[test]
    fn provenance_seeds_from_non_hook_summaries_only() {
        let entries = vec![
            branch_summary("trusted", false, "kept.rs"),
            branch_summary("hooked", true, "dropped.rs"),
            entry(
                "call",
                AgentMessage::assistant(vec![ContentBlock::tool_call(
                    "c",
                    "write",
                    json!({"path": "new.rs"}),
                )]),
            ),
        ];
        let prep = prepare_branch_entries(&entries, 0, &TokenEstimator::default());
        let (read, modified) = prep.file_ops.finalize();
        assert_eq!(read, vec!["kept.rs"]);
        assert_eq!(modified, vec!["new.rs"]);
    }

    #[test]
    fn settings_budget_is_window_minus_reserve() {
        assert_eq!(BranchSummarySettings::default().token_budget(), 128_000 - 16_384);
        let tiny = BranchSummarySettings {
            reserve_tokens: 10,
            context_window_tokens: 5,
        };
        assert_eq!(tiny.token_budget(), 0);
    }

    #[tokio::test]
    async fn empty_span_returns_placeholder_without_a_call() {
        let transport = FixedTransport::new(Completion::text_only("unused"));
        let entries = vec![entry(
            "t",
            AgentMessage::tool_result("c", "read", "x", false),
        )];
        let outcome = summarize_branch(
            &entries,
            &BranchSummaryOptions::default(),
            &transport,
            &model(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            outcome,
            BranchSummaryOutcome::Summary { ref summary, .. } if summary == EMPTY_BRANCH_SUMMARY
        ));
        assert!(transport.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_carries_preamble_and_file_block() {
        let transport = FixedTransport::new(Completion::text_only("## Goal\nTry a refactor"));
        let entries = vec![
            entry("u", AgentMessage::user("refactor the parser")),
            entry(
                "a",
                AgentMessage::assistant(vec![ContentBlock::tool_call(
                    "c",
                    "read",
                    json!({"path": "src/parser.rs"}),
                )]),
            ),
        ];
        let options = BranchSummaryOptions {
            custom_instructions: Some("note the failing test".into()),
            ..Default::default()
        };
        let outcome = summarize_branch(
            &entries,
            &options,
            &transport,
            &model(),
            &CancellationToken::new(),
        )
        .await;
        let BranchSummaryOutcome::Summary {
            summary,
            read_files,
            ..
        } = outcome
        else {
            panic!("expected a summary, got {outcome:?}");
        };
        assert!(summary.starts_with(BRANCH_SUMMARY_PREAMBLE));
        assert!(summary.contains("Try a refactor"));
        assert!(summary.ends_with("<read-files>\nsrc/parser.rs\n</read-files>"));
        assert_eq!(read_files, vec!["src/parser.rs"]);

        let prompts = transport.prompts.lock().unwrap();
        assert!(prompts[0].contains("[User]: refactor the parser"));
        assert!(prompts[0].ends_with("Additional focus: note the failing test"));
    }

    #[tokio::test]
    async fn cancellation_reports_aborted() {
        let transport = FixedTransport::new(Completion::text_only("unused"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let entries = vec![entry("u", AgentMessage::user("hi"))];
        let outcome = summarize_branch(
            &entries,
            &BranchSummaryOptions::default(),
            &transport,
            &model(),
            &cancel,
        )
        .await;
        assert_eq!(outcome, BranchSummaryOutcome::Aborted);
        assert!(transport.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_error_reports_error() {
        let transport = FixedTransport::new(Completion {
            stop_reason: StopReason::Error,
            error_message: Some("rate limited".into()),
            ..Completion::default()
        });
        let entries = vec![entry("u", AgentMessage::user("hi"))];
        let outcome = summarize_branch(
            &entries,
            &BranchSummaryOptions::default(),
            &transport,
            &model(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, BranchSummaryOutcome::Error(ref m) if m.contains("rate limited")));
    }
}

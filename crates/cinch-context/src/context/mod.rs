//! Context reduction: estimation, planning, and summary generation.
//!
//! Everything here except the two generators is synchronous and free of
//! I/O:
//!
//! 1. **[`tokens`]** — [`TokenEstimator`] charges each record by character
//!    count (4 chars per token, flat charge per image).
//!
//! 2. **[`file_tracker`]** — [`FileOperations`] accumulates read and
//!    modified paths from file tool calls so summaries keep file awareness.
//!
//! 3. **[`cut_point`]** — picks where kept history starts without
//!    orphaning tool results, flagging split turns.
//!
//! 4. **[`compaction`]** — [`prepare_compaction`] builds the immutable
//!    plan; [`should_compact`] decides when one is due.
//!
//! 5. **[`summarizer`]** and **[`branch_summary`]** — the cancellable LLM
//!    calls that turn a plan (or an abandoned branch) into summary text.
//!
//! [`transcript`] renders records as the labelled text the summarization
//! prompts embed.

pub mod branch_summary;
pub mod compaction;
pub mod cut_point;
pub mod file_tracker;
pub mod summarizer;
pub mod tokens;
pub mod transcript;

// Re-export commonly used items at the module level.
pub use branch_summary::{
    BranchSummaryOptions, BranchSummaryOutcome, BranchSummarySettings, summarize_branch,
};
pub use compaction::{
    CompactionPreparation, CompactionResult, CompactionSettings, estimate_branch_context_tokens,
    estimate_context_tokens,
    prepare_compaction, should_compact,
};
pub use cut_point::{CutPoint, select_cut_point};
pub use file_tracker::{FileOperations, format_file_operations};
pub use summarizer::summarize;
pub use tokens::{TokenEstimator, estimate_tokens};

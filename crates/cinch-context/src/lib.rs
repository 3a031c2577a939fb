//! Context compaction and branch summarization for LLM coding agents.
//!
//! `cinch-context` decides, as a conversation log grows past a model's
//! context window, which prior turns can be dropped and replaced by a
//! generated summary. It performs the analogous reduction when the user
//! abandons one branch of the conversation tree in favor of another.
//!
//! The conversation lives in an append-only, parent-pointer tree of
//! [`Entry`](session::Entry) values. A branch is the path from the root to
//! a leaf. Reductions never mutate entries in place: they append a new
//! `compaction` or `branch_summary` entry and rebuild the conversation view
//! from the log.
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api_key = std::env::var("OPENROUTER_KEY")?;
//!     let transport = Arc::new(OpenRouterTransport::new()?);
//!     let log = SessionLog::load("session.jsonl")?;
//!
//!     let session = ReductionSession::new(
//!         log,
//!         transport,
//!         ReductionConfig::default(),
//!         SummaryModel::new("anthropic/claude-sonnet-4", api_key),
//!     )
//!     .with_event_handler(LoggingHandler);
//!
//!     let outcome = session.compact(None, &CancellationToken::new()).await?;
//!     println!("appended {}", outcome.entry_id);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Estimate token cost:** [`TokenEstimator`](context::tokens::TokenEstimator)
//!   [`estimate_context_tokens`](context::compaction::estimate_context_tokens)
//!   and [`estimate_branch_context_tokens`](context::compaction::estimate_branch_context_tokens).
//! - **Choose where to cut:** [`select_cut_point`](context::cut_point::select_cut_point).
//! - **Build a reduction plan:** [`prepare_compaction`](context::compaction::prepare_compaction).
//! - **Generate summaries:** [`summarize`](context::summarizer::summarize) and
//!   [`summarize_branch`](context::branch_summary::summarize_branch).
//! - **Run a full reduction:** [`ReductionSession`](agent::orchestrator::ReductionSession),
//!   with [`ReductionHook`](agent::hooks::ReductionHook) for veto/override and
//!   [`EventHandler`](agent::events::EventHandler) for observation.
//! - **Store the log:** [`SessionLog`](session::log::SessionLog) implements
//!   [`EntryStore`](session::EntryStore) with JSONL persistence.
//! - **Talk to a model:** [`LlmTransport`](api::LlmTransport) and
//!   [`OpenRouterTransport`](api::openrouter::OpenRouterTransport).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token estimation, file provenance, cut points, plans, summary generation |
//! | [`session`] | Entry model, entry store trait, arena log, tree walking, context rebuild |
//! | [`agent`] | Reduction orchestrator, settings, hooks, events |
//! | [`api`] | LLM transport trait and the OpenRouter implementation |
//! | [`error`] | Error taxonomy shared by every reduction entry point |

pub mod agent;
pub mod api;
pub mod context;
pub mod error;
pub mod prelude;
pub mod session;

use serde::{Deserialize, Serialize};

// ── Constants ──────────────────────────────────────────────────────

/// Default model for summarization calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Current time as Unix epoch milliseconds, the timestamp unit of records.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Content blocks ─────────────────────────────────────────────────

/// A single block of message content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn thinking(thinking: impl Into<String>) -> Self {
        ContentBlock::Thinking {
            thinking: thinking.into(),
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        ContentBlock::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Join the text blocks of `blocks` with newlines, skipping everything else.
pub fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Usage and stop reasons ─────────────────────────────────────────

/// Token usage reported by the provider for one assistant response.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Tokens occupied by the context when this response was produced.
    ///
    /// Prefers the provider's total; falls back to the sum of the parts.
    pub fn context_tokens(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.input_tokens
                .saturating_add(self.output_tokens)
                .saturating_add(self.cache_read_tokens)
                .saturating_add(self.cache_write_tokens)
        }
    }
}

/// Why the model stopped generating.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl StopReason {
    /// `Error` and `Aborted` responses carry no trustworthy content or usage.
    pub fn is_failure(self) -> bool {
        matches!(self, StopReason::Error | StopReason::Aborted)
    }
}

// ── Conversation records ───────────────────────────────────────────

/// An assistant response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// A conversation record as the agent sees it.
///
/// Besides the provider roles (user, assistant, tool result) the agent
/// carries its own records: shell executions typed by the user, content
/// injected by hooks, and the summaries produced by reductions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentMessage {
    User {
        content: Vec<ContentBlock>,
        #[serde(default)]
        timestamp: i64,
    },
    Assistant(AssistantMessage),
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: Vec<ContentBlock>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        timestamp: i64,
    },
    BashExecution {
        command: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default)]
        timestamp: i64,
    },
    Custom {
        custom_type: String,
        content: String,
        #[serde(default = "default_display")]
        display: bool,
        #[serde(default)]
        timestamp: i64,
    },
    BranchSummary {
        summary: String,
        from_id: String,
        #[serde(default)]
        timestamp: i64,
    },
    CompactionSummary {
        summary: String,
        tokens_before: u64,
        #[serde(default)]
        timestamp: i64,
    },
}

fn default_display() -> bool {
    true
}

impl AgentMessage {
    pub fn user(text: impl Into<String>) -> Self {
        AgentMessage::User {
            content: vec![ContentBlock::text(text)],
            timestamp: now_millis(),
        }
    }

    /// An assistant response with the given content and a successful stop.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        AgentMessage::Assistant(AssistantMessage {
            content,
            model: String::new(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: now_millis(),
        })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::assistant(vec![ContentBlock::text(text)])
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        AgentMessage::ToolResult {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![ContentBlock::text(text)],
            is_error,
            timestamp: now_millis(),
        }
    }

    pub fn bash(command: impl Into<String>, output: impl Into<String>) -> Self {
        AgentMessage::BashExecution {
            command: command.into(),
            output: output.into(),
            exit_code: Some(0),
            timestamp: now_millis(),
        }
    }

    pub fn custom(custom_type: impl Into<String>, content: impl Into<String>) -> Self {
        AgentMessage::Custom {
            custom_type: custom_type.into(),
            content: content.into(),
            display: true,
            timestamp: now_millis(),
        }
    }

    /// Short role label used in logs and the CLI.
    pub fn role(&self) -> &'static str {
        match self {
            AgentMessage::User { .. } => "user",
            AgentMessage::Assistant(_) => "assistant",
            AgentMessage::ToolResult { .. } => "tool_result",
            AgentMessage::BashExecution { .. } => "bash_execution",
            AgentMessage::Custom { .. } => "custom",
            AgentMessage::BranchSummary { .. } => "branch_summary",
            AgentMessage::CompactionSummary { .. } => "compaction_summary",
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, AgentMessage::ToolResult { .. })
    }

    /// Usage figure of a successful assistant response, if this is one.
    pub fn assistant_usage(&self) -> Option<&Usage> {
        match self {
            AgentMessage::Assistant(msg) if !msg.stop_reason.is_failure() => Some(&msg.usage),
            _ => None,
        }
    }
}

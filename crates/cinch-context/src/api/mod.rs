//! LLM transport layer.
//!
//! Summary generation talks to a model only through [`LlmTransport`], so
//! tests and embedders can swap the network out:
//!
//! - [`openrouter`] — [`OpenRouterTransport`](openrouter::OpenRouterTransport),
//!   the chat-completions implementation over `reqwest`.
//!
//! A transport reports a cancelled call as a completion with
//! [`StopReason::Aborted`] rather than an error, so callers can tell
//! "aborted" apart from "failed".

pub mod openrouter;

use crate::error::TransportError;
use crate::{AgentMessage, ContentBlock, StopReason, Usage, collect_text};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub use openrouter::OpenRouterTransport;

/// Reasoning effort level for extended thinking / chain-of-thought models.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Xhigh,
    High,
    Medium,
    Low,
    Minimal,
    None,
}

/// Model id and credentials used for summarization calls.
#[derive(Clone, Debug)]
pub struct SummaryModel {
    pub model: String,
    pub api_key: String,
}

impl SummaryModel {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
        }
    }
}

/// One non-streaming completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<AgentMessage>,
    pub max_tokens: u32,
    pub api_key: String,
    pub reasoning: Option<ReasoningEffort>,
}

impl CompletionRequest {
    /// A request carrying a single user record.
    pub fn single_prompt(
        model: &SummaryModel,
        system_prompt: impl Into<String>,
        prompt: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        Self {
            model: model.model.clone(),
            system_prompt: system_prompt.into(),
            messages: vec![AgentMessage::user(prompt)],
            max_tokens,
            api_key: model.api_key.clone(),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, effort: ReasoningEffort) -> Self {
        self.reasoning = Some(effort);
        self
    }
}

/// A model response.
#[derive(Clone, Debug, Default)]
pub struct Completion {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub error_message: Option<String>,
    pub usage: Usage,
}

impl Completion {
    /// A successful text-only completion.
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Self::default()
        }
    }

    /// The completion reported for a cancelled call.
    pub fn aborted() -> Self {
        Self {
            stop_reason: StopReason::Aborted,
            error_message: Some("request aborted".into()),
            ..Self::default()
        }
    }

    /// Text blocks joined with newlines.
    pub fn text(&self) -> String {
        collect_text(&self.content)
    }
}

/// Boxed future returned by [`LlmTransport::complete`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Completion, TransportError>> + Send + 'a>>;

/// A model backend.
///
/// Implementations should race the request against `cancel` and return
/// [`Completion::aborted`] when it fires first.
pub trait LlmTransport: Send + Sync {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a>;
}

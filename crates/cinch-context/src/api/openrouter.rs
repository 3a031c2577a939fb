//! OpenRouter chat-completions transport.

use super::{Completion, CompletionRequest, LlmTransport, ReasoningEffort, TransportFuture};
use crate::error::TransportError;
use crate::{AgentMessage, ContentBlock, StopReason, Usage, collect_text};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningConfig>,
}

/// Configuration for extended thinking / reasoning tokens.
#[derive(Serialize, Clone, Debug)]
pub struct ReasoningConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffort>,
    /// Use reasoning internally but omit it from the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<bool>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

/// A message in chat-completions format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ChatFunctionCall,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Map agent records to chat-completions messages.
///
/// Agent-specific records (shell executions, custom content, summaries)
/// are sent as user messages holding their text.
pub fn to_chat_messages(system_prompt: &str, messages: &[AgentMessage]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(ChatMessage::plain("system", system_prompt));
    }
    for message in messages {
        let mapped = match message {
            AgentMessage::User { content, .. } => ChatMessage::plain("user", collect_text(content)),
            AgentMessage::Assistant(msg) => {
                let calls: Vec<ChatToolCall> = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(ChatToolCall {
                            id: id.clone(),
                            call_type: "function".into(),
                            function: ChatFunctionCall {
                                name: name.clone(),
                                arguments: arguments.to_string(),
                            },
                        }),
                        _ => None,
                    })
                    .collect();
                let text = collect_text(&msg.content);
                ChatMessage {
                    role: "assistant".into(),
                    content: (!text.is_empty()).then_some(text),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                }
            }
            AgentMessage::ToolResult {
                tool_call_id,
                content,
                ..
            } => ChatMessage {
                role: "tool".into(),
                content: Some(collect_text(content)),
                tool_calls: None,
                tool_call_id: Some(tool_call_id.clone()),
            },
            AgentMessage::BashExecution {
                command, output, ..
            } => ChatMessage::plain("user", format!("$ {command}\n{output}")),
            AgentMessage::Custom { content, .. } => ChatMessage::plain("user", content.clone()),
            AgentMessage::BranchSummary { summary, .. }
            | AgentMessage::CompactionSummary { summary, .. } => {
                ChatMessage::plain("user", summary.clone())
            }
        };
        out.push(mapped);
    }
    out
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

fn stop_reason_for(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("length") => StopReason::Length,
        Some("tool_calls") => StopReason::ToolUse,
        Some("error") => StopReason::Error,
        _ => StopReason::Stop,
    }
}

/// Convert a response body into a [`Completion`].
fn parse_completion(text: &str) -> Result<Completion, TransportError> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| TransportError::Parse(e.to_string()))?;

    if let Some(err) = parsed.error {
        return Err(TransportError::Api(err.message));
    }

    let usage = parsed.usage.map_or_else(Usage::default, |u| {
        debug!(
            "Token usage: prompt={}, completion={}, total={}",
            u.prompt_tokens.unwrap_or(0),
            u.completion_tokens.unwrap_or(0),
            u.total_tokens.unwrap_or(0),
        );
        Usage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
            ..Usage::default()
        }
    });

    let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
        debug!("LLM output: empty (no choices)");
        return Ok(Completion {
            stop_reason: StopReason::Error,
            error_message: Some("response contained no choices".into()),
            usage,
            ..Completion::default()
        });
    };

    let mut content = Vec::new();
    if let Some(reasoning) = choice.message.reasoning.filter(|r| !r.is_empty()) {
        content.push(ContentBlock::thinking(reasoning));
    }
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::text(text));
    }
    let stop_reason = stop_reason_for(choice.finish_reason.as_deref());
    debug!(
        "LLM output: {} block(s), finish_reason={:?}",
        content.len(),
        choice.finish_reason
    );

    Ok(Completion {
        content,
        stop_reason,
        error_message: (stop_reason == StopReason::Error)
            .then(|| "model reported an error finish reason".to_string()),
        usage,
    })
}

// ── Transport ──────────────────────────────────────────────────────

/// Async HTTP transport for the OpenRouter chat completions API.
///
/// The API key travels with each [`CompletionRequest`], so one transport
/// can serve several credentials.
pub struct OpenRouterTransport {
    client: reqwest::Client,
    url: String,
    referer: String,
    title: String,
}

impl OpenRouterTransport {
    /// Create a transport with default headers.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_headers("https://github.com/cinch-rs", "cinch-context")
    }

    /// Create a transport with custom Referer and X-Title headers.
    pub fn with_headers(
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent("cinch-context/0.4")
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: OPENROUTER_URL.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    /// Point the transport at a different chat-completions endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Build the JSON body for `request`.
    pub fn request_body(request: &CompletionRequest) -> ChatRequest {
        ChatRequest {
            model: request.model.clone(),
            messages: to_chat_messages(&request.system_prompt, &request.messages),
            max_tokens: request.max_tokens,
            reasoning: request.reasoning.map(|effort| ReasoningConfig {
                effort: Some(effort),
                exclude: Some(true),
            }),
        }
    }

    async fn send(&self, request: CompletionRequest) -> Result<Completion, TransportError> {
        let body = Self::request_body(&request);
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, reasoning={:?}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            request.reasoning,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", request.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Http(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_completion(&text)
    }
}

impl LlmTransport for OpenRouterTransport {
    fn complete<'a>(
        &'a self,
        request: CompletionRequest,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("LLM request cancelled");
                    Ok(Completion::aborted())
                }
                result = self.send(request) => result,
            }
        })
    }
}

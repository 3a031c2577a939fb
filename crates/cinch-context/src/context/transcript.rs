//! Plain-text transcript rendering for summarization prompts.
//!
//! The summarizer never sends the original records to the model as a
//! conversation (the model would try to continue it). Records are instead
//! flattened into labelled sections:
//!
//! ```text
//! [User]: fix the failing test
//!
//! [Assistant tool calls]: read(path="tests/api.rs")
//!
//! [Tool result]: ...
//! ```

use crate::{AgentMessage, ContentBlock, collect_text};
use std::fmt::Write;

/// Render tool-call arguments as `key=value` pairs.
///
/// Values are JSON-encoded; non-object arguments are rendered whole.
pub fn flatten_arguments(arguments: &serde_json::Value) -> String {
    match arguments.as_object() {
        Some(obj) => obj
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        None => arguments.to_string(),
    }
}

/// Serialize records to a labelled transcript.
pub fn serialize_conversation(messages: &[AgentMessage]) -> String {
    let mut sections: Vec<String> = Vec::new();

    for message in messages {
        match message {
            AgentMessage::User { content, .. } => {
                push_section(&mut sections, "User", &collect_text(content));
            }
            AgentMessage::Assistant(msg) => {
                let thinking = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Thinking { thinking } => Some(thinking.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                push_section(&mut sections, "Assistant thinking", &thinking);
                push_section(&mut sections, "Assistant", &collect_text(&msg.content));

                let calls = msg
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::ToolCall {
                            name, arguments, ..
                        } => Some(format!("{name}({})", flatten_arguments(arguments))),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                push_section(&mut sections, "Assistant tool calls", &calls);
            }
            AgentMessage::ToolResult { content, .. } => {
                push_section(&mut sections, "Tool result", &collect_text(content));
            }
            AgentMessage::BashExecution {
                command,
                output,
                exit_code,
                ..
            } => {
                let mut text = format!("$ {command}\n{output}");
                if let Some(code) = exit_code.filter(|c| *c != 0) {
                    let _ = write!(text, "\n(exit code {code})");
                }
                push_section(&mut sections, "Bash", &text);
            }
            AgentMessage::Custom {
                custom_type,
                content,
                ..
            } => {
                let label = if custom_type.trim().is_empty() {
                    "Custom".to_string()
                } else {
                    format!("Custom:{custom_type}")
                };
                push_section(&mut sections, &label, content);
            }
            AgentMessage::BranchSummary { summary, .. } => {
                push_section(&mut sections, "Branch summary", summary);
            }
            AgentMessage::CompactionSummary { summary, .. } => {
                push_section(&mut sections, "Compaction summary", summary);
            }
        }
    }

    sections.join("\n\n")
}

fn push_section(sections: &mut Vec<String>, label: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }
    sections.push(format!("[{label}]: {body}"));
}

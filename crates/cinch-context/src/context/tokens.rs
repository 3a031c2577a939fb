//! Character-count token estimation for conversation records.
//!
//! This is a budgeting heuristic, not a tokenizer: every record is
//! measured in characters and ceiling-divided by [`CHARS_PER_TOKEN`].
//! Images have no meaningful character count and are charged a flat
//! [`IMAGE_CHAR_ESTIMATE`] instead.

use super::transcript::flatten_arguments;
use crate::{AgentMessage, ContentBlock};

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Characters charged for one image block (1200 estimated tokens).
pub const IMAGE_CHAR_ESTIMATE: usize = 4800;

/// Estimates token cost of conversation records.
///
/// # Example
///
/// ```
/// use cinch_context::AgentMessage;
/// use cinch_context::context::tokens::TokenEstimator;
///
/// let estimator = TokenEstimator::default();
/// // 9 characters → ceil(9 / 4) = 3 tokens.
/// assert_eq!(estimator.estimate(&AgentMessage::user("123456789")), 3);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimator {
    /// Characters charged per image block.
    pub image_chars: usize,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            image_chars: IMAGE_CHAR_ESTIMATE,
        }
    }
}

impl TokenEstimator {
    /// Override the flat image charge.
    pub fn with_image_chars(mut self, chars: usize) -> Self {
        self.image_chars = chars;
        self
    }

    /// Estimated tokens for one record.
    pub fn estimate(&self, message: &AgentMessage) -> u64 {
        let chars = match message {
            AgentMessage::User { content, .. } | AgentMessage::ToolResult { content, .. } => {
                self.blocks_chars(content)
            }
            AgentMessage::Assistant(msg) => self.blocks_chars(&msg.content),
            AgentMessage::BashExecution {
                command, output, ..
            } => command.chars().count() + output.chars().count(),
            AgentMessage::Custom { content, .. } => content.chars().count(),
            AgentMessage::BranchSummary { summary, .. }
            | AgentMessage::CompactionSummary { summary, .. } => summary.chars().count(),
        };
        chars.div_ceil(CHARS_PER_TOKEN) as u64
    }

    /// Total estimate over a slice of records.
    pub fn estimate_all(&self, messages: &[AgentMessage]) -> u64 {
        messages.iter().map(|m| self.estimate(m)).sum()
    }

    fn blocks_chars(&self, blocks: &[ContentBlock]) -> usize {
        blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::Thinking { thinking } => thinking.chars().count(),
                ContentBlock::Image { .. } => self.image_chars,
                ContentBlock::ToolCall {
                    name, arguments, ..
                } => name.chars().count() + flatten_arguments(arguments).chars().count(),
            })
            .sum()
    }
}

/// Estimate with the default estimator.
pub fn estimate_tokens(message: &AgentMessage) -> u64 {
    TokenEstimator::default().estimate(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_ceiling_divided() {
        assert_eq!(estimate_tokens(&AgentMessage::user("")), 0);
        assert_eq!(estimate_tokens(&AgentMessage::user("abcd")), 1);
        assert_eq!(estimate_tokens(&AgentMessage::user("abcde")), 2);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // Four two-byte characters.
        assert_eq!(estimate_tokens(&AgentMessage::user("éééé")), 1);
    }

    #[test]
    fn thinking_and_text_both_count() {
        let msg = AgentMessage::assistant(vec![
            ContentBlock::thinking("1234"),
            ContentBlock::text("5678"),
        ]);
        assert_eq!(estimate_tokens(&msg), 2);
    }

    #[test]
    fn tool_call_counts_name_and_flattened_arguments() {
        // "read" (4) + `path="a.rs"` (11) = 15 chars → 4 tokens.
        let msg = AgentMessage::assistant(vec![ContentBlock::tool_call(
            "c1",
            "read",
            json!({"path": "a.rs"}),
        )]);
        assert_eq!(estimate_tokens(&msg), 4);
    }

    #[test]
    fn images_use_the_flat_charge() {
        let msg = AgentMessage::User {
            content: vec![ContentBlock::Image {
                data: "AAAA".repeat(10_000),
                mime_type: "image/png".into(),
            }],
            timestamp: 0,
        };
        assert_eq!(estimate_tokens(&msg), 1200);
        assert_eq!(TokenEstimator::default().with_image_chars(400).estimate(&msg), 100);
    }

    #[test]
    fn custom_records_use_their_text_field() {
        assert_eq!(estimate_tokens(&AgentMessage::bash("ls", "a b")), 2);
        assert_eq!(estimate_tokens(&AgentMessage::custom("note", "12345678")), 2);
        let summary = AgentMessage::CompactionSummary {
            summary: "x".repeat(40),
            tokens_before: 99_999,
            timestamp: 0,
        };
        assert_eq!(estimate_tokens(&summary), 10);
    }
}

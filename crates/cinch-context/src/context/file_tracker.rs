//! File provenance across reductions.
//!
//! When history is summarized, the model loses the tool calls that told it
//! which files it had looked at or changed. [`FileOperations`] collects the
//! paths from `read`, `write` and `edit` tool calls in the summarized span,
//! seeded with the provenance stored on the previous reduction, and the
//! summary is suffixed with a `<read-files>` / `<modified-files>` block.

use crate::session::CompactionDetails;
use crate::{AgentMessage, ContentBlock};
use std::collections::BTreeSet;

/// Accumulated file paths by access kind.
///
/// Sets are ordered so the rendered lists are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOperations {
    pub read: BTreeSet<String>,
    pub written: BTreeSet<String>,
    pub edited: BTreeSet<String>,
}

impl FileOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the provenance of an earlier reduction.
    ///
    /// Modified files are carried as edits; the original write/edit split
    /// is not stored and does not matter once finalized.
    pub fn seed(&mut self, details: &CompactionDetails) {
        self.read.extend(details.read_files.iter().cloned());
        self.edited.extend(details.modified_files.iter().cloned());
    }

    /// Record the file tool calls of one record.
    ///
    /// Only assistant tool calls are inspected. Unknown tool names and
    /// calls without a path argument are ignored.
    pub fn extend(&mut self, message: &AgentMessage) {
        let AgentMessage::Assistant(msg) = message else {
            return;
        };
        for block in &msg.content {
            let ContentBlock::ToolCall {
                name, arguments, ..
            } = block
            else {
                continue;
            };
            let Some(path) = extract_path(arguments) else {
                continue;
            };
            let set = match name.as_str() {
                "read" => &mut self.read,
                "write" => &mut self.written,
                "edit" => &mut self.edited,
                _ => continue,
            };
            set.insert(path.to_string());
        }
    }

    /// Record every record in `messages`.
    pub fn extend_all<'a>(&mut self, messages: impl IntoIterator<Item = &'a AgentMessage>) {
        for message in messages {
            self.extend(message);
        }
    }

    /// Split into sorted `(read_only, modified)` lists.
    ///
    /// Modified is written ∪ edited; read-only is read minus modified.
    pub fn finalize(&self) -> (Vec<String>, Vec<String>) {
        let modified: BTreeSet<&String> = self.written.union(&self.edited).collect();
        let read_only = self
            .read
            .iter()
            .filter(|p| !modified.contains(p))
            .cloned()
            .collect();
        (read_only, modified.into_iter().cloned().collect())
    }

    /// Finalized lists as stored provenance.
    pub fn to_details(&self) -> CompactionDetails {
        let (read_files, modified_files) = self.finalize();
        CompactionDetails {
            read_files,
            modified_files,
        }
    }
}

/// Path argument of a file tool call.
fn extract_path(arguments: &serde_json::Value) -> Option<&str> {
    let obj = arguments.as_object()?;
    ["path", "file_path"]
        .iter()
        .filter_map(|key| obj.get(*key).and_then(|v| v.as_str()))
        .find(|v| !v.is_empty())
}

/// Render the provenance block appended to a summary.
///
/// Empty when both lists are empty; otherwise starts with a blank line so
/// it can be appended directly.
pub fn format_file_operations(read_only: &[String], modified: &[String]) -> String {
    let mut blocks = Vec::new();
    if !read_only.is_empty() {
        blocks.push(file_list("read-files", read_only));
    }
    if !modified.is_empty() {
        blocks.push(file_list("modified-files", modified));
    }
    if blocks.is_empty() {
        return String::new();
    }
    format!("\n\n{}", blocks.join("\n\n"))
}

fn file_list(tag: &str, files: &[String]) -> String {
    let body = files
        .iter()
        .map(|f| f.replace('<', "&lt;").replace('>', "&gt;"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("<{tag}>\n{body}\n</{tag}>")
}

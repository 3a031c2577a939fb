//! The session log: entry model, store interface, and tree walking.
//!
//! A session is an append-only tree of [`Entry`] values linked by parent
//! ids. The path from the root to a leaf is a *branch*, which stores hand
//! out as an ordered slice, oldest first.
//!
//! - [`EntryStore`] is the interface reductions consume.
//! - [`log::SessionLog`] is the arena-backed implementation with JSONL
//!   persistence.
//! - [`tree`] resolves common ancestors between leaves.
//! - [`view`] rebuilds the model-facing conversation from a branch.

pub mod log;
pub mod tree;
pub mod view;

use crate::AgentMessage;
use crate::error::StoreError;
use serde::{Deserialize, Serialize};

pub use log::SessionLog;
pub use tree::{AbandonedBranch, abandoned_branch, common_ancestor};
pub use view::build_session_context;

// ── Entries ────────────────────────────────────────────────────────

/// One node of the session tree.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// RFC 3339 creation time.
    pub timestamp: String,
    #[serde(flatten)]
    pub kind: EntryKind,
}

/// Payload of an [`Entry`], tagged by `type` on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Message {
        message: AgentMessage,
    },
    Compaction(CompactionEntry),
    BranchSummary(BranchSummaryEntry),
    /// Content injected by a hook, visible to the model.
    CustomMessage {
        custom_type: String,
        content: String,
        #[serde(default)]
        display: bool,
    },
    ModelChange {
        provider: String,
        model_id: String,
    },
    ThinkingLevelChange {
        thinking_level: String,
    },
    Label {
        target_id: String,
        #[serde(default)]
        label: Option<String>,
    },
    /// Hook-private state; never shown to the model.
    Custom {
        custom_type: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
    },
}

/// A reduction marker replacing everything before `first_kept_entry_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompactionEntry {
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CompactionDetails>,
    /// Produced by an override hook; its provenance is not trusted.
    #[serde(default)]
    pub from_hook: bool,
}

/// Summary of a branch the user navigated away from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BranchSummaryEntry {
    /// Leaf of the abandoned branch (`"root"` when there was none).
    pub from_id: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<CompactionDetails>,
    #[serde(default)]
    pub from_hook: bool,
}

/// File provenance stored alongside a reduction.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionDetails {
    #[serde(default)]
    pub read_files: Vec<String>,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

impl Entry {
    pub fn new(id: impl Into<String>, parent_id: Option<String>, kind: EntryKind) -> Self {
        Self {
            id: id.into(),
            parent_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            kind,
        }
    }

    pub fn message(id: impl Into<String>, parent_id: Option<String>, message: AgentMessage) -> Self {
        Self::new(id, parent_id, EntryKind::Message { message })
    }

    /// The wrapped record, for plain message entries only.
    pub fn as_message(&self) -> Option<&AgentMessage> {
        match &self.kind {
            EntryKind::Message { message } => Some(message),
            _ => None,
        }
    }

    /// Project a model-visible entry to a conversation record.
    ///
    /// Metadata markers (model and thinking-level changes, labels, custom
    /// state) yield `None`.
    pub fn to_message(&self) -> Option<AgentMessage> {
        let timestamp = chrono::DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| t.timestamp_millis())
            .unwrap_or_default();
        match &self.kind {
            EntryKind::Message { message } => Some(message.clone()),
            EntryKind::CustomMessage {
                custom_type,
                content,
                display,
            } => Some(AgentMessage::Custom {
                custom_type: custom_type.clone(),
                content: content.clone(),
                display: *display,
                timestamp,
            }),
            EntryKind::BranchSummary(b) => Some(AgentMessage::BranchSummary {
                summary: b.summary.clone(),
                from_id: b.from_id.clone(),
                timestamp,
            }),
            EntryKind::Compaction(c) => Some(AgentMessage::CompactionSummary {
                summary: c.summary.clone(),
                tokens_before: c.tokens_before,
                timestamp,
            }),
            EntryKind::ModelChange { .. }
            | EntryKind::ThinkingLevelChange { .. }
            | EntryKind::Label { .. }
            | EntryKind::Custom { .. } => None,
        }
    }

    /// Whether [`to_message`](Self::to_message) yields a record.
    pub fn is_model_visible(&self) -> bool {
        !matches!(
            self.kind,
            EntryKind::ModelChange { .. }
                | EntryKind::ThinkingLevelChange { .. }
                | EntryKind::Label { .. }
                | EntryKind::Custom { .. }
        )
    }

    pub fn is_compaction(&self) -> bool {
        matches!(self.kind, EntryKind::Compaction(_))
    }

    pub fn is_user_message(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Message {
                message: AgentMessage::User { .. }
            }
        )
    }

    /// Short type label used in logs and the CLI.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            EntryKind::Message { .. } => "message",
            EntryKind::Compaction(_) => "compaction",
            EntryKind::BranchSummary(_) => "branch_summary",
            EntryKind::CustomMessage { .. } => "custom_message",
            EntryKind::ModelChange { .. } => "model_change",
            EntryKind::ThinkingLevelChange { .. } => "thinking_level_change",
            EntryKind::Label { .. } => "label",
            EntryKind::Custom { .. } => "custom",
        }
    }
}

// ── Store interface ────────────────────────────────────────────────

/// The entry store reductions read from and append to.
///
/// Appends attach the new entry as a child of the current leaf and make
/// it the new leaf.
pub trait EntryStore: Send {
    /// Entries on the path from the root to `leaf_id`, oldest first.
    /// `None` means the current leaf.
    fn branch_entries(&self, leaf_id: Option<&str>) -> Vec<Entry>;

    fn entry(&self, id: &str) -> Option<&Entry>;

    fn current_leaf_id(&self) -> Option<String>;

    /// Move the leaf without appending (`None` resets to before the root).
    fn set_leaf(&mut self, leaf_id: Option<&str>) -> Result<(), StoreError>;

    fn append_compaction(
        &mut self,
        summary: String,
        first_kept_entry_id: String,
        tokens_before: u64,
        details: Option<CompactionDetails>,
        from_hook: bool,
    ) -> Result<String, StoreError>;

    /// Append a branch summary as a child of `new_leaf_parent`.
    fn append_branch_summary(
        &mut self,
        new_leaf_parent: Option<&str>,
        from_id: String,
        summary: String,
        details: Option<CompactionDetails>,
        from_hook: bool,
    ) -> Result<String, StoreError>;
}

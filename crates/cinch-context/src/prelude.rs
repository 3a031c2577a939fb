//! Convenience re-exports for common `cinch-context` types.
//!
//! Meant to be glob-imported by the session controller that drives
//! reductions:
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! ```
//!
//! This pulls in the record model, the session log, the orchestrator with
//! its config, hooks and event handlers, and the transport. Planning
//! internals (cut points, file tracking, prompt building) are left out;
//! import those from [`context`](crate::context) directly when needed.

// ── Records ─────────────────────────────────────────────────────────
pub use crate::{AgentMessage, AssistantMessage, ContentBlock, StopReason, Usage};

// ── Session log ─────────────────────────────────────────────────────
pub use crate::session::{Entry, EntryKind, EntryStore, SessionLog};

// ── Reduction runtime ───────────────────────────────────────────────
pub use crate::agent::{
    CompactionOutcome, CompositeEventHandler, EventHandler, ExternalHookRunner, FnEventHandler,
    HookConfig, HookDecision, LoggingHandler, NavigateOptions, NavigateOutcome, NoopHandler,
    ReductionConfig, ReductionEvent, ReductionHook, ReductionSession, SettingsProvider,
};
pub use crate::context::{BranchSummarySettings, CompactionSettings, TokenEstimator};
pub use crate::error::ReductionError;

// ── Transport ───────────────────────────────────────────────────────
pub use crate::api::{LlmTransport, OpenRouterTransport, SummaryModel};

pub use tokio_util::sync::CancellationToken;

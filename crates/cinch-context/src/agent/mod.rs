//! Reduction runtime: the [`ReductionSession`] orchestrator and its
//! supporting modules.
//!
//! - [`orchestrator::ReductionSession`] — runs compactions and tree
//!   navigation against an entry store. Start here.
//! - [`config::ReductionConfig`] — model and budget settings, with the
//!   [`SettingsProvider`] trait for live settings.
//! - [`hooks`] — [`ReductionHook`] for vetoing or replacing a reduction,
//!   and [`ExternalHookRunner`] for shell-command hooks.
//! - [`events`] — [`EventHandler`] trait and [`ReductionEvent`] enum for
//!   observing reductions.

pub mod config;
pub mod events;
pub mod hooks;
pub mod orchestrator;

// Re-export commonly used items at the module level.
pub use config::{ReductionConfig, SettingsProvider};
pub use events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    ReductionEvent,
};
pub use hooks::{
    CompactHookContext, ExternalHookRunner, HookBranchSummary, HookConfig, HookDecision,
    HookEntry, HookFuture, ReductionHook, TreeHookContext,
};
pub use orchestrator::{
    CompactionOutcome, NavigateOptions, NavigateOutcome, ReductionKind, ReductionPhase,
    ReductionSession,
};

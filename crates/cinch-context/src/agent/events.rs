//! Events and handlers for the [`ReductionSession`](super::orchestrator::ReductionSession).
//!
//! The session reports every reduction through [`ReductionEvent`] values:
//! state transitions, the plan it settled on, and how the attempt ended.
//! Events are observations only; vetoing or replacing a reduction is the
//! job of a [`ReductionHook`](super::hooks::ReductionHook).
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use super::orchestrator::{ReductionKind, ReductionPhase};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by a reduction session.
#[derive(Debug)]
pub enum ReductionEvent<'a> {
    /// The state machine moved.
    PhaseChanged {
        kind: ReductionKind,
        from: ReductionPhase,
        to: ReductionPhase,
    },
    /// A compaction plan was prepared.
    CompactionPlanned {
        first_kept_entry_id: &'a str,
        messages_to_summarize: usize,
        is_split_turn: bool,
        tokens_before: u64,
    },
    /// A compaction entry was appended.
    CompactionCompleted {
        entry_id: &'a str,
        tokens_before: u64,
        summary_chars: usize,
        from_hook: bool,
    },
    /// The leaf moved to another branch.
    Navigated {
        old_leaf: Option<&'a str>,
        new_leaf: Option<&'a str>,
        /// Id of the branch-summary entry, when one was appended.
        summary_entry_id: Option<&'a str>,
        from_hook: bool,
    },
    /// The reduction had nothing to do.
    NothingToCompact { kind: ReductionKind },
    /// An override hook declined the reduction.
    Vetoed {
        kind: ReductionKind,
        reason: Option<&'a str>,
    },
    Cancelled { kind: ReductionKind },
    Failed {
        kind: ReductionKind,
        error: &'a str,
    },
}

/// Handler for reduction events.
///
/// The default implementation ignores every event.
///
/// # Example
///
/// ```ignore
/// struct Counter(AtomicUsize);
///
/// impl EventHandler for Counter {
///     fn on_event(&self, event: &ReductionEvent<'_>) {
///         if let ReductionEvent::CompactionCompleted { .. } = event {
///             self.0.fetch_add(1, Ordering::Relaxed);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ReductionEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ReductionEvent::Failed { error, .. } = event {
///         eprintln!("{error}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ReductionEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ReductionEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ReductionEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ReductionEvent<'_>) {
        (self.0)(event)
    }
}

/// An event handler that fans events out to multiple inner handlers.
///
/// Handlers are called in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(my_ui_handler);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a handler to the chain.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ReductionEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
///
/// Expected outcomes (nothing to do, veto, cancellation) never log above
/// `info`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ReductionEvent<'_>) {
        match event {
            ReductionEvent::PhaseChanged { kind, from, to } => {
                debug!("{kind}: {from:?} → {to:?}");
            }
            ReductionEvent::CompactionPlanned {
                first_kept_entry_id,
                messages_to_summarize,
                is_split_turn,
                tokens_before,
            } => {
                debug!(
                    "Compaction plan: {messages_to_summarize} record(s) to summarize, \
                     first kept {first_kept_entry_id}, split_turn={is_split_turn}, \
                     ~{tokens_before} tokens before"
                );
            }
            ReductionEvent::CompactionCompleted {
                entry_id,
                tokens_before,
                summary_chars,
                from_hook,
            } => {
                info!(
                    "Compacted ~{tokens_before} tokens into {summary_chars} chars (entry {entry_id}{})",
                    if *from_hook { ", from hook" } else { "" }
                );
            }
            ReductionEvent::Navigated {
                old_leaf,
                new_leaf,
                summary_entry_id,
                ..
            } => {
                info!(
                    "Moved leaf {} → {}{}",
                    old_leaf.unwrap_or("(root)"),
                    new_leaf.unwrap_or("(root)"),
                    summary_entry_id
                        .map(|id| format!(" with branch summary {id}"))
                        .unwrap_or_default()
                );
            }
            ReductionEvent::NothingToCompact { kind } => {
                debug!("{kind}: nothing to compact");
            }
            ReductionEvent::Vetoed { kind, reason } => {
                info!("{kind} vetoed by hook{}", reason.map(|r| format!(": {r}")).unwrap_or_default());
            }
            ReductionEvent::Cancelled { kind } => {
                info!("{kind} cancelled");
            }
            ReductionEvent::Failed { kind, error } => {
                warn!("{kind} failed: {error}");
            }
        }
    }
}

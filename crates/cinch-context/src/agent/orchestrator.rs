//! The reduction orchestrator.
//!
//! [`ReductionSession`] owns an entry store and runs one reduction at a
//! time against it. Each attempt walks a small state machine:
//!
//! ```text
//! Idle → Preparing → Summarizing → Appending → Idle
//!                  ↘ (hook veto)  ↗ (hook supply)
//!                    Cancelled / Failed
//! ```
//!
//! Planning and the append each take the store lock briefly. The only
//! suspension points are override hooks and model calls, and the lock is
//! never held across them, so callers may keep appending turns while a
//! summary is generated. The plan is re-validated against the live branch
//! before anything is written.

use super::config::SettingsProvider;
use super::events::{EventHandler, LoggingHandler, ReductionEvent};
use super::hooks::{
    CompactHookContext, HookDecision, ReductionHook, TreeHookContext, run_before_compact,
    run_before_tree_navigation,
};
use crate::api::{LlmTransport, SummaryModel};
use crate::context::{
    BranchSummaryOptions, BranchSummaryOutcome, CompactionPreparation,
    estimate_branch_context_tokens, prepare_compaction, should_compact, summarize,
    summarize_branch,
};
use crate::error::ReductionError;
use crate::session::{
    CompactionDetails, Entry, EntryKind, EntryStore, abandoned_branch, build_session_context,
};
use crate::{AgentMessage, collect_text};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

// ── State machine ──────────────────────────────────────────────────

/// Which reduction an attempt performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionKind {
    Compaction,
    BranchSummary,
}

impl fmt::Display for ReductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionKind::Compaction => f.write_str("compaction"),
            ReductionKind::BranchSummary => f.write_str("branch summary"),
        }
    }
}

/// Phase of a single reduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionPhase {
    Idle,
    Preparing,
    Summarizing,
    Appending,
    Cancelled,
    Failed,
}

/// Tracks the phase of one attempt and reports every transition.
struct PhaseTracker<'a> {
    kind: ReductionKind,
    phase: ReductionPhase,
    events: &'a dyn EventHandler,
}

impl<'a> PhaseTracker<'a> {
    fn new(kind: ReductionKind, events: &'a dyn EventHandler) -> Self {
        Self {
            kind,
            phase: ReductionPhase::Idle,
            events,
        }
    }

    fn advance(&mut self, to: ReductionPhase) {
        if self.phase == to {
            return;
        }
        self.events.on_event(&ReductionEvent::PhaseChanged {
            kind: self.kind,
            from: self.phase,
            to,
        });
        self.phase = to;
    }

    /// Report how the attempt ended and settle the final phase.
    fn finish<T>(&mut self, result: &Result<T, ReductionError>) {
        let kind = self.kind;
        let Err(err) = result else {
            self.advance(ReductionPhase::Idle);
            return;
        };
        match err {
            ReductionError::NothingToCompact => {
                self.events.on_event(&ReductionEvent::NothingToCompact { kind });
                self.advance(ReductionPhase::Idle);
            }
            ReductionError::Vetoed { reason } => {
                self.events.on_event(&ReductionEvent::Vetoed {
                    kind,
                    reason: reason.as_deref(),
                });
                self.advance(ReductionPhase::Cancelled);
            }
            ReductionError::Cancelled => {
                self.events.on_event(&ReductionEvent::Cancelled { kind });
                self.advance(ReductionPhase::Cancelled);
            }
            other => {
                let error = other.to_string();
                self.events.on_event(&ReductionEvent::Failed {
                    kind,
                    error: &error,
                });
                self.advance(ReductionPhase::Failed);
            }
        }
    }
}

/// Marks a session busy for the lifetime of one reduction.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ReductionError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReductionError::InProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Outcomes and options ───────────────────────────────────────────

/// A compaction that was appended to the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionOutcome {
    pub entry_id: String,
    pub summary: String,
    pub first_kept_entry_id: String,
    pub tokens_before: u64,
    /// The summary came from an override hook rather than the model.
    pub from_hook: bool,
}

/// Options for [`ReductionSession::navigate_tree`].
#[derive(Debug, Clone, Default)]
pub struct NavigateOptions {
    /// Summarize the abandoned branch into a branch-summary entry.
    pub summarize: bool,
    pub custom_instructions: Option<String>,
    /// Append a placeholder summary even when the abandoned span is empty.
    pub allow_empty_summary: bool,
}

impl NavigateOptions {
    /// Navigate and summarize what is left behind.
    pub fn summarized() -> Self {
        Self {
            summarize: true,
            ..Default::default()
        }
    }

    pub fn with_custom_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.custom_instructions = Some(instructions.into());
        self
    }

    pub fn with_allow_empty_summary(mut self, allow: bool) -> Self {
        self.allow_empty_summary = allow;
        self
    }
}

/// Where navigation left the session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NavigateOutcome {
    /// The new leaf; `None` when the session was reset to before the root.
    pub new_leaf_id: Option<String>,
    /// Text of the target user message, handed back for re-editing.
    pub editor_text: Option<String>,
    pub summary_entry_id: Option<String>,
    pub from_hook: bool,
}

// ── ReductionSession ───────────────────────────────────────────────

/// Runs compactions and branch navigation against an entry store.
///
/// At most one reduction runs at a time; a second request while one is in
/// flight fails with [`ReductionError::InProgress`]. After every append the
/// model-facing conversation is rebuilt and available from
/// [`messages`](Self::messages).
pub struct ReductionSession<S: EntryStore> {
    store: Mutex<S>,
    transport: Arc<dyn LlmTransport>,
    settings: Box<dyn SettingsProvider>,
    model: SummaryModel,
    hooks: Vec<Arc<dyn ReductionHook>>,
    event_handler: Box<dyn EventHandler>,
    in_flight: AtomicBool,
    context: Mutex<Vec<AgentMessage>>,
}

impl<S: EntryStore> ReductionSession<S> {
    pub fn new(
        store: S,
        transport: Arc<dyn LlmTransport>,
        settings: impl SettingsProvider + 'static,
        model: SummaryModel,
    ) -> Self {
        let context = build_session_context(&store.branch_entries(None));
        Self {
            store: Mutex::new(store),
            transport,
            settings: Box::new(settings),
            model,
            hooks: Vec::new(),
            event_handler: Box::new(LoggingHandler),
            in_flight: AtomicBool::new(false),
            context: Mutex::new(context),
        }
    }

    /// Replace the default [`LoggingHandler`].
    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.event_handler = Box::new(handler);
        self
    }

    /// Register an override hook. Hooks run in registration order.
    pub fn with_hook(mut self, hook: impl ReductionHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// The conversation the model currently sees.
    pub fn messages(&self) -> Vec<AgentMessage> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether a reduction is running.
    pub fn is_reducing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run `f` against the store, then rebuild the conversation view.
    ///
    /// This is how callers append turns between (or during) reductions.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let result = {
            let mut store = self.lock_store();
            f(&mut store)
        };
        self.rebuild_context();
        result
    }

    pub fn into_store(self) -> S {
        self.store
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The compaction plan for the current branch, without running it.
    pub fn plan(&self) -> Option<CompactionPreparation> {
        let branch = self.lock_store().branch_entries(None);
        prepare_compaction(
            &branch,
            &self.settings.compaction_settings(),
            &self.settings.estimator(),
        )
    }

    fn lock_store(&self) -> MutexGuard<'_, S> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rebuild_context(&self) {
        let view = build_session_context(&self.lock_store().branch_entries(None));
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = view;
    }

    // ── Compaction ─────────────────────────────────────────────────

    /// Compact the current branch.
    ///
    /// Fails with [`ReductionError::NothingToCompact`] when compaction is
    /// disabled or the branch is already reduced.
    pub async fn compact(
        &self,
        custom_instructions: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome, ReductionError> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;
        let mut phase = PhaseTracker::new(ReductionKind::Compaction, self.event_handler.as_ref());
        let result = self.run_compaction(&mut phase, custom_instructions, cancel).await;
        phase.finish(&result);
        result
    }

    /// Compact only when the conversation has outgrown `context_window`.
    ///
    /// Returns `Ok(None)` when compaction is disabled, the context is under
    /// the threshold, or there is nothing to compact.
    pub async fn compact_if_needed(
        &self,
        context_window: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<CompactionOutcome>, ReductionError> {
        let settings = self.settings.compaction_settings();
        let branch = self.lock_store().branch_entries(None);
        let context_tokens = estimate_branch_context_tokens(&branch, &self.settings.estimator());
        if !should_compact(context_tokens, context_window, &settings) {
            return Ok(None);
        }
        match self.compact(None, cancel).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(ReductionError::NothingToCompact) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run_compaction(
        &self,
        phase: &mut PhaseTracker<'_>,
        custom_instructions: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CompactionOutcome, ReductionError> {
        phase.advance(ReductionPhase::Preparing);
        let settings = self.settings.compaction_settings();
        if !settings.enabled {
            return Err(ReductionError::NothingToCompact);
        }
        let (branch, snapshot_leaf) = {
            let store = self.lock_store();
            (store.branch_entries(None), store.current_leaf_id())
        };
        let plan = prepare_compaction(&branch, &settings, &self.settings.estimator())
            .ok_or(ReductionError::NothingToCompact)?;

        self.event_handler.on_event(&ReductionEvent::CompactionPlanned {
            first_kept_entry_id: &plan.first_kept_entry_id,
            messages_to_summarize: plan.messages_to_summarize.len(),
            is_split_turn: plan.is_split_turn,
            tokens_before: plan.tokens_before,
        });

        let ctx = CompactHookContext {
            preparation: &plan,
            branch_entries: &branch,
            custom_instructions,
            cancel,
        };
        let (result, from_hook) = match run_before_compact(&self.hooks, &ctx).await {
            HookDecision::Veto(reason) => return Err(ReductionError::Vetoed { reason }),
            HookDecision::Supply(result) => (result, true),
            HookDecision::Proceed => {
                phase.advance(ReductionPhase::Summarizing);
                let result = summarize(
                    &plan,
                    self.transport.as_ref(),
                    &self.model,
                    custom_instructions,
                    cancel,
                )
                .await?;
                (result, false)
            }
        };
        if cancel.is_cancelled() {
            return Err(ReductionError::Cancelled);
        }

        phase.advance(ReductionPhase::Appending);
        let entry_id = {
            let mut store = self.lock_store();
            ensure_on_branch(
                &*store,
                snapshot_leaf.as_deref(),
                &result.first_kept_entry_id,
            )?;
            store.append_compaction(
                result.summary.clone(),
                result.first_kept_entry_id.clone(),
                result.tokens_before,
                Some(result.details.clone()),
                from_hook,
            )?
        };
        self.rebuild_context();

        self.event_handler.on_event(&ReductionEvent::CompactionCompleted {
            entry_id: &entry_id,
            tokens_before: result.tokens_before,
            summary_chars: result.summary.len(),
            from_hook,
        });
        Ok(CompactionOutcome {
            entry_id,
            summary: result.summary,
            first_kept_entry_id: result.first_kept_entry_id,
            tokens_before: result.tokens_before,
            from_hook,
        })
    }

    // ── Tree navigation ────────────────────────────────────────────

    /// Move the leaf to `target_id`, optionally summarizing the branch
    /// being left.
    ///
    /// Navigating to a user or custom message puts the leaf on its parent
    /// and returns the message text as [`NavigateOutcome::editor_text`], so
    /// the user can edit and resend it.
    pub async fn navigate_tree(
        &self,
        target_id: &str,
        options: NavigateOptions,
        cancel: &CancellationToken,
    ) -> Result<NavigateOutcome, ReductionError> {
        let _guard = InFlightGuard::acquire(&self.in_flight)?;
        let mut phase =
            PhaseTracker::new(ReductionKind::BranchSummary, self.event_handler.as_ref());
        let result = self
            .run_navigation(&mut phase, target_id, &options, cancel)
            .await;
        phase.finish(&result);
        result
    }

    async fn run_navigation(
        &self,
        phase: &mut PhaseTracker<'_>,
        target_id: &str,
        options: &NavigateOptions,
        cancel: &CancellationToken,
    ) -> Result<NavigateOutcome, ReductionError> {
        phase.advance(ReductionPhase::Preparing);
        let (target, old_leaf, abandoned) = {
            let store = self.lock_store();
            let target = store
                .entry(target_id)
                .cloned()
                .ok_or_else(|| ReductionError::EntryNotFound(target_id.to_string()))?;
            let old_leaf = store.current_leaf_id();
            let abandoned = abandoned_branch(&*store, old_leaf.as_deref(), target_id);
            (target, old_leaf, abandoned)
        };
        if old_leaf.as_deref() == Some(target_id) {
            return Ok(NavigateOutcome {
                new_leaf_id: old_leaf,
                ..Default::default()
            });
        }

        let has_content = abandoned.entries.iter().any(Entry::is_model_visible);
        if options.summarize && !has_content && !options.allow_empty_summary {
            return Err(ReductionError::NothingToCompact);
        }

        let ctx = TreeHookContext {
            target_id,
            old_leaf_id: old_leaf.as_deref(),
            common_ancestor_id: abandoned.common_ancestor_id.as_deref(),
            entries_to_summarize: &abandoned.entries,
            summarize: options.summarize,
            custom_instructions: options.custom_instructions.as_deref(),
            cancel,
        };
        let supplied = match run_before_tree_navigation(&self.hooks, &ctx).await {
            HookDecision::Veto(reason) => return Err(ReductionError::Vetoed { reason }),
            HookDecision::Supply(summary) => Some(summary),
            HookDecision::Proceed => None,
        };

        let summary = match (options.summarize, supplied) {
            (false, _) => None,
            (true, Some(hook)) => Some((hook.summary, hook.details, true)),
            (true, None) => {
                phase.advance(ReductionPhase::Summarizing);
                let branch_settings = self.settings.branch_summary_settings();
                let summary_options = BranchSummaryOptions {
                    token_budget: branch_settings.token_budget(),
                    custom_instructions: options.custom_instructions.clone(),
                    estimator: self.settings.estimator(),
                };
                match summarize_branch(
                    &abandoned.entries,
                    &summary_options,
                    self.transport.as_ref(),
                    &self.model,
                    cancel,
                )
                .await
                {
                    BranchSummaryOutcome::Summary {
                        summary,
                        read_files,
                        modified_files,
                    } => Some((
                        summary,
                        Some(CompactionDetails {
                            read_files,
                            modified_files,
                        }),
                        false,
                    )),
                    BranchSummaryOutcome::Aborted => return Err(ReductionError::Cancelled),
                    BranchSummaryOutcome::Error(e) => {
                        return Err(ReductionError::SummarizationFailed(e));
                    }
                }
            }
        };
        if cancel.is_cancelled() {
            return Err(ReductionError::Cancelled);
        }

        let (new_leaf, editor_text) = landing_point(&target);

        phase.advance(ReductionPhase::Appending);
        let outcome = {
            let mut store = self.lock_store();
            if store.current_leaf_id() != old_leaf {
                return Err(ReductionError::StalePlan(
                    "the leaf moved while the branch was being summarized".into(),
                ));
            }
            match summary {
                Some((summary, details, from_hook)) => {
                    let from_id = old_leaf.clone().unwrap_or_else(|| "root".into());
                    let id = store.append_branch_summary(
                        new_leaf.as_deref(),
                        from_id,
                        summary,
                        details,
                        from_hook,
                    )?;
                    NavigateOutcome {
                        new_leaf_id: Some(id.clone()),
                        editor_text,
                        summary_entry_id: Some(id),
                        from_hook,
                    }
                }
                None => {
                    store.set_leaf(new_leaf.as_deref())?;
                    NavigateOutcome {
                        new_leaf_id: new_leaf,
                        editor_text,
                        summary_entry_id: None,
                        from_hook: false,
                    }
                }
            }
        };
        self.rebuild_context();

        self.event_handler.on_event(&ReductionEvent::Navigated {
            old_leaf: old_leaf.as_deref(),
            new_leaf: outcome.new_leaf_id.as_deref(),
            summary_entry_id: outcome.summary_entry_id.as_deref(),
            from_hook: outcome.from_hook,
        });
        Ok(outcome)
    }
}

/// Where the leaf lands when navigating to `target`, and the text to hand
/// back for re-editing.
fn landing_point(target: &Entry) -> (Option<String>, Option<String>) {
    match &target.kind {
        EntryKind::Message {
            message: AgentMessage::User { content, .. },
        } => (target.parent_id.clone(), Some(collect_text(content))),
        EntryKind::CustomMessage { content, .. } => {
            (target.parent_id.clone(), Some(content.clone()))
        }
        _ => (Some(target.id.clone()), None),
    }
}

/// Fail unless the planned leaf and first kept entry are still on the
/// current branch.
fn ensure_on_branch<S: EntryStore + ?Sized>(
    store: &S,
    snapshot_leaf: Option<&str>,
    first_kept_entry_id: &str,
) -> Result<(), ReductionError> {
    let branch = store.branch_entries(None);
    if let Some(leaf) = snapshot_leaf
        && !branch.iter().any(|e| e.id == leaf)
    {
        return Err(ReductionError::StalePlan(format!(
            "planned leaf {leaf} is no longer on the current branch"
        )));
    }
    if !branch.iter().any(|e| e.id == first_kept_entry_id) {
        return Err(ReductionError::StalePlan(format!(
            "first kept entry {first_kept_entry_id} is not on the current branch"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionLog;

    #[test]
    fn in_flight_guard_is_exclusive_and_released_on_drop() {
        let flag = AtomicBool::new(false);
        let guard = InFlightGuard::acquire(&flag).unwrap();
        assert!(matches!(
            InFlightGuard::acquire(&flag),
            Err(ReductionError::InProgress)
        ));
        drop(guard);
        assert!(InFlightGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn phase_tracker_settles_terminal_phases() {
        let handler = crate::agent::events::NoopHandler;
        let mut phase = PhaseTracker::new(ReductionKind::Compaction, &handler);
        phase.advance(ReductionPhase::Preparing);

        phase.finish::<()>(&Err(ReductionError::Vetoed { reason: None }));
        assert_eq!(phase.phase, ReductionPhase::Cancelled);

        phase.finish::<()>(&Err(ReductionError::SummarizationFailed("x".into())));
        assert_eq!(phase.phase, ReductionPhase::Failed);

        phase.finish::<()>(&Err(ReductionError::NothingToCompact));
        assert_eq!(phase.phase, ReductionPhase::Idle);
    }

    #[test]
    fn landing_point_moves_to_parent_of_user_messages() {
        let user = Entry::message("u", Some("p".into()), AgentMessage::user("try again"));
        assert_eq!(
            landing_point(&user),
            (Some("p".into()), Some("try again".into()))
        );

        let assistant = Entry::message("a", Some("u".into()), AgentMessage::assistant_text("ok"));
        assert_eq!(landing_point(&assistant), (Some("a".into()), None));

        let root_user = Entry::message("r", None, AgentMessage::user("first"));
        assert_eq!(landing_point(&root_user), (None, Some("first".into())));
    }

    #[test]
    fn stale_plan_detected_after_leaf_moves() {
        let mut log = SessionLog::new();
        let a = log.append_message(AgentMessage::user("a")).unwrap();
        let b = log.append_message(AgentMessage::assistant_text("b")).unwrap();
        assert!(ensure_on_branch(&log, Some(&b), &a).is_ok());

        // A new turn under the planned leaf keeps the plan valid.
        log.append_message(AgentMessage::user("c")).unwrap();
        assert!(ensure_on_branch(&log, Some(&b), &a).is_ok());

        // Moving to a sibling branch does not.
        log.set_leaf(Some(&a)).unwrap();
        log.append_message(AgentMessage::assistant_text("b'")).unwrap();
        assert!(matches!(
            ensure_on_branch(&log, Some(&b), &a),
            Err(ReductionError::StalePlan(_))
        ));
        assert!(matches!(
            ensure_on_branch(&log, None, "missing"),
            Err(ReductionError::StalePlan(_))
        ));
    }

    #[test]
    fn kind_display() {
        assert_eq!(ReductionKind::Compaction.to_string(), "compaction");
        assert_eq!(ReductionKind::BranchSummary.to_string(), "branch summary");
    }
}

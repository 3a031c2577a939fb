//! Override hooks and the external hook runner.
//!
//! Two mechanisms let callers step into a reduction between planning and
//! summarization:
//!
//! 1. **[`ReductionHook`]** — a typed trait with one method per reduction
//!    kind. Each returns a [`HookDecision`]: let the reduction proceed, veto
//!    it, or supply a ready-made result that replaces the model call.
//!
//! 2. **[`ExternalHookRunner`]** — a `ReductionHook` that runs shell
//!    commands configured through [`HookConfig`] (loadable from JSON).
//!
//! Hooks run in registration order and the first decision other than
//! [`HookDecision::Proceed`] wins.

use crate::context::CompactionPreparation;
use crate::context::CompactionResult;
use crate::context::transcript::serialize_conversation;
use crate::session::{CompactionDetails, Entry};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── Decisions and contexts ─────────────────────────────────────────

/// What a hook decided about a pending reduction.
#[derive(Debug, Clone, PartialEq)]
pub enum HookDecision<T> {
    /// Continue with the built-in summary generator.
    Proceed,
    /// Abort the reduction; nothing is appended.
    Veto(Option<String>),
    /// Use this result instead of calling the model.
    Supply(T),
}

/// Boxed future returned by [`ReductionHook`] methods.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = HookDecision<T>> + Send + 'a>>;

/// Input to [`ReductionHook::before_compact`].
#[derive(Debug)]
pub struct CompactHookContext<'a> {
    pub preparation: &'a CompactionPreparation,
    /// The branch the plan was computed from, oldest first.
    pub branch_entries: &'a [Entry],
    pub custom_instructions: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

/// Input to [`ReductionHook::before_tree_navigation`].
#[derive(Debug)]
pub struct TreeHookContext<'a> {
    pub target_id: &'a str,
    pub old_leaf_id: Option<&'a str>,
    pub common_ancestor_id: Option<&'a str>,
    /// The abandoned span, oldest first.
    pub entries_to_summarize: &'a [Entry],
    /// Whether the caller asked for a branch summary.
    pub summarize: bool,
    pub custom_instructions: Option<&'a str>,
    pub cancel: &'a CancellationToken,
}

/// A branch summary supplied by a hook.
#[derive(Debug, Clone, PartialEq)]
pub struct HookBranchSummary {
    pub summary: String,
    pub details: Option<CompactionDetails>,
}

// ── ReductionHook trait ────────────────────────────────────────────

/// Typed override hook for reductions.
///
/// Both methods default to [`HookDecision::Proceed`]. Results supplied by
/// a hook are stored with `from_hook = true` and their provenance is not
/// carried into later reductions.
///
/// # Example
///
/// ```ignore
/// struct NoCompactionDuringDeploy;
///
/// impl ReductionHook for NoCompactionDuringDeploy {
///     fn before_compact<'a>(
///         &'a self,
///         _ctx: &'a CompactHookContext<'a>,
///     ) -> HookFuture<'a, CompactionResult> {
///         Box::pin(async { HookDecision::Veto(Some("deploy in progress".into())) })
///     }
/// }
/// ```
pub trait ReductionHook: Send + Sync {
    fn before_compact<'a>(
        &'a self,
        ctx: &'a CompactHookContext<'a>,
    ) -> HookFuture<'a, CompactionResult> {
        let _ = ctx;
        Box::pin(async { HookDecision::Proceed })
    }

    fn before_tree_navigation<'a>(
        &'a self,
        ctx: &'a TreeHookContext<'a>,
    ) -> HookFuture<'a, HookBranchSummary> {
        let _ = ctx;
        Box::pin(async { HookDecision::Proceed })
    }
}

/// Run `before_compact` on each hook until one decides.
pub async fn run_before_compact(
    hooks: &[Arc<dyn ReductionHook>],
    ctx: &CompactHookContext<'_>,
) -> HookDecision<CompactionResult> {
    for hook in hooks {
        match hook.before_compact(ctx).await {
            HookDecision::Proceed => continue,
            decision => return decision,
        }
    }
    HookDecision::Proceed
}

/// Run `before_tree_navigation` on each hook until one decides.
pub async fn run_before_tree_navigation(
    hooks: &[Arc<dyn ReductionHook>],
    ctx: &TreeHookContext<'_>,
) -> HookDecision<HookBranchSummary> {
    for hook in hooks {
        match hook.before_tree_navigation(ctx).await {
            HookDecision::Proceed => continue,
            decision => return decision,
        }
    }
    HookDecision::Proceed
}

// ── HookConfig ─────────────────────────────────────────────────────

/// Configuration for external shell hooks, loadable from JSON.
///
/// # Example JSON
///
/// ```json
/// {
///   "before_compact": [
///     { "command": "./hooks/summarize.sh", "timeout_secs": 120 }
///   ],
///   "before_tree_navigation": [
///     { "command": "./hooks/guard-branch.sh" }
///   ]
/// }
/// ```
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct HookConfig {
    #[serde(default)]
    pub before_compact: Vec<HookEntry>,
    #[serde(default)]
    pub before_tree_navigation: Vec<HookEntry>,
}

/// A single hook entry: a shell command with an optional timeout.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct HookEntry {
    /// Shell command to execute.
    pub command: String,
    /// Seconds before the command is killed. Default: 60.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

// ── ExternalHookRunner ─────────────────────────────────────────────

/// A [`ReductionHook`] that runs external shell commands.
///
/// Commands receive context via environment variables:
/// - `CINCH_HOOK_EVENT`: `before_compact` or `before_tree_navigation`
/// - `CINCH_FIRST_KEPT_ENTRY`, `CINCH_TOKENS_BEFORE`, `CINCH_SPLIT_TURN`
///   (compaction)
/// - `CINCH_TARGET_ID`, `CINCH_OLD_LEAF`, `CINCH_SUMMARIZE` (navigation)
///
/// The transcript of the span being reduced is written to stdin.
///
/// Exit code 0 with empty stdout proceeds; exit code 0 with output
/// supplies that output as the summary; any other exit code vetoes, with
/// stdout as the reason. A command that cannot be run, or that times
/// out, is logged and treated as proceed.
pub struct ExternalHookRunner {
    hooks: HookConfig,
    workdir: String,
}

/// Outcome of one hook command.
#[derive(Debug, PartialEq, Eq)]
struct HookOutput {
    exit_code: i32,
    stdout: String,
}

impl ExternalHookRunner {
    /// Create a runner with the given config and working directory.
    pub fn new(hooks: HookConfig, workdir: impl Into<String>) -> Self {
        Self {
            hooks,
            workdir: workdir.into(),
        }
    }

    /// Load hook config from a JSON file. Returns a runner with default
    /// (empty) config if the file doesn't exist or can't be parsed.
    pub fn load(path: impl AsRef<Path>, workdir: impl Into<String>) -> Self {
        let hooks = match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Failed to parse hooks config: {e}");
                HookConfig::default()
            }),
            Err(_) => HookConfig::default(),
        };
        Self::new(hooks, workdir)
    }

    pub fn config(&self) -> &HookConfig {
        &self.hooks
    }

    /// Run a single hook command, feeding `stdin` to it.
    async fn run_hook(
        &self,
        entry: &HookEntry,
        env_vars: &[(&str, String)],
        stdin: String,
        cancel: &CancellationToken,
    ) -> Result<Option<HookOutput>, String> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&entry.command)
            .current_dir(&self.workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, val) in env_vars {
            cmd.env(key, val);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to execute hook command: {e}"))?;

        if let Some(mut pipe) = child.stdin.take() {
            tokio::spawn(async move {
                // Commands are free to ignore their input.
                if let Err(e) = pipe.write_all(stdin.as_bytes()).await {
                    debug!("Hook did not read its input: {e}");
                }
            });
        }

        let timeout = entry
            .timeout_secs
            .map_or(DEFAULT_HOOK_TIMEOUT, Duration::from_secs);
        let output = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|e| format!("Failed to wait for hook command: {e}"))?,
                Err(_) => return Err(format!("hook timed out after {}s", timeout.as_secs())),
            },
        };

        Ok(Some(HookOutput {
            exit_code: output.status.code().unwrap_or(1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        }))
    }

    /// Run `entries` in order and map the first deciding command.
    async fn decide<T>(
        &self,
        event: &str,
        entries: &[HookEntry],
        env_vars: &[(&str, String)],
        stdin: &str,
        cancel: &CancellationToken,
        supply: impl Fn(String) -> Option<T>,
    ) -> HookDecision<T> {
        for entry in entries {
            match self.run_hook(entry, env_vars, stdin.to_string(), cancel).await {
                Ok(Some(HookOutput { exit_code: 0, stdout })) => {
                    if stdout.is_empty() {
                        continue;
                    }
                    if let Some(result) = supply(stdout) {
                        debug!("{event} hook supplied a summary");
                        return HookDecision::Supply(result);
                    }
                }
                Ok(Some(HookOutput { stdout, .. })) => {
                    return HookDecision::Veto((!stdout.is_empty()).then_some(stdout));
                }
                Ok(None) => return HookDecision::Proceed,
                Err(e) => {
                    warn!("{event} hook failed: {e}");
                }
            }
        }
        HookDecision::Proceed
    }
}

impl ReductionHook for ExternalHookRunner {
    fn before_compact<'a>(
        &'a self,
        ctx: &'a CompactHookContext<'a>,
    ) -> HookFuture<'a, CompactionResult> {
        Box::pin(async move {
            if self.hooks.before_compact.is_empty() {
                return HookDecision::Proceed;
            }
            let plan = ctx.preparation;
            let env_vars = [
                ("CINCH_HOOK_EVENT", "before_compact".to_string()),
                ("CINCH_FIRST_KEPT_ENTRY", plan.first_kept_entry_id.clone()),
                ("CINCH_TOKENS_BEFORE", plan.tokens_before.to_string()),
                ("CINCH_SPLIT_TURN", plan.is_split_turn.to_string()),
            ];
            let mut span = plan.messages_to_summarize.clone();
            span.extend(plan.turn_prefix_messages.iter().cloned());
            let transcript = serialize_conversation(&span);

            self.decide(
                "before_compact",
                &self.hooks.before_compact,
                &env_vars,
                &transcript,
                ctx.cancel,
                |summary| {
                    Some(CompactionResult {
                        summary,
                        first_kept_entry_id: plan.first_kept_entry_id.clone(),
                        tokens_before: plan.tokens_before,
                        details: CompactionDetails::default(),
                    })
                },
            )
            .await
        })
    }

    fn before_tree_navigation<'a>(
        &'a self,
        ctx: &'a TreeHookContext<'a>,
    ) -> HookFuture<'a, HookBranchSummary> {
        Box::pin(async move {
            if self.hooks.before_tree_navigation.is_empty() {
                return HookDecision::Proceed;
            }
            let env_vars = [
                ("CINCH_HOOK_EVENT", "before_tree_navigation".to_string()),
                ("CINCH_TARGET_ID", ctx.target_id.to_string()),
                ("CINCH_OLD_LEAF", ctx.old_leaf_id.unwrap_or_default().to_string()),
                ("CINCH_SUMMARIZE", ctx.summarize.to_string()),
            ];
            let span: Vec<_> = ctx
                .entries_to_summarize
                .iter()
                .filter_map(Entry::to_message)
                .collect();
            let transcript = serialize_conversation(&span);
            let summarize = ctx.summarize;

            self.decide(
                "before_tree_navigation",
                &self.hooks.before_tree_navigation,
                &env_vars,
                &transcript,
                ctx.cancel,
                |summary| {
                    summarize.then_some(HookBranchSummary {
                        summary,
                        details: None,
                    })
                },
            )
            .await
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

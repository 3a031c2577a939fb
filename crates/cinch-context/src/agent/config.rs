//! Configuration for the [`ReductionSession`](super::orchestrator::ReductionSession).
//!
//! Reductions are **enabled by default** with budgets that suit a 128k
//! window. Settings are read through [`SettingsProvider`] at the moment a
//! reduction starts, so a provider backed by shared state can change them
//! between reductions.
//!
//! # Examples
//!
//! ```
//! use cinch_context::agent::config::ReductionConfig;
//! use cinch_context::context::CompactionSettings;
//!
//! let config = ReductionConfig::default()
//!     .with_model("openai/gpt-4o-mini")
//!     .with_compaction(CompactionSettings::default().with_keep_recent_tokens(8_000));
//! assert_eq!(config.compaction.keep_recent_tokens, 8_000);
//! assert!(config.compaction.enabled);
//! ```
//!
//! Loading from JSON, where every field is optional:
//!
//! ```json
//! {
//!   "model": "anthropic/claude-sonnet-4",
//!   "compaction": { "reserve_tokens": 16384, "keep_recent_tokens": 20000 },
//!   "branch_summary": { "context_window_tokens": 200000 },
//!   "image_chars": 4800
//! }
//! ```

use crate::DEFAULT_MODEL;
use crate::context::tokens::IMAGE_CHAR_ESTIMATE;
use crate::context::{BranchSummarySettings, CompactionSettings, TokenEstimator};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Largest accepted response reserve. Output budgets are derived from it.
pub const MAX_RESERVE_TOKENS: u32 = 1_000_000;

/// All reduction settings in one serializable bundle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReductionConfig {
    /// Model used for summarization calls.
    pub model: String,
    pub compaction: CompactionSettings,
    pub branch_summary: BranchSummarySettings,
    /// Characters charged per image by the token estimator.
    pub image_chars: usize,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.into(),
            compaction: CompactionSettings::default(),
            branch_summary: BranchSummarySettings::default(),
            image_chars: IMAGE_CHAR_ESTIMATE,
        }
    }
}

impl ReductionConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_compaction(mut self, settings: CompactionSettings) -> Self {
        self.compaction = settings;
        self
    }

    pub fn with_branch_summary(mut self, settings: BranchSummarySettings) -> Self {
        self.branch_summary = settings;
        self
    }

    pub fn with_image_chars(mut self, chars: usize) -> Self {
        self.image_chars = chars;
        self
    }

    /// Check budgets that would make a reduction meaningless.
    pub fn validate(&self) -> Result<(), String> {
        let reserves = [
            ("compaction.reserve_tokens", self.compaction.reserve_tokens),
            ("branch_summary.reserve_tokens", self.branch_summary.reserve_tokens),
        ];
        for (name, value) in reserves {
            if value > MAX_RESERVE_TOKENS {
                return Err(format!(
                    "{name} is {value}, above the maximum of {MAX_RESERVE_TOKENS}"
                ));
            }
        }
        let window = self.branch_summary.context_window_tokens;
        if window > 0 && self.branch_summary.reserve_tokens >= window {
            return Err(format!(
                "branch_summary.reserve_tokens must be below context_window_tokens ({window})"
            ));
        }
        Ok(())
    }

    /// Load from a JSON file. A missing file yields the defaults.
    ///
    /// Parsed settings are validated; see [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        let config: Self =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.display().to_string(),
            reason,
        })?;
        Ok(config)
    }
}

// ── Settings provider ──────────────────────────────────────────────

/// Supplies reduction settings when a reduction starts.
pub trait SettingsProvider: Send + Sync {
    fn compaction_settings(&self) -> CompactionSettings;

    fn branch_summary_settings(&self) -> BranchSummarySettings;

    fn estimator(&self) -> TokenEstimator {
        TokenEstimator::default()
    }
}

impl SettingsProvider for ReductionConfig {
    fn compaction_settings(&self) -> CompactionSettings {
        self.compaction.clone()
    }

    fn branch_summary_settings(&self) -> BranchSummarySettings {
        self.branch_summary.clone()
    }

    fn estimator(&self) -> TokenEstimator {
        TokenEstimator::default().with_image_chars(self.image_chars)
    }
}

/// Live settings shared with whoever edits them.
impl SettingsProvider for Arc<RwLock<ReductionConfig>> {
    fn compaction_settings(&self) -> CompactionSettings {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .compaction_settings()
    }

    fn branch_summary_settings(&self) -> BranchSummarySettings {
        self.read()
            .unwrap_or_else(PoisonError::into_inner)
            .branch_summary_settings()
    }

    fn estimator(&self) -> TokenEstimator {
        self.read().unwrap_or_else(PoisonError::into_inner).estimator()
    }
}

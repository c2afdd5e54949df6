//! Configuration for the fix engine.
//!
//! Loaded from `.quality-hook.json` in the project directory, falling back to
//! `~/.claude/linter-config.json`, then to built-in defaults. Key names match
//! the hook configuration files already in use, e.g.:
//!
//! ```json
//! {
//!   "max_fix_iterations": 3,
//!   "auto_fix": { "enabled": true, "threshold": 10 },
//!   "claude_code": {
//!     "max_workers": 10,
//!     "timeout": 600,
//!     "clustering_strategy": "hybrid",
//!     "worktree_merge_strategy": "sequential",
//!     "custom_issue_categories": { "django": ["DJ", "django"] }
//!   }
//! }
//! ```

use crate::cluster::{ClusterConfig, ClusterStrategy};
use crate::error::{FixError, Result};
use crate::merge::MergeStrategy;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Project-level config file name.
pub const PROJECT_CONFIG_FILE: &str = ".quality-hook.json";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixerConfig {
    /// Convergence rounds per run across all files.
    #[serde(default = "default_max_fix_iterations")]
    pub max_fix_iterations: u32,

    #[serde(default)]
    pub auto_fix: AutoFixConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Agent, clustering and workspace settings.
    #[serde(default)]
    pub claude_code: AgentConfig,

    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_max_fix_iterations() -> u32 {
    3
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            max_fix_iterations: default_max_fix_iterations(),
            auto_fix: AutoFixConfig::default(),
            logging: LoggingConfig::default(),
            claude_code: AgentConfig::default(),
            source: None,
        }
    }
}

/// Linter-native auto-fix pre-pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoFixConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip the auto-fixer when more issues than this are reported.
    #[serde(default = "default_auto_fix_threshold")]
    pub threshold: usize,
}

fn default_auto_fix_threshold() -> usize {
    10
}

impl Default for AutoFixConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_auto_fix_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default filter level when neither `-v` nor `RUST_LOG` is given.
    #[serde(default)]
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: None,
        }
    }
}

/// Settings for the agent-driven fix path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Whether the agent path runs at all (predictions still apply when off).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent agent invocations across the whole run.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Agent timeout in seconds.
    #[serde(default = "default_agent_timeout", rename = "timeout")]
    pub timeout_secs: u64,

    /// Timeout in seconds for each git workspace operation.
    #[serde(default = "default_workspace_timeout", rename = "workspace_timeout")]
    pub workspace_timeout_secs: u64,

    /// Timeout in seconds for each linter run.
    #[serde(default = "default_linter_timeout", rename = "linter_timeout")]
    pub linter_timeout_secs: u64,

    /// Convergence iterations per file.
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,

    #[serde(default = "default_cluster_distance")]
    pub cluster_distance: u32,

    #[serde(default = "default_max_issues_per_cluster")]
    pub max_issues_per_cluster: usize,

    /// When false every issue becomes its own cluster.
    #[serde(default = "default_true", rename = "batch_similar_issues")]
    pub batch_similar: bool,

    #[serde(default = "default_true")]
    pub predict_simple_fixes: bool,

    /// Category name to keyword list, checked before the built-in categories.
    #[serde(default)]
    pub custom_issue_categories: BTreeMap<String, Vec<String>>,

    #[serde(default, deserialize_with = "lenient")]
    pub clustering_strategy: ClusterStrategy,

    #[serde(default, deserialize_with = "lenient")]
    pub worktree_merge_strategy: MergeStrategy,

    /// Maximum simultaneously active workspaces.
    #[serde(default = "default_max_worktrees")]
    pub max_worktrees: usize,

    /// Seconds after which a `linter-fix-*` workspace or branch not owned by
    /// this process is swept before a run.
    #[serde(default = "default_stale_worktree_age", rename = "stale_worktree_age")]
    pub stale_worktree_age_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_workers() -> usize {
    10
}

fn default_agent_timeout() -> u64 {
    600
}

fn default_workspace_timeout() -> u64 {
    60
}

fn default_linter_timeout() -> u64 {
    30
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_cluster_distance() -> u32 {
    5
}

fn default_max_issues_per_cluster() -> usize {
    5
}

fn default_max_worktrees() -> usize {
    10
}

fn default_stale_worktree_age() -> u64 {
    3600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: default_max_workers(),
            timeout_secs: default_agent_timeout(),
            workspace_timeout_secs: default_workspace_timeout(),
            linter_timeout_secs: default_linter_timeout(),
            max_fix_attempts: default_max_fix_attempts(),
            cluster_distance: default_cluster_distance(),
            max_issues_per_cluster: default_max_issues_per_cluster(),
            batch_similar: true,
            predict_simple_fixes: true,
            custom_issue_categories: BTreeMap::new(),
            clustering_strategy: ClusterStrategy::default(),
            worktree_merge_strategy: MergeStrategy::default(),
            max_worktrees: default_max_worktrees(),
            stale_worktree_age_secs: default_stale_worktree_age(),
        }
    }
}

/// Deserialize a strategy name, falling back to the default on unknown names.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Default,
    T::Err: std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.parse().unwrap_or_else(|e| {
        warn!(value = %raw, "{e}; using default");
        T::default()
    }))
}

impl FixerConfig {
    /// Load configuration for a project.
    ///
    /// Looks for `.quality-hook.json` in `project_dir`, then
    /// `~/.claude/linter-config.json`. Returns defaults when neither exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        for candidate in Self::candidate_paths(project_dir) {
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }
        debug!("Using default configuration");
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FixError::config_with_path(format!("cannot read: {e}"), path.to_path_buf())
        })?;
        let mut config: FixerConfig = serde_json::from_str(&content).map_err(|e| {
            FixError::config_with_path(format!("cannot parse: {e}"), path.to_path_buf())
        })?;
        config.source = Some(path.to_path_buf());
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Candidate config files in lookup order.
    #[must_use]
    pub fn candidate_paths(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![project_dir.join(PROJECT_CONFIG_FILE)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".claude").join("linter-config.json"));
        }
        paths
    }

    /// Reject values that would stall the engine.
    ///
    /// # Errors
    ///
    /// Returns [`FixError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let agent = &self.claude_code;
        let checks: [(&str, bool); 8] = [
            ("max_fix_iterations", self.max_fix_iterations > 0),
            ("claude_code.max_workers", agent.max_workers > 0),
            ("claude_code.max_worktrees", agent.max_worktrees > 0),
            ("claude_code.max_fix_attempts", agent.max_fix_attempts > 0),
            ("claude_code.max_issues_per_cluster", agent.max_issues_per_cluster > 0),
            ("claude_code.timeout", agent.timeout_secs > 0),
            ("claude_code.workspace_timeout", agent.workspace_timeout_secs > 0),
            ("claude_code.linter_timeout", agent.linter_timeout_secs > 0),
        ];
        for (field, ok) in checks {
            if !ok {
                return Err(FixError::invalid_config(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Clustering settings derived from this config.
    #[must_use]
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            distance: self.claude_code.cluster_distance,
            max_cluster_size: self.claude_code.max_issues_per_cluster,
            strategy: self.claude_code.clustering_strategy,
            batching: self.claude_code.batch_similar,
        }
    }

    #[must_use]
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.claude_code.timeout_secs)
    }

    #[must_use]
    pub fn workspace_timeout(&self) -> Duration {
        Duration::from_secs(self.claude_code.workspace_timeout_secs)
    }

    #[must_use]
    pub fn linter_timeout(&self) -> Duration {
        Duration::from_secs(self.claude_code.linter_timeout_secs)
    }

    #[must_use]
    pub fn stale_worktree_age(&self) -> Duration {
        Duration::from_secs(self.claude_code.stale_worktree_age_secs)
    }

    /// Permits in the engine-wide worker pool.
    #[must_use]
    pub fn worker_budget(&self) -> usize {
        self.claude_code
            .max_workers
            .min(self.claude_code.max_worktrees)
            .max(1)
    }
}

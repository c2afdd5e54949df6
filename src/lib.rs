//! lintfix - parallel, worktree-isolated lint fixing
//!
//! Resolves static-analysis issues by grouping them into independently
//! fixable clusters, handing each cluster to a fixing agent inside its own
//! detached `git worktree`, and merging the divergent results back into one
//! file. A bounded convergence loop repeats until the file is clean or stops
//! improving.
//!
//! # Architecture
//!
//! - [`issue`] - issues, clusters and fingerprints
//! - [`cluster`] - proximity/similarity/hybrid clustering
//! - [`predict`] - deterministic fixes that skip the agent
//! - [`vcs`] - version-control seam and the git CLI
//! - [`workspace`] - worktree lifecycle, registry and leases
//! - [`agent`] - fixing-agent seam, Claude CLI adapter and prompts
//! - [`linter`] - static-analysis seam and the ruff adapter
//! - [`executor`] - concurrent cluster attempts
//! - [`merge`] - agent, sequential and octopus merges
//! - [`session`] - the per-file convergence loop
//! - [`engine`] - shared context and the multi-file runner
//! - [`config`] - configuration loading and validation
//! - [`error`] - error types
//! - [`testing`] - mocks and fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use lintfix::{FixContext, FixEngine, FixerConfig};
//!
//! let config = FixerConfig::load(".".as_ref())?;
//! let engine = FixEngine::new(FixContext::with_defaults(config));
//! let report = engine.fix_files(&["src/app.py".into()]).await;
//! println!("{} clean", report.success_count());
//! ```

pub mod agent;
pub mod blocking;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod issue;
pub mod linter;
pub mod merge;
pub mod predict;
pub mod session;
pub mod testing;
pub mod vcs;
pub mod workspace;

// Re-export commonly used types
pub use error::{ErrorCategory, FixError, Result};

pub use agent::{needs_agent, AgentRequest, AgentResponse, ClaudeCliAgent, FixingAgent};
pub use cluster::{CategoryTable, ClusterConfig, ClusterStrategy, Clusterer};
pub use config::FixerConfig;
pub use engine::{BatchReport, FixContext, FixEngine, FixPlan};
pub use executor::{FixAttemptResult, ParallelFixExecutor};
pub use issue::{Issue, IssueCluster, Severity};
pub use linter::{Linter, RuffLinter};
pub use merge::{MergeEngine, MergeOutcome, MergeStrategy};
pub use predict::{ImportTable, Prediction, Predictor};
pub use session::{FixSession, SessionOutcome, SessionStatus};
pub use vcs::{GitCli, VersionControl};
pub use workspace::{Workspace, WorkspaceLease, WorkspaceManager};

// Re-export testing types for convenience
pub use testing::{MockAgent, MockLinter, MockVcs};

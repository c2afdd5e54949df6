//! Shared context and the multi-file batch runner.
//!
//! [`FixContext`] is the one place run-wide state lives: configuration,
//! collaborators, the workspace registry and the global worker pool. It is
//! cheap to clone and is handed to every [`FixSession`].

use crate::agent::{needs_agent, ClaudeCliAgent, FixingAgent};
use crate::blocking::run_blocking;
use crate::cluster::{CategoryTable, Clusterer};
use crate::config::FixerConfig;
use crate::error::Result;
use crate::executor::ParallelFixExecutor;
use crate::issue::{Issue, IssueCluster};
use crate::linter::{Linter, RuffLinter};
use crate::merge::MergeEngine;
use crate::predict::{ImportTable, Predictor};
use crate::session::{stage_predictions, FixSession, SessionOutcome, SessionStatus};
use crate::vcs::{GitCli, VersionControl};
use crate::workspace::WorkspaceManager;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Everything a fix run shares.
#[derive(Clone)]
pub struct FixContext {
    pub config: Arc<FixerConfig>,
    pub agent: Arc<dyn FixingAgent>,
    pub linter: Arc<dyn Linter>,
    pub workspaces: WorkspaceManager,
    pub predictor: Arc<Predictor>,
    pub clusterer: Arc<Clusterer>,
    /// Bounds agent invocations and scratch merges across all files.
    pub permits: Arc<Semaphore>,
}

impl std::fmt::Debug for FixContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixContext")
            .field("agent", &self.agent.name())
            .field("linter", &self.linter.name())
            .field("workspaces", &self.workspaces)
            .field("permits", &self.permits.available_permits())
            .finish()
    }
}

impl FixContext {
    pub fn new(
        config: FixerConfig,
        agent: Arc<dyn FixingAgent>,
        linter: Arc<dyn Linter>,
        vcs: Arc<dyn VersionControl>,
    ) -> Self {
        let workspaces = WorkspaceManager::new(
            vcs,
            config.claude_code.max_worktrees,
            config.workspace_timeout(),
        );
        let predictor = Predictor::new(ImportTable::builtin(), config.claude_code.predict_simple_fixes);
        let clusterer = Clusterer::new(
            config.cluster_config(),
            CategoryTable::with_custom(&config.claude_code.custom_issue_categories),
        );
        let permits = Arc::new(Semaphore::new(config.worker_budget()));

        Self {
            config: Arc::new(config),
            agent,
            linter,
            workspaces,
            predictor: Arc::new(predictor),
            clusterer: Arc::new(clusterer),
            permits,
        }
    }

    /// Context with the Claude CLI agent, ruff and git.
    #[must_use]
    pub fn with_defaults(config: FixerConfig) -> Self {
        let linter = RuffLinter::new().with_timeout(config.linter_timeout());
        Self::new(
            config,
            Arc::new(ClaudeCliAgent::new()),
            Arc::new(linter),
            Arc::new(GitCli::new()),
        )
    }

    /// Turn the agent path off when the agent cannot run. Predicted fixes
    /// and the linter's own fixer still apply.
    pub async fn with_available_agent(mut self) -> Self {
        if self.config.claude_code.enabled && !self.agent.is_available().await {
            warn!(
                agent = self.agent.name(),
                "Agent not available; only predicted and auto-fixes will be applied"
            );
            let mut config = (*self.config).clone();
            config.claude_code.enabled = false;
            self.config = Arc::new(config);
        }
        self
    }

    #[must_use]
    pub fn with_predictor(mut self, predictor: Predictor) -> Self {
        self.predictor = Arc::new(predictor);
        self
    }

    #[must_use]
    pub fn with_clusterer(mut self, clusterer: Clusterer) -> Self {
        self.clusterer = Arc::new(clusterer);
        self
    }

    /// Executor sharing this context's pool and registry.
    #[must_use]
    pub fn executor(&self) -> ParallelFixExecutor {
        let strategy = self.config.claude_code.worktree_merge_strategy;
        ParallelFixExecutor::new(
            Arc::clone(&self.agent),
            self.workspaces.clone(),
            Arc::clone(&self.permits),
            self.config.claude_code.max_workers,
            self.config.agent_timeout(),
        )
        .with_branch_commits(strategy.needs_branches())
    }

    #[must_use]
    pub fn merge_engine(&self) -> MergeEngine {
        MergeEngine::new(
            Arc::clone(&self.agent),
            self.workspaces.clone(),
            Arc::clone(&self.permits),
            self.config.claude_code.worktree_merge_strategy,
            self.config.agent_timeout(),
        )
    }
}

/// Outcome of a multi-file run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rounds: u32,
    pub outcomes: Vec<SessionOutcome>,
}

impl BatchReport {
    /// Every file ended clean.
    #[must_use]
    pub fn all_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_success())
    }

    #[must_use]
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.status.is_success()).count()
    }

    /// Issues left across all files.
    #[must_use]
    pub fn residual_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.residual.len()).sum()
    }

    #[must_use]
    pub fn aborted(&self) -> Vec<&SessionOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, SessionStatus::Aborted(_)))
            .collect()
    }
}

/// What a fix run would do for one file, computed without changing it.
#[derive(Debug, Clone, Serialize)]
pub struct FixPlan {
    pub file: PathBuf,
    pub issues: Vec<Issue>,
    /// Issues the predictor resolves without the agent.
    pub predicted: Vec<Issue>,
    /// Clusters that would go to the agent.
    pub clusters: Vec<IssueCluster>,
    pub needs_agent: bool,
}

/// Runs fix sessions for many files.
#[derive(Debug, Clone)]
pub struct FixEngine {
    ctx: FixContext,
}

impl FixEngine {
    pub fn new(ctx: FixContext) -> Self {
        Self { ctx }
    }

    #[must_use]
    pub fn context(&self) -> &FixContext {
        &self.ctx
    }

    /// Lint, predict and cluster `file` in memory.
    pub async fn plan(&self, file: &Path) -> Result<FixPlan> {
        let linter = Arc::clone(&self.ctx.linter);
        let path = file.to_path_buf();
        let issues = run_blocking("lint", self.ctx.config.linter_timeout(), move || {
            linter.check(&path)
        })
        .await?;
        let content = tokio::fs::read_to_string(file).await?;

        let staged = stage_predictions(&self.ctx.predictor, &content, issues.clone());
        let clusters = self.ctx.clusterer.cluster(&staged.remaining);
        Ok(FixPlan {
            file: file.to_path_buf(),
            needs_agent: needs_agent(&issues, false),
            issues,
            predicted: staged.predicted.into_iter().map(|(issue, _)| issue).collect(),
            clusters,
        })
    }

    /// Fix a single file to completion.
    pub async fn fix_file(&self, file: &Path) -> SessionOutcome {
        let mut report = self.fix_files(&[file.to_path_buf()]).await;
        report
            .outcomes
            .pop()
            .unwrap_or_else(|| SessionOutcome::aborted(file, "no session ran"))
    }

    /// Fix several files concurrently.
    ///
    /// Sessions advance in rounds, one iteration each per round, for at most
    /// `max_fix_iterations` rounds. Outcomes keep the order of `files`; a
    /// file named more than once is fixed by a single session and every
    /// mention reports its outcome.
    pub async fn fix_files(&self, files: &[PathBuf]) -> BatchReport {
        let started_at = Utc::now();
        let opened = join_all(files.iter().map(|f| FixSession::open(self.ctx.clone(), f))).await;

        let mut outcomes: Vec<Option<SessionOutcome>> = Vec::with_capacity(files.len());
        let mut sessions: Vec<(usize, FixSession)> = Vec::new();
        let mut first_index: HashMap<PathBuf, usize> = HashMap::new();
        let mut duplicates: Vec<(usize, usize)> = Vec::new();
        for (index, (file, session)) in files.iter().zip(opened).enumerate() {
            match session {
                Ok(session) => {
                    match first_index.get(session.file_path()) {
                        Some(&first) => {
                            debug!(file = %file.display(), "File already has a session");
                            duplicates.push((index, first));
                        }
                        None => {
                            first_index.insert(session.file_path().to_path_buf(), index);
                            sessions.push((index, session));
                        }
                    }
                    outcomes.push(None);
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Cannot start fix session");
                    outcomes.push(Some(SessionOutcome::aborted(file, e)));
                }
            }
        }

        let roots: BTreeSet<PathBuf> = sessions
            .iter()
            .map(|(_, s)| s.repo_root().to_path_buf())
            .collect();
        for root in &roots {
            let older_than = self.ctx.config.stale_worktree_age();
            if let Err(e) = self.ctx.workspaces.sweep_stale(root, older_than).await {
                warn!(repo = %root.display(), error = %e, "Stale workspace sweep failed");
            }
        }

        let max_rounds = self.ctx.config.max_fix_iterations;
        let mut rounds = 0;
        while rounds < max_rounds && sessions.iter().any(|(_, s)| !s.is_finished()) {
            rounds += 1;
            info!(round = rounds, max_rounds, "Fix round");
            let open = sessions.iter_mut().filter(|(_, s)| !s.is_finished());
            join_all(open.map(|(_, s)| s.step())).await;
        }

        for (index, session) in &mut sessions {
            outcomes[*index] = Some(session.stop().await);
        }
        for (index, first) in duplicates {
            outcomes[index] = outcomes[first].clone();
        }

        let swept = self.ctx.workspaces.sweep_all().await;
        if swept > 0 {
            warn!(swept, "Swept workspaces left after the run");
        }

        BatchReport {
            started_at,
            finished_at: Utc::now(),
            rounds,
            outcomes: outcomes
                .into_iter()
                .zip(files)
                .map(|(o, f)| o.unwrap_or_else(|| SessionOutcome::aborted(f, "no session ran")))
                .collect(),
        }
    }
}

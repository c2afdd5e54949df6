//! Merge engine.
//!
//! Reconciles the diffs of successful cluster attempts, all computed against
//! the same base content, into the real file. This is the only place the
//! real file is written after workers have run.

use crate::agent::{merge_prompt, run_agent_with_timeout, AgentRequest, FixingAgent};
use crate::error::{FixError, Result};
use crate::executor::{relative_path, FixAttemptResult};
use crate::issue::IssueCluster;
use crate::workspace::WorkspaceManager;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// How divergent cluster fixes are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// One consolidated agent request in the real tree.
    #[default]
    Agent,
    /// Three-way patch application in order, falling back to [`Agent`](Self::Agent).
    Sequential,
    /// Single `--no-ff` merge of per-cluster branches. No fallback.
    Octopus,
}

impl MergeStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Sequential => "sequential",
            Self::Octopus => "octopus",
        }
    }

    /// Whether attempts must be committed on branches.
    #[must_use]
    pub const fn needs_branches(&self) -> bool {
        matches!(self, Self::Octopus)
    }
}

/// Error for parsing [`MergeStrategy`] from a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown merge strategy: '{0}'. Valid options: claude, agent, sequential, octopus")]
pub struct ParseMergeStrategyError(String);

impl std::str::FromStr for MergeStrategy {
    type Err = ParseMergeStrategyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "agent" | "agent-merge" => Ok(Self::Agent),
            "sequential" | "sequential-patch" => Ok(Self::Sequential),
            "octopus" => Ok(Self::Octopus),
            _ => Err(ParseMergeStrategyError(s.to_string())),
        }
    }
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    /// Configured strategy.
    pub strategy: MergeStrategy,
    /// Sequential merge gave up and the agent merged instead.
    pub fell_back: bool,
    /// Cluster fixes that were offered to the merge.
    pub merged: usize,
    pub error: Option<String>,
}

impl MergeOutcome {
    fn ok(strategy: MergeStrategy, merged: usize) -> Self {
        Self {
            success: true,
            strategy,
            fell_back: false,
            merged,
            error: None,
        }
    }

    fn failed(strategy: MergeStrategy, merged: usize, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            strategy,
            fell_back: false,
            merged,
            error: Some(error.to_string()),
        }
    }
}

/// Combines cluster results into the real file.
#[derive(Clone)]
pub struct MergeEngine {
    agent: Arc<dyn FixingAgent>,
    workspaces: WorkspaceManager,
    permits: Arc<Semaphore>,
    strategy: MergeStrategy,
    agent_timeout: Duration,
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("strategy", &self.strategy)
            .field("agent_timeout", &self.agent_timeout)
            .finish()
    }
}

impl MergeEngine {
    pub fn new(
        agent: Arc<dyn FixingAgent>,
        workspaces: WorkspaceManager,
        permits: Arc<Semaphore>,
        strategy: MergeStrategy,
        agent_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            workspaces,
            permits,
            strategy,
            agent_timeout,
        }
    }

    #[must_use]
    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Merge every result with a diff into `file_path`.
    ///
    /// `base_content` is the content every diff was computed against and
    /// must be what `file_path` currently holds.
    pub async fn merge(
        &self,
        file_path: &Path,
        repo_root: &Path,
        base_content: &str,
        results: &[FixAttemptResult],
    ) -> MergeOutcome {
        let mut changed: Vec<&FixAttemptResult> =
            results.iter().filter(|r| r.has_changes()).collect();
        changed.sort_by_key(|r| r.cluster.start_line);
        let count = changed.len();

        let outcome = if changed.is_empty() {
            MergeOutcome::ok(self.strategy, 0)
        } else {
            info!(
                file = %file_path.display(),
                strategy = %self.strategy,
                fixes = count,
                "Merging cluster fixes"
            );
            match self.strategy {
                MergeStrategy::Agent => self.agent_outcome(file_path, repo_root, &changed).await,
                MergeStrategy::Sequential => {
                    match self
                        .sequential(file_path, repo_root, base_content, &changed)
                        .await
                    {
                        Ok(()) => MergeOutcome::ok(self.strategy, count),
                        Err(e) => {
                            warn!(error = %e, "Sequential merge failed; falling back to agent merge");
                            let mut outcome = self.agent_outcome(file_path, repo_root, &changed).await;
                            outcome.strategy = MergeStrategy::Sequential;
                            outcome.fell_back = true;
                            outcome
                        }
                    }
                }
                MergeStrategy::Octopus => match self.octopus(file_path, repo_root, &changed).await {
                    Ok(()) => MergeOutcome::ok(self.strategy, count),
                    Err(e) => {
                        warn!(error = %e, "Octopus merge failed");
                        MergeOutcome::failed(self.strategy, count, e)
                    }
                },
            }
        };

        if self.strategy.needs_branches() {
            self.delete_branches(repo_root, results).await;
        }
        outcome
    }

    async fn agent_outcome(
        &self,
        file_path: &Path,
        repo_root: &Path,
        changed: &[&FixAttemptResult],
    ) -> MergeOutcome {
        match self.agent_merge(file_path, repo_root, changed).await {
            Ok(()) => MergeOutcome::ok(MergeStrategy::Agent, changed.len()),
            Err(e) => {
                warn!(error = %e, "Agent merge failed");
                MergeOutcome::failed(MergeStrategy::Agent, changed.len(), e)
            }
        }
    }

    async fn agent_merge(
        &self,
        file_path: &Path,
        repo_root: &Path,
        changed: &[&FixAttemptResult],
    ) -> Result<()> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| FixError::Other(e.into()))?;

        let fixes: Vec<(&IssueCluster, &str)> = changed
            .iter()
            .filter_map(|r| r.diff.as_deref().map(|d| (&r.cluster, d)))
            .collect();
        let request = AgentRequest::merge(
            repo_root.to_path_buf(),
            merge_prompt(file_path, &fixes),
            self.agent_timeout,
        );
        run_agent_with_timeout(self.agent.as_ref(), &request).await?;
        debug!(file = %file_path.display(), "Agent merge finished");
        Ok(())
    }

    async fn sequential(
        &self,
        file_path: &Path,
        repo_root: &Path,
        base_content: &str,
        changed: &[&FixAttemptResult],
    ) -> Result<()> {
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| FixError::Other(e.into()))?;
        let rel = relative_path(file_path, repo_root)?;
        let lease = self
            .workspaces
            .lease_labeled(repo_root, "merge", file_path)
            .await?;

        let scratch = lease.workspace().root_path.clone();
        let result = async {
            let target = scratch.join(&rel);
            tokio::fs::write(&target, base_content).await?;
            let (root, path) = (scratch.clone(), rel.clone());
            self.workspaces
                .git("commit merge base", move |vcs| {
                    vcs.commit(&root, &path, "lintfix merge base")
                })
                .await?;

            for attempt in changed {
                let Some(diff) = attempt.diff.clone() else {
                    continue;
                };
                let root = scratch.clone();
                self.workspaces
                    .git("apply", move |vcs| vcs.apply(&root, &diff))
                    .await
                    .map_err(|e| FixError::PatchFailed {
                        fingerprint: attempt.cluster.fingerprint.clone(),
                        message: e.to_string(),
                    })?;
                debug!(cluster = %attempt.cluster.fingerprint, "Applied patch");
            }

            let merged = tokio::fs::read_to_string(&target).await?;
            tokio::fs::write(file_path, merged).await?;
            Ok::<(), FixError>(())
        }
        .await;

        lease.release().await;
        result
    }

    async fn octopus(
        &self,
        file_path: &Path,
        repo_root: &Path,
        changed: &[&FixAttemptResult],
    ) -> Result<()> {
        let branches: Vec<String> = changed
            .iter()
            .map(|r| {
                r.branch.clone().ok_or_else(|| FixError::PatchFailed {
                    fingerprint: r.cluster.fingerprint.clone(),
                    message: "attempt was not committed on a branch".to_string(),
                })
            })
            .collect::<Result<_>>()?;
        let base_revision = changed.iter().find_map(|r| r.base_revision.clone());

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| FixError::Other(e.into()))?;
        let rel = relative_path(file_path, repo_root)?;
        let lease = self
            .workspaces
            .lease_labeled(repo_root, "merge", file_path)
            .await?;

        let scratch = lease.workspace().root_path.clone();
        let result = async {
            let root = scratch.clone();
            self.workspaces
                .git("octopus merge", move |vcs| {
                    if let Some(revision) = &base_revision {
                        vcs.checkout(&root, revision)?;
                    }
                    vcs.merge_branches(&root, &branches, "Merge linter fixes")
                })
                .await?;
            let merged = tokio::fs::read_to_string(scratch.join(&rel)).await?;
            tokio::fs::write(file_path, merged).await?;
            Ok::<(), FixError>(())
        }
        .await;

        lease.release().await;
        result
    }

    async fn delete_branches(&self, repo_root: &Path, results: &[FixAttemptResult]) {
        for branch in results.iter().filter_map(|r| r.branch.clone()) {
            let repo = repo_root.to_path_buf();
            let name = branch.clone();
            if let Err(e) = self
                .workspaces
                .git("delete branch", move |vcs| vcs.delete_branch(&repo, &name))
                .await
            {
                warn!(branch = %branch, error = %e, "Failed to delete cluster branch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ParallelFixExecutor;
    use crate::issue::Issue;
    use crate::testing::{GitRepoFixture, MockAgent, APP_PY};
    use crate::vcs::{GitCli, VersionControl};

    /// Agent that tags every listed line with its rule, and writes
    /// `merged = True` when asked to merge.
    fn tagging_agent() -> MockAgent {
        MockAgent::new().with_handler(|request| {
            let path = request.working_dir.join("app.py");
            if request.allowed_tools.iter().any(|t| t == "Write") {
                std::fs::write(&path, "merged = True\n")?;
                return Ok(());
            }
            let re = regex::Regex::new(r"(?m)^Line (\d+): \[(\w+)\]").unwrap();
            let content = std::fs::read_to_string(&path)?;
            let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
            for caps in re.captures_iter(&request.instruction) {
                let n: usize = caps[1].parse().unwrap();
                lines[n - 1] = format!("{}  # {}", lines[n - 1], &caps[2]);
            }
            std::fs::write(&path, lines.join("\n") + "\n")?;
            Ok(())
        })
    }

    fn cluster(rule: &str, line: u32) -> IssueCluster {
        IssueCluster::from_issues(vec![Issue::new(rule, "problem", line)]).unwrap()
    }

    struct Harness {
        repo: GitRepoFixture,
        agent: MockAgent,
        workspaces: WorkspaceManager,
        permits: Arc<Semaphore>,
    }

    impl Harness {
        fn new() -> Option<Self> {
            Some(Self {
                repo: GitRepoFixture::new()?,
                agent: tagging_agent(),
                workspaces: WorkspaceManager::new(
                    Arc::new(GitCli::new()),
                    8,
                    Duration::from_secs(30),
                ),
                permits: Arc::new(Semaphore::new(4)),
            })
        }

        async fn attempts(&self, clusters: Vec<IssueCluster>, branches: bool) -> Vec<FixAttemptResult> {
            self.attempts_from(APP_PY, clusters, branches).await
        }

        async fn attempts_from(
            &self,
            base: &str,
            clusters: Vec<IssueCluster>,
            branches: bool,
        ) -> Vec<FixAttemptResult> {
            ParallelFixExecutor::new(
                Arc::new(self.agent.clone()),
                self.workspaces.clone(),
                Arc::clone(&self.permits),
                4,
                Duration::from_secs(30),
            )
            .with_branch_commits(branches)
            .fix_all(&self.repo.file("app.py"), clusters, self.repo.path(), base)
            .await
        }

        fn engine(&self, strategy: MergeStrategy) -> MergeEngine {
            MergeEngine::new(
                Arc::new(self.agent.clone()),
                self.workspaces.clone(),
                Arc::clone(&self.permits),
                strategy,
                Duration::from_secs(30),
            )
        }

        async fn merge(&self, strategy: MergeStrategy, results: &[FixAttemptResult]) -> MergeOutcome {
            self.merge_from(APP_PY, strategy, results).await
        }

        async fn merge_from(
            &self,
            base: &str,
            strategy: MergeStrategy,
            results: &[FixAttemptResult],
        ) -> MergeOutcome {
            self.engine(strategy)
                .merge(&self.repo.file("app.py"), self.repo.path(), base, results)
                .await
        }
    }

    #[test]
    fn test_strategy_aliases() {
        for name in ["claude", "agent", "Agent-Merge"] {
            assert_eq!(name.parse::<MergeStrategy>().unwrap(), MergeStrategy::Agent);
        }
        for name in ["sequential", "sequential-patch"] {
            assert_eq!(name.parse::<MergeStrategy>().unwrap(), MergeStrategy::Sequential);
        }
        assert_eq!("octopus".parse::<MergeStrategy>().unwrap(), MergeStrategy::Octopus);
        assert!("rebase".parse::<MergeStrategy>().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_merges_non_overlapping_fixes() {
        let Some(h) = Harness::new() else {
            return;
        };
        let results = h
            .attempts(vec![cluster("F841", 1), cluster("E501", 4), cluster("F821", 8)], false)
            .await;
        assert!(results.iter().all(FixAttemptResult::has_changes));
        let calls_before = h.agent.call_count();

        let outcome = h.merge(MergeStrategy::Sequential, &results).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert!(!outcome.fell_back);
        assert_eq!(outcome.merged, 3);
        assert_eq!(h.agent.call_count(), calls_before, "no agent call needed");

        let merged = h.repo.read("app.py");
        assert!(merged.contains("a = 1  # F841\n"));
        assert!(merged.contains("d = 4  # E501\n"));
        assert!(merged.contains("h = 8  # F821\n"));
        assert!(h.workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequential_conflict_falls_back_to_agent() {
        let Some(h) = Harness::new() else {
            return;
        };
        let results = h
            .attempts(
                vec![
                    IssueCluster::from_issues(vec![Issue::new("F841", "x", 2)]).unwrap(),
                    IssueCluster::from_issues(vec![
                        Issue::new("E501", "y", 2),
                        Issue::new("E501", "y", 3),
                    ])
                    .unwrap(),
                ],
                false,
            )
            .await;

        let outcome = h.merge(MergeStrategy::Sequential, &results).await;
        assert!(outcome.success);
        assert!(outcome.fell_back);
        assert_eq!(h.repo.read("app.py"), "merged = True\n");

        let merge_request = h.agent.requests().pop().unwrap();
        assert_eq!(merge_request.allowed_tools, vec!["Read", "Write"]);
        assert!(merge_request.instruction.contains("Version 2 fixed these issues"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_agent_strategy_runs_in_real_tree() {
        let Some(h) = Harness::new() else {
            return;
        };
        let results = h.attempts(vec![cluster("F841", 1)], false).await;
        let outcome = h.merge(MergeStrategy::Agent, &results).await;
        assert!(outcome.success);

        let request = h.agent.requests().pop().unwrap();
        assert_eq!(request.working_dir, h.repo.path());
        assert_eq!(h.repo.read("app.py"), "merged = True\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_octopus_merges_branches_and_deletes_them() {
        let Some(h) = Harness::new() else {
            return;
        };
        let results = h
            .attempts(vec![cluster("F841", 1), cluster("F821", 8)], true)
            .await;
        assert!(results.iter().all(|r| r.branch.is_some()));

        let outcome = h.merge(MergeStrategy::Octopus, &results).await;
        assert!(outcome.success, "{:?}", outcome.error);
        let merged = h.repo.read("app.py");
        assert!(merged.starts_with("a = 1  # F841\n"));
        assert!(merged.ends_with("h = 8  # F821\n"));

        let left = GitCli::new().list_branches(h.repo.path(), "linter-fix-").unwrap();
        assert!(left.is_empty());
        assert!(h.workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_octopus_merges_on_top_of_uncommitted_base() {
        let Some(h) = Harness::new() else {
            return;
        };
        let base = format!("import json\n{APP_PY}");
        h.repo.write("app.py", &base);

        let results = h
            .attempts_from(&base, vec![cluster("F841", 2), cluster("F821", 9)], true)
            .await;
        assert!(results.iter().all(FixAttemptResult::has_changes), "{results:?}");
        let forked_from = results[0].base_revision.clone().unwrap();
        assert!(results
            .iter()
            .all(|r| r.base_revision.as_deref() == Some(forked_from.as_str())));
        assert_ne!(forked_from, GitCli::new().head_revision(h.repo.path()).unwrap());

        let outcome = h.merge_from(&base, MergeStrategy::Octopus, &results).await;
        assert!(outcome.success, "{:?}", outcome.error);
        let merged = h.repo.read("app.py");
        assert!(merged.starts_with("import json\na = 1  # F841\n"), "{merged}");
        assert!(merged.ends_with("h = 8  # F821\n"), "{merged}");

        let left = GitCli::new().list_branches(h.repo.path(), "linter-fix-").unwrap();
        assert!(left.is_empty());
        assert!(h.workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_octopus_conflict_fails_without_fallback() {
        let Some(h) = Harness::new() else {
            return;
        };
        let results = h
            .attempts(
                vec![
                    IssueCluster::from_issues(vec![Issue::new("F841", "x", 2)]).unwrap(),
                    IssueCluster::from_issues(vec![
                        Issue::new("E501", "y", 2),
                        Issue::new("E501", "y", 3),
                    ])
                    .unwrap(),
                ],
                true,
            )
            .await;
        let calls_before = h.agent.call_count();

        let outcome = h.merge(MergeStrategy::Octopus, &results).await;
        assert!(!outcome.success);
        assert!(!outcome.fell_back);
        assert_eq!(h.agent.call_count(), calls_before);
        assert_eq!(h.repo.read("app.py"), APP_PY);
        assert!(GitCli::new()
            .list_branches(h.repo.path(), "linter-fix-")
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_merge() {
        let Some(h) = Harness::new() else {
            return;
        };
        let outcome = h.merge(MergeStrategy::Agent, &[]).await;
        assert!(outcome.success);
        assert_eq!(outcome.merged, 0);
        assert_eq!(h.agent.call_count(), 0);
    }
}

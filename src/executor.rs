//! Parallel fix executor.
//!
//! Dispatches each cluster to the fixing agent inside its own workspace and
//! collects one [`FixAttemptResult`] per cluster. Attempts never propagate
//! errors: every failure becomes `success = false` with a message, and the
//! workspace is released on every path.

use crate::agent::{fix_prompt, run_agent_with_timeout, AgentRequest, FixingAgent};
use crate::error::{FixError, Result};
use crate::issue::IssueCluster;
use crate::workspace::{Workspace, WorkspaceManager};
use futures::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Outcome of one cluster attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixAttemptResult {
    pub cluster: IssueCluster,
    pub success: bool,
    /// Unified diff against the pre-attempt content; `None` when nothing changed.
    pub diff: Option<String>,
    pub error: Option<String>,
    /// Branch holding the committed attempt (octopus merges only).
    pub branch: Option<String>,
    /// Commit the branch was forked from.
    pub base_revision: Option<String>,
}

impl FixAttemptResult {
    fn succeeded(cluster: IssueCluster, diff: Option<String>, branch: Option<(String, String)>) -> Self {
        let (branch, base_revision) = branch.unzip();
        Self {
            cluster,
            success: true,
            diff,
            error: None,
            branch,
            base_revision,
        }
    }

    fn failed(cluster: IssueCluster, error: impl std::fmt::Display) -> Self {
        Self {
            cluster,
            success: false,
            diff: None,
            error: Some(error.to_string()),
            branch: None,
            base_revision: None,
        }
    }

    /// Successful and produced a diff.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.success && self.diff.is_some()
    }
}

/// Runs cluster attempts concurrently.
#[derive(Clone)]
pub struct ParallelFixExecutor {
    agent: Arc<dyn FixingAgent>,
    workspaces: WorkspaceManager,
    permits: Arc<Semaphore>,
    max_workers: usize,
    timeout: Duration,
    commit_branches: bool,
}

impl std::fmt::Debug for ParallelFixExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelFixExecutor")
            .field("agent", &self.agent.name())
            .field("max_workers", &self.max_workers)
            .field("timeout", &self.timeout)
            .field("commit_branches", &self.commit_branches)
            .finish()
    }
}

impl ParallelFixExecutor {
    /// `permits` is shared by every executor in a run and bounds agent
    /// invocations globally.
    pub fn new(
        agent: Arc<dyn FixingAgent>,
        workspaces: WorkspaceManager,
        permits: Arc<Semaphore>,
        max_workers: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            agent,
            workspaces,
            permits,
            max_workers: max_workers.max(1),
            timeout,
            commit_branches: false,
        }
    }

    /// Commit each successful attempt on its own branch before release.
    #[must_use]
    pub fn with_branch_commits(mut self, enabled: bool) -> Self {
        self.commit_branches = enabled;
        self
    }

    /// Fix one cluster in an isolated workspace of `HEAD`.
    ///
    /// `file_path` must lie under `repo_root`; `base_content` is written to the
    /// workspace copy before the agent runs.
    pub async fn fix(
        &self,
        file_path: &Path,
        cluster: IssueCluster,
        repo_root: &Path,
        base_content: &str,
    ) -> FixAttemptResult {
        self.fix_from(file_path, cluster, repo_root, base_content, None)
            .await
    }

    /// Fix one cluster in a workspace detached at `base_revision`, or at
    /// `HEAD` when it is `None`.
    pub async fn fix_from(
        &self,
        file_path: &Path,
        cluster: IssueCluster,
        repo_root: &Path,
        base_content: &str,
        base_revision: Option<&str>,
    ) -> FixAttemptResult {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return FixAttemptResult::failed(cluster, e),
        };

        let lease = match self.workspaces.lease(repo_root, &cluster, file_path).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(cluster = %cluster.fingerprint, error = %e, "No workspace for cluster");
                return FixAttemptResult::failed(cluster, e);
            }
        };

        let outcome = self
            .attempt(
                lease.workspace(),
                file_path,
                &cluster,
                repo_root,
                base_content,
                base_revision,
            )
            .await;
        lease.release().await;

        match outcome {
            Ok((diff, branch)) => {
                debug!(
                    cluster = %cluster.fingerprint,
                    changed = diff.is_some(),
                    "Cluster attempt finished"
                );
                FixAttemptResult::succeeded(cluster, diff, branch)
            }
            Err(e) => {
                warn!(
                    cluster = %cluster.describe(),
                    category = %e.category(),
                    error = %e,
                    "Cluster attempt failed"
                );
                FixAttemptResult::failed(cluster, e)
            }
        }
    }

    async fn attempt(
        &self,
        workspace: &Workspace,
        file_path: &Path,
        cluster: &IssueCluster,
        repo_root: &Path,
        base_content: &str,
        base_revision: Option<&str>,
    ) -> Result<(Option<String>, Option<(String, String)>)> {
        let rel = relative_path(file_path, repo_root)?;

        if let Some(revision) = base_revision {
            let (root, revision) = (workspace.root_path.clone(), revision.to_string());
            self.workspaces
                .git("checkout base", move |vcs| vcs.checkout(&root, &revision))
                .await?;
        }

        let target = workspace.file_path(&rel);
        if !target.is_file() {
            return Err(FixError::TargetMissing { path: target });
        }

        // Stage the pre-attempt content so the diff covers only the agent's edits.
        tokio::fs::write(&target, base_content).await?;
        let (root, staged) = (workspace.root_path.clone(), rel.clone());
        self.workspaces
            .git("stage base content", move |vcs| vcs.stage(&root, &staged))
            .await?;

        let request = AgentRequest::fix(
            workspace.root_path.clone(),
            fix_prompt(&rel, cluster),
            self.timeout,
        );
        run_agent_with_timeout(self.agent.as_ref(), &request).await?;

        let (root, changed) = (workspace.root_path.clone(), rel.clone());
        let diff = self
            .workspaces
            .git("diff", move |vcs| vcs.diff(&root, &changed))
            .await?;
        if diff.trim().is_empty() {
            return Ok((None, None));
        }

        let branch = if self.commit_branches {
            let (root, rel, branch) = (
                workspace.root_path.clone(),
                rel.clone(),
                workspace.branch_name().to_string(),
            );
            let message = format!("Fix lint cluster {}", cluster.fingerprint);
            let name = branch.clone();
            let forked_from = self
                .workspaces
                .git("commit attempt", move |vcs| {
                    let parent = vcs.head_revision(&root)?;
                    vcs.commit_on_branch(&root, &name, &rel, &message)?;
                    Ok(parent)
                })
                .await?;
            Some((branch, forked_from))
        } else {
            None
        };

        Ok((Some(diff), branch))
    }

    /// Commit `base_content` in a scratch workspace and return the commit id.
    ///
    /// Cluster branches fork from this commit, so they differ from one another
    /// only by their own fixes even when the base is not what `HEAD` holds.
    pub async fn commit_base(
        &self,
        file_path: &Path,
        repo_root: &Path,
        base_content: &str,
    ) -> Result<String> {
        let rel = relative_path(file_path, repo_root)?;
        let lease = self
            .workspaces
            .lease_labeled(repo_root, "base", file_path)
            .await?;

        let root = lease.workspace().root_path.clone();
        let result = async {
            tokio::fs::write(root.join(&rel), base_content).await?;
            let (dir, path) = (root.clone(), rel.clone());
            self.workspaces
                .git("commit fix base", move |vcs| {
                    vcs.commit(&dir, &path, "lintfix fix base")?;
                    vcs.head_revision(&dir)
                })
                .await
        }
        .await;

        lease.release().await;
        result
    }

    /// Fix every cluster concurrently and wait for all of them.
    ///
    /// With branch commits on, the base content is committed first and every
    /// attempt forks from that commit. Results are ordered by cluster
    /// `start_line`.
    pub async fn fix_all(
        &self,
        file_path: &Path,
        clusters: Vec<IssueCluster>,
        repo_root: &Path,
        base_content: &str,
    ) -> Vec<FixAttemptResult> {
        if clusters.is_empty() {
            return Vec::new();
        }

        let concurrency = self
            .max_workers
            .min(clusters.len())
            .min(self.workspaces.max_worktrees());
        info!(
            file = %file_path.display(),
            clusters = clusters.len(),
            concurrency,
            "Dispatching clusters"
        );

        let base_revision = if self.commit_branches {
            match self.commit_base(file_path, repo_root, base_content).await {
                Ok(revision) => Some(revision),
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "Cannot commit fix base");
                    let reason = e.to_string();
                    let mut failed: Vec<FixAttemptResult> = clusters
                        .into_iter()
                        .map(|cluster| FixAttemptResult::failed(cluster, &reason))
                        .collect();
                    failed.sort_by_key(|r| r.cluster.start_line);
                    return failed;
                }
            }
        } else {
            None
        };

        let local = Arc::new(Semaphore::new(concurrency));
        let base: Arc<str> = Arc::from(base_content);

        let handles: Vec<_> = clusters
            .iter()
            .cloned()
            .map(|cluster| {
                let executor = self.clone();
                let local = Arc::clone(&local);
                let base = Arc::clone(&base);
                let file_path = file_path.to_path_buf();
                let repo_root = repo_root.to_path_buf();
                let revision = base_revision.clone();

                tokio::spawn(async move {
                    let _slot = match local.acquire_owned().await {
                        Ok(slot) => slot,
                        Err(e) => return FixAttemptResult::failed(cluster, e),
                    };
                    executor
                        .fix_from(&file_path, cluster, &repo_root, &base, revision.as_deref())
                        .await
                })
            })
            .collect();

        let mut results: Vec<FixAttemptResult> = join_all(handles)
            .await
            .into_iter()
            .zip(clusters)
            .map(|(joined, cluster)| {
                joined.unwrap_or_else(|e| {
                    FixAttemptResult::failed(cluster, format!("fix task panicked: {e}"))
                })
            })
            .collect();

        results.sort_by_key(|r| r.cluster.start_line);
        results
    }
}

/// `file_path` relative to `repo_root`.
pub(crate) fn relative_path(file_path: &Path, repo_root: &Path) -> Result<PathBuf> {
    file_path
        .strip_prefix(repo_root)
        .map(Path::to_path_buf)
        .map_err(|_| FixError::TargetMissing {
            path: file_path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::Issue;
    use crate::testing::{GitRepoFixture, MockAgent};
    use crate::vcs::{GitCli, VersionControl};

    fn cluster(rule: &str, line: u32) -> IssueCluster {
        IssueCluster::from_issues(vec![Issue::new(rule, "problem", line)]).unwrap()
    }

    fn executor(agent: MockAgent, timeout: Duration) -> (ParallelFixExecutor, WorkspaceManager) {
        let workspaces = WorkspaceManager::new(Arc::new(GitCli::new()), 4, Duration::from_secs(30));
        let executor = ParallelFixExecutor::new(
            Arc::new(agent),
            workspaces.clone(),
            Arc::new(Semaphore::new(4)),
            4,
            timeout,
        );
        (executor, workspaces)
    }

    #[tokio::test]
    async fn test_successful_attempt_yields_diff_and_releases() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().replacing("app.py", "b = 2", "b = 20");
        let (executor, workspaces) = executor(agent.clone(), Duration::from_secs(30));
        let file = repo.file("app.py");
        let base = repo.read("app.py");

        let result = executor.fix(&file, cluster("F841", 2), repo.path(), &base).await;
        assert!(result.success, "{:?}", result.error);
        let diff = result.diff.unwrap();
        assert!(diff.contains("-b = 2"));
        assert!(diff.contains("+b = 20"));
        assert!(result.branch.is_none());
        assert!(workspaces.registry().is_empty());
        assert_eq!(agent.call_count(), 1);
        // the real file is untouched
        assert_eq!(repo.read("app.py"), base);
    }

    #[tokio::test]
    async fn test_diff_excludes_base_content_changes() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().replacing("app.py", "b = 2", "b = 20");
        let (executor, _) = executor(agent, Duration::from_secs(30));
        let base = format!("import json\n{}", repo.read("app.py"));

        let result = executor
            .fix(&repo.file("app.py"), cluster("F841", 3), repo.path(), &base)
            .await;
        let diff = result.diff.unwrap();
        assert!(!diff.contains("+import json"));
        assert!(diff.contains("+b = 20"));
    }

    #[tokio::test]
    async fn test_unchanged_file_has_no_diff() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let (executor, _) = executor(MockAgent::new(), Duration::from_secs(30));
        let result = executor
            .fix(&repo.file("app.py"), cluster("F841", 2), repo.path(), &repo.read("app.py"))
            .await;
        assert!(result.success);
        assert!(result.diff.is_none());
        assert!(!result.has_changes());
    }

    #[tokio::test]
    async fn test_agent_timeout_fails_and_removes_workspace() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().with_delay(Duration::from_secs(5));
        let (executor, workspaces) = executor(agent, Duration::from_millis(100));

        let result = executor
            .fix(&repo.file("app.py"), cluster("F821", 1), repo.path(), &repo.read("app.py"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(workspaces.registry().is_empty());
        let leftovers = std::fs::read_dir(repo.path().join(".claude/worktrees"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_agent_failure_is_a_failed_result() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let (executor, workspaces) = executor(MockAgent::new().failing(2), Duration::from_secs(30));
        let result = executor
            .fix(&repo.file("app.py"), cluster("F821", 1), repo.path(), &repo.read("app.py"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exit code 2"));
        assert!(workspaces.registry().is_empty());
    }

    #[tokio::test]
    async fn test_untracked_target_is_missing() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        repo.write("new.py", "x = 1\n");
        let (executor, workspaces) = executor(MockAgent::new(), Duration::from_secs(30));
        let result = executor
            .fix(&repo.file("new.py"), cluster("F841", 1), repo.path(), "x = 1\n")
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not found"));
        assert!(workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fix_all_orders_results_and_cleans_up() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new()
            .replacing("app.py", "a = 1", "a = 10")
            .with_delay(Duration::from_millis(50));
        let (executor, workspaces) = executor(agent.clone(), Duration::from_secs(30));

        let clusters = vec![cluster("E501", 7), cluster("F841", 1), cluster("F821", 4)];
        let results = executor
            .fix_all(&repo.file("app.py"), clusters, repo.path(), &repo.read("app.py"))
            .await;

        let lines: Vec<u32> = results.iter().map(|r| r.cluster.start_line).collect();
        assert_eq!(lines, vec![1, 4, 7]);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(agent.call_count(), 3);
        assert!(workspaces.registry().is_empty());
    }

    #[tokio::test]
    async fn test_branch_commit_when_enabled() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().replacing("app.py", "c = 3", "c = 30");
        let (executor, _) = executor(agent, Duration::from_secs(30));
        let executor = executor.with_branch_commits(true);

        let result = executor
            .fix(&repo.file("app.py"), cluster("F841", 3), repo.path(), &repo.read("app.py"))
            .await;
        let branch = result.branch.unwrap();
        assert!(branch.starts_with("linter-fix-"));
        let branches = GitCli::new().list_branches(repo.path(), "linter-fix-").unwrap();
        assert_eq!(branches, vec![branch]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_branches_fork_from_committed_base() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new()
            .replacing("app.py", "b = 2", "b = 20")
            .replacing("app.py", "g = 7", "g = 70");
        let (executor, workspaces) = executor(agent, Duration::from_secs(30));
        let executor = executor.with_branch_commits(true);
        let base = format!("import json\n{}", repo.read("app.py"));
        let head = GitCli::new().head_revision(repo.path()).unwrap();

        let results = executor
            .fix_all(
                &repo.file("app.py"),
                vec![cluster("F841", 3), cluster("E501", 8)],
                repo.path(),
                &base,
            )
            .await;
        assert!(results.iter().all(|r| r.success), "{results:?}");
        let forked_from = results[0].base_revision.clone().unwrap();
        assert_ne!(forked_from, head);
        assert_eq!(results[1].base_revision.as_deref(), Some(forked_from.as_str()));
        for result in &results {
            let diff = result.diff.as_deref().unwrap();
            assert!(!diff.contains("+import json"));
        }
        assert!(workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_fix_all_runs_up_to_max_workers_at_once() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().with_delay(Duration::from_secs(1));
        let workspaces = WorkspaceManager::new(Arc::new(GitCli::new()), 8, Duration::from_secs(30));
        let executor = ParallelFixExecutor::new(
            Arc::new(agent.clone()),
            workspaces.clone(),
            Arc::new(Semaphore::new(8)),
            3,
            Duration::from_secs(30),
        );

        let clusters = (1..=6).map(|line| cluster("E501", line)).collect();
        let results = executor
            .fix_all(&repo.file("app.py"), clusters, repo.path(), &repo.read("app.py"))
            .await;
        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.success), "{results:?}");
        assert_eq!(agent.call_count(), 6);
        assert_eq!(agent.peak_concurrency(), 3);
        assert!(workspaces.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_fix_all_concurrency_bounded_by_worktree_quota() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let agent = MockAgent::new().with_delay(Duration::from_secs(1));
        let workspaces = WorkspaceManager::new(Arc::new(GitCli::new()), 2, Duration::from_secs(30));
        let executor = ParallelFixExecutor::new(
            Arc::new(agent.clone()),
            workspaces.clone(),
            Arc::new(Semaphore::new(8)),
            8,
            Duration::from_secs(30),
        );

        let clusters = (1..=4).map(|line| cluster("E501", line)).collect();
        let results = executor
            .fix_all(&repo.file("app.py"), clusters, repo.path(), &repo.read("app.py"))
            .await;
        assert!(results.iter().all(|r| r.success), "{results:?}");
        assert_eq!(agent.call_count(), 4);
        assert_eq!(agent.peak_concurrency(), 2);
    }
}

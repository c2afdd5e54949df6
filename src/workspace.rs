//! Isolated workspaces for concurrent fix attempts.
//!
//! Each cluster attempt gets its own detached git worktree under
//! `<repo>/.claude/worktrees/linter-fix-<fingerprint>-<uuid8>`. The manager
//! keeps a process-scoped registry of active workspaces, enforces the
//! `max_worktrees` quota, and guarantees removal through [`WorkspaceLease`]
//! and the sweep functions.

use crate::blocking::run_blocking;
use crate::error::{FixError, Result};
use crate::issue::IssueCluster;
use crate::vcs::VersionControl;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Directory under the repository root holding workspaces.
pub const WORKTREE_DIR: &str = ".claude/worktrees";

/// Prefix shared by workspace directories and cluster branches.
pub const WORKSPACE_PREFIX: &str = "linter-fix-";

/// An isolated copy of the repository at `HEAD`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    /// `linter-fix-<label>-<uuid8>`; also used as the branch name.
    pub id: String,
    pub root_path: PathBuf,
    /// `HEAD` commit the worktree was created from (empty until created).
    pub base_revision: String,
    pub repo_root: PathBuf,
    /// File whose session owns this workspace.
    pub owner: PathBuf,
}

impl Workspace {
    /// Path of a repository-relative file inside this workspace.
    #[must_use]
    pub fn file_path(&self, rel: &Path) -> PathBuf {
        self.root_path.join(rel)
    }

    /// Branch name used when the attempt is committed.
    #[must_use]
    pub fn branch_name(&self) -> &str {
        &self.id
    }
}

/// Registry of active workspaces keyed by id.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceRegistry {
    inner: Arc<Mutex<HashMap<String, Workspace>>>,
}

impl WorkspaceRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Workspace>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `workspace` unless `max` are already active.
    fn reserve(&self, workspace: &Workspace, max: usize) -> Result<()> {
        let mut active = self.lock();
        if active.len() >= max {
            return Err(FixError::WorkspaceQuota {
                active: active.len(),
                max,
            });
        }
        active.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    fn update(&self, workspace: &Workspace) {
        if let Some(entry) = self.lock().get_mut(&workspace.id) {
            *entry = workspace.clone();
        }
    }

    fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Active workspaces owned by `owner`, sorted by id.
    #[must_use]
    pub fn owned_by(&self, owner: &Path) -> Vec<Workspace> {
        let mut owned: Vec<Workspace> = self
            .lock()
            .values()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.id.cmp(&b.id));
        owned
    }

    #[must_use]
    pub fn all(&self) -> Vec<Workspace> {
        let mut all: Vec<Workspace> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

/// Creates, tracks and discards workspaces.
#[derive(Clone)]
pub struct WorkspaceManager {
    vcs: Arc<dyn VersionControl>,
    registry: WorkspaceRegistry,
    max_worktrees: usize,
    op_timeout: Duration,
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("active", &self.registry.len())
            .field("max_worktrees", &self.max_worktrees)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VersionControl>, max_worktrees: usize, op_timeout: Duration) -> Self {
        Self {
            vcs,
            registry: WorkspaceRegistry::default(),
            max_worktrees: max_worktrees.max(1),
            op_timeout,
        }
    }

    #[must_use]
    pub fn vcs(&self) -> &Arc<dyn VersionControl> {
        &self.vcs
    }

    #[must_use]
    pub fn registry(&self) -> &WorkspaceRegistry {
        &self.registry
    }

    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    #[must_use]
    pub fn max_worktrees(&self) -> usize {
        self.max_worktrees
    }

    /// Workspaces currently held for `owner`.
    #[must_use]
    pub fn active_for(&self, owner: &Path) -> Vec<Workspace> {
        self.registry.owned_by(owner)
    }

    /// Run a git operation on the blocking pool, bounded by the op timeout.
    pub async fn git<T, F>(&self, operation: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VersionControl) -> Result<T> + Send + 'static,
    {
        let vcs = Arc::clone(&self.vcs);
        run_blocking(operation, self.op_timeout, move || f(vcs.as_ref())).await
    }

    /// Create a workspace for one cluster attempt.
    ///
    /// # Errors
    ///
    /// [`FixError::WorkspaceQuota`] when `max_worktrees` are active, otherwise
    /// the git or timeout failure. Partial state is discarded first.
    pub async fn create(
        &self,
        repo_root: &Path,
        cluster: &IssueCluster,
        owner: &Path,
    ) -> Result<Workspace> {
        self.create_labeled(repo_root, &cluster.fingerprint, owner).await
    }

    /// Create a workspace whose id carries `label` instead of a fingerprint.
    pub async fn create_labeled(
        &self,
        repo_root: &Path,
        label: &str,
        owner: &Path,
    ) -> Result<Workspace> {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{WORKSPACE_PREFIX}{label}-{}", &uuid[..8]);
        let mut workspace = Workspace {
            root_path: repo_root.join(WORKTREE_DIR).join(&id),
            id,
            base_revision: String::new(),
            repo_root: repo_root.to_path_buf(),
            owner: owner.to_path_buf(),
        };

        self.registry.reserve(&workspace, self.max_worktrees)?;

        let vcs = Arc::clone(&self.vcs);
        let repo = workspace.repo_root.clone();
        let dest = workspace.root_path.clone();
        let mut handle = tokio::task::spawn_blocking(move || -> Result<String> {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            vcs.create_isolated_copy(&repo, &dest)?;
            vcs.head_revision(&dest)
        });

        let failure = match tokio::time::timeout(self.op_timeout, &mut handle).await {
            Ok(Ok(Ok(revision))) => {
                workspace.base_revision = revision;
                self.registry.update(&workspace);
                debug!(id = %workspace.id, owner = %owner.display(), "Workspace ready");
                return Ok(workspace);
            }
            Ok(Ok(Err(e))) => FixError::workspace_create(&workspace.id, e.to_string()),
            Ok(Err(e)) => FixError::workspace_create(&workspace.id, format!("task panicked: {e}")),
            Err(_elapsed) => {
                // The worktree may still appear once git returns.
                let manager = self.clone();
                let pending = workspace.clone();
                tokio::spawn(async move {
                    let _ = handle.await;
                    manager.discard(&pending).await;
                });
                return Err(FixError::timeout("worktree add", self.op_timeout));
            }
        };

        warn!(id = %workspace.id, error = %failure, "Workspace creation failed");
        self.discard(&workspace).await;
        Err(failure)
    }

    /// Create a workspace wrapped in a lease that discards it on release or drop.
    pub async fn lease(
        &self,
        repo_root: &Path,
        cluster: &IssueCluster,
        owner: &Path,
    ) -> Result<WorkspaceLease> {
        let workspace = self.create(repo_root, cluster, owner).await?;
        Ok(WorkspaceLease::new(workspace, self.clone()))
    }

    /// Lease a scratch workspace for merging.
    pub async fn lease_labeled(
        &self,
        repo_root: &Path,
        label: &str,
        owner: &Path,
    ) -> Result<WorkspaceLease> {
        let workspace = self.create_labeled(repo_root, label, owner).await?;
        Ok(WorkspaceLease::new(workspace, self.clone()))
    }

    /// Remove a workspace. Idempotent and never fails; problems are logged.
    pub async fn discard(&self, workspace: &Workspace) {
        let manager = self.clone();
        let target = workspace.clone();
        let result = tokio::time::timeout(
            self.op_timeout,
            tokio::task::spawn_blocking(move || manager.discard_blocking(&target)),
        )
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(id = %workspace.id, "Workspace discard panicked: {e}");
                self.registry.remove(&workspace.id);
            }
            Err(_) => {
                warn!(id = %workspace.id, "Workspace discard timed out; left for the next sweep");
                self.registry.remove(&workspace.id);
            }
        }
    }

    /// Blocking form of [`discard`](Self::discard), used from `Drop`.
    pub fn discard_blocking(&self, workspace: &Workspace) {
        if let Err(e) = self
            .vcs
            .remove_isolated_copy(&workspace.repo_root, &workspace.root_path)
        {
            debug!(id = %workspace.id, "worktree remove: {e}");
        }
        if workspace.root_path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&workspace.root_path) {
                warn!(id = %workspace.id, "Failed to remove workspace directory: {e}");
            }
        }
        if let Err(e) = self.vcs.prune(&workspace.repo_root) {
            debug!("worktree prune: {e}");
        }
        if self.registry.remove(&workspace.id) {
            debug!(id = %workspace.id, "Workspace discarded");
        }
    }

    /// Discard every workspace held for `owner`.
    pub async fn sweep_owner(&self, owner: &Path) -> usize {
        let owned = self.registry.owned_by(owner);
        for workspace in &owned {
            self.discard(workspace).await;
        }
        if !owned.is_empty() {
            warn!(owner = %owner.display(), count = owned.len(), "Swept leftover workspaces");
        }
        owned.len()
    }

    /// Discard every registered workspace.
    pub async fn sweep_all(&self) -> usize {
        let all = self.registry.all();
        for workspace in &all {
            self.discard(workspace).await;
        }
        all.len()
    }

    /// Remove `linter-fix-*` directories and branches left by an earlier run.
    ///
    /// Workspaces registered in this process are left alone, and so is
    /// anything younger than `older_than`, which another running process may
    /// still be using. `Duration::ZERO` removes every unregistered workspace.
    pub async fn sweep_stale(&self, repo_root: &Path, older_than: Duration) -> Result<usize> {
        let repo = repo_root.to_path_buf();
        let live: Vec<String> = self.registry.all().into_iter().map(|w| w.id).collect();
        let now = SystemTime::now();
        let young = move |time: SystemTime| now.duration_since(time).unwrap_or_default() < older_than;

        let removed = self
            .git("sweep stale workspaces", move |vcs| {
                let mut removed = 0;
                let dir = repo.join(WORKTREE_DIR);
                if let Ok(entries) = std::fs::read_dir(&dir) {
                    for entry in entries.flatten() {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if !name.starts_with(WORKSPACE_PREFIX) || live.contains(&name) {
                            continue;
                        }
                        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                            if young(modified) {
                                debug!("Keeping recent workspace {name}");
                                continue;
                            }
                        }
                        let path = entry.path();
                        if let Err(e) = vcs.remove_isolated_copy(&repo, &path) {
                            debug!("worktree remove {name}: {e}");
                        }
                        if path.exists() {
                            std::fs::remove_dir_all(&path)?;
                        }
                        removed += 1;
                    }
                }
                vcs.prune(&repo)?;

                for branch in vcs.list_branches(&repo, WORKSPACE_PREFIX)? {
                    if live.contains(&branch) {
                        continue;
                    }
                    if !older_than.is_zero() {
                        match vcs.commit_time(&repo, &branch) {
                            Ok(time) if young(time) => {
                                debug!("Keeping recent branch {branch}");
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => debug!("commit time of {branch}: {e}"),
                        }
                    }
                    if let Err(e) = vcs.delete_branch(&repo, &branch) {
                        warn!(branch = %branch, "Failed to delete stale branch: {e}");
                    } else {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await?;

        if removed > 0 {
            info!(repo = %repo_root.display(), removed, "Reclaimed stale workspaces");
        }
        Ok(removed)
    }
}

/// Scoped ownership of a workspace.
///
/// Call [`release`](Self::release) on the normal path. If the lease is
/// dropped without release (panic, cancellation) the workspace is discarded
/// synchronously in `Drop`.
#[derive(Debug)]
pub struct WorkspaceLease {
    workspace: Workspace,
    manager: WorkspaceManager,
    released: bool,
}

impl WorkspaceLease {
    fn new(workspace: Workspace, manager: WorkspaceManager) -> Self {
        Self {
            workspace,
            manager,
            released: false,
        }
    }

    #[must_use]
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub async fn release(mut self) {
        self.released = true;
        self.manager.discard(&self.workspace).await;
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(id = %self.workspace.id, "Workspace lease dropped without release");
            self.manager.discard_blocking(&self.workspace);
        }
    }
}

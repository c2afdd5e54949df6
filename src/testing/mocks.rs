//! Mock implementations of the engine's external seams.
//!
//! These mocks provide controllable test doubles for the agent, the linter
//! and version control, enabling deterministic tests of the fix pipeline.

use crate::agent::{AgentRequest, AgentResponse, FixingAgent};
use crate::error::{FixError, Result};
use crate::issue::Issue;
use crate::linter::Linter;
use crate::vcs::VersionControl;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

type AgentHandler = Arc<dyn Fn(&AgentRequest) -> Result<()> + Send + Sync>;

/// Mock fixing agent.
///
/// Edits are applied to files under the request's working directory, so the
/// same mock works for isolated cluster attempts and for merges in the real
/// tree. Clones share call counters.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgent::new()
///     .replacing("app.py", "x = 1", "_x = 1")
///     .with_delay(Duration::from_millis(10));
///
/// // ... run the executor ...
/// assert_eq!(agent.call_count(), 1);
/// ```
#[derive(Clone)]
pub struct MockAgent {
    edits: Vec<(PathBuf, String, String)>,
    handler: Option<AgentHandler>,
    delay: Option<Duration>,
    exit_code: i32,
    available: bool,
    calls: Arc<AtomicU32>,
    in_flight: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<AgentRequest>>>,
}

impl std::fmt::Debug for MockAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockAgent")
            .field("edits", &self.edits)
            .field("delay", &self.delay)
            .field("exit_code", &self.exit_code)
            .field("calls", &self.call_count())
            .finish()
    }
}

impl Default for MockAgent {
    fn default() -> Self {
        Self {
            edits: Vec::new(),
            handler: None,
            delay: None,
            exit_code: 0,
            available: true,
            calls: Arc::new(AtomicU32::new(0)),
            in_flight: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl MockAgent {
    /// Create a mock that succeeds without touching anything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the first occurrence of `from` with `to` in `file` (relative to
    /// the working directory) on every call.
    #[must_use]
    pub fn replacing(mut self, file: impl Into<PathBuf>, from: &str, to: &str) -> Self {
        self.edits.push((file.into(), from.to_string(), to.to_string()));
        self
    }

    /// Run custom logic on every call, after the configured edits.
    #[must_use]
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AgentRequest) -> Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sleep before doing anything.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Exit with `code` without editing.
    #[must_use]
    pub fn failing(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Number of invocations so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most invocations that were running at the same time.
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl FixingAgent for MockAgent {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        // Decrements even when the caller's timeout drops this future.
        let _running = InFlight(Arc::clone(&self.in_flight));
        self.respond(request).await
    }
}

struct InFlight(Arc<AtomicU32>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockAgent {
    async fn respond(&self, request: &AgentRequest) -> Result<AgentResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.exit_code != 0 {
            return Err(FixError::AgentFailed {
                exit_code: self.exit_code,
                message: "mock agent failure".to_string(),
            });
        }

        for (file, from, to) in &self.edits {
            let path = request.working_dir.join(file);
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            if content.contains(from.as_str()) {
                tokio::fs::write(&path, content.replacen(from.as_str(), to, 1)).await?;
            }
        }
        if let Some(handler) = &self.handler {
            handler(request)?;
        }

        Ok(AgentResponse {
            output: String::new(),
            duration: self.delay.unwrap_or_default(),
        })
    }
}

type IssueFn = Arc<dyn Fn(&str) -> Vec<Issue> + Send + Sync>;
type FixFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Mock linter whose issues are computed from the file's current content.
///
/// # Example
///
/// ```rust,ignore
/// let linter = MockLinter::new(|content| {
///     if content.contains("import json") { vec![] }
///     else { vec![Issue::new("F821", "Undefined name `json`", 3)] }
/// });
/// ```
#[derive(Clone)]
pub struct MockLinter {
    issues: IssueFn,
    fixer: Option<FixFn>,
    fail_fix: bool,
    fail_check: bool,
    checks: Arc<AtomicU32>,
    fixes: Arc<AtomicU32>,
}

impl std::fmt::Debug for MockLinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLinter")
            .field("supports_fix", &self.fixer.is_some())
            .field("checks", &self.check_count())
            .finish()
    }
}

impl MockLinter {
    pub fn new<F>(issues: F) -> Self
    where
        F: Fn(&str) -> Vec<Issue> + Send + Sync + 'static,
    {
        Self {
            issues: Arc::new(issues),
            fixer: None,
            fail_fix: false,
            fail_check: false,
            checks: Arc::new(AtomicU32::new(0)),
            fixes: Arc::new(AtomicU32::new(0)),
        }
    }

    /// A linter that always reports the same issues.
    #[must_use]
    pub fn constant(issues: Vec<Issue>) -> Self {
        Self::new(move |_| issues.clone())
    }

    /// A linter that never reports anything.
    #[must_use]
    pub fn clean() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Enable auto-fix with a content transformation.
    #[must_use]
    pub fn with_fixer<F>(mut self, fixer: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.fixer = Some(Arc::new(fixer));
        self
    }

    /// Auto-fix corrupts the file and then errors.
    #[must_use]
    pub fn with_failing_fix(mut self) -> Self {
        self.fail_fix = true;
        self
    }

    /// `check` fails.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail_check = true;
        self
    }

    pub fn check_count(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn fix_count(&self) -> u32 {
        self.fixes.load(Ordering::SeqCst)
    }
}

impl Linter for MockLinter {
    fn name(&self) -> &str {
        "mock"
    }

    fn check(&self, path: &Path) -> Result<Vec<Issue>> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.fail_check {
            return Err(FixError::linter("mock", "check failed"));
        }
        let content = std::fs::read_to_string(path)?;
        let mut issues = (self.issues)(&content);
        issues.sort_by(Issue::cmp_position);
        Ok(issues)
    }

    fn supports_fix(&self) -> bool {
        self.fixer.is_some() || self.fail_fix
    }

    fn fix(&self, path: &Path) -> Result<bool> {
        self.fixes.fetch_add(1, Ordering::SeqCst);
        let before = std::fs::read_to_string(path)?;
        if self.fail_fix {
            std::fs::write(path, "<<corrupted>>")?;
            return Err(FixError::linter("mock", "fix crashed"));
        }
        let Some(fixer) = &self.fixer else {
            return Ok(false);
        };
        let after = fixer(&before);
        if after == before {
            return Ok(false);
        }
        std::fs::write(path, after)?;
        Ok(true)
    }
}

/// Version control double that only creates and removes directories.
///
/// Counts calls so tests can check that every create has a matching remove.
#[derive(Debug, Default)]
pub struct MockVcs {
    fail_create: bool,
    created: AtomicU32,
    removed: AtomicU32,
}

impl MockVcs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `create_isolated_copy` makes the directory and then fails.
    #[must_use]
    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> u32 {
        self.removed.load(Ordering::SeqCst)
    }
}

impl VersionControl for MockVcs {
    fn repo_root(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.parent().unwrap_or(path).to_path_buf())
    }

    fn head_revision(&self, _repo: &Path) -> Result<String> {
        Ok("mock-head".to_string())
    }

    fn create_isolated_copy(&self, _repo: &Path, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        if self.fail_create {
            return Err(FixError::git("worktree add", "mock failure"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove_isolated_copy(&self, _repo: &Path, dest: &Path) -> Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        Ok(())
    }

    fn checkout(&self, _dir: &Path, _revision: &str) -> Result<()> {
        Ok(())
    }

    fn stage(&self, _dir: &Path, _rel: &Path) -> Result<()> {
        Ok(())
    }

    fn diff(&self, _dir: &Path, _rel: &Path) -> Result<String> {
        Ok(String::new())
    }

    fn apply(&self, _dir: &Path, _patch: &str) -> Result<()> {
        Ok(())
    }

    fn commit(&self, _dir: &Path, _rel: &Path, _message: &str) -> Result<()> {
        Ok(())
    }

    fn commit_on_branch(&self, _dir: &Path, _branch: &str, _rel: &Path, _message: &str) -> Result<()> {
        Ok(())
    }

    fn merge_branches(&self, _dir: &Path, _branches: &[String], _message: &str) -> Result<()> {
        Ok(())
    }

    fn delete_branch(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn list_branches(&self, _repo: &Path, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn commit_time(&self, _repo: &Path, _revision: &str) -> Result<SystemTime> {
        Ok(SystemTime::UNIX_EPOCH)
    }

    fn prune(&self, _repo: &Path) -> Result<()> {
        Ok(())
    }
}

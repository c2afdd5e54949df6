//! Per-file convergence loop.
//!
//! A [`FixSession`] drives one file through
//! `LINT → AUTOFIX → PREDICT → CLUSTER → EXECUTE → MERGE → RELINT` until the
//! file is clean, stops improving, or runs out of attempts. Every exit path
//! sweeps the workspaces the session owns.

use crate::blocking::run_blocking;
use crate::engine::FixContext;
use crate::error::{FixError, Result};
use crate::executor::FixAttemptResult;
use crate::issue::Issue;
use crate::merge::MergeOutcome;
use crate::predict::{Predictor, UNDEFINED_NAME};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SessionStatus {
    /// No issues remain.
    Success,
    /// An iteration applied nothing and the issue count did not drop.
    NoProgress,
    /// The attempt budget ran out with issues left.
    Exhausted,
    /// An I/O, git or linter failure stopped the session.
    Aborted(String),
}

impl SessionStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoProgress => "no-progress",
            Self::Exhausted => "exhausted",
            Self::Aborted(_) => "aborted",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, Serialize)]
pub struct IterationReport {
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub issues_before: usize,
    pub issues_after: usize,
    pub auto_fixed: bool,
    pub predicted: usize,
    pub clusters: usize,
    pub successful_clusters: usize,
    pub merge: Option<MergeOutcome>,
    /// Some fix was applied to the file.
    pub applied: bool,
}

impl IterationReport {
    fn new(iteration: u32, issues_before: usize) -> Self {
        Self {
            iteration,
            started_at: Utc::now(),
            finished_at: None,
            issues_before,
            issues_after: issues_before,
            auto_fixed: false,
            predicted: 0,
            clusters: 0,
            successful_clusters: 0,
            merge: None,
            applied: false,
        }
    }
}

/// Final state of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub file: PathBuf,
    pub status: SessionStatus,
    /// Issues still present when the session ended.
    pub residual: Vec<Issue>,
    pub attempts: u32,
    pub reports: Vec<IterationReport>,
}

impl SessionOutcome {
    /// Outcome for a file whose session could not start.
    pub fn aborted(file: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self {
            file: file.into(),
            status: SessionStatus::Aborted(reason.to_string()),
            residual: Vec::new(),
            attempts: 0,
            reports: Vec::new(),
        }
    }
}

/// Output of the prediction phase.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StagedFixes {
    /// Content with every prediction applied.
    pub content: String,
    /// Issues left for the agent, with lines adjusted for inserted imports.
    pub remaining: Vec<Issue>,
    /// Resolved issues and the content after each fix.
    pub predicted: Vec<(Issue, String)>,
}

/// Apply predictions in issue order against progressively updated content.
///
/// An undefined name whose import was already inserted for an earlier issue
/// counts as predicted.
#[must_use]
pub fn stage_predictions(predictor: &Predictor, content: &str, issues: Vec<Issue>) -> StagedFixes {
    let mut staged = StagedFixes {
        content: content.to_string(),
        ..StagedFixes::default()
    };
    if !predictor.is_enabled() {
        staged.remaining = issues;
        return staged;
    }

    let mut pending = issues;
    pending.sort_by(Issue::cmp_position);
    let mut inserted: HashSet<String> = HashSet::new();
    let mut index = 0;

    while index < pending.len() {
        let issue = pending[index].clone();
        index += 1;

        if let Some(prediction) = predictor.predict(&issue, &staged.content) {
            if let Some(line) = prediction.inserted_line {
                if let Some(statement) = predictor.import_for(&issue) {
                    inserted.insert(statement.to_string());
                }
                shift_from(&mut pending[index..], line);
                shift_from(&mut staged.remaining, line);
            }
            staged.content = prediction.content;
            staged.predicted.push((issue, staged.content.clone()));
            continue;
        }

        let covered = issue.rule == UNDEFINED_NAME
            && predictor
                .import_for(&issue)
                .is_some_and(|statement| inserted.contains(statement));
        if covered {
            debug!(line = issue.line, "Undefined name covered by an earlier import");
            staged.predicted.push((issue, staged.content.clone()));
        } else {
            staged.remaining.push(issue);
        }
    }
    staged
}

/// Convergence loop for one file.
pub struct FixSession {
    ctx: FixContext,
    file_path: PathBuf,
    repo_root: PathBuf,
    attempt_count: u32,
    max_attempts: u32,
    predicted_fixes: Vec<(Issue, String)>,
    current: Option<Vec<Issue>>,
    reports: Vec<IterationReport>,
    outcome: Option<SessionOutcome>,
}

impl std::fmt::Debug for FixSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixSession")
            .field("file_path", &self.file_path)
            .field("attempt_count", &self.attempt_count)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl FixSession {
    /// Resolve `file` and the repository containing it.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist or is not inside a git repository.
    pub async fn open(ctx: FixContext, file: &Path) -> Result<Self> {
        let file_path = tokio::fs::canonicalize(file).await?;
        let dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| file_path.clone());
        let repo_root = ctx
            .workspaces
            .git("rev-parse", move |vcs| vcs.repo_root(&dir))
            .await?;
        let repo_root = tokio::fs::canonicalize(&repo_root).await.unwrap_or(repo_root);

        Ok(Self {
            max_attempts: ctx.config.claude_code.max_fix_attempts,
            ctx,
            file_path,
            repo_root,
            attempt_count: 0,
            predicted_fixes: Vec::new(),
            current: None,
            reports: Vec::new(),
            outcome: None,
        })
    }

    #[must_use]
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    #[must_use]
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Every predicted fix so far, with the content it produced.
    #[must_use]
    pub fn predicted_fixes(&self) -> &[(Issue, String)] {
        &self.predicted_fixes
    }

    /// Workspaces currently held for this file.
    #[must_use]
    pub fn active_workspaces(&self) -> Vec<Workspace> {
        self.ctx.workspaces.active_for(&self.file_path)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Run iterations until the session ends.
    pub async fn run(mut self) -> SessionOutcome {
        loop {
            if let Some(outcome) = self.step().await {
                return outcome;
            }
        }
    }

    /// Run one iteration. Returns the outcome once the session has ended;
    /// later calls return it again without doing any work.
    pub async fn step(&mut self) -> Option<SessionOutcome> {
        if let Some(outcome) = &self.outcome {
            return Some(outcome.clone());
        }

        let status = match self.iterate().await {
            Ok(status) => status?,
            Err(e) => {
                warn!(
                    file = %self.file_path.display(),
                    category = %e.category(),
                    error = %e,
                    "Fix session aborted"
                );
                SessionStatus::Aborted(e.to_string())
            }
        };
        Some(self.finish(status).await)
    }

    /// End the session now as [`SessionStatus::Exhausted`] unless it already
    /// ended.
    pub async fn stop(&mut self) -> SessionOutcome {
        match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => self.finish(SessionStatus::Exhausted).await,
        }
    }

    async fn finish(&mut self, status: SessionStatus) -> SessionOutcome {
        let swept = self.ctx.workspaces.sweep_owner(&self.file_path).await;
        if swept > 0 {
            warn!(file = %self.file_path.display(), swept, "Swept leftover workspaces");
        }

        let outcome = SessionOutcome {
            file: self.file_path.clone(),
            status,
            residual: self.current.clone().unwrap_or_default(),
            attempts: self.attempt_count,
            reports: self.reports.clone(),
        };
        info!(
            file = %self.file_path.display(),
            status = %outcome.status,
            attempts = outcome.attempts,
            residual = outcome.residual.len(),
            "Fix session finished"
        );
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn iterate(&mut self) -> Result<Option<SessionStatus>> {
        let issues = match self.current.clone() {
            Some(issues) => issues,
            None => {
                let issues = self.lint().await?;
                self.current = Some(issues.clone());
                issues
            }
        };
        if issues.is_empty() {
            self.current = Some(issues);
            return Ok(Some(SessionStatus::Success));
        }
        if self.attempt_count >= self.max_attempts {
            let err = FixError::AttemptsExhausted {
                max: self.max_attempts,
                remaining: issues.len(),
            };
            debug!(file = %self.file_path.display(), "{err}");
            self.current = Some(issues);
            return Ok(Some(SessionStatus::Exhausted));
        }

        self.attempt_count += 1;
        let before = issues.len();
        let mut report = IterationReport::new(self.attempt_count, before);
        info!(
            file = %self.file_path.display(),
            iteration = self.attempt_count,
            issues = before,
            "Starting fix iteration"
        );

        let mut remaining = issues;
        if self.auto_fix_applies(before) && self.auto_fix().await? {
            report.auto_fixed = true;
            report.applied = true;
            remaining = self.lint().await?;
            self.current = Some(remaining.clone());
        }

        let content = tokio::fs::read_to_string(&self.file_path).await?;
        let staged = stage_predictions(&self.ctx.predictor, &content, remaining);
        if !staged.predicted.is_empty() {
            tokio::fs::write(&self.file_path, &staged.content).await?;
            report.predicted = staged.predicted.len();
            report.applied = true;
            self.predicted_fixes.extend(staged.predicted);
        }

        if self.ctx.config.claude_code.enabled && !staged.remaining.is_empty() {
            let clusters = self.ctx.clusterer.cluster(&staged.remaining);
            report.clusters = clusters.len();
            debug!(clusters = clusters.len(), "Dispatching clusters");

            let results = self
                .ctx
                .executor()
                .fix_all(&self.file_path, clusters, &self.repo_root, &staged.content)
                .await;
            report.successful_clusters = results.iter().filter(|r| r.has_changes()).count();
            log_failures(&results);

            let merge = self
                .ctx
                .merge_engine()
                .merge(&self.file_path, &self.repo_root, &staged.content, &results)
                .await;
            if merge.success && merge.merged > 0 {
                report.applied = true;
            }
            report.merge = Some(merge);
        }

        let after = self.lint().await?;
        report.issues_after = after.len();
        report.finished_at = Some(Utc::now());
        let applied = report.applied;
        self.reports.push(report);

        let status = if after.is_empty() {
            Some(SessionStatus::Success)
        } else if !applied && after.len() >= before {
            let err = FixError::NoProgress {
                iteration: self.attempt_count,
                remaining: after.len(),
            };
            debug!(file = %self.file_path.display(), "{err}");
            Some(SessionStatus::NoProgress)
        } else if self.attempt_count >= self.max_attempts {
            Some(SessionStatus::Exhausted)
        } else {
            None
        };
        self.current = Some(after);
        Ok(status)
    }

    async fn lint(&self) -> Result<Vec<Issue>> {
        let linter = Arc::clone(&self.ctx.linter);
        let path = self.file_path.clone();
        run_blocking("lint", self.ctx.config.linter_timeout(), move || {
            linter.check(&path)
        })
        .await
    }

    fn auto_fix_applies(&self, issue_count: usize) -> bool {
        let auto_fix = &self.ctx.config.auto_fix;
        auto_fix.enabled && issue_count <= auto_fix.threshold && self.ctx.linter.supports_fix()
    }

    /// Run the linter's own fixer. Restores the previous content if it errors.
    async fn auto_fix(&self) -> Result<bool> {
        let original = tokio::fs::read(&self.file_path).await?;
        let linter = Arc::clone(&self.ctx.linter);
        let path = self.file_path.clone();

        match run_blocking("auto-fix", self.ctx.config.linter_timeout(), move || {
            linter.fix(&path)
        })
        .await
        {
            Ok(changed) => {
                if changed {
                    info!(file = %self.file_path.display(), "Linter auto-fix applied");
                }
                Ok(changed)
            }
            Err(e) => {
                warn!(file = %self.file_path.display(), error = %e, "Auto-fix failed; restoring file");
                tokio::fs::write(&self.file_path, original).await?;
                Ok(false)
            }
        }
    }
}

/// Move every issue at or below `line` down by one.
fn shift_from(issues: &mut [Issue], line: u32) {
    for issue in issues.iter_mut().filter(|i| i.line >= line) {
        *issue = issue.shifted(1);
    }
}

fn log_failures(results: &[FixAttemptResult]) {
    for result in results.iter().filter(|r| !r.success) {
        warn!(
            cluster = %result.cluster.fingerprint,
            error = result.error.as_deref().unwrap_or("unknown"),
            "Cluster fix failed"
        );
    }
}

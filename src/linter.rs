//! Static-analysis boundary.
//!
//! Tool output is translated into [`Issue`] here; nothing past this module
//! sees raw JSON. Calls are blocking and are run through
//! [`run_blocking`](crate::blocking::run_blocking) by the session. A ruff
//! process that runs past its timeout is killed.

use crate::error::{FixError, Result};
use crate::issue::{Issue, Severity};
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A linter that reports issues for a single file.
pub trait Linter: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;

    /// Issues currently present in `path`, ordered by position.
    fn check(&self, path: &Path) -> Result<Vec<Issue>>;

    /// Whether [`fix`](Self::fix) can change files.
    fn supports_fix(&self) -> bool {
        false
    }

    /// Run the tool's own fixer. Returns whether the file changed.
    fn fix(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }
}

// ============================================================================
// Ruff
// ============================================================================

/// Ruff diagnostic as emitted by `--output-format=json`.
#[derive(Debug, Deserialize)]
struct RuffDiagnostic {
    /// `null` for syntax errors.
    code: Option<String>,
    message: String,
    location: Option<RuffLocation>,
}

#[derive(Debug, Deserialize)]
struct RuffLocation {
    row: u32,
    column: u32,
}

/// Rule id given to diagnostics without a code.
const SYNTAX_ERROR_RULE: &str = "E999";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// [`Linter`] that runs `ruff check` on one file.
#[derive(Debug, Clone)]
pub struct RuffLinter {
    program: PathBuf,
    extra_args: Vec<String>,
    timeout: Option<Duration>,
}

impl Default for RuffLinter {
    fn default() -> Self {
        Self::new()
    }
}

impl RuffLinter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("ruff"),
            extra_args: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Kill ruff when a run takes longer than `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Additional arguments passed to every `ruff check`.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// Parse ruff JSON output.
    ///
    /// # Errors
    ///
    /// Returns a linter error when the output is not a ruff diagnostic array.
    pub fn parse_output(stdout: &str) -> Result<Vec<Issue>> {
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let diagnostics: Vec<RuffDiagnostic> = serde_json::from_str(stdout)
            .map_err(|e| FixError::linter("ruff", format!("unexpected output: {e}")))?;

        let mut issues: Vec<Issue> = diagnostics
            .into_iter()
            .map(|diag| {
                let rule = diag
                    .code
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| SYNTAX_ERROR_RULE.to_string());
                let severity = Self::severity_from_code(&rule);
                let (line, column) = diag.location.map_or((0, 0), |l| (l.row, l.column));
                Issue::new(rule, diag.message, line)
                    .with_column(column)
                    .with_severity(severity)
            })
            .collect();
        issues.sort_by(Issue::cmp_position);
        Ok(issues)
    }

    /// E (pycodestyle errors), F (pyflakes) and S (security) are errors.
    fn severity_from_code(code: &str) -> Severity {
        if code.starts_with('E') || code.starts_with('F') || code.starts_with('S') {
            Severity::Error
        } else {
            Severity::Warning
        }
    }

    fn run(&self, path: &Path, fix: bool) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("check");
        if fix {
            cmd.arg("--fix");
        }
        cmd.arg("--output-format=json")
            .args(&self.extra_args)
            .arg("--")
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FixError::linter("ruff", format!("{} not found", self.program.display()))
            } else {
                FixError::linter("ruff", e.to_string())
            }
        })?;
        let stdout = child.stdout.take().map(read_to_end);
        let stderr = child.stderr.take().map(read_to_end);

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| FixError::linter("ruff", e.to_string()))?
            {
                break status;
            }
            if self.timeout.is_some_and(|limit| start.elapsed() >= limit) {
                let _ = child.kill();
                let _ = child.wait();
                warn!(path = %path.display(), "ruff timed out and was killed");
                return Err(FixError::timeout("ruff", start.elapsed()));
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        // 0 = clean, 1 = issues found, anything else is a tool failure.
        match status.code() {
            Some(0 | 1) => Ok(collect(stdout)),
            code => Err(FixError::linter(
                "ruff",
                format!("exit code {code:?}: {}", collect(stderr).trim()),
            )),
        }
    }
}

/// Drain a child pipe on its own thread so a full pipe cannot stall the child.
fn read_to_end<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

impl Linter for RuffLinter {
    fn name(&self) -> &str {
        "ruff"
    }

    fn check(&self, path: &Path) -> Result<Vec<Issue>> {
        let stdout = self.run(path, false)?;
        let issues = Self::parse_output(&stdout)?;
        debug!(path = %path.display(), count = issues.len(), "ruff check");
        Ok(issues)
    }

    fn supports_fix(&self) -> bool {
        true
    }

    fn fix(&self, path: &Path) -> Result<bool> {
        let before = std::fs::read(path)?;
        self.run(path, true)?;
        let after = std::fs::read(path)?;
        Ok(before != after)
    }
}

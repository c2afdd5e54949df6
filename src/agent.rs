//! Fixing agent boundary.
//!
//! The engine hands natural-language instructions to an external agent that
//! edits files in a working directory. [`FixingAgent`] is the seam;
//! [`ClaudeCliAgent`] drives the `claude` CLI in print mode.

use crate::error::{FixError, Result};
use crate::issue::{Issue, IssueCluster};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Set for every agent child so project hooks do not start nested fix runs.
pub const FIX_IN_PROGRESS_ENV: &str = "CLAUDE_CODE_FIX_IN_PROGRESS";

/// Tools granted for a cluster fix.
pub const FIX_TOOLS: &[&str] = &["Read", "Edit", "MultiEdit"];

/// Tools granted for an agent merge.
pub const MERGE_TOOLS: &[&str] = &["Read", "Write"];

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub working_dir: PathBuf,
    pub instruction: String,
    pub allowed_tools: Vec<String>,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        instruction: impl Into<String>,
        allowed_tools: &[&str],
        timeout: Duration,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            instruction: instruction.into(),
            allowed_tools: allowed_tools.iter().map(|t| (*t).to_string()).collect(),
            timeout,
        }
    }

    /// Request for fixing one cluster.
    pub fn fix(working_dir: impl Into<PathBuf>, instruction: impl Into<String>, timeout: Duration) -> Self {
        Self::new(working_dir, instruction, FIX_TOOLS, timeout)
    }

    /// Request for merging divergent fixes.
    pub fn merge(working_dir: impl Into<PathBuf>, instruction: impl Into<String>, timeout: Duration) -> Self {
        Self::new(working_dir, instruction, MERGE_TOOLS, timeout)
    }
}

/// Outcome of a clean agent exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub output: String,
    pub duration: Duration,
}

/// An external agent that edits files.
#[async_trait]
pub trait FixingAgent: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether the agent can be invoked at all.
    async fn is_available(&self) -> bool;

    /// Run the agent to completion.
    ///
    /// # Errors
    ///
    /// [`FixError::AgentFailed`] on a non-zero exit,
    /// [`FixError::AgentUnavailable`] when it cannot be started.
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse>;
}

/// Invoke `agent`, failing with [`FixError::Timeout`] once `request.timeout`
/// elapses. The in-flight invocation is dropped, which kills a child process
/// spawned with `kill_on_drop`.
pub async fn run_agent_with_timeout(
    agent: &dyn FixingAgent,
    request: &AgentRequest,
) -> Result<AgentResponse> {
    let start = Instant::now();
    match tokio::time::timeout(request.timeout, agent.invoke(request)).await {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(
                agent = agent.name(),
                dir = %request.working_dir.display(),
                timeout_secs = request.timeout.as_secs(),
                "Agent timed out"
            );
            Err(FixError::timeout(agent.name(), start.elapsed()))
        }
    }
}

/// [`FixingAgent`] backed by the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliAgent {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl Default for ClaudeCliAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeCliAgent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("claude"),
            extra_args: Vec::new(),
        }
    }

    /// Use a different executable (tests, wrappers).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Extra CLI arguments, e.g. `--model sonnet`.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn build_args(&self, request: &AgentRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--allowedTools".to_string(),
            request.allowed_tools.join(","),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl FixingAgent for ClaudeCliAgent {
    fn name(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let start = Instant::now();
        debug!(
            dir = %request.working_dir.display(),
            tools = %request.allowed_tools.join(","),
            "Invoking claude"
        );

        let mut child = AsyncCommand::new(&self.program)
            .args(self.build_args(request))
            .current_dir(&request.working_dir)
            .env(FIX_IN_PROGRESS_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FixError::AgentUnavailable {
                        detail: format!("{} not found", self.program.display()),
                    }
                } else {
                    FixError::AgentFailed {
                        exit_code: -1,
                        message: format!("failed to spawn: {e}"),
                    }
                }
            })?;

        // Prompt goes on stdin so long instructions are not limited by argv.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.instruction.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(FixError::AgentFailed {
                exit_code: output.status.code().unwrap_or(-1),
                message,
            });
        }

        Ok(AgentResponse {
            output: stdout,
            duration: start.elapsed(),
        })
    }
}

// ============================================================================
// Prompts
// ============================================================================

fn issue_lines(issues: &[Issue], indent: &str) -> String {
    issues
        .iter()
        .map(|i| format!("{indent}{}\n", i.format()))
        .collect()
}

/// Instruction for fixing one cluster in `rel_path`.
#[must_use]
pub fn fix_prompt(rel_path: &Path, cluster: &IssueCluster) -> String {
    format!(
        "Fix the following {count} linting issues in {path}:\n\n\
         {issues}\n\
         Requirements:\n\
         - Fix ONLY the issues listed above\n\
         - Maintain code style and functionality\n\
         - Make minimal changes\n\
         - Consider the full file context when making fixes",
        count = cluster.len(),
        path = rel_path.display(),
        issues = issue_lines(&cluster.issues, ""),
    )
}

/// Instruction for merging several cluster fixes into `file_path`.
///
/// Each entry is a cluster and the diff its attempt produced against the
/// current content of the file.
#[must_use]
pub fn merge_prompt(file_path: &Path, fixes: &[(&IssueCluster, &str)]) -> String {
    let name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_path.display().to_string());

    let mut prompt = format!(
        "You are tasked with merging multiple fixes for a file that has various linting issues.\n\n\
         The file {name} had multiple linting issues that were fixed in parallel by different instances.\n\
         Your job is to merge all these fixes into a single, coherent file.\n\n\
         IMPORTANT REQUIREMENTS:\n\
         1. The final merged file must include ALL fixes from ALL versions\n\
         2. Resolve any conflicts by choosing the most complete fix\n\
         3. Ensure no fixes are lost in the merge\n\
         4. Maintain code functionality and style\n\
         5. The merged result should pass all linting checks\n\n\
         Here are the issues that were fixed in each version, with the diff against the current file:\n"
    );

    for (index, (cluster, diff)) in fixes.iter().enumerate() {
        prompt.push_str(&format!("\nVersion {} fixed these issues:\n", index + 1));
        prompt.push_str(&issue_lines(&cluster.issues, "  - "));
        prompt.push_str("```diff\n");
        prompt.push_str(diff);
        if !diff.ends_with('\n') {
            prompt.push('\n');
        }
        prompt.push_str("```\n");
    }

    prompt.push_str(&format!(
        "\n\nThe current file is at {path}.\n\n\
         MERGE STRATEGY:\n\
         1. Read the current file to understand the base state\n\
         2. Analyze each fix to understand what was changed\n\
         3. Apply all fixes, ensuring no fix overwrites another\n\
         4. If fixes conflict, choose the most comprehensive solution\n\
         5. Write the final merged result back to {path}\n\n\
         Proceed with the merge.",
        path = file_path.display()
    ));
    prompt
}

// ============================================================================
// Routing
// ============================================================================

/// Messages and rules the linter's own fixer cannot handle.
const COMPLEX_PATTERNS: &[&str] = &[
    "undefined",
    "importerror",
    "modulenotfounderror",
    "typeerror",
    "nameerror",
    "syntax",
    "type-error",
    "reportgeneraltypeissues",
    "reportargumenttype",
    "reportassignmenttype",
    "reportreturntype",
    "reportindexissue",
    "reportoptionalmemberaccess",
    "reportmissingtypeargument",
    "reportpossiblyunboundvariable",
    "reportconstantredefinition",
    "reportcallissue",
    "reportattributeaccessissue",
    "reportunknownparametertype",
    "reportunknownmembertype",
];

/// Whether `issues` call for the agent rather than the linter's own fixer.
#[must_use]
pub fn needs_agent(issues: &[Issue], auto_fix_failed: bool) -> bool {
    if auto_fix_failed {
        return true;
    }
    issues.iter().any(|issue| {
        let rule = issue.rule.to_lowercase();
        let message = issue.message.to_lowercase();
        COMPLEX_PATTERNS
            .iter()
            .any(|p| rule.contains(p) || message.contains(p))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> IssueCluster {
        IssueCluster::from_issues(vec![
            Issue::new("F821", "Undefined name `json`", 10),
            Issue::new("F841", "Local variable `x` is assigned to but never used", 12),
        ])
        .unwrap()
    }

    #[test]
    fn test_fix_prompt_lists_every_issue() {
        let prompt = fix_prompt(Path::new("pkg/app.py"), &cluster());
        assert!(prompt.starts_with("Fix the following 2 linting issues in pkg/app.py:"));
        assert!(prompt.contains("Line 10: [F821] Undefined name `json`\n"));
        assert!(prompt.contains("Line 12: [F841]"));
        assert!(prompt.contains("Fix ONLY the issues listed above"));
    }

    #[test]
    fn test_merge_prompt_includes_issues_and_diffs() {
        let c = cluster();
        let prompt = merge_prompt(
            Path::new("/repo/app.py"),
            &[(&c, "@@ -1 +1 @@\n-a\n+b"), (&c, "@@ -9 +9 @@\n-c\n+d\n")],
        );
        assert!(prompt.contains("The file app.py had multiple"));
        assert!(prompt.contains("Version 1 fixed these issues:\n  - Line 10: [F821]"));
        assert!(prompt.contains("Version 2 fixed"));
        assert!(prompt.contains("+b\n```"));
        assert!(prompt.contains("Write the final merged result back to /repo/app.py"));
    }

    #[test]
    fn test_request_tools() {
        let fix = AgentRequest::fix("/tmp", "x", Duration::from_secs(1));
        assert_eq!(fix.allowed_tools, vec!["Read", "Edit", "MultiEdit"]);
        let merge = AgentRequest::merge("/tmp", "x", Duration::from_secs(1));
        assert_eq!(merge.allowed_tools, vec!["Read", "Write"]);
    }

    #[test]
    fn test_cli_args() {
        let agent = ClaudeCliAgent::new().with_args(vec!["--model".into(), "sonnet".into()]);
        let args = agent.build_args(&AgentRequest::fix("/tmp", "x", Duration::from_secs(1)));
        assert_eq!(
            args,
            vec![
                "-p",
                "--dangerously-skip-permissions",
                "--allowedTools",
                "Read,Edit,MultiEdit",
                "--output-format",
                "text",
                "--model",
                "sonnet"
            ]
        );
    }

    #[test]
    fn test_needs_agent() {
        let simple = vec![Issue::new("E501", "Line too long (120 > 88)", 1)];
        assert!(!needs_agent(&simple, false));
        assert!(needs_agent(&simple, true));

        let complex = vec![Issue::new("F821", "Undefined name `foo`", 3)];
        assert!(needs_agent(&complex, false));

        let pyright = vec![Issue::new("reportCallIssue", "No overloads", 3)];
        assert!(needs_agent(&pyright, false));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let agent = ClaudeCliAgent::new().with_program("/nonexistent/lintfix-claude");
        assert!(!agent.is_available().await);
        let err = agent
            .invoke(&AgentRequest::fix("/", "x", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, FixError::AgentUnavailable { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_agent_passes_prompt_and_env() {
        let temp = tempfile::TempDir::new().unwrap();
        let program = script(
            temp.path(),
            "cat > prompt.txt\necho \"$CLAUDE_CODE_FIX_IN_PROGRESS $*\" > args.txt\necho done",
        );
        let agent = ClaudeCliAgent::new().with_program(program);

        let response = agent
            .invoke(&AgentRequest::fix(temp.path(), "fix it", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(response.output.trim(), "done");
        assert_eq!(
            std::fs::read_to_string(temp.path().join("prompt.txt")).unwrap(),
            "fix it"
        );
        let args = std::fs::read_to_string(temp.path().join("args.txt")).unwrap();
        assert!(args.starts_with("1 -p --dangerously-skip-permissions"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_agent_nonzero_exit() {
        let temp = tempfile::TempDir::new().unwrap();
        let program = script(temp.path(), "cat > /dev/null\necho 'rate limited' >&2\nexit 3");
        let agent = ClaudeCliAgent::new().with_program(program);

        let err = agent
            .invoke(&AgentRequest::fix(temp.path(), "x", Duration::from_secs(10)))
            .await
            .unwrap_err();
        match err {
            FixError::AgentFailed { exit_code, message } => {
                assert_eq!(exit_code, 3);
                assert_eq!(message, "rate limited");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_wrapper_stops_slow_agent() {
        let temp = tempfile::TempDir::new().unwrap();
        let program = script(temp.path(), "cat > /dev/null\nsleep 30");
        let agent = ClaudeCliAgent::new().with_program(program);

        let start = Instant::now();
        let err = run_agent_with_timeout(
            &agent,
            &AgentRequest::fix(temp.path(), "x", Duration::from_millis(200)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FixError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}

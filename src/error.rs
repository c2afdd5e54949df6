//! Error types for the fix engine.
//!
//! Errors are grouped into the categories the convergence loop reacts to:
//! configuration mistakes, exhausted resources, timeouts, failing external
//! tools and session-level progress failures. Only the executor and merge
//! boundaries turn these into plain failed results; everywhere else they
//! propagate with `?`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Broad classification of a [`FixError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad configuration value.
    Configuration,
    /// Workspace quota exceeded or workspace creation failed.
    Resource,
    /// An external call exceeded its time budget.
    Timeout,
    /// Non-zero exit from the agent, git, the linter, or patch application.
    ExternalTool,
    /// Session could not converge.
    Progress,
    /// Local I/O, serialization, or anything else.
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Resource => write!(f, "resource"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExternalTool => write!(f, "external-tool"),
            Self::Progress => write!(f, "progress"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Main error type for fix operations.
#[derive(Error, Debug)]
pub enum FixError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Too many workspaces are active at once
    #[error("Workspace quota exceeded: {active} active (max {max})")]
    WorkspaceQuota { active: usize, max: usize },

    /// Creating an isolated workspace failed
    #[error("Failed to create workspace {id}: {message}")]
    WorkspaceCreate { id: String, message: String },

    /// The file to fix does not exist inside the workspace
    #[error("Target file not found in workspace: {path}")]
    TargetMissing { path: PathBuf },

    /// The file is not inside a git repository
    #[error("Not inside a git repository: {path}")]
    NotARepository { path: PathBuf },

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// An operation exceeded its time budget
    #[error("{operation} timed out after {}s", .elapsed.as_secs())]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    /// The fixing agent exited unsuccessfully
    #[error("Fixing agent failed with exit code {exit_code}: {message}")]
    AgentFailed { exit_code: i32, message: String },

    /// The fixing agent binary could not be found
    #[error("Fixing agent not available: {detail}")]
    AgentUnavailable { detail: String },

    /// A patch could not be applied
    #[error("Patch for cluster {fingerprint} failed to apply: {message}")]
    PatchFailed {
        fingerprint: String,
        message: String,
    },

    /// Git operation failed
    #[error("Git operation failed: {operation} - {message}")]
    Git { operation: String, message: String },

    /// The static-analysis tool failed
    #[error("Linter '{linter}' failed: {message}")]
    Linter { linter: String, message: String },

    // =========================================================================
    // Progress Errors
    // =========================================================================
    /// The per-file attempt budget ran out
    #[error("Maximum fix attempts ({max}) exhausted with {remaining} issue(s) left")]
    AttemptsExhausted { max: u32, remaining: usize },

    /// An iteration neither applied a fix nor reduced the issue count
    #[error("No progress: {remaining} issue(s) left after iteration {iteration}")]
    NoProgress { iteration: u32, remaining: usize },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FixError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid-configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a git error
    pub fn git(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Git {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Create a linter error
    pub fn linter(linter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Linter {
            linter: linter.into(),
            message: message.into(),
        }
    }

    /// Create a workspace creation error
    pub fn workspace_create(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::WorkspaceCreate {
            id: id.into(),
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::WorkspaceQuota { .. }
            | Self::WorkspaceCreate { .. }
            | Self::TargetMissing { .. }
            | Self::NotARepository { .. } => ErrorCategory::Resource,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::AgentFailed { .. }
            | Self::AgentUnavailable { .. }
            | Self::PatchFailed { .. }
            | Self::Git { .. }
            | Self::Linter { .. } => ErrorCategory::ExternalTool,
            Self::AttemptsExhausted { .. } | Self::NoProgress { .. } => ErrorCategory::Progress,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AttemptsExhausted { .. } | Self::NoProgress { .. } => 2,
            Self::Timeout { .. } => 3,
            Self::WorkspaceQuota { .. } | Self::WorkspaceCreate { .. } => 4,
            Self::AgentUnavailable { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for fix-engine results
pub type Result<T> = std::result::Result<T, FixError>;

//! Issue and cluster types shared by every stage of the fix pipeline.
//!
//! Linter output is translated into [`Issue`] at the linter boundary; from
//! there on, nothing in the crate handles loosely-typed payloads.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Severity reported by the static-analysis tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single reported problem at a file location.
///
/// Issues are immutable once reported; [`Issue::shifted`] produces a moved
/// copy when an earlier edit inserts lines above it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Issue {
    /// Rule identifier, e.g. `F821`.
    pub rule: String,
    /// Human-readable message from the tool.
    pub message: String,
    /// 1-based line (0 when the tool gave no location).
    pub line: u32,
    /// 1-based column (0 when unknown).
    pub column: u32,
    #[serde(default)]
    pub severity: Severity,
}

impl Issue {
    /// Create an error-severity issue.
    pub fn new(rule: impl Into<String>, message: impl Into<String>, line: u32) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
            line,
            column: 0,
            severity: Severity::Error,
        }
    }

    #[must_use]
    pub fn with_column(mut self, column: u32) -> Self {
        self.column = column;
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Copy of this issue moved down by `lines`.
    #[must_use]
    pub fn shifted(&self, lines: u32) -> Self {
        Self {
            line: self.line + lines,
            ..self.clone()
        }
    }

    /// `rule:line` key used for fingerprints.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        format!("{}:{}", self.rule, self.line)
    }

    /// Ordering key `(line, column)`.
    #[must_use]
    pub fn position(&self) -> (u32, u32) {
        (self.line, self.column)
    }

    /// Compare by position only.
    #[must_use]
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.position().cmp(&other.position())
    }

    /// One-line form used in agent prompts and CLI output.
    #[must_use]
    pub fn format(&self) -> String {
        format!("Line {}: [{}] {}", self.line, self.rule, self.message)
    }
}

/// A group of issues dispatched together as one fix unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCluster {
    pub issues: Vec<Issue>,
    pub start_line: u32,
    pub end_line: u32,
    pub fingerprint: String,
}

impl IssueCluster {
    /// Build a cluster from a non-empty list of issues, keeping their order.
    ///
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn from_issues(issues: Vec<Issue>) -> Option<Self> {
        let start_line = issues.iter().map(|i| i.line).min()?;
        let end_line = issues.iter().map(|i| i.line).max()?;
        let fingerprint = cluster_fingerprint(&issues);
        Some(Self {
            issues,
            start_line,
            end_line,
            fingerprint,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.issues.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Short description for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "{} ({} issue(s), lines {}-{})",
            self.fingerprint,
            self.issues.len(),
            self.start_line,
            self.end_line
        )
    }
}

/// Stable 8-hex-char hash of the ordered `rule:line` pairs.
#[must_use]
pub fn cluster_fingerprint(issues: &[Issue]) -> String {
    let joined = issues
        .iter()
        .map(Issue::fingerprint)
        .collect::<Vec<_>>()
        .join("|");
    let digest = format!("{:x}", md5::compute(joined.as_bytes()));
    digest[..8].to_string()
}

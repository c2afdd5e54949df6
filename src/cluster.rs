//! Issue clustering.
//!
//! Groups a flat issue list for one file into [`IssueCluster`]s that can be
//! fixed independently. Clustering is pure and deterministic: the same issues
//! and config always yield the same clusters in the same order, and every
//! input issue lands in exactly one cluster.

use crate::issue::{Issue, IssueCluster};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// How issues are grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStrategy {
    /// Nearby lines go together.
    #[default]
    Proximity,
    /// Same category goes together regardless of distance.
    Similarity,
    /// Same category and nearby.
    Hybrid,
}

impl ClusterStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Proximity => "proximity",
            Self::Similarity => "similarity",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Error for parsing [`ClusterStrategy`] from a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown clustering strategy: '{0}'. Valid options: proximity, similarity, hybrid")]
pub struct ParseClusterStrategyError(String);

impl std::str::FromStr for ClusterStrategy {
    type Err = ParseClusterStrategyError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "proximity" => Ok(Self::Proximity),
            "similarity" => Ok(Self::Similarity),
            "hybrid" => Ok(Self::Hybrid),
            _ => Err(ParseClusterStrategyError(s.to_string())),
        }
    }
}

impl std::fmt::Display for ClusterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clustering parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Maximum line gap between neighbouring issues in one cluster.
    pub distance: u32,
    /// Maximum issues per cluster.
    pub max_cluster_size: usize,
    pub strategy: ClusterStrategy,
    /// When false every issue is its own cluster.
    pub batching: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            distance: 5,
            max_cluster_size: 5,
            strategy: ClusterStrategy::Proximity,
            batching: true,
        }
    }
}

/// A single category test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Case-insensitive prefix of the rule id.
    RulePrefix(String),
    /// Case-insensitive substring of the rule id or the message.
    Keyword(String),
}

impl Matcher {
    #[must_use]
    pub fn rule_prefix(prefix: &str) -> Self {
        Self::RulePrefix(prefix.to_lowercase())
    }

    #[must_use]
    pub fn keyword(keyword: &str) -> Self {
        Self::Keyword(keyword.to_lowercase())
    }

    fn matches(&self, rule: &str, message: &str) -> bool {
        match self {
            Self::RulePrefix(prefix) => rule.starts_with(prefix.as_str()),
            Self::Keyword(keyword) => rule.contains(keyword.as_str()) || message.contains(keyword.as_str()),
        }
    }
}

/// Ordered `(name, matchers)` entries; the first matching entry wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryTable {
    entries: Vec<(String, Vec<Matcher>)>,
}

impl CategoryTable {
    /// Empty table: every issue falls back to `rule_<c>` or `other`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Built-in categories for ruff/pyright style rules.
    #[must_use]
    pub fn builtin() -> Self {
        use Matcher as M;
        let k = M::keyword;
        let p = M::rule_prefix;
        Self::empty()
            .with_category("imports", vec![k("import"), p("F401"), p("E402"), k("isort")])
            .with_category(
                "types",
                vec![k("type"), k("annotation"), k("typing"), k("reportmissingtypeargument")],
            )
            .with_category(
                "undefined",
                vec![p("F821"), k("undefined"), k("nameerror"), k("unbound")],
            )
            .with_category(
                "unused",
                vec![p("F841"), k("unused"), k("assigned but never used")],
            )
            .with_category("docstrings", vec![p("D"), k("docstring")])
            .with_category(
                "formatting",
                vec![
                    k("syntax"),
                    k("indent"),
                    k("whitespace"),
                    k("format"),
                    p("E1"),
                    p("E2"),
                    p("E3"),
                    p("W"),
                ],
            )
            .with_category("security", vec![p("S"), k("security"), k("bandit"), k("unsafe")])
            .with_category(
                "complexity",
                vec![p("C901"), k("complex"), k("cyclomatic"), k("mccabe")],
            )
    }

    /// Built-in table with user categories (name to keywords) checked first.
    #[must_use]
    pub fn with_custom(custom: &BTreeMap<String, Vec<String>>) -> Self {
        let mut table = Self::empty();
        for (name, keywords) in custom {
            let matchers = keywords.iter().map(|k| Matcher::keyword(k)).collect();
            table = table.with_category(name.clone(), matchers);
        }
        table.entries.extend(Self::builtin().entries);
        table
    }

    /// Append a category.
    #[must_use]
    pub fn with_category(mut self, name: impl Into<String>, matchers: Vec<Matcher>) -> Self {
        self.entries.push((name.into(), matchers));
        self
    }

    /// Category name for an issue.
    #[must_use]
    pub fn categorize(&self, issue: &Issue) -> String {
        let rule = issue.rule.to_lowercase();
        let message = issue.message.to_lowercase();

        for (name, matchers) in &self.entries {
            if matchers.iter().any(|m| m.matches(&rule, &message)) {
                return name.clone();
            }
        }

        match rule.chars().next() {
            Some(c) => format!("rule_{c}"),
            None => "other".to_string(),
        }
    }
}

impl Default for CategoryTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Groups issues into clusters.
#[derive(Debug, Clone, Default)]
pub struct Clusterer {
    config: ClusterConfig,
    categories: CategoryTable,
}

impl Clusterer {
    #[must_use]
    pub fn new(config: ClusterConfig, categories: CategoryTable) -> Self {
        Self { config, categories }
    }

    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    #[must_use]
    pub fn categories(&self) -> &CategoryTable {
        &self.categories
    }

    /// Partition `issues` into clusters.
    #[must_use]
    pub fn cluster(&self, issues: &[Issue]) -> Vec<IssueCluster> {
        if issues.is_empty() {
            return Vec::new();
        }

        let clusters = if !self.config.batching {
            let mut sorted = issues.to_vec();
            sorted.sort_by(Issue::cmp_position);
            sorted
                .into_iter()
                .filter_map(|issue| IssueCluster::from_issues(vec![issue]))
                .collect()
        } else {
            match self.config.strategy {
                ClusterStrategy::Proximity => self.split(issues.to_vec(), true),
                ClusterStrategy::Similarity => self
                    .group_by_category(issues)
                    .into_iter()
                    .flat_map(|group| self.split(group, false))
                    .collect(),
                ClusterStrategy::Hybrid => self
                    .group_by_category(issues)
                    .into_iter()
                    .flat_map(|group| self.split(group, true))
                    .collect(),
            }
        };

        debug!(
            issues = issues.len(),
            clusters = clusters.len(),
            strategy = %self.config.strategy,
            "Clustered issues"
        );
        clusters
    }

    /// Category groups in first-appearance order.
    fn group_by_category(&self, issues: &[Issue]) -> Vec<Vec<Issue>> {
        let mut order: Vec<String> = Vec::new();
        let mut groups: BTreeMap<String, Vec<Issue>> = BTreeMap::new();

        for issue in issues {
            let category = self.categories.categorize(issue);
            if !groups.contains_key(&category) {
                order.push(category.clone());
            }
            groups.entry(category).or_default().push(issue.clone());
        }

        order
            .into_iter()
            .filter_map(|name| groups.remove(&name))
            .collect()
    }

    /// Sort by position, then cut on the size cap (and on distance when
    /// `by_distance` is set).
    fn split(&self, mut issues: Vec<Issue>, by_distance: bool) -> Vec<IssueCluster> {
        issues.sort_by(Issue::cmp_position);
        let cap = self.config.max_cluster_size.max(1);

        let mut clusters = Vec::new();
        let mut current: Vec<Issue> = Vec::new();

        for issue in issues {
            let fits = match current.last() {
                None => true,
                Some(last) => {
                    current.len() < cap
                        && (!by_distance
                            || issue.line.saturating_sub(last.line) <= self.config.distance)
                }
            };
            if !fits {
                clusters.extend(IssueCluster::from_issues(std::mem::take(&mut current)));
            }
            current.push(issue);
        }
        clusters.extend(IssueCluster::from_issues(current));
        clusters
    }
}

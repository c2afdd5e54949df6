//! Deterministic fixes for trivially resolvable issues.
//!
//! The predictor handles a small table of patterns (missing well-known
//! imports, unused locals) without calling the agent. It is synchronous and
//! side-effect free; applying a prediction and predicting again for the same
//! issue yields `None`.

use crate::issue::Issue;
use regex::Regex;
use std::collections::BTreeMap;
use tracing::debug;

/// Rule id for undefined names.
pub const UNDEFINED_NAME: &str = "F821";
/// Rule id for locals assigned but never used.
pub const UNUSED_VARIABLE: &str = "F841";

/// Result of a successful prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    /// Full file content with the fix applied.
    pub content: String,
    /// 1-based line of an inserted import statement. Issues at or below this
    /// line have moved down by one.
    pub inserted_line: Option<u32>,
}

/// Identifier to import statement table for undefined names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTable {
    imports: BTreeMap<String, String>,
}

impl ImportTable {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            imports: BTreeMap::new(),
        }
    }

    /// Common standard-library names.
    #[must_use]
    pub fn builtin() -> Self {
        [
            ("json", "import json"),
            ("datetime", "from datetime import datetime"),
            ("logging", "import logging"),
            ("os", "import os"),
            ("sys", "import sys"),
            ("Path", "from pathlib import Path"),
            ("List", "from typing import List"),
            ("Dict", "from typing import Dict"),
            ("Optional", "from typing import Optional"),
        ]
        .into_iter()
        .fold(Self::empty(), |table, (name, stmt)| table.with_import(name, stmt))
    }

    #[must_use]
    pub fn with_import(mut self, name: impl Into<String>, statement: impl Into<String>) -> Self {
        self.imports.insert(name.into(), statement.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.imports.get(name).map(String::as_str)
    }
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Pattern-based fixer.
#[derive(Debug, Clone)]
pub struct Predictor {
    imports: ImportTable,
    enabled: bool,
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new(ImportTable::builtin(), true)
    }
}

impl Predictor {
    #[must_use]
    pub fn new(imports: ImportTable, enabled: bool) -> Self {
        Self { imports, enabled }
    }

    /// A predictor that never predicts.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(ImportTable::empty(), false)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Import statement that would resolve this issue, if any.
    #[must_use]
    pub fn import_for(&self, issue: &Issue) -> Option<&str> {
        if issue.rule != UNDEFINED_NAME {
            return None;
        }
        self.imports.get(quoted_name(&issue.message)?)
    }

    /// Try to fix `issue` in `content`.
    #[must_use]
    pub fn predict(&self, issue: &Issue, content: &str) -> Option<Prediction> {
        if !self.enabled {
            return None;
        }

        let prediction = match issue.rule.as_str() {
            UNDEFINED_NAME => {
                let statement = self.import_for(issue)?;
                insert_import(content, statement)
            }
            UNUSED_VARIABLE => prefix_unused(issue, content),
            _ => None,
        };

        if prediction.is_some() {
            debug!(rule = %issue.rule, line = issue.line, "Predicted fix");
        }
        prediction
    }
}

/// First backtick-quoted token of a message.
fn quoted_name(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    let name = &message[start..start + len];
    (!name.is_empty()).then_some(name)
}

/// Split into lines, remembering the line ending and trailing newline.
struct Lines<'a> {
    lines: Vec<&'a str>,
    newline: &'static str,
    trailing: bool,
}

impl<'a> Lines<'a> {
    fn new(content: &'a str) -> Self {
        Self {
            lines: content.lines().collect(),
            newline: if content.contains("\r\n") { "\r\n" } else { "\n" },
            trailing: content.ends_with('\n'),
        }
    }

    fn join(&self, lines: &[String]) -> String {
        let mut out = lines.join(self.newline);
        if self.trailing {
            out.push_str(self.newline);
        }
        out
    }
}

fn is_import(trimmed: &str) -> bool {
    trimmed.starts_with("import ") || trimmed.starts_with("from ")
}

fn insert_import(content: &str, statement: &str) -> Option<Prediction> {
    let parsed = Lines::new(content);
    let lines = &parsed.lines;

    if lines.iter().any(|l| l.trim() == statement) {
        return None;
    }

    let position = import_position(lines);
    let mut updated: Vec<String> = lines.iter().map(|l| (*l).to_string()).collect();
    updated.insert(position, statement.to_string());

    Some(Prediction {
        content: parsed.join(&updated),
        inserted_line: u32::try_from(position + 1).ok(),
    })
}

/// 0-based index at which a new import line goes.
fn import_position(lines: &[&str]) -> usize {
    let mut i = 0;

    // Leading comments, blank lines and the module docstring.
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }
        let quote = ["\"\"\"", "'''"].into_iter().find(|q| trimmed.starts_with(q));
        match quote {
            Some(q) if trimmed.len() >= 6 && trimmed[3..].contains(q) => {
                i += 1;
            }
            Some(q) => {
                i += 1;
                while i < lines.len() && !lines[i].contains(q) {
                    i += 1;
                }
                i += 1;
            }
            None => break,
        }
    }

    if i >= lines.len() {
        return lines.len();
    }
    if !is_import(lines[i].trim()) {
        return i;
    }

    // Walk the import block, including parenthesised and continued imports.
    let mut last_import = i;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if is_import(trimmed) {
            let mut end = i;
            if trimmed.contains('(') && !trimmed.contains(')') {
                while end + 1 < lines.len() {
                    end += 1;
                    if lines[end].contains(')') {
                        break;
                    }
                }
            } else {
                while lines[end].trim_end().ends_with('\\') && end + 1 < lines.len() {
                    end += 1;
                }
            }
            last_import = end;
            i = end + 1;
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
        } else {
            break;
        }
    }
    last_import + 1
}

fn prefix_unused(issue: &Issue, content: &str) -> Option<Prediction> {
    let index = usize::try_from(issue.line).ok()?.checked_sub(1)?;
    let parsed = Lines::new(content);
    let line = *parsed.lines.get(index)?;

    let name = match quoted_name(&issue.message) {
        Some(name) => name.to_string(),
        None => {
            let re = Regex::new(r"^\s*([A-Za-z_]\w*)\s*(?::[^=]*)?=(?:[^=]|$)").ok()?;
            re.captures(line)?.get(1)?.as_str().to_string()
        }
    };
    if name.starts_with('_') {
        return None;
    }

    let escaped = regex::escape(&name);
    let patterns = [
        format!(r"^(?P<head>\s*){escaped}(?P<tail>\s*(?::[^=]*)?=(?:[^=]|$))"),
        format!(r"(?P<head>\bas\s+){escaped}(?P<tail>\b)"),
    ];

    for pattern in &patterns {
        let Ok(re) = Regex::new(pattern) else {
            continue;
        };
        if re.is_match(line) {
            let replacement = format!("${{head}}_{name}${{tail}}");
            let fixed = re.replacen(line, 1, replacement.as_str()).into_owned();
            let mut updated: Vec<String> = parsed.lines.iter().map(|l| (*l).to_string()).collect();
            updated[index] = fixed;
            return Some(Prediction {
                content: parsed.join(&updated),
                inserted_line: None,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn undefined(name: &str, line: u32) -> Issue {
        Issue::new(UNDEFINED_NAME, format!("Undefined name `{name}`"), line)
    }

    fn unused(name: &str, line: u32) -> Issue {
        Issue::new(
            UNUSED_VARIABLE,
            format!("Local variable `{name}` is assigned to but never used"),
            line,
        )
    }

    #[test]
    fn test_inserts_after_import_block() {
        let content = "import os\nimport sys\n\n\ndef f():\n    return json.dumps({})\n";
        let prediction = Predictor::default().predict(&undefined("json", 6), content).unwrap();
        assert_eq!(
            prediction.content,
            "import os\nimport sys\nimport json\n\n\ndef f():\n    return json.dumps({})\n"
        );
        assert_eq!(prediction.inserted_line, Some(3));
    }

    #[test]
    fn test_inserts_before_first_statement_without_imports() {
        let content = "#!/usr/bin/env python\n\"\"\"Module doc.\"\"\"\n\nx = json.loads('1')\n";
        let prediction = Predictor::default().predict(&undefined("json", 4), content).unwrap();
        assert_eq!(
            prediction.content,
            "#!/usr/bin/env python\n\"\"\"Module doc.\"\"\"\n\nimport json\nx = json.loads('1')\n"
        );
        assert_eq!(prediction.inserted_line, Some(4));
    }

    #[test]
    fn test_multiline_docstring_and_parenthesised_import() {
        let content = "\"\"\"\nDoc.\n\"\"\"\nfrom typing import (\n    Any,\n)\n\nv: Path = 1\n";
        let prediction = Predictor::default().predict(&undefined("Path", 8), content).unwrap();
        assert_eq!(
            prediction.content,
            "\"\"\"\nDoc.\n\"\"\"\nfrom typing import (\n    Any,\n)\nfrom pathlib import Path\n\nv: Path = 1\n"
        );
        assert_eq!(prediction.inserted_line, Some(7));
    }

    #[test]
    fn test_import_prediction_is_idempotent() {
        let predictor = Predictor::default();
        let issue = undefined("json", 10);
        let first = predictor.predict(&issue, "x = 1\n").unwrap();
        assert!(predictor.predict(&issue, &first.content).is_none());
    }

    #[test]
    fn test_unknown_name_is_not_predicted() {
        assert!(Predictor::default().predict(&undefined("numpy", 1), "x = 1\n").is_none());
    }

    #[test]
    fn test_prefix_unused_assignment() {
        let content = "def f():\n    result = compute()\n    return 1\n";
        let prediction = Predictor::default().predict(&unused("result", 2), content).unwrap();
        assert_eq!(prediction.content, "def f():\n    _result = compute()\n    return 1\n");
        assert_eq!(prediction.inserted_line, None);
    }

    #[test]
    fn test_prefix_unused_annotated_and_as_forms() {
        let predictor = Predictor::default();
        let annotated = predictor
            .predict(&unused("count", 1), "count: int = 0\n")
            .unwrap();
        assert_eq!(annotated.content, "_count: int = 0\n");

        let with_as = predictor
            .predict(&unused("err", 2), "try:\n    pass\nexcept ValueError as err:\n")
            .map(|p| p.content);
        assert!(with_as.is_none(), "wrong line should not match");

        let with_as = predictor
            .predict(&unused("err", 3), "try:\n    pass\nexcept ValueError as err:\n")
            .unwrap();
        assert_eq!(with_as.content, "try:\n    pass\nexcept ValueError as _err:\n");
    }

    #[test]
    fn test_unused_prediction_is_idempotent() {
        let predictor = Predictor::default();
        let issue = unused("value", 1);
        let first = predictor.predict(&issue, "value = 3\n").unwrap();
        assert!(predictor.predict(&issue, &first.content).is_none());
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        assert!(Predictor::default()
            .predict(&unused("x", 1), "x == 3\n")
            .is_none());
    }

    #[test]
    fn test_disabled_predictor() {
        assert!(Predictor::disabled().predict(&undefined("json", 1), "x = 1\n").is_none());
    }

    #[test]
    fn test_custom_import_table() {
        let predictor = Predictor::new(ImportTable::empty().with_import("np", "import numpy as np"), true);
        let prediction = predictor.predict(&undefined("np", 1), "a = np.zeros(3)\n").unwrap();
        assert!(prediction.content.starts_with("import numpy as np\n"));
    }
}

//! Testing infrastructure for lintfix.
//!
//! This module provides mocks and fixtures for testing the fix pipeline
//! without a real agent, linter, or (where possible) git.
//!
//! # Architecture
//!
//! - **Mocks**: [`MockAgent`], [`MockLinter`] and [`MockVcs`] implement the
//!   engine's seams with controllable behavior
//! - **Fixtures**: temporary git repositories (test-only)
//!
//! # Example
//!
//! ```rust,ignore
//! use lintfix::testing::{MockAgent, MockLinter};
//!
//! let agent = MockAgent::new().replacing("app.py", "x = 1", "_x = 1");
//! let linter = MockLinter::clean();
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRequest, FixingAgent};
    use crate::issue::Issue;
    use crate::linter::Linter;
    use std::time::Duration;

    // =========================================================================
    // Mock Agent Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_agent_default_succeeds() {
        let agent = MockAgent::default();
        let request = AgentRequest::fix("/nonexistent", "prompt", Duration::from_secs(1));
        assert!(agent.invoke(&request).await.is_ok());
        assert_eq!(agent.call_count(), 1);
        assert_eq!(agent.requests()[0].instruction, "prompt");
    }

    #[tokio::test]
    async fn test_mock_agent_applies_edit() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("app.py"), "x = 1\n").unwrap();

        let agent = MockAgent::new().replacing("app.py", "x = 1", "_x = 1");
        let request = AgentRequest::fix(temp.path(), "fix", Duration::from_secs(1));
        agent.invoke(&request).await.unwrap();

        let content = std::fs::read_to_string(temp.path().join("app.py")).unwrap();
        assert_eq!(content, "_x = 1\n");
    }

    #[tokio::test]
    async fn test_mock_agent_failure_and_shared_counter() {
        let agent = MockAgent::new().failing(1);
        let clone = agent.clone();
        let request = AgentRequest::fix("/tmp", "x", Duration::from_secs(1));
        assert!(clone.invoke(&request).await.is_err());
        assert_eq!(agent.call_count(), 1);
    }

    // =========================================================================
    // Mock Linter Tests
    // =========================================================================

    #[test]
    fn test_mock_linter_reads_content() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("app.py");
        std::fs::write(&file, "print(json)\n").unwrap();

        let linter = MockLinter::new(|content| {
            if content.contains("import json") {
                Vec::new()
            } else {
                vec![Issue::new("F821", "Undefined name `json`", 1)]
            }
        })
        .with_fixer(|content| format!("import json\n{content}"));

        assert_eq!(linter.check(&file).unwrap().len(), 1);
        assert!(linter.supports_fix());
        assert!(linter.fix(&file).unwrap());
        assert!(linter.check(&file).unwrap().is_empty());
        assert_eq!(linter.check_count(), 2);
        assert_eq!(linter.fix_count(), 1);
    }

    #[test]
    fn test_mock_linter_failures() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("app.py");
        std::fs::write(&file, "x\n").unwrap();

        assert!(MockLinter::clean().failing().check(&file).is_err());
        assert!(MockLinter::clean().with_failing_fix().fix(&file).is_err());
        assert!(!MockLinter::clean().supports_fix());
    }
}

//! Test fixtures for creating reproducible git repositories.

use crate::vcs::GitCli;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Contents of `app.py` in a fresh fixture: eight independent assignments, so
/// edits at the top and bottom never share a hunk.
pub const APP_PY: &str = "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\nf = 6\ng = 7\nh = 8\n";

/// A temporary git repository with one commit containing `app.py`.
///
/// Automatically cleaned up when dropped.
///
/// # Example
///
/// ```rust,ignore
/// let Some(repo) = GitRepoFixture::new() else { return };
/// repo.write("app.py", "x = 1\n");
/// repo.commit_all("change");
/// ```
pub struct GitRepoFixture {
    temp_dir: TempDir,
}

impl GitRepoFixture {
    /// Create the repository, or `None` when git is not installed.
    ///
    /// # Panics
    ///
    /// Panics if git is installed but the repository cannot be set up.
    #[must_use]
    pub fn new() -> Option<Self> {
        if !GitCli::is_available() {
            return None;
        }
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let fixture = Self { temp_dir };

        fixture.git(&["init", "-q"]);
        fixture.git(&["config", "user.email", "test@test.com"]);
        fixture.git(&["config", "user.name", "Test User"]);
        fixture.git(&["config", "commit.gpgsign", "false"]);
        fixture.write("app.py", APP_PY);
        fixture.commit_all("Initial commit");
        Some(fixture)
    }

    /// Get the repository root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Absolute path of a file in the repository.
    #[must_use]
    pub fn file(&self, rel: &str) -> PathBuf {
        self.path().join(rel)
    }

    /// Write a file (creating parent directories).
    ///
    /// # Panics
    ///
    /// Panics if the write fails.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.file(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create directory");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Read a file.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be read.
    #[must_use]
    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.file(rel)).expect("Failed to read file")
    }

    /// Stage everything and commit.
    ///
    /// # Panics
    ///
    /// Panics if the commit fails.
    pub fn commit_all(&self, message: &str) {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-q", "-m", message]);
    }

    fn git(&self, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .expect("Failed to run git");
        assert!(status.success(), "git {args:?} failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_has_committed_app() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        assert!(repo.path().join(".git").exists());
        assert_eq!(repo.read("app.py"), APP_PY);

        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert!(status.stdout.is_empty());
    }
}

//! Version-control primitive behind isolated workspaces.
//!
//! [`VersionControl`] is the seam between the engine and git. Calls are
//! blocking; async callers go through `spawn_blocking` with a timeout.
//! [`GitCli`] drives the `git` binary.

use crate::error::{FixError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Operations the workspace manager and merge engine need from git.
pub trait VersionControl: Send + Sync {
    /// Top-level directory of the repository containing `path`.
    fn repo_root(&self, path: &Path) -> Result<PathBuf>;

    /// Commit id of `HEAD`.
    fn head_revision(&self, repo: &Path) -> Result<String>;

    /// Create a detached worktree of `HEAD` at `dest`.
    fn create_isolated_copy(&self, repo: &Path, dest: &Path) -> Result<()>;

    /// Remove the worktree at `dest`, discarding local changes.
    fn remove_isolated_copy(&self, repo: &Path, dest: &Path) -> Result<()>;

    /// Detach the work tree `dir` at `revision`.
    fn checkout(&self, dir: &Path, revision: &str) -> Result<()>;

    /// Stage `rel` in the work tree `dir`.
    fn stage(&self, dir: &Path, rel: &Path) -> Result<()>;

    /// Diff of the working copy of `rel` against the index, with full blob ids.
    fn diff(&self, dir: &Path, rel: &Path) -> Result<String>;

    /// Apply `patch` with a three-way fallback.
    fn apply(&self, dir: &Path, patch: &str) -> Result<()>;

    /// Stage `rel` and commit.
    fn commit(&self, dir: &Path, rel: &Path, message: &str) -> Result<()>;

    /// Create `branch` at `HEAD`, switch to it, then stage `rel` and commit.
    fn commit_on_branch(&self, dir: &Path, branch: &str, rel: &Path, message: &str) -> Result<()>;

    /// Merge every branch into `HEAD` with one `--no-ff` merge commit.
    fn merge_branches(&self, dir: &Path, branches: &[String], message: &str) -> Result<()>;

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()>;

    /// Local branches whose name starts with `prefix`.
    fn list_branches(&self, repo: &Path, prefix: &str) -> Result<Vec<String>>;

    /// Committer time of `revision`.
    fn commit_time(&self, repo: &Path, revision: &str) -> Result<SystemTime>;

    /// Drop administrative data for worktrees that no longer exist.
    fn prune(&self, repo: &Path) -> Result<()>;
}

/// [`VersionControl`] backed by the `git` command line.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }

    /// Use a specific git binary.
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Whether git can be found on `PATH`.
    #[must_use]
    pub fn is_available() -> bool {
        which::which("git").is_ok()
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.current_dir(dir)
            .args([
                "-c",
                "user.name=lintfix",
                "-c",
                "user.email=lintfix@localhost",
                "-c",
                "commit.gpgsign=false",
            ])
            .env("CLAUDE_CODE_FIX_IN_PROGRESS", "1");
        cmd
    }

    /// Run git in `dir`, returning stdout.
    fn run(&self, dir: &Path, operation: &str, args: &[&str]) -> Result<String> {
        trace!(dir = %dir.display(), ?args, "git");
        let output = self
            .command(dir)
            .args(args)
            .output()
            .map_err(|e| FixError::git(operation, format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(FixError::git(operation, detail.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn path_arg(path: &Path) -> String {
        path.display().to_string()
    }
}

impl VersionControl for GitCli {
    fn repo_root(&self, path: &Path) -> Result<PathBuf> {
        let dir = if path.is_dir() {
            path
        } else {
            path.parent().unwrap_or(Path::new("."))
        };
        let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };

        match self.run(dir, "rev-parse", &["rev-parse", "--show-toplevel"]) {
            Ok(out) => Ok(PathBuf::from(out.trim())),
            Err(_) => Err(FixError::NotARepository {
                path: path.to_path_buf(),
            }),
        }
    }

    fn head_revision(&self, repo: &Path) -> Result<String> {
        Ok(self
            .run(repo, "rev-parse HEAD", &["rev-parse", "HEAD"])?
            .trim()
            .to_string())
    }

    fn create_isolated_copy(&self, repo: &Path, dest: &Path) -> Result<()> {
        let dest = Self::path_arg(dest);
        self.run(
            repo,
            "worktree add",
            &["worktree", "add", "--detach", &dest, "HEAD"],
        )?;
        debug!(path = %dest, "Created worktree");
        Ok(())
    }

    fn remove_isolated_copy(&self, repo: &Path, dest: &Path) -> Result<()> {
        let dest = Self::path_arg(dest);
        self.run(
            repo,
            "worktree remove",
            &["worktree", "remove", "--force", &dest],
        )?;
        Ok(())
    }

    fn checkout(&self, dir: &Path, revision: &str) -> Result<()> {
        self.run(dir, "checkout", &["checkout", "-q", "--detach", revision])?;
        Ok(())
    }

    fn stage(&self, dir: &Path, rel: &Path) -> Result<()> {
        let rel = Self::path_arg(rel);
        self.run(dir, "add", &["add", "--", &rel])?;
        Ok(())
    }

    fn diff(&self, dir: &Path, rel: &Path) -> Result<String> {
        let rel = Self::path_arg(rel);
        self.run(dir, "diff", &["diff", "--full-index", "--", &rel])
    }

    fn apply(&self, dir: &Path, patch: &str) -> Result<()> {
        let mut child = self
            .command(dir)
            .args(["apply", "--3way", "--whitespace=fix", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FixError::git("apply", format!("failed to run git: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(patch.as_bytes())
                .map_err(|e| FixError::git("apply", format!("failed to write patch: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| FixError::git("apply", e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FixError::git("apply", stderr.trim().to_string()));
        }
        Ok(())
    }

    fn commit(&self, dir: &Path, rel: &Path, message: &str) -> Result<()> {
        self.stage(dir, rel)?;
        self.run(
            dir,
            "commit",
            &["commit", "--no-verify", "--allow-empty", "-m", message],
        )?;
        Ok(())
    }

    fn commit_on_branch(&self, dir: &Path, branch: &str, rel: &Path, message: &str) -> Result<()> {
        self.run(dir, "checkout -b", &["checkout", "-q", "-b", branch])?;
        self.commit(dir, rel, message)
    }

    fn merge_branches(&self, dir: &Path, branches: &[String], message: &str) -> Result<()> {
        let mut args = vec!["merge", "--no-ff", "--no-verify", "-m", message];
        args.extend(branches.iter().map(String::as_str));
        self.run(dir, "merge", &args)?;
        Ok(())
    }

    fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run(repo, "branch -D", &["branch", "-D", branch])?;
        Ok(())
    }

    fn list_branches(&self, repo: &Path, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        let out = self.run(
            repo,
            "branch --list",
            &["branch", "--list", &pattern, "--format=%(refname:short)"],
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn commit_time(&self, repo: &Path, revision: &str) -> Result<SystemTime> {
        let out = self.run(repo, "log", &["log", "-1", "--format=%ct", revision, "--"])?;
        let secs: u64 = out
            .trim()
            .parse()
            .map_err(|e| FixError::git("log", format!("unexpected commit time {:?}: {e}", out.trim())))?;
        Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    fn prune(&self, repo: &Path) -> Result<()> {
        self.run(repo, "worktree prune", &["worktree", "prune"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::GitRepoFixture;

    #[test]
    fn test_repo_root_outside_repository() {
        if !GitCli::is_available() {
            return;
        }
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("a.py");
        std::fs::write(&file, "x = 1\n").unwrap();
        // A temp dir can still sit inside some repository; only assert the error type when it does not.
        if let Err(e) = GitCli::new().repo_root(&file) {
            assert!(matches!(e, FixError::NotARepository { .. }));
        }
    }

    #[test]
    fn test_worktree_lifecycle() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let git = GitCli::new();
        let root = git.repo_root(&repo.file("app.py")).unwrap();
        assert_eq!(root.canonicalize().unwrap(), repo.path().canonicalize().unwrap());

        let dest = repo.path().join(".claude/worktrees/linter-fix-test");
        git.create_isolated_copy(repo.path(), &dest).unwrap();
        assert!(dest.join("app.py").exists());

        git.remove_isolated_copy(repo.path(), &dest).unwrap();
        assert!(!dest.exists());
        git.prune(repo.path()).unwrap();
    }

    #[test]
    fn test_diff_against_staged_content_applies_three_way() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let git = GitCli::new();
        let rel = Path::new("app.py");
        let base = "a = 1\nb = 2\nc = 3\nd = 4\ne = 5\nf = 6\ng = 7\nh = 8\n";

        let make_patch = |name: &str, from: &str, to: &str| {
            let dest = repo.path().join(format!(".claude/worktrees/{name}"));
            git.create_isolated_copy(repo.path(), &dest).unwrap();
            std::fs::write(dest.join(rel), base).unwrap();
            git.stage(&dest, rel).unwrap();
            std::fs::write(dest.join(rel), base.replace(from, to)).unwrap();
            let patch = git.diff(&dest, rel).unwrap();
            git.remove_isolated_copy(repo.path(), &dest).unwrap();
            patch
        };
        let first = make_patch("one", "a = 1", "a = 10");
        let second = make_patch("two", "h = 8", "h = 80");
        assert!(first.contains("+a = 10"));

        let scratch = repo.path().join(".claude/worktrees/merge");
        git.create_isolated_copy(repo.path(), &scratch).unwrap();
        std::fs::write(scratch.join(rel), base).unwrap();
        git.commit(&scratch, rel, "base").unwrap();
        git.apply(&scratch, &first).unwrap();
        git.apply(&scratch, &second).unwrap();

        let merged = std::fs::read_to_string(scratch.join(rel)).unwrap();
        assert!(merged.contains("a = 10"));
        assert!(merged.contains("h = 80"));
        git.remove_isolated_copy(repo.path(), &scratch).unwrap();
    }

    #[test]
    fn test_branch_commit_merge_and_cleanup() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let git = GitCli::new();
        let rel = Path::new("app.py");
        let original = std::fs::read_to_string(repo.file("app.py")).unwrap();

        for (name, line) in [("linter-fix-aaaa", "top = 1\n"), ("linter-fix-bbbb", "")] {
            let dest = repo.path().join(format!(".claude/worktrees/{name}"));
            git.create_isolated_copy(repo.path(), &dest).unwrap();
            let content = if line.is_empty() {
                format!("{original}bottom = 2\n")
            } else {
                format!("{line}{original}")
            };
            std::fs::write(dest.join(rel), content).unwrap();
            git.commit_on_branch(&dest, name, rel, "fix").unwrap();
            git.remove_isolated_copy(repo.path(), &dest).unwrap();
        }

        let branches = git.list_branches(repo.path(), "linter-fix-").unwrap();
        assert_eq!(branches, vec!["linter-fix-aaaa", "linter-fix-bbbb"]);

        let scratch = repo.path().join(".claude/worktrees/merge");
        git.create_isolated_copy(repo.path(), &scratch).unwrap();
        git.merge_branches(&scratch, &branches, "Merge linter fixes").unwrap();
        let merged = std::fs::read_to_string(scratch.join(rel)).unwrap();
        assert!(merged.starts_with("top = 1\n"));
        assert!(merged.ends_with("bottom = 2\n"));
        git.remove_isolated_copy(repo.path(), &scratch).unwrap();

        for branch in &branches {
            git.delete_branch(repo.path(), branch).unwrap();
        }
        assert!(git.list_branches(repo.path(), "linter-fix-").unwrap().is_empty());
    }

    #[test]
    fn test_git_error_carries_operation() {
        let Some(repo) = GitRepoFixture::new() else {
            return;
        };
        let err = GitCli::new()
            .delete_branch(repo.path(), "does-not-exist")
            .unwrap_err();
        match err {
            FixError::Git { operation, .. } => assert_eq!(operation, "branch -D"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Git command execution abstraction

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;

use async_trait::async_trait;
use mend_core::{MendError, Result};
use tokio::process::Command;
use tracing::debug;

/// Output from a git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a git command in the repository root
    async fn exec(&self, args: &[&str]) -> Result<GitOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect the repository root from the given directory
    pub async fn detect(dir: impl AsRef<Path>) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir.as_ref())
            .output()
            .await
            .map_err(|e| MendError::GitCommand(format!("failed to run git rev-parse: {e}")))?;

        if !output.status.success() {
            return Err(MendError::GitCommand("not in a git repository".to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!(repo = %self.repo_root.display(), "executing git {args:?}");

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| MendError::GitCommand(format!("failed to execute git: {e}")))?;

        let git_output = GitOutput::from(output);
        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr);
        }
        Ok(git_output)
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Mock git executor for testing
pub struct MockGit {
    repo_root: PathBuf,
    responses: Mutex<HashMap<String, GitOutput>>,
}

impl MockGit {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            responses: Mutex::new(HashMap::new()),
        }
    }

    /// Script the response for a space-joined argument list.
    pub fn respond(&self, args: &str, stdout: &str, success: bool) {
        self.responses.lock().unwrap().insert(
            args.to_string(),
            GitOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                success,
            },
        );
    }
}

#[async_trait]
impl GitExecutor for MockGit {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        let key = args.join(" ");
        self.responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| MendError::GitCommand(format!("unscripted git command: {key}")))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Fail when the repository is mid-merge or mid-rebase.
pub async fn require_normal_git_state(git: &dyn GitExecutor) -> Result<()> {
    let out = git.exec(&["rev-parse", "--git-dir"]).await?;
    if !out.success {
        return Err(MendError::GitState(format!(
            "unable to locate git dir: {}",
            out.stderr
        )));
    }
    let git_dir = git.repo_root().join(out.stdout.trim());
    for (marker, state) in [
        ("MERGE_HEAD", "merge"),
        ("rebase-merge", "rebase"),
        ("rebase-apply", "rebase"),
    ] {
        if git_dir.join(marker).exists() {
            return Err(MendError::GitState(format!(
                "git is in the middle of a {state}; finish or abort it first"
            )));
        }
    }
    Ok(())
}

/// Fail when the working tree has uncommitted changes.
pub async fn require_no_uncommitted_changes(git: &dyn GitExecutor) -> Result<()> {
    let out = git.exec(&["status", "--porcelain"]).await?;
    if !out.success {
        return Err(MendError::GitState(format!("git status failed: {}", out.stderr)));
    }
    if !out.stdout.trim().is_empty() {
        return Err(MendError::GitState(format!(
            "the working tree has uncommitted changes; commit or stash them first:\n{}",
            out.stdout.trim_end()
        )));
    }
    Ok(())
}

/// Current HEAD commit hash.
pub async fn current_commit(git: &dyn GitExecutor) -> Result<String> {
    let out = git.exec(&["rev-parse", "HEAD"]).await?;
    if !out.success {
        return Err(MendError::GitCommand(format!("rev-parse HEAD failed: {}", out.stderr)));
    }
    Ok(out.stdout.trim().to_string())
}

/// Absolute paths of files that differ between two commits.
pub async fn changed_files(git: &dyn GitExecutor, from: &str, to: &str) -> Result<Vec<PathBuf>> {
    let out = git
        .exec(&["diff", "--name-only", "-z", from, to])
        .await?;
    if !out.success {
        return Err(MendError::GitCommand(format!("git diff failed: {}", out.stderr)));
    }
    Ok(out
        .stdout
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(|s| git.repo_root().join(s))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_scripts_responses() {
        let git = MockGit::new("/repo");
        git.respond("rev-parse HEAD", "abc123\n", true);
        assert_eq!(current_commit(&git).await.unwrap(), "abc123");
        assert!(current_commit(&MockGit::new("/repo")).await.is_err());
    }

    #[tokio::test]
    async fn dirty_tree_is_rejected() {
        let git = MockGit::new("/repo");
        git.respond("status --porcelain", " M src/lib.rs\n", true);
        let err = require_no_uncommitted_changes(&git).await.unwrap_err();
        assert!(err.to_string().contains("uncommitted changes"), "got: {err}");

        git.respond("status --porcelain", "", true);
        require_no_uncommitted_changes(&git).await.unwrap();
    }

    #[tokio::test]
    async fn changed_files_are_rooted() {
        let git = MockGit::new("/repo");
        git.respond(
            "diff --name-only -z abc def",
            "src/a.rs\0src/b.rs\0",
            true,
        );
        let files = changed_files(&git, "abc", "def").await.unwrap();
        assert_eq!(
            files,
            vec![PathBuf::from("/repo/src/a.rs"), PathBuf::from("/repo/src/b.rs")]
        );
    }

    #[tokio::test]
    async fn real_repo_round_trip() {
        // Exercises the real executor when git is available.
        let Ok(dir) = tempfile::TempDir::new() else {
            return;
        };
        let run = |args: &[&str], cwd: &Path| {
            let out = std::process::Command::new("git")
                .args(args)
                .current_dir(cwd)
                .env("GIT_AUTHOR_NAME", "t")
                .env("GIT_AUTHOR_EMAIL", "t@example.com")
                .env("GIT_COMMITTER_NAME", "t")
                .env("GIT_COMMITTER_EMAIL", "t@example.com")
                .output();
            matches!(out, Ok(o) if o.status.success())
        };
        if !run(&["init", "-q"], dir.path()) {
            return; // git unavailable
        }
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        assert!(run(&["add", "."], dir.path()));
        assert!(run(&["commit", "-q", "-m", "initial"], dir.path()));

        let git = GitCommand::detect(dir.path()).await.unwrap();
        require_normal_git_state(&git).await.unwrap();
        require_no_uncommitted_changes(&git).await.unwrap();
        let head = current_commit(&git).await.unwrap();
        assert_eq!(head.len(), 40);
    }
}

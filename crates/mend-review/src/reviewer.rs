//! The differential code reviewer and its tool surface.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use mend_core::{MendError, Result};
use mend_llm::{ContentBlock, Tool};
use serde_json::json;
use tracing::{debug, info};

use crate::analyzer_stage::{
    find_analyzer_regressions, format_analyzer_regressions, run_analyzer,
};
use crate::git::{
    changed_files, current_commit, require_no_uncommitted_changes, require_normal_git_state,
    GitExecutor,
};
use crate::lint_stage::{
    find_lint_regressions, format_lint_regressions, has_issues, run_lints,
};
use crate::packages::{load_metadata, packages_for_files};
use crate::test_stage::{compare_test_results, format_test_regressions, run_tests};

#[derive(Default)]
struct ReviewState {
    /// Detached worktree at the initial commit, created lazily, reused.
    initial_worktree: Option<PathBuf>,
    /// HEAD hashes this reviewer has already reviewed.
    reviewed: Vec<String>,
}

/// Compares test, lint, and analyzer state between a fixed initial commit
/// and HEAD, reporting only regressions.
pub struct CodeReviewer {
    git: Arc<dyn GitExecutor>,
    initial_commit: String,
    state: Mutex<ReviewState>,
}

impl CodeReviewer {
    pub fn new(git: Arc<dyn GitExecutor>, initial_commit: impl Into<String>) -> Self {
        Self {
            git,
            initial_commit: initial_commit.into(),
            state: Mutex::new(ReviewState::default()),
        }
    }

    pub fn initial_commit(&self) -> &str {
        &self.initial_commit
    }

    pub fn is_initial_commit(&self, commit: &str) -> bool {
        commit == self.initial_commit
    }

    pub fn has_reviewed(&self, commit: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .reviewed
            .iter()
            .any(|c| c == commit)
    }

    pub async fn require_normal_git_state(&self) -> Result<()> {
        require_normal_git_state(self.git.as_ref()).await
    }

    pub async fn require_no_uncommitted_changes(&self) -> Result<()> {
        require_no_uncommitted_changes(self.git.as_ref()).await
    }

    pub async fn current_commit(&self) -> Result<String> {
        current_commit(self.git.as_ref()).await
    }

    /// Run the full review pipeline; returns the regression report, or
    /// "OK" when nothing regressed.
    pub async fn run(&self) -> Result<String> {
        self.require_normal_git_state().await?;
        self.require_no_uncommitted_changes().await?;

        let head = self.current_commit().await?;
        if self.is_initial_commit(&head) {
            return Err(MendError::Review(
                "no new commits have been added, nothing to review".to_string(),
            ));
        }

        // No matter what fails from here on, the commit counts as
        // reviewed so a broken review tool never blocks the agent.
        self.state.lock().unwrap().reviewed.push(head.clone());

        let changed = changed_files(self.git.as_ref(), &self.initial_commit, &head).await?;
        debug!(files = changed.len(), "collected changed files");

        let repo_root = self.git.repo_root().clone();
        let metadata = load_metadata(&repo_root).await?;
        let (direct_packages, all_packages) = packages_for_files(&metadata, &changed)?;
        info!(
            direct = ?direct_packages,
            impacted = ?all_packages,
            "resolved impacted packages"
        );

        let mut sections = Vec::new();

        if let Some(msg) = self.check_tests(&repo_root, &all_packages).await? {
            sections.push(msg);
        }
        if let Some(msg) = self.check_lints(&repo_root, &direct_packages).await? {
            sections.push(msg);
        }
        if let Some(msg) = self.check_analyzer(&repo_root, &changed).await? {
            sections.push(msg);
        }

        if sections.is_empty() {
            debug!("no issues found");
            return Ok("OK".to_string());
        }
        Ok(sections.join("\n\n"))
    }

    async fn check_tests(&self, repo_root: &PathBuf, packages: &[String]) -> Result<Option<String>> {
        if packages.is_empty() {
            return Ok(None);
        }
        let (after_events, all_passed) = run_tests(repo_root, packages).await?;
        if all_passed {
            return Ok(None);
        }

        let worktree = self.ensure_initial_worktree().await?;
        let (before_events, _) = run_tests(&worktree, packages).await?;

        let regressions = compare_test_results(&before_events, &after_events);
        if regressions.is_empty() {
            return Ok(None);
        }
        Ok(Some(format_test_regressions(&self.initial_commit, &regressions)))
    }

    async fn check_lints(&self, repo_root: &PathBuf, packages: &[String]) -> Result<Option<String>> {
        if packages.is_empty() {
            return Ok(None);
        }
        let after = run_lints(repo_root, packages).await?;
        if !has_issues(&after) {
            return Ok(None);
        }

        let worktree = self.ensure_initial_worktree().await?;
        let before = run_lints(&worktree, packages).await?;

        let regressions = find_lint_regressions(&before, &after);
        if !has_issues(&regressions) {
            return Ok(None);
        }
        Ok(Some(format_lint_regressions(&regressions)))
    }

    async fn check_analyzer(
        &self,
        repo_root: &PathBuf,
        changed: &[PathBuf],
    ) -> Result<Option<String>> {
        let Some(after) = run_analyzer(repo_root, changed).await? else {
            return Ok(None);
        };
        if after.is_empty() {
            return Ok(None);
        }

        let worktree = self.ensure_initial_worktree().await?;
        let worktree_files: Vec<PathBuf> = changed
            .iter()
            .filter_map(|f| f.strip_prefix(repo_root).ok())
            .map(|rel| worktree.join(rel))
            .collect();
        let before = run_analyzer(&worktree, &worktree_files)
            .await?
            .unwrap_or_default();

        let regressions = find_analyzer_regressions(&before, &after);
        if regressions.is_empty() {
            return Ok(None);
        }
        Ok(Some(format_analyzer_regressions(&regressions)))
    }

    /// Create (once) and return the detached worktree at the initial
    /// commit.
    async fn ensure_initial_worktree(&self) -> Result<PathBuf> {
        if let Some(existing) = self.state.lock().unwrap().initial_worktree.clone() {
            return Ok(existing);
        }
        let dir = std::env::temp_dir().join(format!(
            "mend-review-worktree-{}",
            &self.initial_commit[..self.initial_commit.len().min(12)]
        ));
        let dir_str = dir.to_string_lossy().to_string();
        let out = self
            .git
            .exec(&["worktree", "add", "--detach", &dir_str, &self.initial_commit])
            .await?;
        if !out.success {
            return Err(MendError::Review(format!(
                "unable to create worktree for initial commit: {}",
                out.stderr
            )));
        }
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.initial_worktree.clone() {
            return Ok(existing);
        }
        state.initial_worktree = Some(dir.clone());
        Ok(dir)
    }

    /// The codereview tool: empty input, human-readable report out.
    pub fn tool(self: &Arc<Self>) -> Tool {
        let reviewer = self.clone();
        Tool::new(
            "codereview",
            "Run an automated code review.",
            json!({"type": "object"}),
            move |_ctx, _input| {
                let reviewer = reviewer.clone();
                async move {
                    let report = reviewer.run().await?;
                    Ok(vec![ContentBlock::text(report)])
                }
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::MockGit;

    fn reviewer_with(git: MockGit) -> Arc<CodeReviewer> {
        Arc::new(CodeReviewer::new(Arc::new(git), "base000"))
    }

    #[tokio::test]
    async fn dirty_tree_blocks_review() {
        let git = MockGit::new("/repo");
        git.respond("rev-parse --git-dir", ".git\n", true);
        git.respond("status --porcelain", " M src/lib.rs\n", true);
        let reviewer = reviewer_with(git);
        let err = reviewer.run().await.unwrap_err();
        assert!(err.to_string().contains("uncommitted changes"), "got: {err}");
    }

    #[tokio::test]
    async fn initial_commit_head_has_nothing_to_review() {
        let git = MockGit::new("/repo");
        git.respond("rev-parse --git-dir", ".git\n", true);
        git.respond("status --porcelain", "", true);
        git.respond("rev-parse HEAD", "base000\n", true);
        let reviewer = reviewer_with(git);
        let err = reviewer.run().await.unwrap_err();
        assert!(
            err.to_string().contains("no new commits have been added"),
            "got: {err}"
        );
        assert!(!reviewer.has_reviewed("base000"));
    }

    #[tokio::test]
    async fn review_marks_head_reviewed_even_when_later_stages_fail() {
        let git = MockGit::new("/repo");
        git.respond("rev-parse --git-dir", ".git\n", true);
        git.respond("status --porcelain", "", true);
        git.respond("rev-parse HEAD", "head111\n", true);
        // changed_files is unscripted, so the pipeline fails after the
        // reviewed-mark is taken.
        let reviewer = reviewer_with(git);
        assert!(reviewer.run().await.is_err());
        assert!(reviewer.has_reviewed("head111"));
        assert!(!reviewer.has_reviewed("other222"));
    }

    #[test]
    fn is_initial_commit() {
        let git = MockGit::new("/repo");
        let reviewer = reviewer_with(git);
        assert!(reviewer.is_initial_commit("base000"));
        assert!(!reviewer.is_initial_commit("head111"));
    }
}

//! Detects commits produced by the agent's tools and the branches they
//! were pushed to.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use mend_core::{Commit, Result};
use mend_review::GitExecutor;
use tracing::debug;

/// Tracks which commits have already been reported during the session.
pub struct CommitDetector {
    git: Arc<dyn GitExecutor>,
    initial_commit: String,
    branch_prefix: String,
    seen: Mutex<HashSet<String>>,
}

impl CommitDetector {
    pub fn new(
        git: Arc<dyn GitExecutor>,
        initial_commit: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            git,
            initial_commit: initial_commit.into(),
            branch_prefix: branch_prefix.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Commits reachable from HEAD but not the initial commit that have
    /// not been reported yet, newest first. The newest commit is enriched
    /// with the agent branch pointing at it, if any.
    pub async fn detect_new_commits(&self) -> Result<Vec<Commit>> {
        let range = format!("{}..HEAD", self.initial_commit);
        let out = self
            .git
            .exec(&["log", "--format=%H%x00%h%x00%s", &range])
            .await?;
        if !out.success {
            // HEAD may not have moved yet (e.g. unborn branch states).
            debug!(stderr = %out.stderr, "git log failed during commit detection");
            return Ok(Vec::new());
        }

        let mut commits = Vec::new();
        {
            let mut seen = self.seen.lock().unwrap();
            for line in out.stdout.lines() {
                let mut parts = line.splitn(3, '\0');
                let (Some(hash), Some(short), Some(subject)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                if !seen.insert(hash.to_string()) {
                    continue;
                }
                commits.push(Commit {
                    hash: hash.to_string(),
                    short_hash: short.to_string(),
                    subject: subject.to_string(),
                    pushed_branch: None,
                });
            }
        }

        if let Some(newest) = commits.first_mut() {
            newest.pushed_branch = self.branch_pointing_at(&newest.hash).await;
        }
        Ok(commits)
    }

    /// The agent-prefixed branch pointing at `hash`, if one exists.
    async fn branch_pointing_at(&self, hash: &str) -> Option<String> {
        let out = self
            .git
            .exec(&[
                "for-each-ref",
                "--format=%(refname:short)",
                "--points-at",
                hash,
                "refs/heads",
            ])
            .await
            .ok()?;
        if !out.success {
            return None;
        }
        out.stdout
            .lines()
            .map(str::trim)
            .find(|b| b.starts_with(&self.branch_prefix))
            .map(String::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_review::MockGit;

    fn detector(git: MockGit) -> CommitDetector {
        CommitDetector::new(Arc::new(git), "base000", "mend/")
    }

    #[tokio::test]
    async fn detects_commits_once() {
        let git = MockGit::new("/repo");
        git.respond(
            "log --format=%H%x00%h%x00%s base000..HEAD",
            "aaa111\0aaa\0fix the bug\nbbb222\0bbb\0add a test\n",
            true,
        );
        git.respond(
            "for-each-ref --format=%(refname:short) --points-at aaa111 refs/heads",
            "mend/fix-bug\nmain\n",
            true,
        );
        let det = detector(git);

        let commits = det.detect_new_commits().await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaa111");
        assert_eq!(commits[0].short_hash, "aaa");
        assert_eq!(commits[0].subject, "fix the bug");
        assert_eq!(commits[0].pushed_branch.as_deref(), Some("mend/fix-bug"));
        assert_eq!(commits[1].pushed_branch, None);

        // A second scan reports nothing new.
        let again = det.detect_new_commits().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn failed_log_is_not_fatal() {
        let git = MockGit::new("/repo");
        git.respond("log --format=%H%x00%h%x00%s base000..HEAD", "", false);
        let det = detector(git);
        assert!(det.detect_new_commits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_prefixed_branches_are_not_reported() {
        let git = MockGit::new("/repo");
        git.respond(
            "log --format=%H%x00%h%x00%s base000..HEAD",
            "ccc333\0ccc\0tweak\n",
            true,
        );
        git.respond(
            "for-each-ref --format=%(refname:short) --points-at ccc333 refs/heads",
            "main\nfeature/x\n",
            true,
        );
        let det = detector(git);
        let commits = det.detect_new_commits().await.unwrap();
        assert_eq!(commits[0].pushed_branch, None);
    }
}

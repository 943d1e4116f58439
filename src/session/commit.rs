//! Committing a finished session's changes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::SessionError;

/// Stages and commits the working tree after a successful session, and
/// throws it away after a failed one.
#[async_trait]
pub trait Committer: Send + Sync {
    /// Commit all changes with `message`.
    ///
    /// Returns the new commit id, or `None` when there was nothing to commit.
    async fn commit(&self, message: &str) -> Result<Option<String>, SessionError>;

    /// Drop every uncommitted change, staged or not, including untracked files.
    async fn discard(&self) -> Result<(), SessionError>;
}

/// `git`-backed committer for one repository checkout.
///
/// Sessions running in parallel slots share one instance, so commits on the
/// same checkout are serialized by the internal lock.
pub struct GitCommitter {
    repo: PathBuf,
    lock: Mutex<()>,
}

impl GitCommitter {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output, SessionError> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await
            .map_err(|e| SessionError::CommitFailed(format!("failed to run git {}: {e}", args[0])))
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String, SessionError> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(SessionError::CommitFailed(format!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Committer for GitCommitter {
    async fn commit(&self, message: &str) -> Result<Option<String>, SessionError> {
        let _guard = self.lock.lock().await;

        self.git_ok(&["add", "-A"]).await?;

        // Exit 0 means nothing is staged.
        let staged = self.git(&["diff", "--cached", "--quiet"]).await?;
        match staged.status.code() {
            Some(0) => {
                tracing::info!(repo = %self.repo.display(), "Nothing to commit");
                return Ok(None);
            }
            Some(1) => {}
            _ => {
                return Err(SessionError::CommitFailed(format!(
                    "git diff --cached failed: {}",
                    String::from_utf8_lossy(&staged.stderr).trim()
                )));
            }
        }

        self.git_ok(&["commit", "-m", message]).await?;
        let sha = self.git_ok(&["rev-parse", "HEAD"]).await?;
        tracing::info!(repo = %self.repo.display(), commit = %sha, "Committed session changes");
        Ok(Some(sha))
    }

    async fn discard(&self) -> Result<(), SessionError> {
        let _guard = self.lock.lock().await;
        // A failed commit can leave changes staged, so reset the index too.
        self.git_ok(&["reset", "--hard", "HEAD"]).await?;
        self.git_ok(&["clean", "-fd"]).await?;
        tracing::info!(repo = %self.repo.display(), "Discarded session changes");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outside_a_repository_commit_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let committer = GitCommitter::new(dir.path());
        // Either git is missing or the directory is not a repository;
        // both must surface as a commit failure, never as success.
        let result = committer.commit("msg").await;
        assert!(matches!(result, Err(SessionError::CommitFailed(_))));
        assert!(matches!(
            committer.discard().await,
            Err(SessionError::CommitFailed(_))
        ));
    }
}

//! Git-specific error handling.
//!
//! Errors from the Git tool are a tagged variant set: stderr is inspected
//! once at the invocation site and mapped to the matching variant, so
//! callers branch on variants instead of re-parsing messages.

use std::time::Duration;

use thiserror::Error;

use crate::error::codes;

#[derive(Error, Debug)]
pub enum GitError {
    /// Git executable was not found on the system
    #[error("git not found")]
    NotAvailable,

    /// Rebase or merge stopped on conflicting changes
    #[error("conflicts detected: {0}")]
    ConflictsDetected(String),

    /// Rebase refused to join unrelated histories
    #[error("unrelated histories: {0}")]
    UnrelatedHistories(String),

    /// Fetching from the remote failed
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The base branch does not exist on the remote
    #[error("base branch missing on remote: {0}")]
    BaseBranchMissing(String),

    /// The remote rejected our credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The remote rejected the push (e.g. non-fast-forward)
    #[error("push rejected: {0}")]
    PushRejected(String),

    /// Commit was requested with an empty index and clean tree
    #[error("nothing to commit")]
    NothingToCommit,

    /// The working directory is not inside a Git repository
    #[error("not a git repository: {0}")]
    NotARepository(String),

    /// A worktree add/remove/prune invocation failed
    #[error("worktree operation failed: {0}")]
    WorktreeFailed(String),

    /// The invocation exceeded its bounded timeout
    #[error("git timed out after {0:?}")]
    Timeout(Duration),

    /// IO error spawning or talking to the git process
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Git command failed with a non-zero exit code, unclassified
    #[error("git failed: {stderr}")]
    Failed {
        /// Exit code from git (if available)
        code: Option<i32>,
        /// Error output from git
        stderr: String,
    },
}

impl GitError {
    /// Get the stable taxonomy code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GitError::ConflictsDetected(_) | GitError::UnrelatedHistories(_) => {
                codes::GIT_REBASE_CONFLICTS
            }
            GitError::FetchFailed(_) | GitError::BaseBranchMissing(_) => codes::GIT_FETCH_FAILED,
            GitError::AuthFailed(_) | GitError::PushRejected(_) => codes::GIT_PUSH_FAILED,
            GitError::NothingToCommit => codes::GIT_COMMIT_FAILED,
            GitError::WorktreeFailed(_) => codes::GIT_WORKTREE_FAILED,
            GitError::Timeout(_) => codes::GIT_TIMEOUT,
            GitError::NotARepository(_) => codes::INVALID_REPO,
            GitError::Io(_) => codes::IO_FAILED,
            GitError::NotAvailable | GitError::Failed { .. } => codes::UNKNOWN,
        }
    }
}

/// Map a failed invocation's stderr to a tagged variant. Called exactly once
/// per failed invocation; patterns cover the messages git emits for the
/// operations the driver runs.
pub(super) fn classify_failure(code: Option<i32>, stderr: &str) -> GitError {
    let trimmed = stderr.trim().to_string();
    let lower = trimmed.to_lowercase();

    if lower.contains("not a git repository") {
        return GitError::NotARepository(trimmed);
    }
    if lower.contains("refusing to merge unrelated histories") {
        return GitError::UnrelatedHistories(trimmed);
    }
    if lower.contains("conflict")
        || lower.contains("could not apply")
        || lower.contains("needs merge")
    {
        return GitError::ConflictsDetected(trimmed);
    }
    if lower.contains("authentication failed")
        || lower.contains("could not read username")
        || lower.contains("permission denied (publickey")
    {
        return GitError::AuthFailed(trimmed);
    }
    if lower.contains("[rejected]")
        || lower.contains("failed to push some refs")
        || lower.contains("non-fast-forward")
    {
        return GitError::PushRejected(trimmed);
    }
    if lower.contains("couldn't find remote ref") || lower.contains("could not find remote ref") {
        return GitError::BaseBranchMissing(trimmed);
    }
    if lower.contains("could not read from remote repository")
        || lower.contains("unable to access")
        || lower.contains("could not resolve host")
    {
        return GitError::FetchFailed(trimmed);
    }
    if lower.contains("nothing to commit") || lower.contains("nothing added to commit") {
        return GitError::NothingToCommit;
    }

    GitError::Failed {
        code,
        stderr: trimmed,
    }
}

//! High-level operations: commit, push, merge, rebase, stash.

use std::path::{Path, PathBuf};

use crate::git::error::GitError;
use crate::git::runner::GitDriver;
use crate::git::types::{CommitRecord, RebaseOutcome};

const AUTO_STASH_MESSAGE: &str = "agent-session-engine: auto-stash";

impl GitDriver {
    /// Stage everything and commit. Returns the resulting commit with its
    /// stat totals and file list.
    pub async fn commit(&self, cwd: &Path, message: &str) -> Result<CommitRecord, GitError> {
        self.run(cwd, ["add", "-A"]).await?;
        self.run(cwd, ["commit", "-m", message]).await?;
        self.head_commit_record(cwd).await
    }

    /// Read HEAD as a [`CommitRecord`].
    pub async fn head_commit_record(&self, cwd: &Path) -> Result<CommitRecord, GitError> {
        let meta = self
            .run(cwd, ["log", "-1", "--format=%H%x1f%h%x1f%an%x1f%aI%x1f%B"])
            .await?;
        let mut record = parse_commit_meta(&meta).ok_or_else(|| GitError::Failed {
            code: None,
            stderr: format!("unparseable commit metadata: {meta}"),
        })?;

        let stat = self
            .run(cwd, ["show", "--shortstat", "--format=", "HEAD"])
            .await?;
        let (files_changed, additions, deletions) = parse_shortstat(&stat);
        record.files_changed = files_changed;
        record.additions = additions;
        record.deletions = deletions;

        let names = self
            .run(cwd, ["show", "--name-only", "--format=", "HEAD"])
            .await?;
        record.files = names
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.to_string())
            .collect();

        Ok(record)
    }

    /// `push -u origin <current-branch>`.
    pub async fn push(&self, cwd: &Path) -> Result<(), GitError> {
        let branch = self.current_branch(cwd).await?;
        self.run(cwd, ["push", "-u", "origin", &branch]).await?;
        Ok(())
    }

    /// Merge `source_branch` into `target_branch` in the main repository,
    /// non-fast-forward, and push the result. The previously checked-out
    /// branch is restored afterwards.
    pub async fn merge(
        &self,
        main_repo: &Path,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<(), GitError> {
        let original = self.current_branch(main_repo).await?;
        self.run(main_repo, ["checkout", target_branch]).await?;

        let message = format!("Merge session branch '{source_branch}' into '{target_branch}'");
        let merged = self
            .run(
                main_repo,
                ["merge", "--no-ff", source_branch, "-m", message.as_str()],
            )
            .await;
        if let Err(err) = merged {
            let _ = self.run(main_repo, ["merge", "--abort"]).await;
            let _ = self.run(main_repo, ["checkout", &original]).await;
            return Err(err);
        }

        let pushed = self
            .run(main_repo, ["push", "-u", "origin", target_branch])
            .await;
        let _ = self.run(main_repo, ["checkout", &original]).await;
        pushed.map(|_| ())
    }

    /// `pull --rebase origin <base>`. On failure the rebase is aborted
    /// (abort failure is ignored; the next operation surfaces it) and the
    /// classified error is returned.
    pub async fn rebase(&self, repo: &Path, base: &str) -> Result<RebaseOutcome, GitError> {
        match self.run(repo, ["pull", "--rebase", "origin", base]).await {
            Ok(out) => Ok(RebaseOutcome {
                ok: true,
                message: out,
            }),
            Err(err) => {
                let _ = self.run(repo, ["rebase", "--abort"]).await;
                Err(err)
            }
        }
    }

    /// Stash the working tree including untracked files. Returns `false`
    /// when there was nothing to stash.
    pub async fn stash_push(&self, repo: &Path) -> Result<bool, GitError> {
        let out = self
            .run(
                repo,
                ["stash", "push", "--include-untracked", "-m", AUTO_STASH_MESSAGE],
            )
            .await?;
        Ok(!out.contains("No local changes to save"))
    }

    pub async fn stash_pop(&self, repo: &Path) -> Result<(), GitError> {
        self.run(repo, ["stash", "pop"]).await?;
        Ok(())
    }

    pub async fn fetch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run(repo, ["fetch", "origin", branch]).await?;
        Ok(())
    }

    pub async fn checkout(&self, repo: &Path, rev: &str) -> Result<(), GitError> {
        self.run(repo, ["checkout", rev]).await?;
        Ok(())
    }

    /// Create `branch` at the current HEAD without switching to it.
    pub async fn create_branch(&self, repo: &Path, branch: &str) -> Result<(), GitError> {
        self.run(repo, ["branch", branch]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GitError> {
        let flag = if force { "-D" } else { "-d" };
        self.run(repo, ["branch", flag, branch]).await?;
        Ok(())
    }

    pub async fn remote_url(&self, repo: &Path) -> Result<String, GitError> {
        self.run(repo, ["remote", "get-url", "origin"]).await
    }

    pub async fn set_remote_url(&self, repo: &Path, url: &str) -> Result<(), GitError> {
        self.run(repo, ["remote", "set-url", "origin", url]).await?;
        Ok(())
    }

    /// Root of the working tree containing `cwd`.
    pub async fn toplevel(&self, cwd: &Path) -> Result<PathBuf, GitError> {
        let out = self.run(cwd, ["rev-parse", "--show-toplevel"]).await?;
        Ok(PathBuf::from(out))
    }

    /// Working tree of the super-project when `repo` is checked out as a
    /// sub-repository, `None` otherwise.
    pub async fn superproject_root(&self, repo: &Path) -> Result<Option<PathBuf>, GitError> {
        let out = self
            .run(repo, ["rev-parse", "--show-superproject-working-tree"])
            .await?;
        if out.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(PathBuf::from(out.trim())))
        }
    }
}

fn parse_commit_meta(meta: &str) -> Option<CommitRecord> {
    let mut fields = meta.splitn(5, '\x1f');
    let hash = fields.next()?.trim().to_string();
    let short_hash = fields.next()?.trim().to_string();
    let author = fields.next()?.trim().to_string();
    let date = fields.next()?.trim().to_string();
    let message = fields.next().unwrap_or_default().trim_end().to_string();
    if hash.is_empty() {
        return None;
    }
    Some(CommitRecord {
        hash,
        short_hash,
        message,
        author,
        date,
        files_changed: 0,
        additions: 0,
        deletions: 0,
        files: Vec::new(),
    })
}

/// Parse ` N files changed, X insertions(+), Y deletions(-)`; the insertion
/// and deletion clauses are each optional.
pub(super) fn parse_shortstat(out: &str) -> (u32, u32, u32) {
    let mut files_changed = 0;
    let mut additions = 0;
    let mut deletions = 0;
    for part in out.trim().split(',') {
        let part = part.trim();
        let Some(value) = part.split_whitespace().next().and_then(|v| v.parse().ok()) else {
            continue;
        };
        if part.contains("file") {
            files_changed = value;
        } else if part.contains("insertion") {
            additions = value;
        } else if part.contains("deletion") {
            deletions = value;
        }
    }
    (files_changed, additions, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commit_meta() {
        let meta = "deadbeefcafe\x1fdeadbee\x1fTest User\x1f2026-08-01T10:00:00+00:00\x1ffeat(auth): add login\n\nbody text\n";
        let record = parse_commit_meta(meta).expect("parse");
        assert_eq!(record.hash, "deadbeefcafe");
        assert_eq!(record.short_hash, "deadbee");
        assert_eq!(record.author, "Test User");
        assert_eq!(record.message, "feat(auth): add login\n\nbody text");
    }

    #[test]
    fn test_parse_shortstat_full() {
        let (files, adds, dels) =
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)");
        assert_eq!((files, adds, dels), (3, 10, 2));
    }

    #[test]
    fn test_parse_shortstat_partial() {
        let (files, adds, dels) = parse_shortstat(" 1 file changed, 5 deletions(-)");
        assert_eq!((files, adds, dels), (1, 0, 5));
        assert_eq!(parse_shortstat(""), (0, 0, 0));
    }
}

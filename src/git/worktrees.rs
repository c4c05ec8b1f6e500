//! Worktree management over `git worktree`.

use std::path::Path;

use crate::git::error::GitError;
use crate::git::runner::GitDriver;
use crate::git::types::WorktreeInfo;

impl GitDriver {
    /// Create `branch` at HEAD when missing, then add a worktree at `path`
    /// checked out on it.
    pub async fn create_worktree(
        &self,
        repo: &Path,
        branch: &str,
        path: &Path,
    ) -> Result<(), GitError> {
        if !self.branch_exists(repo, branch).await? {
            self.run(repo, ["branch", branch]).await?;
        }
        let path_arg = path.to_string_lossy().to_string();
        self.run(repo, ["worktree", "add", path_arg.as_str(), branch])
            .await
            .map_err(worktree_failure)?;
        Ok(())
    }

    /// Force-remove the worktree at `path`, then prune stale metadata.
    pub async fn remove_worktree(
        &self,
        repo: &Path,
        path: &Path,
        force: bool,
    ) -> Result<(), GitError> {
        let path_arg = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_arg);
        self.run(repo, args).await.map_err(worktree_failure)?;
        self.run(repo, ["worktree", "prune"])
            .await
            .map_err(worktree_failure)?;
        Ok(())
    }

    pub async fn prune_worktrees(&self, repo: &Path) -> Result<(), GitError> {
        self.run(repo, ["worktree", "prune"])
            .await
            .map_err(worktree_failure)?;
        Ok(())
    }

    /// Parse `git worktree list --porcelain`, distinguishing the bare entry.
    pub async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>, GitError> {
        let out = self
            .run(repo, ["worktree", "list", "--porcelain"])
            .await
            .map_err(worktree_failure)?;
        Ok(parse_worktree_list(&out))
    }
}

fn worktree_failure(err: GitError) -> GitError {
    match err {
        GitError::Failed { stderr, .. } => GitError::WorktreeFailed(stderr),
        other => other,
    }
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in out.lines() {
        if line.is_empty() {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: path.to_string(),
                branch: None,
                head: None,
                bare: false,
            });
            continue;
        }
        let Some(info) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            info.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            info.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "bare" {
            info.bare = true;
        }
        // "detached" leaves branch as None
    }
    if let Some(info) = current.take() {
        worktrees.push(info);
    }
    worktrees
}

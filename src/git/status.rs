//! Working-tree status and branch introspection.

use std::path::Path;

use crate::git::error::GitError;
use crate::git::runner::GitDriver;
use crate::git::types::{ChangeKind, RepoStatus, StatusChange};

impl GitDriver {
    /// Parse `git status --porcelain` plus tracking information.
    ///
    /// Ahead/behind are computed against `origin/<branch>` when that tracking
    /// ref exists, otherwise both are zero.
    pub async fn status(&self, cwd: &Path) -> Result<RepoStatus, GitError> {
        let branch = self.current_branch(cwd).await?;
        let porcelain = self.run(cwd, ["status", "--porcelain"]).await?;
        let changes = parse_porcelain(&porcelain);

        let (ahead, behind) = self.ahead_behind(cwd, &branch).await;

        Ok(RepoStatus {
            branch,
            ahead,
            behind,
            clean: changes.is_empty(),
            changes,
        })
    }

    /// Current branch short name, or `HEAD` when detached/unborn.
    pub async fn current_branch(&self, cwd: &Path) -> Result<String, GitError> {
        self.run(cwd, ["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    pub async fn branch_exists(&self, cwd: &Path, branch: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{branch}");
        match self
            .run(cwd, ["rev-parse", "--verify", "--quiet", refname.as_str()])
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Failed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn rev_parse(&self, cwd: &Path, rev: &str) -> Result<String, GitError> {
        self.run(cwd, ["rev-parse", rev]).await
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub async fn is_ancestor(
        &self,
        cwd: &Path,
        ancestor: &str,
        descendant: &str,
    ) -> Result<bool, GitError> {
        match self
            .run(cwd, ["merge-base", "--is-ancestor", ancestor, descendant])
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Failed { code: Some(1), .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// All branch short names, local and remote, with the `remotes/origin/`
    /// prefix stripped for display.
    pub async fn list_branches(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let out = self
            .run(
                cwd,
                ["branch", "--all", "--format=%(refname:short)", "--no-color"],
            )
            .await?;
        let mut names: Vec<String> = Vec::new();
        for line in out.lines() {
            let name = line.trim();
            if name.is_empty() || name.ends_with("/HEAD") {
                continue;
            }
            let name = name.strip_prefix("origin/").unwrap_or(name);
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn ahead_behind(&self, cwd: &Path, branch: &str) -> (u32, u32) {
        let tracking = format!("refs/remotes/origin/{branch}");
        if self
            .run(cwd, ["rev-parse", "--verify", "--quiet", tracking.as_str()])
            .await
            .is_err()
        {
            return (0, 0);
        }
        let range = format!("{branch}...origin/{branch}");
        match self
            .run(cwd, ["rev-list", "--left-right", "--count", range.as_str()])
            .await
        {
            Ok(out) => parse_ahead_behind(&out),
            Err(_) => (0, 0),
        }
    }
}

/// Parse `status --porcelain` v1 output into classified changes.
///
/// Everything past the two status columns and the separator space is kept as
/// one path, so names containing tabs or spaces survive intact.
fn parse_porcelain(out: &str) -> Vec<StatusChange> {
    let mut changes = Vec::new();
    for line in out.lines() {
        if line.len() < 4 {
            continue;
        }
        let (xy, rest) = line.split_at(2);
        let pathspec = &rest[1..];
        let staged = xy.as_bytes()[0] as char;
        let unstaged = xy.as_bytes()[1] as char;

        let kind = if xy == "??" {
            ChangeKind::Untracked
        } else {
            match classify_column(staged).or_else(|| classify_column(unstaged)) {
                Some(kind) => kind,
                None => continue,
            }
        };

        // Renames list `old -> new`
        let (path, orig_path) = if kind == ChangeKind::Renamed && pathspec.contains(" -> ") {
            let mut parts = pathspec.splitn(2, " -> ");
            let old = parts.next().unwrap_or_default().to_string();
            let new = parts.next().unwrap_or_default().to_string();
            (new, Some(old))
        } else {
            (pathspec.to_string(), None)
        };

        changes.push(StatusChange {
            kind,
            path: unquote_path(&path),
            orig_path: orig_path.map(|p| unquote_path(&p)),
        });
    }
    changes
}

fn classify_column(column: char) -> Option<ChangeKind> {
    match column {
        'A' => Some(ChangeKind::Added),
        'M' | 'T' => Some(ChangeKind::Modified),
        'D' => Some(ChangeKind::Deleted),
        'R' | 'C' => Some(ChangeKind::Renamed),
        _ => None,
    }
}

/// Git quotes paths containing specials as C-style strings. Undo the common
/// escapes so callers see the real name.
fn unquote_path(path: &str) -> String {
    let inner = match path.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => inner,
        None => return path.to_string(),
    };
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => result.push('\t'),
            Some('n') => result.push('\n'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

fn parse_ahead_behind(out: &str) -> (u32, u32) {
    let mut fields = out.split_whitespace();
    let ahead = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let behind = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    (ahead, behind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_porcelain_classifies_kinds() {
        let out = " M src/main.rs\nA  src/new.rs\n D gone.rs\n?? scratch.txt\n";
        let changes = parse_porcelain(out);
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].path, "src/main.rs");
        assert_eq!(changes[1].kind, ChangeKind::Added);
        assert_eq!(changes[2].kind, ChangeKind::Deleted);
        assert_eq!(changes[3].kind, ChangeKind::Untracked);
        assert_eq!(changes[3].path, "scratch.txt");
    }

    #[test]
    fn test_parse_porcelain_rename() {
        let out = "R  old name.rs -> new name.rs\n";
        let changes = parse_porcelain(out);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Renamed);
        assert_eq!(changes[0].path, "new name.rs");
        assert_eq!(changes[0].orig_path.as_deref(), Some("old name.rs"));
    }

    #[test]
    fn test_parse_porcelain_quoted_tab_path() {
        let out = " M \"with\\ttab.txt\"\n";
        let changes = parse_porcelain(out);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "with\ttab.txt");
    }

    #[test]
    fn test_parse_ahead_behind() {
        assert_eq!(parse_ahead_behind("2\t5"), (2, 5));
        assert_eq!(parse_ahead_behind("0\t0"), (0, 0));
        assert_eq!(parse_ahead_behind("garbage"), (0, 0));
    }
}

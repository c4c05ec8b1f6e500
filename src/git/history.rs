//! Commit history and per-commit diffs.

use std::path::Path;

use crate::git::error::GitError;
use crate::git::operations::parse_shortstat;
use crate::git::runner::GitDriver;
use crate::git::types::{ChangeKind, CommitDiff, CommitFileDiff, CommitRecord};

/// Per-file diff text is truncated at this many bytes.
const DIFF_BYTE_CAP: usize = 64 * 1024;
const DIFF_TRUNCATED_MARKER: &str = "\n... [diff truncated]";

impl GitDriver {
    /// Commits on the current branch since the merge-base with `base_branch`,
    /// newest first, with per-commit shortstat totals.
    ///
    /// Falls back to `<base>..HEAD` when no merge-base resolves, and to the
    /// last `limit` commits when the base branch is unknown entirely.
    pub async fn history(
        &self,
        repo: &Path,
        base_branch: &str,
        limit: usize,
    ) -> Result<Vec<CommitRecord>, GitError> {
        let limit_arg = format!("-n{limit}");
        let format = "--format=%x1e%H%x1f%h%x1f%an%x1f%aI%x1f%s";

        let range = match self.run(repo, ["merge-base", base_branch, "HEAD"]).await {
            Ok(merge_base) => Some(format!("{merge_base}..HEAD")),
            Err(_) => {
                if self.run_check(repo, ["rev-parse", "--verify", "--quiet", base_branch]).await {
                    Some(format!("{base_branch}..HEAD"))
                } else {
                    None
                }
            }
        };

        let out = match &range {
            Some(range) => {
                self.run(
                    repo,
                    ["log", limit_arg.as_str(), format, "--shortstat", range.as_str()],
                )
                .await?
            }
            None => {
                self.run(repo, ["log", limit_arg.as_str(), format, "--shortstat"])
                    .await?
            }
        };

        Ok(parse_history(&out))
    }

    /// Commit hashes after `from` (exclusive) up to `to`, oldest first.
    /// With no watermark, the last `limit` commits of `to` in the same order.
    pub async fn commits_since(
        &self,
        repo: &Path,
        from: Option<&str>,
        to: &str,
        limit: usize,
    ) -> Result<Vec<String>, GitError> {
        let out = match from {
            Some(from) => {
                let range = format!("{from}..{to}");
                self.run(repo, ["rev-list", "--reverse", range.as_str()])
                    .await?
            }
            None => {
                let limit_arg = format!("-n{limit}");
                self.run(repo, ["rev-list", "--reverse", limit_arg.as_str(), to])
                    .await?
            }
        };
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Commit subjects after `from` (exclusive), oldest first.
    pub async fn commit_subjects_since(
        &self,
        repo: &Path,
        from: &str,
    ) -> Result<Vec<String>, GitError> {
        let range = format!("{from}..HEAD");
        let out = self
            .run(repo, ["log", "--reverse", "--format=%s", range.as_str()])
            .await?;
        Ok(out
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(String::from)
            .collect())
    }

    /// Subject line of a single commit.
    pub async fn commit_subject(&self, repo: &Path, hash: &str) -> Result<String, GitError> {
        self.run(repo, ["log", "-1", "--format=%s", hash]).await
    }

    /// Per-file stat and diff text for one commit. Each file's diff is
    /// truncated at a byte cap with a marker.
    pub async fn commit_diff(&self, repo: &Path, hash: &str) -> Result<CommitDiff, GitError> {
        let numstat = self
            .run(repo, ["show", "--numstat", "--format=", hash])
            .await?;
        let name_status = self
            .run(repo, ["show", "--name-status", "--format=", hash])
            .await?;
        let statuses = parse_name_status(&name_status);

        let mut files = Vec::new();
        for (additions, deletions, path) in parse_numstat(&numstat) {
            let status = statuses
                .iter()
                .find(|(entry_path, _)| *entry_path == path)
                .map(|(_, status)| *status)
                .unwrap_or(ChangeKind::Modified);

            let diff = self
                .run(repo, ["show", "--format=", hash, "--", &path])
                .await?;
            let (diff, truncated) = truncate_diff(diff);

            files.push(CommitFileDiff {
                path,
                status,
                additions,
                deletions,
                diff,
                truncated,
            });
        }

        Ok(CommitDiff {
            hash: hash.to_string(),
            files,
        })
    }
}

fn truncate_diff(diff: String) -> (String, bool) {
    if diff.len() <= DIFF_BYTE_CAP {
        return (diff, false);
    }
    let mut cut = DIFF_BYTE_CAP;
    while !diff.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = diff[..cut].to_string();
    truncated.push_str(DIFF_TRUNCATED_MARKER);
    (truncated, true)
}

/// Parse `log --format=%x1e...%s --shortstat` output: records separated by
/// `\x1e`, metadata fields by `\x1f`, a shortstat line trailing each record.
fn parse_history(out: &str) -> Vec<CommitRecord> {
    let mut commits = Vec::new();
    for record in out.split('\x1e') {
        let record = record.trim_matches(['\n', '\r']);
        if record.is_empty() {
            continue;
        }
        let (meta, stat) = match record.find('\n') {
            Some(idx) => (&record[..idx], &record[idx + 1..]),
            None => (record, ""),
        };
        let mut fields = meta.splitn(5, '\x1f');
        let (Some(hash), Some(short_hash), Some(author), Some(date)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        let subject = fields.next().unwrap_or_default();
        let (files_changed, additions, deletions) = parse_shortstat(stat);
        commits.push(CommitRecord {
            hash: hash.trim().to_string(),
            short_hash: short_hash.to_string(),
            message: subject.to_string(),
            author: author.to_string(),
            date: date.to_string(),
            files_changed,
            additions,
            deletions,
            files: Vec::new(),
        });
    }
    commits
}

/// Parse `--numstat` lines: `additions<TAB>deletions<TAB>path`. Fragments
/// after the second tab are rejoined so tab-containing paths survive;
/// binary entries (`-`) count as zero.
fn parse_numstat(out: &str) -> Vec<(u32, u32, String)> {
    let mut entries = Vec::new();
    for line in out.lines() {
        let mut fields = line.splitn(3, '\t');
        let (Some(adds), Some(dels), Some(path)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let additions = adds.parse().unwrap_or(0);
        let deletions = dels.parse().unwrap_or(0);
        entries.push((additions, deletions, path.to_string()));
    }
    entries
}

/// Parse `--name-status` lines: `X<TAB>path` (renames: `RNN<TAB>old<TAB>new`).
fn parse_name_status(out: &str) -> Vec<(String, ChangeKind)> {
    let mut entries = Vec::new();
    for line in out.lines() {
        let mut fields = line.splitn(2, '\t');
        let (Some(status), Some(rest)) = (fields.next(), fields.next()) else {
            continue;
        };
        let kind = match status.chars().next() {
            Some('A') => ChangeKind::Added,
            Some('M') | Some('T') => ChangeKind::Modified,
            Some('D') => ChangeKind::Deleted,
            Some('R') | Some('C') => ChangeKind::Renamed,
            _ => continue,
        };
        // For renames, report the destination path
        let path = if kind == ChangeKind::Renamed {
            rest.rsplit('\t').next().unwrap_or(rest)
        } else {
            rest
        };
        entries.push((path.to_string(), kind));
    }
    entries
}

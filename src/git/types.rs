use serde::{Deserialize, Serialize};

/// Classified change kind from porcelain/name-status output.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Untracked,
}

/// One changed path from `git status`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub kind: ChangeKind,
    pub path: String,
    /// Original path for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_path: Option<String>,
}

/// Summary of a working tree's state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    pub branch: String,
    pub ahead: u32,
    pub behind: u32,
    pub clean: bool,
    pub changes: Vec<StatusChange>,
}

/// A commit as reported to consumers and events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub short_hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
    pub files_changed: u32,
    pub additions: u32,
    pub deletions: u32,
    pub files: Vec<String>,
}

/// One entry from `git worktree list --porcelain`.
///
/// `bare = true` marks the parent repository entry; sweeps skip it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
    pub head: Option<String>,
    pub bare: bool,
}

/// Per-file portion of a commit diff.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFileDiff {
    pub path: String,
    pub status: ChangeKind,
    pub additions: u32,
    pub deletions: u32,
    pub diff: String,
    pub truncated: bool,
}

/// Full diff of one commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitDiff {
    pub hash: String,
    pub files: Vec<CommitFileDiff>,
}

/// Result of a successful rebase cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseOutcome {
    pub ok: bool,
    pub message: String,
}

//! Session data model: identifiers, statuses, processing state, and the
//! descriptor JSON persisted under the per-repo toolkit directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of agent the session hosts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Cline,
    Cursor,
    Copilot,
    Warp,
    Custom,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Cline => "cline",
            AgentType::Cursor => "cursor",
            AgentType::Copilot => "copilot",
            AgentType::Warp => "warp",
            AgentType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    Idle,
    Stopped,
    Closed,
}

/// Merge-on-close policy for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMergeConfig {
    pub target_branch: String,
    #[serde(default)]
    pub delete_branch: bool,
}

/// One agent session and its dedicated workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub agent_type: AgentType,
    pub task: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub base_branch: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: SessionStatus,
    pub commit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebase_interval_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<AutoMergeConfig>,
}

impl Session {
    /// Short form of the session id, used in branch names, worktree names,
    /// and the per-session drop file.
    pub fn short_id(&self) -> &str {
        short_session_id(&self.session_id)
    }

    /// Per-session commit-message drop file, relative to the repo root.
    pub fn drop_file_name(&self) -> String {
        format!(".devops-commit-{}.msg", self.short_id())
    }

    /// Shared fallback drop file for this agent kind, relative to the repo root.
    pub fn shared_drop_file_name(&self) -> String {
        format!(".{}-commit-msg", self.agent_type)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }
}

/// Generate a fresh session id: `sess-` + a v4 uuid (122 bits of entropy).
pub fn new_session_id() -> String {
    format!("sess-{}", Uuid::new_v4().simple())
}

/// First 8 hex characters of the uuid portion of a session id.
pub fn short_session_id(session_id: &str) -> &str {
    let raw = session_id.strip_prefix("sess-").unwrap_or(session_id);
    &raw[..raw.len().min(8)]
}

/// Branch name derived from the session identity: `agent/<type>/<short-id>`.
pub fn derive_branch_name(agent_type: AgentType, session_id: &str) -> String {
    format!("agent/{}/{}", agent_type, short_session_id(session_id))
}

/// Directory name of the session worktree under the worktree root.
pub fn derive_worktree_name(agent_type: AgentType, session_id: &str) -> String {
    format!("{}-{}", agent_type, short_session_id(session_id))
}

/// Per-session watermark for crash recovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProcessingState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<String>,
    #[serde(default)]
    pub contract_changes_count: u32,
    #[serde(default)]
    pub breaking_changes_count: u32,
}

/// A repository the engine has hosted sessions in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentRepo {
    pub path: String,
    pub name: String,
    pub last_used: String,
    pub agent_count: u32,
}

/// Stable on-disk mirror of a session, written to
/// `<toolkit>/sessions/<session_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub agent_id: String,
    pub agent_type: AgentType,
    pub task: String,
    pub branch_name: String,
    pub base_branch: String,
    pub worktree_path: String,
    pub repo_path: String,
    pub status: SessionStatus,
    pub created: String,
    pub updated: String,
    pub commit_count: u32,
}

impl SessionDescriptor {
    pub fn from_session(session: &Session, agent_id: &str) -> Self {
        Self {
            session_id: session.session_id.clone(),
            agent_id: agent_id.to_string(),
            agent_type: session.agent_type,
            task: session.task.clone(),
            branch_name: session.branch_name.clone(),
            base_branch: session.base_branch.clone(),
            worktree_path: session.worktree_path.clone(),
            repo_path: session.repo_path.clone(),
            status: session.status,
            created: session.created_at.clone(),
            updated: session.updated_at.clone(),
            commit_count: session.commit_count,
        }
    }
}

/// On-disk agent identity, written to `<toolkit>/agents/<agent_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub session_id: String,
    pub agent_type: AgentType,
    pub repo_path: String,
    pub registered_at: String,
}

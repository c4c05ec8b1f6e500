//! Session and workspace coordination engine for concurrent AI coding agents
//! sharing one Git repository.
//!
//! Each agent task gets an isolated workspace: a Git worktree on a dedicated
//! branch. The engine watches workspaces for changes, turns agent-authored
//! commit-message drop files into debounced commits and pushes, coordinates
//! file-level edit claims between sessions through on-disk declarations, and
//! tracks per-session processing state so interrupted work is recovered
//! after a crash.
//!
//! Construct an [`Engine`], subscribe to its [`events::EventBus`], and drive
//! it through the lifecycle operations. All Git work shells out to the host
//! `git` tool.

mod activity;
mod error;
mod events;
mod git;
mod lifecycle;
mod locks;
mod logging;
mod pipeline;
mod rebase;
mod recovery;
mod session;
mod settings;
mod store;
mod watcher;
mod workspace;

pub use error::{codes, EngineError, EngineResult, Envelope, ErrorResponse, LockConflictInfo};
pub use events::{channels, EventBus, EventEnvelope};
pub use git::{
    ChangeKind, CommitDiff, CommitFileDiff, CommitRecord, GitDriver, GitError, RebaseOutcome,
    RepoStatus, StatusChange, WorktreeInfo,
};
pub use lifecycle::{CreateSessionRequest, Engine};
pub use locks::{EditDeclaration, EditOperation, LockRegistry};
pub use logging::init_logging;
pub use rebase::RebaseReport;
pub use recovery::{ContractAnalysis, ContractAnalyzer, NoopAnalyzer, OrphanedSession, RecoveryReport};
pub use session::{
    derive_branch_name, derive_worktree_name, new_session_id, short_session_id, AgentDescriptor,
    AgentType, AutoMergeConfig, RecentRepo, Session, SessionDescriptor, SessionProcessingState,
    SessionStatus,
};
pub use settings::EngineSettings;
pub use store::SessionStore;
pub use watcher::FileEventKind;
pub use workspace::{BranchCleanup, WorkspaceProvisioner};

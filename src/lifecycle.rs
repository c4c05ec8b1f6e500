//! Session lifecycle orchestration.
//!
//! [`Engine`] owns every other component and is the only mutator of session
//! records: create, close, restart, delete, and the startup recovery pass.
//! Components report outward through the event bus; none of them calls back
//! up into the lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::activity::ActivityLog;
use crate::error::{EngineError, EngineResult};
use crate::events::{channels, EventBus};
use crate::git::GitDriver;
use crate::locks::{EditDeclaration, EditOperation, LockRegistry};
use crate::pipeline::CommitPipeline;
use crate::rebase::{RebaseReport, RebaseSupervisor};
use crate::recovery::{ContractAnalyzer, RecoveryReport, RecoveryScanner};
use crate::session::{
    derive_branch_name, derive_worktree_name, new_session_id, short_session_id, AgentDescriptor,
    AgentType, AutoMergeConfig, Session, SessionDescriptor, SessionStatus,
};
use crate::settings::EngineSettings;
use crate::store::SessionStore;
use crate::watcher::WatcherPool;
use crate::workspace::{BranchCleanup, WorkspaceProvisioner};

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub repo_path: PathBuf,
    pub agent_type: AgentType,
    pub task: String,
    /// `None` or `"HEAD"` resolve to the current branch at create time
    /// (the super-project's current branch for sub-repositories)
    pub base_branch: Option<String>,
    pub rebase_interval_hours: Option<f64>,
    pub auto_merge: Option<AutoMergeConfig>,
    pub agent_pid: Option<u32>,
}

impl CreateSessionRequest {
    pub fn new(repo_path: impl Into<PathBuf>, agent_type: AgentType, task: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
            agent_type,
            task: task.into(),
            base_branch: None,
            rebase_interval_hours: None,
            auto_merge: None,
            agent_pid: None,
        }
    }
}

/// The coordination engine. Construct once per process; all services are
/// owned here and passed inward, only the event bus is shared outward.
pub struct Engine {
    settings: EngineSettings,
    events: EventBus,
    git: Arc<GitDriver>,
    store: Arc<SessionStore>,
    provisioner: Arc<WorkspaceProvisioner>,
    locks: Arc<LockRegistry>,
    pipeline: Arc<CommitPipeline>,
    watchers: Arc<WatcherPool>,
    rebases: Arc<RebaseSupervisor>,
}

impl Engine {
    /// Open the engine against a state directory (defaulting to the
    /// platform state dir) and the `default` profile.
    pub fn new(state_dir: Option<PathBuf>, settings: EngineSettings) -> EngineResult<Self> {
        Self::with_profile(state_dir, "default", settings)
    }

    pub fn with_profile(
        state_dir: Option<PathBuf>,
        profile: &str,
        settings: EngineSettings,
    ) -> EngineResult<Self> {
        let state_dir = state_dir.unwrap_or_else(default_state_dir);
        let events = EventBus::default();
        let git = Arc::new(GitDriver::new(settings.git_timeout()));
        let store = Arc::new(SessionStore::open(&state_dir, profile, events.clone())?);
        let provisioner = Arc::new(WorkspaceProvisioner::new(
            git.clone(),
            events.clone(),
            settings.clone(),
        ));
        let locks = Arc::new(LockRegistry::new(
            settings.coordination_dir.clone(),
            events.clone(),
        ));
        let activity = Arc::new(ActivityLog::new(settings.toolkit_dir.clone()));
        let pipeline = Arc::new(CommitPipeline::new(
            git.clone(),
            store.clone(),
            activity.clone(),
            events.clone(),
            settings.clone(),
        ));
        let watchers = Arc::new(WatcherPool::new(
            events.clone(),
            locks.clone(),
            activity.clone(),
            pipeline.clone(),
            settings.clone(),
        ));
        let rebases = Arc::new(RebaseSupervisor::new(git.clone(), events.clone()));

        Ok(Self {
            settings,
            events,
            git,
            store,
            provisioner,
            locks,
            pipeline,
            watchers,
            rebases,
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    pub fn locks(&self) -> Arc<LockRegistry> {
        self.locks.clone()
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub async fn create_session(&self, request: CreateSessionRequest) -> EngineResult<Session> {
        let repo = request.repo_path.clone();
        self.validate_repo(&repo).await?;
        self.provisioner.ensure_toolkit(&repo)?;

        let base_branch = self.resolve_base_branch(&repo, request.base_branch.as_deref()).await?;
        self.ensure_base_exists(&repo, &base_branch).await?;

        let session_id = new_session_id();
        let agent_id = format!("agent-{}", short_session_id(&session_id));
        let branch_name = derive_branch_name(request.agent_type, &session_id);
        let worktree_name = derive_worktree_name(request.agent_type, &session_id);

        let worktree_path = self
            .provisioner
            .create(&repo, &branch_name, &base_branch, &worktree_name)
            .await?;

        let now = Utc::now().to_rfc3339();
        let session = Session {
            session_id: session_id.clone(),
            agent_type: request.agent_type,
            task: request.task,
            repo_path: repo.to_string_lossy().to_string(),
            worktree_path: worktree_path.to_string_lossy().to_string(),
            branch_name,
            base_branch,
            created_at: now.clone(),
            updated_at: now,
            status: SessionStatus::Active,
            commit_count: 0,
            last_commit_hash: None,
            agent_pid: request.agent_pid,
            rebase_interval_hours: request
                .rebase_interval_hours
                .or_else(|| {
                    (self.settings.rebase_default_hours > 0.0)
                        .then_some(self.settings.rebase_default_hours)
                }),
            auto_merge: request.auto_merge,
        };

        self.provisioner
            .write_session_descriptor(&repo, &session, &agent_id)?;
        self.provisioner.write_agent_descriptor(
            &repo,
            &AgentDescriptor {
                agent_id: agent_id.clone(),
                session_id: session_id.clone(),
                agent_type: session.agent_type,
                repo_path: session.repo_path.clone(),
                registered_at: session.created_at.clone(),
            },
        )?;
        self.provisioner.write_agent_config(&session, &agent_id)?;

        self.store.insert_session(session.clone())?;
        let repo_name = repo
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| session.repo_path.clone());
        self.store.touch_recent_repo(&session.repo_path, &repo_name)?;
        self.store.recompute_agent_counts()?;

        self.watchers.start(&session)?;
        self.rebases.start(&session);

        self.events.publish(
            channels::SESSION_REPORTED,
            serde_json::to_value(SessionDescriptor::from_session(&session, &agent_id))
                .unwrap_or_else(|_| json!({})),
        );
        self.events.publish(
            channels::AGENT_REGISTERED,
            json!({
                "agentId": agent_id,
                "sessionId": session.session_id,
                "agentType": session.agent_type,
            }),
        );

        tracing::info!(
            session_id = %session.session_id,
            branch = %session.branch_name,
            "session created"
        );
        Ok(session)
    }

    async fn validate_repo(&self, repo: &Path) -> EngineResult<()> {
        if !repo.is_dir() {
            return Err(EngineError::InvalidRepo(format!(
                "not a directory: {}",
                repo.display()
            )));
        }
        if !repo.join(".git").exists() {
            return Err(EngineError::InvalidRepo(format!(
                "no .git entry: {}",
                repo.display()
            )));
        }
        self.git
            .current_branch(repo)
            .await
            .map_err(|err| EngineError::InvalidRepo(format!("{}: {err}", repo.display())))?;
        Ok(())
    }

    /// `None`/`"HEAD"` resolve to the current branch at create time; when the
    /// repo is a sub-repository, the super-project's current branch wins.
    async fn resolve_base_branch(
        &self,
        repo: &Path,
        requested: Option<&str>,
    ) -> EngineResult<String> {
        match requested {
            Some(base) if base != "HEAD" => Ok(base.to_string()),
            _ => {
                let root = match self.git.superproject_root(repo).await {
                    Ok(Some(parent)) => parent,
                    _ => repo.to_path_buf(),
                };
                Ok(self.git.current_branch(&root).await?)
            }
        }
    }

    async fn ensure_base_exists(&self, repo: &Path, base_branch: &str) -> EngineResult<()> {
        if self.git.branch_exists(repo, base_branch).await? {
            return Ok(());
        }
        let branches = self.git.list_branches(repo).await?;
        if branches.iter().any(|name| name == base_branch) {
            return Ok(());
        }
        Err(EngineError::NotFound(format!(
            "base branch not found locally or remotely: {base_branch}"
        )))
    }

    // ------------------------------------------------------------------
    // Close / delete
    // ------------------------------------------------------------------

    /// Close a session: stop its tasks, release its claims, optionally merge
    /// its branch, and remove its workspace and artifacts.
    pub async fn close_session(&self, session_id: &str) -> EngineResult<()> {
        let session = self.store.get_session(session_id)?;
        let repo = PathBuf::from(&session.repo_path);
        let agent_id = format!("agent-{}", session.short_id());

        self.watchers.stop(session_id).await;
        self.rebases.stop(session_id).await;
        self.pipeline.close_session(session_id).await;
        self.locks.release(&repo, session_id)?;

        let mut cleanup = BranchCleanup::DeleteIfMerged;
        if let Some(auto_merge) = &session.auto_merge {
            match self
                .git
                .merge(&repo, &session.branch_name, &auto_merge.target_branch)
                .await
            {
                Ok(()) => {
                    if auto_merge.delete_branch {
                        cleanup = BranchCleanup::Force;
                    }
                }
                Err(err) => {
                    tracing::error!(%err, session_id, "auto-merge failed, keeping session branch");
                    cleanup = BranchCleanup::Keep;
                }
            }
        }

        self.provisioner
            .remove(
                &repo,
                Path::new(&session.worktree_path),
                &session.branch_name,
                cleanup,
            )
            .await?;
        self.provisioner
            .remove_session_artifacts(&repo, &session, &agent_id);

        self.store.remove_session(session_id)?;
        self.store.recompute_agent_counts()?;

        self.events
            .publish(channels::SESSION_CLOSED, json!({ "sessionId": session_id }));
        self.events.publish(
            channels::INSTANCE_DELETED,
            json!({ "sessionId": session_id, "agentId": agent_id }),
        );

        tracing::info!(session_id, "session closed");
        Ok(())
    }

    /// Forcibly delete a session: no merge, branch removed, workspace gone.
    pub async fn delete_session(&self, session_id: &str) -> EngineResult<()> {
        let session = self.store.get_session(session_id)?;
        let repo = PathBuf::from(&session.repo_path);
        let agent_id = format!("agent-{}", session.short_id());

        self.watchers.stop(session_id).await;
        self.rebases.stop(session_id).await;
        self.pipeline.close_session(session_id).await;
        self.locks.release(&repo, session_id)?;

        self.provisioner
            .remove(
                &repo,
                Path::new(&session.worktree_path),
                &session.branch_name,
                BranchCleanup::Force,
            )
            .await?;
        self.provisioner
            .remove_session_artifacts(&repo, &session, &agent_id);

        self.store.remove_session(session_id)?;
        self.store.recompute_agent_counts()?;

        self.events
            .publish(channels::SESSION_CLOSED, json!({ "sessionId": session_id }));
        self.events.publish(
            channels::INSTANCE_DELETED,
            json!({ "sessionId": session_id, "agentId": agent_id }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Restart
    // ------------------------------------------------------------------

    /// Restart a session: consolidate pending work into a synthetic commit,
    /// clean the session's artifacts, and create a replacement session with
    /// the same configuration under a new id.
    pub async fn restart_session(&self, session_id: &str) -> EngineResult<Session> {
        let session = self.store.get_session(session_id)?;
        let repo = PathBuf::from(&session.repo_path);
        let worktree = PathBuf::from(&session.worktree_path);
        let agent_id = format!("agent-{}", session.short_id());

        self.watchers.stop(session_id).await;
        self.rebases.stop(session_id).await;
        self.pipeline.close_session(session_id).await;

        // Consolidate: any uncommitted changes become one synthetic commit
        // whose body enumerates the subjects produced since the watermark.
        let status = self.git.status(&worktree).await?;
        if !status.clean {
            let processing = self.store.processing_state(session_id);
            let subjects = match processing.last_processed_commit.as_deref() {
                Some(watermark) => self
                    .git
                    .commit_subjects_since(&worktree, watermark)
                    .await
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let known_watermark = processing.last_processed_commit.is_some();
            let message = consolidated_restart_message(
                session.agent_type,
                &subjects,
                known_watermark,
            );
            self.git.commit(&worktree, &message).await?;
        }

        self.locks.release(&repo, session_id)?;
        self.provisioner
            .remove_session_artifacts(&repo, &session, &agent_id);
        self.provisioner.ensure_toolkit(&repo)?;

        self.store.remove_session(session_id)?;
        self.store.recompute_agent_counts()?;
        self.events
            .publish(channels::SESSION_CLOSED, json!({ "sessionId": session_id }));

        let request = CreateSessionRequest {
            repo_path: repo,
            agent_type: session.agent_type,
            task: session.task.clone(),
            base_branch: Some(session.base_branch.clone()),
            rebase_interval_hours: session.rebase_interval_hours,
            auto_merge: session.auto_merge.clone(),
            agent_pid: session.agent_pid,
        };
        let replacement = self.create_session(request).await?;
        tracing::info!(
            old = session_id,
            new = %replacement.session_id,
            "session restarted"
        );
        Ok(replacement)
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Startup pass: recompute derived counters, sweep unprocessed commits
    /// through the analyzer, report orphans, and resume watching live
    /// sessions whose workspaces still exist.
    pub async fn recover(&self, analyzer: &dyn ContractAnalyzer) -> EngineResult<RecoveryReport> {
        self.store.recompute_agent_counts()?;

        let scanner = RecoveryScanner::new(
            self.git.clone(),
            self.store.clone(),
            self.provisioner.clone(),
            self.events.clone(),
        );
        let report = scanner.run(analyzer).await;

        for session in self.store.live_sessions() {
            if Path::new(&session.worktree_path).exists() {
                if let Err(err) = self.watchers.start(&session) {
                    tracing::error!(%err, session_id = %session.session_id, "failed to resume watcher");
                }
                self.rebases.start(&session);
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Coordination and ancillary operations
    // ------------------------------------------------------------------

    /// Declare an edit claim on behalf of a session.
    pub fn declare_edit(
        &self,
        session_id: &str,
        files: Vec<String>,
        operation: EditOperation,
        reason: impl Into<String>,
        estimated_duration_sec: u64,
    ) -> EngineResult<()> {
        let session = self.store.get_session(session_id)?;
        let declaration = EditDeclaration {
            agent: session.agent_type.as_str().to_string(),
            session_id: session_id.to_string(),
            files,
            operation,
            reason: reason.into(),
            declared_at: Utc::now().to_rfc3339(),
            estimated_duration_sec,
            auto: false,
        };
        self.locks
            .declare(Path::new(&session.repo_path), declaration)
    }

    /// Blocking declarations for `paths` in `repo`, without modifying state.
    pub fn check_edits(
        &self,
        repo: &Path,
        paths: &[String],
    ) -> EngineResult<Vec<crate::error::LockConflictInfo>> {
        self.locks.check(repo, paths)
    }

    /// Record a heartbeat for an agent and publish it.
    pub fn heartbeat(&self, repo: &Path, agent_id: &str) -> EngineResult<()> {
        let stamp = self.provisioner.record_heartbeat(repo, agent_id)?;
        self.events.publish(
            channels::AGENT_HEARTBEAT,
            json!({ "agentId": agent_id, "at": stamp }),
        );
        Ok(())
    }

    /// Run a rebase cycle for a session right now.
    pub async fn force_rebase(&self, session_id: &str) -> EngineResult<RebaseReport> {
        let session = self.store.get_session(session_id)?;
        Ok(self.rebases.force_check(&session).await)
    }

    pub fn pause_rebase(&self, session_id: &str) {
        self.rebases.pause(session_id);
    }

    pub fn resume_rebase(&self, session_id: &str) {
        self.rebases.resume(session_id);
    }

    /// Stop all per-session tasks and close the event bus.
    pub async fn shutdown(&self) {
        self.watchers.stop_all().await;
        self.rebases.stop_all().await;
        self.events.shutdown();
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("agent-session-engine"))
        .unwrap_or_else(|| PathBuf::from(".agent-session-engine"))
}

/// Build the synthetic restart commit message. With a known watermark the
/// body enumerates the subjects committed since it; either way the
/// uncommitted work is called out.
fn consolidated_restart_message(
    agent_type: AgentType,
    subjects: &[String],
    known_watermark: bool,
) -> String {
    if !known_watermark {
        return format!("[{agent_type} Restart] Session restart\n\n+ Uncommitted changes at restart");
    }
    let mut message = format!("[{agent_type} Restart] Consolidated changes\n");
    for subject in subjects {
        message.push_str("\n- ");
        message.push_str(subject);
    }
    message.push_str("\n+ Uncommitted changes at restart");
    message
}

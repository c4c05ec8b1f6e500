//! Startup recovery sweep.
//!
//! After a crash, stored sessions may have commits the external contract
//! analyzer never saw. The scanner enumerates every session's commits past
//! its watermark, drives the analyzer over them in order, and separately
//! reports session descriptor files on disk that no longer correspond to
//! stored sessions. A single failing session never halts the sweep.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use crate::error::{EngineError, EngineResult};
use crate::events::{channels, EventBus};
use crate::git::GitDriver;
use crate::session::Session;
use crate::store::SessionStore;
use crate::workspace::WorkspaceProvisioner;

/// Commits examined per session when no watermark exists.
const RECOVERY_COMMIT_LIMIT: usize = 10;

/// Counters produced by the external analyzer for one commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractAnalysis {
    pub contract_changes: u32,
    pub breaking_changes: u32,
}

/// External contract-change analyzer. The AI pipeline behind it is a
/// collaborator; only this hook is part of the engine's contract.
#[async_trait]
pub trait ContractAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        session: &Session,
        commit_hash: &str,
    ) -> EngineResult<ContractAnalysis>;
}

/// Analyzer that counts nothing. Used when no external pipeline is wired.
pub struct NoopAnalyzer;

#[async_trait]
impl ContractAnalyzer for NoopAnalyzer {
    async fn analyze(
        &self,
        _session: &Session,
        _commit_hash: &str,
    ) -> EngineResult<ContractAnalysis> {
        Ok(ContractAnalysis::default())
    }
}

/// One orphaned descriptor: on disk but unknown to the store.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OrphanedSession {
    pub repo_path: String,
    pub session_id: String,
}

/// Outcome of one recovery sweep.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// (session id, commits fed to the analyzer)
    pub processed: Vec<(String, Vec<String>)>,
    /// Sessions whose recorded worktree no longer exists
    pub missing_worktrees: Vec<String>,
    /// Descriptors on disk with no stored session
    pub orphans: Vec<OrphanedSession>,
}

pub struct RecoveryScanner {
    git: Arc<GitDriver>,
    store: Arc<SessionStore>,
    provisioner: Arc<WorkspaceProvisioner>,
    events: EventBus,
}

impl RecoveryScanner {
    pub fn new(
        git: Arc<GitDriver>,
        store: Arc<SessionStore>,
        provisioner: Arc<WorkspaceProvisioner>,
        events: EventBus,
    ) -> Self {
        Self {
            git,
            store,
            provisioner,
            events,
        }
    }

    /// Run the full sweep: unprocessed commits per session, then the orphan
    /// scan over recent repositories.
    pub async fn run(&self, analyzer: &dyn ContractAnalyzer) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for session in self.store.live_sessions() {
            match self.process_session(&session, analyzer).await {
                Ok(commits) => report.processed.push((session.session_id.clone(), commits)),
                Err(EngineError::RecoverySkipped(reason)) => {
                    tracing::warn!(session_id = %session.session_id, %reason, "recovery skipped session");
                    if !Path::new(&session.worktree_path).exists() {
                        report.missing_worktrees.push(session.session_id.clone());
                    }
                }
                Err(err) => {
                    tracing::error!(%err, session_id = %session.session_id, "recovery failed for session");
                }
            }
        }

        report.orphans = self.scan_orphans();
        report
    }

    /// Enumerate commits past the watermark on the session branch and drive
    /// the analyzer over each in order. A commit whose analysis fails is
    /// skipped; the next one continues.
    async fn process_session(
        &self,
        session: &Session,
        analyzer: &dyn ContractAnalyzer,
    ) -> EngineResult<Vec<String>> {
        let repo = Path::new(&session.repo_path);
        if !repo.exists() {
            return Err(EngineError::RecoverySkipped(format!(
                "repository missing: {}",
                session.repo_path
            )));
        }
        if !Path::new(&session.worktree_path).exists() {
            return Err(EngineError::RecoverySkipped(format!(
                "worktree missing: {}",
                session.worktree_path
            )));
        }

        let state = self.store.processing_state(&session.session_id);
        let commits = self
            .git
            .commits_since(
                repo,
                state.last_processed_commit.as_deref(),
                &session.branch_name,
                RECOVERY_COMMIT_LIMIT,
            )
            .await?;

        for hash in &commits {
            match analyzer.analyze(session, hash).await {
                Ok(analysis) => {
                    self.store
                        .update_processing_state(&session.session_id, |processing| {
                            processing.last_processed_commit = Some(hash.clone());
                            processing.contract_changes_count += analysis.contract_changes;
                            processing.breaking_changes_count += analysis.breaking_changes;
                        })?;
                }
                Err(err) => {
                    tracing::warn!(%err, commit = %hash, session_id = %session.session_id, "analyzer failed, commit skipped");
                }
            }
        }

        Ok(commits)
    }

    /// Find session descriptor files in recent repositories that do not
    /// correspond to any stored session.
    fn scan_orphans(&self) -> Vec<OrphanedSession> {
        let known: Vec<String> = self
            .store
            .sessions()
            .into_iter()
            .map(|session| session.session_id)
            .collect();

        let mut orphans = Vec::new();
        for repo in self.store.recent_repos() {
            let sessions_dir = self.provisioner.sessions_dir(Path::new(&repo.path));
            let entries = match fs::read_dir(&sessions_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            let mut repo_orphans = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let Some(session_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if !known.iter().any(|id| id == session_id) {
                    repo_orphans.push(session_id.to_string());
                }
            }
            if !repo_orphans.is_empty() {
                self.events.publish(
                    channels::RECOVERY_ORPHANS_FOUND,
                    json!({
                        "repoPath": repo.path,
                        "sessionIds": repo_orphans,
                    }),
                );
                orphans.extend(repo_orphans.into_iter().map(|session_id| OrphanedSession {
                    repo_path: repo.path.clone(),
                    session_id,
                }));
            }
        }
        orphans
    }
}

//! Drop-file driven commit pipeline.
//!
//! When a session's commit-message drop file settles, the pipeline reads it,
//! commits the worktree, truncates the file, emits progress events, links
//! activity, updates the processing watermark, and pushes. Per session at
//! most one commit is in flight; extra triggers coalesce into one follow-up
//! run. Push failure never rolls back the commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLog;
use crate::events::{channels, EventBus};
use crate::git::{GitDriver, GitError};
use crate::session::Session;
use crate::settings::EngineSettings;
use crate::store::SessionStore;

struct SessionCommitState {
    /// Held for the duration of one commit run
    busy: tokio::sync::Mutex<()>,
    /// Set by triggers; swapped off by the runner. Coalesces bursts.
    pending: AtomicBool,
    /// Session closed; downstream state mutations become no-ops
    closed: CancellationToken,
}

pub struct CommitPipeline {
    git: Arc<GitDriver>,
    store: Arc<SessionStore>,
    activity: Arc<ActivityLog>,
    events: EventBus,
    settings: EngineSettings,
    states: Mutex<HashMap<String, Arc<SessionCommitState>>>,
}

impl CommitPipeline {
    pub fn new(
        git: Arc<GitDriver>,
        store: Arc<SessionStore>,
        activity: Arc<ActivityLog>,
        events: EventBus,
        settings: EngineSettings,
    ) -> Self {
        Self {
            git,
            store,
            activity,
            events,
            settings,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn state_for(&self, session_id: &str) -> Arc<SessionCommitState> {
        let mut guard = self.states.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionCommitState {
                    busy: tokio::sync::Mutex::new(()),
                    pending: AtomicBool::new(false),
                    closed: CancellationToken::new(),
                })
            })
            .clone()
    }

    /// Mark the session closed: pending triggers are dropped and an
    /// in-flight commit is waited out; it finishes without mutating
    /// session state.
    pub async fn close_session(&self, session_id: &str) {
        let state = {
            let mut guard = self.states.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(session_id)
        };
        if let Some(state) = state {
            state.closed.cancel();
            let _settled = state.busy.lock().await;
        }
        self.activity.clear(session_id);
    }

    /// Trigger a commit for `session` from its drop file. Called by the
    /// watcher after the drop-file write has settled; triggers while a
    /// commit is running coalesce into exactly one follow-up.
    pub fn schedule_commit(self: &Arc<Self>, session: Session, drop_file: PathBuf) {
        if !self.settings.auto_commit {
            return;
        }
        let state = self.state_for(&session.session_id);
        if state.closed.is_cancelled() {
            return;
        }
        state.pending.store(true, Ordering::SeqCst);

        let pipeline = self.clone();
        tokio::spawn(async move {
            let _guard = state.busy.lock().await;
            while state.pending.swap(false, Ordering::SeqCst) {
                if state.closed.is_cancelled() {
                    break;
                }
                pipeline.commit_once(&session, &drop_file, &state).await;
            }
        });
    }

    async fn commit_once(
        &self,
        session: &Session,
        drop_file: &Path,
        state: &SessionCommitState,
    ) {
        // A deleted or empty drop file is a no-op: no commit, no events.
        let message = match tokio::fs::read_to_string(drop_file).await {
            Ok(contents) => contents.trim().to_string(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
            Err(err) => {
                tracing::error!(%err, path = %drop_file.display(), "failed to read drop file");
                return;
            }
        };
        if message.is_empty() {
            return;
        }

        self.events.publish(
            channels::COMMIT_TRIGGERED,
            json!({
                "sessionId": session.session_id,
                "message": message,
            }),
        );

        let worktree = Path::new(&session.worktree_path);
        let record = match self.git.commit(worktree, &message).await {
            Ok(record) => record,
            Err(GitError::NothingToCommit) => {
                tracing::info!(session_id = %session.session_id, "drop file set but nothing to commit");
                self.truncate_drop_file(drop_file).await;
                return;
            }
            Err(err) => {
                tracing::error!(%err, session_id = %session.session_id, "commit failed");
                return;
            }
        };

        self.truncate_drop_file(drop_file).await;

        self.events.publish(
            channels::COMMIT_COMPLETED,
            json!({
                "sessionId": session.session_id,
                "hash": record.hash,
                "shortHash": record.short_hash,
                "filesChanged": record.files_changed,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        );

        if state.closed.is_cancelled() {
            // Terminal events above still fired; state mutation is gated.
            return;
        }

        if let Err(err) = self.activity.attribute_commit(
            Path::new(&session.repo_path),
            &session.session_id,
            &record,
        ) {
            tracing::warn!(%err, "failed to append commit activity");
        }

        if let Err(err) = self.store.update_session(&session.session_id, |stored| {
            stored.commit_count += 1;
            stored.last_commit_hash = Some(record.hash.clone());
        }) {
            tracing::warn!(%err, "failed to update session counters");
        }
        if let Err(err) = self
            .store
            .update_processing_state(&session.session_id, |processing| {
                processing.last_processed_commit = Some(record.hash.clone());
            })
        {
            tracing::warn!(%err, "failed to update processing state");
        }

        if self.settings.push_on_commit {
            if let Err(err) = self.git.push(worktree).await {
                tracing::error!(%err, session_id = %session.session_id, "push failed after commit");
                self.events.publish(
                    channels::COMMIT_PUSH_FAILED,
                    json!({
                        "sessionId": session.session_id,
                        "hash": record.hash,
                        "error": { "code": err.code(), "message": err.to_string() },
                    }),
                );
            }
        }
    }

    /// Clear the drop file after a successful read-and-commit. A file that
    /// vanished in the meantime is left alone rather than recreated.
    async fn truncate_drop_file(&self, drop_file: &Path) {
        match tokio::fs::metadata(drop_file).await {
            Ok(_) => {
                if let Err(err) = tokio::fs::write(drop_file, "").await {
                    tracing::warn!(%err, path = %drop_file.display(), "failed to truncate drop file");
                }
            }
            Err(_) => {}
        }
    }
}

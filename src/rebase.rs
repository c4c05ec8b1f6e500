//! Periodic rebase of session branches onto their base.
//!
//! Sessions with a configured interval get a scheduled cycle: fetch the base,
//! stash local edits including untracked files, `pull --rebase`, pop the
//! stash. Conflicts abort the rebase and restore the stash best-effort;
//! nothing is retried automatically. Schedules support pause/resume and an
//! on-demand force check.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::events::{channels, EventBus};
use crate::git::{GitDriver, GitError};
use crate::session::Session;

/// Outcome of one rebase cycle, also carried on the completion event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseReport {
    pub session_id: String,
    pub success: bool,
    /// Whether local edits were stashed around the rebase
    pub had_changes: bool,
    /// Success, but the stash pop conflicted and needs manual attention
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RebaseSchedule {
    cancel: CancellationToken,
    paused: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

pub struct RebaseSupervisor {
    git: Arc<GitDriver>,
    events: EventBus,
    schedules: Mutex<HashMap<String, RebaseSchedule>>,
}

impl RebaseSupervisor {
    pub fn new(git: Arc<GitDriver>, events: EventBus) -> Self {
        Self {
            git,
            events,
            schedules: Mutex::new(HashMap::new()),
        }
    }

    /// Start the periodic schedule for a session. No-op unless the session
    /// carries a positive interval.
    pub fn start(self: &Arc<Self>, session: &Session) {
        let Some(hours) = session.rebase_interval_hours.filter(|hours| *hours > 0.0) else {
            return;
        };
        let interval = Duration::from_secs_f64(hours * 3600.0);
        let cancel = CancellationToken::new();
        let paused = Arc::new(AtomicBool::new(false));

        let supervisor = self.clone();
        let task_session = session.clone();
        let task_cancel = cancel.clone();
        let task_paused = paused.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if task_paused.load(Ordering::Acquire) {
                            continue;
                        }
                        supervisor.run_cycle(&task_session).await;
                    }
                }
            }
        });

        let mut guard = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.insert(
            session.session_id.clone(),
            RebaseSchedule {
                cancel,
                paused,
                handle,
            },
        ) {
            previous.cancel.cancel();
        }
    }

    pub fn pause(&self, session_id: &str) {
        if let Some(schedule) = self
            .schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
        {
            schedule.paused.store(true, Ordering::Release);
        }
    }

    pub fn resume(&self, session_id: &str) {
        if let Some(schedule) = self
            .schedules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
        {
            schedule.paused.store(false, Ordering::Release);
        }
    }

    /// Run one cycle immediately, regardless of schedule or pause state.
    pub async fn force_check(&self, session: &Session) -> RebaseReport {
        self.run_cycle(session).await
    }

    pub async fn stop(&self, session_id: &str) {
        let schedule = {
            let mut guard = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(session_id)
        };
        if let Some(schedule) = schedule {
            schedule.cancel.cancel();
            let _ = schedule.handle.await;
        }
    }

    pub async fn stop_all(&self) {
        let schedules: Vec<RebaseSchedule> = {
            let mut guard = self.schedules.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, schedule)| schedule).collect()
        };
        for schedule in schedules {
            schedule.cancel.cancel();
            let _ = schedule.handle.await;
        }
    }

    async fn run_cycle(&self, session: &Session) -> RebaseReport {
        let worktree = Path::new(&session.worktree_path);
        let base = session.base_branch.as_str();

        let report = self.rebase_with_stash(worktree, base, session).await;
        self.events.publish(
            channels::REBASE_COMPLETED,
            serde_json::to_value(&report).unwrap_or_else(|_| json!({})),
        );
        report
    }

    async fn rebase_with_stash(
        &self,
        worktree: &Path,
        base: &str,
        session: &Session,
    ) -> RebaseReport {
        let session_id = session.session_id.clone();

        if let Err(err) = self.git.fetch(worktree, base).await {
            let error = match &err {
                GitError::BaseBranchMissing(_) => "BaseBranchMissing".to_string(),
                other => other.to_string(),
            };
            tracing::warn!(session_id = %session_id, %err, "rebase cycle aborted at fetch");
            return RebaseReport {
                session_id,
                success: false,
                had_changes: false,
                degraded: false,
                error: Some(error),
            };
        }

        let had_changes = match self.git.stash_push(worktree).await {
            Ok(stashed) => stashed,
            Err(err) => {
                tracing::error!(session_id = %session_id, %err, "stash push failed");
                return RebaseReport {
                    session_id,
                    success: false,
                    had_changes: false,
                    degraded: false,
                    error: Some(err.to_string()),
                };
            }
        };

        if let Err(err) = self.git.rebase(worktree, base).await {
            if had_changes {
                if let Err(pop_err) = self.git.stash_pop(worktree).await {
                    tracing::error!(session_id = %session_id, %pop_err, "stash pop failed after aborted rebase");
                }
            }
            let error = match &err {
                GitError::ConflictsDetected(_) => "ConflictsDetected".to_string(),
                GitError::UnrelatedHistories(_) => "UnrelatedHistories".to_string(),
                GitError::BaseBranchMissing(_) => "BaseBranchMissing".to_string(),
                GitError::FetchFailed(_) => "FetchFailed".to_string(),
                other => other.to_string(),
            };
            return RebaseReport {
                session_id,
                success: false,
                had_changes,
                degraded: false,
                error: Some(error),
            };
        }

        let mut degraded = false;
        if had_changes {
            if let Err(err) = self.git.stash_pop(worktree).await {
                tracing::warn!(session_id = %session_id, %err, "stash pop conflicted after rebase");
                degraded = true;
            }
        }

        RebaseReport {
            session_id,
            success: true,
            had_changes,
            degraded,
            error: None,
        }
    }
}

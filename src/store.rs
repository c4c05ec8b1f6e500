//! Durable session store.
//!
//! A single JSON file keyed by profile name holds three collections:
//! sessions (ordered by creation time), recent repositories (most-recent
//! first, capped), and per-session processing states. Writes are full-object
//! replacements through a temp-file rename; every mutation emits an event.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{EngineError, EngineResult};
use crate::events::{channels, EventBus};
use crate::session::{RecentRepo, Session, SessionProcessingState, SessionStatus};

/// Most-recent repositories kept in the list.
const RECENT_REPO_CAP: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoreFile {
    sessions: Vec<Session>,
    recent_repos: Vec<RecentRepo>,
    processing_states: HashMap<String, SessionProcessingState>,
}

/// Single-writer durable store. Not safe for concurrent access from multiple
/// engine processes.
pub struct SessionStore {
    path: PathBuf,
    events: EventBus,
    inner: Mutex<StoreFile>,
}

impl SessionStore {
    /// Open (or create) the store file `<state_dir>/<profile>.json`.
    pub fn open(state_dir: &Path, profile: &str, events: EventBus) -> EngineResult<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{profile}.json"));
        let data = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), %err, "store file unreadable, starting fresh");
                StoreFile::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            events,
            inner: Mutex::new(data),
        })
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn insert_session(&self, session: Session) -> EngineResult<Session> {
        let mut guard = self.lock();
        guard.sessions.push(session.clone());
        self.persist(&guard)?;
        drop(guard);
        self.events.publish(
            channels::SESSION_UPDATED,
            json!({ "sessionId": session.session_id, "change": "inserted" }),
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        let guard = self.lock();
        guard
            .sessions
            .iter()
            .find(|session| session.session_id == session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))
    }

    pub fn update_session<F>(&self, session_id: &str, updater: F) -> EngineResult<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut guard = self.lock();
        let session = guard
            .sessions
            .iter_mut()
            .find(|session| session.session_id == session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        updater(session);
        session.updated_at = Utc::now().to_rfc3339();
        let snapshot = session.clone();
        self.persist(&guard)?;
        drop(guard);
        self.events.publish(
            channels::SESSION_UPDATED,
            json!({ "sessionId": snapshot.session_id, "change": "updated" }),
        );
        Ok(snapshot)
    }

    pub fn remove_session(&self, session_id: &str) -> EngineResult<Session> {
        let mut guard = self.lock();
        let idx = guard
            .sessions
            .iter()
            .position(|session| session.session_id == session_id)
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))?;
        let removed = guard.sessions.remove(idx);
        guard.processing_states.remove(session_id);
        self.persist(&guard)?;
        drop(guard);
        self.events.publish(
            channels::SESSION_UPDATED,
            json!({ "sessionId": session_id, "change": "removed" }),
        );
        Ok(removed)
    }

    /// All sessions in creation order.
    pub fn sessions(&self) -> Vec<Session> {
        self.lock().sessions.clone()
    }

    /// Sessions whose status is not closed.
    pub fn live_sessions(&self) -> Vec<Session> {
        self.lock()
            .sessions
            .iter()
            .filter(|session| session.status != SessionStatus::Closed)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Recent repositories
    // ------------------------------------------------------------------

    /// Move `repo_path` to the front of the recent list, inserting it if
    /// needed, and trim past the cap.
    pub fn touch_recent_repo(&self, repo_path: &str, name: &str) -> EngineResult<()> {
        let mut guard = self.lock();
        let existing = guard
            .recent_repos
            .iter()
            .position(|repo| repo.path == repo_path);
        let mut repo = match existing {
            Some(idx) => guard.recent_repos.remove(idx),
            None => RecentRepo {
                path: repo_path.to_string(),
                name: name.to_string(),
                last_used: String::new(),
                agent_count: 0,
            },
        };
        repo.last_used = Utc::now().to_rfc3339();
        guard.recent_repos.insert(0, repo);
        guard.recent_repos.truncate(RECENT_REPO_CAP);
        self.persist(&guard)?;
        drop(guard);
        self.events
            .publish(channels::RECENT_REPOS_CHANGED, json!({ "path": repo_path }));
        Ok(())
    }

    /// Patch every `agent_count` to the number of live sessions actually
    /// stored for that repository. Invoked on startup and after every close.
    pub fn recompute_agent_counts(&self) -> EngineResult<()> {
        let mut guard = self.lock();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for session in &guard.sessions {
            if session.status != SessionStatus::Closed {
                *counts.entry(session.repo_path.clone()).or_default() += 1;
            }
        }
        let mut changed = false;
        for repo in &mut guard.recent_repos {
            let actual = counts.get(&repo.path).copied().unwrap_or(0);
            if repo.agent_count != actual {
                repo.agent_count = actual;
                changed = true;
            }
        }
        if changed {
            self.persist(&guard)?;
            drop(guard);
            self.events
                .publish(channels::RECENT_REPOS_CHANGED, json!({ "recomputed": true }));
        }
        Ok(())
    }

    pub fn recent_repos(&self) -> Vec<RecentRepo> {
        self.lock().recent_repos.clone()
    }

    // ------------------------------------------------------------------
    // Processing states
    // ------------------------------------------------------------------

    pub fn processing_state(&self, session_id: &str) -> SessionProcessingState {
        self.lock()
            .processing_states
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn update_processing_state<F>(
        &self,
        session_id: &str,
        updater: F,
    ) -> EngineResult<SessionProcessingState>
    where
        F: FnOnce(&mut SessionProcessingState),
    {
        let mut guard = self.lock();
        let state = guard
            .processing_states
            .entry(session_id.to_string())
            .or_default();
        updater(state);
        state.last_processed_at = Some(Utc::now().to_rfc3339());
        let snapshot = state.clone();
        self.persist(&guard)?;
        Ok(snapshot)
    }

    pub fn clear_processing_state(&self, session_id: &str) -> EngineResult<()> {
        let mut guard = self.lock();
        if guard.processing_states.remove(session_id).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreFile> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Full-object replacement write via temp file + rename.
    fn persist(&self, data: &StoreFile) -> EngineResult<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.exists() {
            return Err(EngineError::StaleState(format!(
                "store directory vanished: {}",
                parent.display()
            )));
        }
        let serialized = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{
        derive_branch_name, derive_worktree_name, new_session_id, AgentType,
    };
    use tempfile::TempDir;

    fn make_session(repo_path: &str) -> Session {
        let session_id = new_session_id();
        let now = Utc::now().to_rfc3339();
        Session {
            branch_name: derive_branch_name(AgentType::Claude, &session_id),
            worktree_path: format!(
                "{repo_path}/.worktrees/{}",
                derive_worktree_name(AgentType::Claude, &session_id)
            ),
            session_id,
            agent_type: AgentType::Claude,
            task: "test".to_string(),
            repo_path: repo_path.to_string(),
            base_branch: "main".to_string(),
            created_at: now.clone(),
            updated_at: now,
            status: SessionStatus::Active,
            commit_count: 0,
            last_commit_hash: None,
            agent_pid: None,
            rebase_interval_hours: None,
            auto_merge: None,
        }
    }

    fn open_store(dir: &TempDir) -> SessionStore {
        SessionStore::open(dir.path(), "default", EventBus::default()).expect("open store")
    }

    #[test]
    fn test_insert_get_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let session = make_session("/r");
        let id = session.session_id.clone();

        store.insert_session(session).unwrap();
        let loaded = store.get_session(&id).unwrap();
        assert_eq!(loaded.session_id, id);
        assert_eq!(loaded.base_branch, "main");

        store.remove_session(&id).unwrap();
        assert!(matches!(
            store.get_session(&id),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let session = make_session("/r");
        let id = session.session_id.clone();
        {
            let store = open_store(&dir);
            store.insert_session(session).unwrap();
            store
                .update_processing_state(&id, |state| {
                    state.last_processed_commit = Some("abc123".to_string());
                    state.contract_changes_count += 2;
                })
                .unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.get_session(&id).unwrap().session_id, id);
        let state = store.processing_state(&id);
        assert_eq!(state.last_processed_commit.as_deref(), Some("abc123"));
        assert_eq!(state.contract_changes_count, 2);
    }

    #[test]
    fn test_sessions_keep_creation_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let first = make_session("/r1");
        let second = make_session("/r2");
        let first_id = first.session_id.clone();
        let second_id = second.session_id.clone();
        store.insert_session(first).unwrap();
        store.insert_session(second).unwrap();

        let ids: Vec<String> = store
            .sessions()
            .into_iter()
            .map(|session| session.session_id)
            .collect();
        assert_eq!(ids, vec![first_id, second_id]);
    }

    #[test]
    fn test_recent_repo_cap_and_order() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..12 {
            store
                .touch_recent_repo(&format!("/repo{i}"), &format!("repo{i}"))
                .unwrap();
        }
        let repos = store.recent_repos();
        assert_eq!(repos.len(), RECENT_REPO_CAP);
        assert_eq!(repos[0].path, "/repo11");
        assert!(!repos.iter().any(|repo| repo.path == "/repo0"));

        store.touch_recent_repo("/repo5", "repo5").unwrap();
        assert_eq!(store.recent_repos()[0].path, "/repo5");
    }

    #[test]
    fn test_recompute_agent_counts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.touch_recent_repo("/r", "r").unwrap();

        let live = make_session("/r");
        let mut closed = make_session("/r");
        closed.status = SessionStatus::Closed;
        store.insert_session(live).unwrap();
        store.insert_session(closed).unwrap();

        store.recompute_agent_counts().unwrap();
        let repos = store.recent_repos();
        assert_eq!(repos[0].agent_count, 1);
    }

    #[test]
    fn test_update_session_bumps_updated_at() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let session = make_session("/r");
        let id = session.session_id.clone();
        store.insert_session(session).unwrap();

        let updated = store
            .update_session(&id, |session| {
                session.commit_count += 1;
                session.last_commit_hash = Some("ffff".to_string());
            })
            .unwrap();
        assert_eq!(updated.commit_count, 1);
        assert_eq!(updated.last_commit_hash.as_deref(), Some("ffff"));
    }
}

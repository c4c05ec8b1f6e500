//! Per-session file watching with write-finish debouncing.
//!
//! Each session gets one recursive watcher over its worktree plus a shallow
//! watch of the repository root, where the commit-message drop files live.
//! Raw notifications land in a bounded channel; a per-session task owns the
//! debounce state and exits on cancellation. A path is flushed once it has
//! been stable for the threshold, checked on a fixed poll.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityLog;
use crate::error::{EngineError, EngineResult};
use crate::events::{channels, EventBus};
use crate::locks::LockRegistry;
use crate::pipeline::CommitPipeline;
use crate::session::Session;
use crate::settings::EngineSettings;

/// Write-finish stability threshold for ordinary files.
const STABILITY: Duration = Duration::from_millis(1_000);
/// How often pending paths are checked for stability.
const FLUSH_POLL: Duration = Duration::from_millis(500);
/// Raw notification buffer per session.
const CHANNEL_CAPACITY: usize = 1_024;

/// Directory names never watched inside a worktree.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "target",
    "dist",
    "build",
    "out",
    ".next",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileEventKind {
    Add,
    Change,
    Remove,
}

impl FileEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileEventKind::Add => "add",
            FileEventKind::Change => "change",
            FileEventKind::Remove => "remove",
        }
    }
}

struct RawEvent {
    path: PathBuf,
    kind: FileEventKind,
}

struct SessionWatch {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
    /// Dropping the watcher stops the native subscription
    _watcher: RecommendedWatcher,
}

pub struct WatcherPool {
    events: EventBus,
    locks: Arc<LockRegistry>,
    activity: Arc<ActivityLog>,
    pipeline: Arc<CommitPipeline>,
    settings: EngineSettings,
    watches: Mutex<HashMap<String, SessionWatch>>,
}

impl WatcherPool {
    pub fn new(
        events: EventBus,
        locks: Arc<LockRegistry>,
        activity: Arc<ActivityLog>,
        pipeline: Arc<CommitPipeline>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            events,
            locks,
            activity,
            pipeline,
            settings,
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching a session's worktree and drop files.
    pub fn start(self: &Arc<Self>, session: &Session) -> EngineResult<()> {
        let worktree = PathBuf::from(&session.worktree_path);
        let repo = PathBuf::from(&session.repo_path);

        let (tx, rx) = mpsc::channel::<RawEvent>(CHANNEL_CAPACITY);
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let Ok(event) = result else { return };
                let Some(kind) = map_event_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    // Overflow drops the event; the stability poll will pick
                    // the path up again on its next write.
                    let _ = tx.try_send(RawEvent { path, kind });
                }
            })
            .map_err(notify_error)?;

        watcher
            .watch(&worktree, RecursiveMode::Recursive)
            .map_err(notify_error)?;
        // Drop files live at the repository root, outside the worktree.
        watcher
            .watch(&repo, RecursiveMode::NonRecursive)
            .map_err(notify_error)?;

        let cancel = CancellationToken::new();
        let task = SessionWatchTask {
            pool: self.clone(),
            session: session.clone(),
            worktree,
            repo,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(task.run(rx));

        let mut guard = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.insert(
            session.session_id.clone(),
            SessionWatch {
                cancel,
                handle,
                _watcher: watcher,
            },
        ) {
            previous.cancel.cancel();
        }
        Ok(())
    }

    /// Stop a session's watcher: pending debounce state is discarded and the
    /// consumer task is awaited out.
    pub async fn stop(&self, session_id: &str) {
        let watch = {
            let mut guard = self.watches.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(session_id)
        };
        if let Some(watch) = watch {
            watch.cancel.cancel();
            let _ = watch.handle.await;
        }
    }

    pub async fn stop_all(&self) {
        let watches: Vec<SessionWatch> = {
            let mut guard = self.watches.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, watch)| watch).collect()
        };
        for watch in watches {
            watch.cancel.cancel();
            let _ = watch.handle.await;
        }
    }
}

struct SessionWatchTask {
    pool: Arc<WatcherPool>,
    session: Session,
    worktree: PathBuf,
    repo: PathBuf,
    cancel: CancellationToken,
}

impl SessionWatchTask {
    async fn run(self, mut rx: mpsc::Receiver<RawEvent>) {
        let drop_file = self.repo.join(self.session.drop_file_name());
        let shared_drop_file = self.repo.join(self.session.shared_drop_file_name());
        let commit_stability = self.pool.settings.commit_debounce();

        let mut pending: HashMap<PathBuf, (FileEventKind, Instant)> = HashMap::new();
        let mut tick = tokio::time::interval(FLUSH_POLL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(raw) = event else { break };
                    if self.accepts(&raw.path, &drop_file, &shared_drop_file) {
                        pending.insert(raw.path, (raw.kind, Instant::now()));
                    }
                }
                _ = tick.tick() => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(path, (_, last))| {
                            let threshold = if is_drop_file(path, &drop_file, &shared_drop_file) {
                                commit_stability
                            } else {
                                STABILITY
                            };
                            now.duration_since(*last) >= threshold
                        })
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        if let Some((kind, _)) = pending.remove(&path) {
                            self.flush(&path, kind, &drop_file, &shared_drop_file);
                        }
                    }
                }
            }
        }
    }

    /// Ignore predicate. Dotfiles are excluded except the drop files; the
    /// build/dependency directories and configured patterns are skipped.
    fn accepts(&self, path: &Path, drop_file: &Path, shared_drop_file: &Path) -> bool {
        if is_drop_file(path, drop_file, shared_drop_file) {
            return true;
        }
        let Ok(relative) = path.strip_prefix(&self.worktree) else {
            // Repository-root events only matter for the drop files.
            return false;
        };
        accepts_relative(relative, &self.pool.settings)
    }

    fn flush(
        &self,
        path: &Path,
        kind: FileEventKind,
        drop_file: &Path,
        shared_drop_file: &Path,
    ) {
        let session = &self.session;
        let relative = path
            .strip_prefix(&self.worktree)
            .or_else(|_| path.strip_prefix(&self.repo))
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();

        self.pool.events.publish(
            channels::WATCHER_FILE_CHANGED,
            json!({
                "sessionId": session.session_id,
                "path": relative,
                "kind": kind.as_str(),
            }),
        );

        if is_drop_file(path, drop_file, shared_drop_file) {
            if matches!(kind, FileEventKind::Add | FileEventKind::Change) {
                self.pool
                    .pipeline
                    .schedule_commit(session.clone(), path.to_path_buf());
            }
            return;
        }

        if let Err(err) = self.pool.activity.record_file_change(
            &self.repo,
            &session.session_id,
            &relative,
            kind.as_str(),
        ) {
            tracing::warn!(%err, "failed to record file-change activity");
        }

        if self.pool.settings.auto_lock
            && matches!(kind, FileEventKind::Add | FileEventKind::Change)
        {
            if let Err(err) = self.pool.locks.auto_lock(
                &self.repo,
                &session.session_id,
                session.agent_type.as_str(),
                &relative,
            ) {
                tracing::warn!(%err, path = %relative, "auto-lock failed");
            }
        }
    }
}

fn is_drop_file(path: &Path, drop_file: &Path, shared_drop_file: &Path) -> bool {
    path == drop_file || path == shared_drop_file
}

/// Worktree-relative ignore predicate: dotfiles, dependency and build output
/// directories, the worktree root, and configured patterns are excluded.
fn accepts_relative(relative: &Path, settings: &EngineSettings) -> bool {
    for component in relative.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.starts_with('.') {
            return false;
        }
        if IGNORED_DIRS.contains(&name.as_ref()) || name == settings.worktree_root {
            return false;
        }
    }
    let relative_str = relative.to_string_lossy();
    !settings
        .ignore_patterns
        .iter()
        .any(|pattern| relative_str.contains(pattern.as_str()))
}

fn map_event_kind(kind: &EventKind) -> Option<FileEventKind> {
    match kind {
        EventKind::Create(_) => Some(FileEventKind::Add),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FileEventKind::Change),
        EventKind::Remove(_) => Some(FileEventKind::Remove),
        _ => None,
    }
}

fn notify_error(err: notify::Error) -> EngineError {
    EngineError::Internal(format!("file watcher error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    #[test]
    fn test_map_event_kind() {
        assert_eq!(
            map_event_kind(&EventKind::Create(CreateKind::File)),
            Some(FileEventKind::Add)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileEventKind::Change)
        );
        assert_eq!(
            map_event_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FileEventKind::Remove)
        );
        assert_eq!(
            map_event_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(map_event_kind(&EventKind::Access(notify::event::AccessKind::Any)), None);
    }

    #[test]
    fn test_ignore_predicate() {
        let settings = EngineSettings::default();
        assert!(accepts_relative(Path::new("src/main.rs"), &settings));
        assert!(accepts_relative(Path::new("README.md"), &settings));

        assert!(!accepts_relative(Path::new(".git/index"), &settings));
        assert!(!accepts_relative(Path::new(".env"), &settings));
        assert!(!accepts_relative(Path::new("node_modules/pkg/index.js"), &settings));
        assert!(!accepts_relative(Path::new("target/debug/foo"), &settings));
        assert!(!accepts_relative(Path::new(".worktrees/other/file.rs"), &settings));
    }

    #[test]
    fn test_ignore_predicate_custom_patterns() {
        let settings = EngineSettings {
            ignore_patterns: vec!["generated".to_string()],
            ..EngineSettings::default()
        };
        assert!(!accepts_relative(Path::new("src/generated/api.rs"), &settings));
        assert!(accepts_relative(Path::new("src/handwritten/api.rs"), &settings));
    }
}

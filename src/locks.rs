//! On-disk edit-claim coordination between sessions.
//!
//! Declarations live as one JSON file per `(agent, session)` under
//! `<repo>/<coordination_dir>/active-edits/`; released declarations move to
//! `completed-edits/` for audit. The directory is shared with external agent
//! processes, so writes go through a temp file + rename and readers treat
//! missing or partially written JSON as "no declaration".

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{EngineError, EngineResult, LockConflictInfo};
use crate::events::{channels, EventBus};

/// Lifetime of a synthesized auto-lock; refreshed on every observed write.
const AUTO_LOCK_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    Edit,
    Create,
    Delete,
}

/// One session's claim over a set of files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditDeclaration {
    pub agent: String,
    pub session_id: String,
    pub files: Vec<String>,
    pub operation: EditOperation,
    pub reason: String,
    pub declared_at: String,
    pub estimated_duration_sec: u64,
    /// Synthesized from watcher events rather than declared explicitly
    #[serde(default)]
    pub auto: bool,
}

impl EditDeclaration {
    fn file_name(&self) -> String {
        declaration_file_name(&self.agent, &self.session_id)
    }

    /// Auto-locks expire after their TTL; explicit declarations never do.
    fn expired(&self, now: DateTime<Utc>) -> bool {
        if !self.auto {
            return false;
        }
        match DateTime::parse_from_rfc3339(&self.declared_at) {
            Ok(declared) => {
                let age = now.signed_duration_since(declared.with_timezone(&Utc));
                age.num_seconds() >= self.estimated_duration_sec as i64
            }
            Err(_) => false,
        }
    }
}

fn declaration_file_name(agent: &str, session_id: &str) -> String {
    format!("{agent}-{session_id}.json")
}

pub struct LockRegistry {
    coordination_dir: String,
    events: EventBus,
}

impl LockRegistry {
    pub fn new(coordination_dir: String, events: EventBus) -> Self {
        Self {
            coordination_dir,
            events,
        }
    }

    fn active_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.coordination_dir).join("active-edits")
    }

    fn completed_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.coordination_dir).join("completed-edits")
    }

    /// Claim `files` for a session. Fails with every blocking declaration
    /// when any file is covered by another session's live claim.
    pub fn declare(&self, repo: &Path, declaration: EditDeclaration) -> EngineResult<()> {
        let conflicts = self.blocking_declarations(
            repo,
            &declaration.files,
            Some(&declaration.session_id),
        )?;
        if !conflicts.is_empty() {
            return Err(EngineError::LockConflict { conflicts });
        }

        self.write_declaration(repo, &declaration)?;
        self.events.publish(
            channels::LOCK_CHANGED,
            json!({
                "sessionId": declaration.session_id,
                "agent": declaration.agent,
                "files": declaration.files,
                "change": "declared",
            }),
        );
        Ok(())
    }

    /// Synthesize or refresh the session's auto-lock declaration with `path`.
    /// Conflicting paths are left to the explicit `declare` flow; an auto-lock
    /// never steals a file another session already claims.
    pub fn auto_lock(
        &self,
        repo: &Path,
        session_id: &str,
        agent: &str,
        path: &str,
    ) -> EngineResult<()> {
        let blockers = self.blocking_declarations(repo, &[path.to_string()], Some(session_id))?;
        if !blockers.is_empty() {
            tracing::debug!(path, session_id, "auto-lock skipped, path claimed elsewhere");
            return Ok(());
        }

        let file = self
            .active_dir(repo)
            .join(declaration_file_name(agent, session_id));
        let mut declaration = read_declaration(&file).unwrap_or(EditDeclaration {
            agent: agent.to_string(),
            session_id: session_id.to_string(),
            files: Vec::new(),
            operation: EditOperation::Edit,
            reason: "auto-lock on file change".to_string(),
            declared_at: String::new(),
            estimated_duration_sec: AUTO_LOCK_TTL_SECS,
            auto: true,
        });
        if !declaration.files.iter().any(|existing| existing == path) {
            declaration.files.push(path.to_string());
        }
        declaration.declared_at = Utc::now().to_rfc3339();

        self.write_declaration(repo, &declaration)?;
        self.events.publish(
            channels::LOCK_CHANGED,
            json!({
                "sessionId": session_id,
                "agent": agent,
                "files": [path],
                "change": "auto-locked",
            }),
        );
        Ok(())
    }

    /// Blocking declarations for `paths` without modifying state.
    pub fn check(&self, repo: &Path, paths: &[String]) -> EngineResult<Vec<LockConflictInfo>> {
        self.blocking_declarations(repo, paths, None)
    }

    /// Move every live declaration owned by `session_id` to
    /// `completed-edits/`, retaining it for audit.
    pub fn release(&self, repo: &Path, session_id: &str) -> EngineResult<()> {
        let active = self.active_dir(repo);
        let entries = match fs::read_dir(&active) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let completed = self.completed_dir(repo);
        fs::create_dir_all(&completed)?;

        let mut released = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(declaration) = read_declaration(&path) else {
                continue;
            };
            if declaration.session_id != session_id {
                continue;
            }
            let target = completed.join(declaration.file_name());
            match fs::rename(&path, &target) {
                Ok(()) => released.extend(declaration.files),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        if !released.is_empty() {
            self.events.publish(
                channels::LOCK_CHANGED,
                json!({
                    "sessionId": session_id,
                    "files": released,
                    "change": "released",
                }),
            );
        }
        Ok(())
    }

    /// Declarations from sessions other than `exclude_session` covering any
    /// of `paths`. A directory read failure denies conservatively.
    fn blocking_declarations(
        &self,
        repo: &Path,
        paths: &[String],
        exclude_session: Option<&str>,
    ) -> EngineResult<Vec<LockConflictInfo>> {
        let declarations = self.read_all(repo)?;
        let now = Utc::now();
        let mut conflicts = Vec::new();
        for declaration in &declarations {
            if Some(declaration.session_id.as_str()) == exclude_session {
                continue;
            }
            if declaration.expired(now) {
                continue;
            }
            for path in paths {
                if declaration.files.iter().any(|file| file == path) {
                    conflicts.push(LockConflictInfo {
                        path: path.clone(),
                        session_id: declaration.session_id.clone(),
                        agent: declaration.agent.clone(),
                    });
                }
            }
        }
        Ok(conflicts)
    }

    fn read_all(&self, repo: &Path) -> EngineResult<Vec<EditDeclaration>> {
        let active = self.active_dir(repo);
        let entries = match fs::read_dir(&active) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                // Unknown state: claims must be denied, not granted.
                return Err(EngineError::CoordinationUnavailable(format!(
                    "{}: {err}",
                    active.display()
                )));
            }
        };

        let mut declarations = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(declaration) = read_declaration(&path) {
                declarations.push(declaration);
            }
        }
        Ok(declarations)
    }

    fn write_declaration(&self, repo: &Path, declaration: &EditDeclaration) -> EngineResult<()> {
        let active = self.active_dir(repo);
        fs::create_dir_all(&active)?;
        let target = active.join(declaration.file_name());
        let tmp = active.join(format!(".{}.tmp", declaration.file_name()));
        fs::write(&tmp, serde_json::to_string_pretty(declaration)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}

/// `None` on ENOENT or parse failure; a partially written file is simply
/// not a declaration yet.
fn read_declaration(path: &Path) -> Option<EditDeclaration> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

//! Append-only per-session activity records.
//!
//! Each session gets a JSON-lines log under `<toolkit>/activity/`. File
//! changes accumulate as in-flight entries; when a commit lands they are
//! attributed to it in a single commit record.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;

use crate::error::EngineResult;
use crate::git::CommitRecord;

pub struct ActivityLog {
    toolkit_dir: String,
    /// Paths changed since the last commit, per session
    in_flight: Mutex<HashMap<String, Vec<String>>>,
}

impl ActivityLog {
    pub fn new(toolkit_dir: String) -> Self {
        Self {
            toolkit_dir,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, repo: &Path, session_id: &str) -> PathBuf {
        repo.join(&self.toolkit_dir)
            .join("activity")
            .join(format!("{session_id}.log"))
    }

    /// Record an observed file change and keep it in flight until the next
    /// commit attribution.
    pub fn record_file_change(
        &self,
        repo: &Path,
        session_id: &str,
        path: &str,
        kind: &str,
    ) -> EngineResult<()> {
        self.append(
            repo,
            session_id,
            json!({
                "type": "file-change",
                "path": path,
                "kind": kind,
                "at": Utc::now().to_rfc3339(),
            }),
        )?;
        let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let entries = guard.entry(session_id.to_string()).or_default();
        if !entries.iter().any(|existing| existing == path) {
            entries.push(path.to_string());
        }
        Ok(())
    }

    /// Attribute all in-flight entries to `commit` and clear them.
    pub fn attribute_commit(
        &self,
        repo: &Path,
        session_id: &str,
        commit: &CommitRecord,
    ) -> EngineResult<()> {
        let attributed = {
            let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            guard.remove(session_id).unwrap_or_default()
        };
        self.append(
            repo,
            session_id,
            json!({
                "type": "commit",
                "hash": commit.hash,
                "shortHash": commit.short_hash,
                "message": commit.message,
                "filesChanged": commit.files_changed,
                "attributed": attributed,
                "at": Utc::now().to_rfc3339(),
            }),
        )
    }

    /// Drop any in-flight entries for a session without attributing them.
    pub fn clear(&self, session_id: &str) {
        let mut guard = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(session_id);
    }

    fn append(&self, repo: &Path, session_id: &str, record: serde_json::Value) -> EngineResult<()> {
        let path = self.log_path(repo, session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{record}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn commit_record() -> CommitRecord {
        CommitRecord {
            hash: "abc123".to_string(),
            short_hash: "abc".to_string(),
            message: "feat: thing".to_string(),
            author: "Test".to_string(),
            date: "2026-08-01T00:00:00+00:00".to_string(),
            files_changed: 1,
            additions: 2,
            deletions: 0,
            files: vec!["a.rs".to_string()],
        }
    }

    #[test]
    fn test_changes_attributed_to_commit() {
        let temp = TempDir::new().unwrap();
        let log = ActivityLog::new(".devops-agent".to_string());

        log.record_file_change(temp.path(), "sess-1", "src/a.rs", "change")
            .unwrap();
        log.record_file_change(temp.path(), "sess-1", "src/b.rs", "add")
            .unwrap();
        log.attribute_commit(temp.path(), "sess-1", &commit_record())
            .unwrap();

        let contents = std::fs::read_to_string(
            temp.path().join(".devops-agent/activity/sess-1.log"),
        )
        .unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "file-change");
        assert_eq!(lines[2]["type"], "commit");
        assert_eq!(lines[2]["attributed"][0], "src/a.rs");
        assert_eq!(lines[2]["attributed"][1], "src/b.rs");

        // In-flight entries were consumed.
        log.attribute_commit(temp.path(), "sess-1", &commit_record())
            .unwrap();
        let contents = std::fs::read_to_string(
            temp.path().join(".devops-agent/activity/sess-1.log"),
        )
        .unwrap();
        let last: serde_json::Value =
            serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert_eq!(last["attributed"].as_array().unwrap().len(), 0);
    }
}

//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recognized engine options. Unknown fields are rejected so callers notice
/// typos in their configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Enable the commit pipeline (drop-file driven commits)
    pub auto_commit: bool,
    /// Debounce quiescence window for drop-file writes, in milliseconds
    pub commit_interval: u64,
    /// Extra glob-ish patterns to watch (currently informational; the
    /// watcher is recursive over the whole worktree)
    pub watch_patterns: Vec<String>,
    /// Path substrings excluded from watching, on top of the built-ins
    pub ignore_patterns: Vec<String>,
    /// Synthesize edit declarations from observed file changes
    pub auto_lock: bool,
    /// Default rebase interval for new sessions; 0 disables
    pub rebase_default_hours: f64,
    /// Push after each successful commit
    pub push_on_commit: bool,
    /// Per-repo directory holding session worktrees
    pub worktree_root: String,
    /// Per-repo toolkit directory (descriptors, activity, heartbeats)
    pub toolkit_dir: String,
    /// Per-repo coordination directory (edit declarations)
    pub coordination_dir: String,
    /// Bounded timeout for a single Git invocation, in seconds
    pub git_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auto_commit: true,
            commit_interval: 1_000,
            watch_patterns: Vec::new(),
            ignore_patterns: Vec::new(),
            auto_lock: true,
            rebase_default_hours: 0.0,
            push_on_commit: true,
            worktree_root: ".worktrees".to_string(),
            toolkit_dir: ".devops-agent".to_string(),
            coordination_dir: ".file-coordination".to_string(),
            git_timeout_secs: 30,
        }
    }
}

impl EngineSettings {
    pub fn commit_debounce(&self) -> Duration {
        Duration::from_millis(self.commit_interval)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert!(settings.auto_commit);
        assert!(settings.auto_lock);
        assert!(settings.push_on_commit);
        assert_eq!(settings.commit_interval, 1_000);
        assert_eq!(settings.worktree_root, ".worktrees");
        assert_eq!(settings.git_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"autoCommit": false, "commitInterval": 250}"#).unwrap();
        assert!(!settings.auto_commit);
        assert_eq!(settings.commit_interval, 250);
        assert_eq!(settings.toolkit_dir, ".devops-agent");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = serde_json::from_str::<EngineSettings>(r#"{"autocommit": true}"#);
        assert!(result.is_err());
    }
}

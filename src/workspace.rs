//! Workspace provisioning: session worktrees, the per-repo toolkit
//! directory tree, and descriptor files.
//!
//! The provisioner exclusively allocates and deallocates worktree
//! directories. It never leaves the main working tree on a different branch:
//! branch creation checks out the base momentarily and restores the previous
//! HEAD even on failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::error::{EngineError, EngineResult};
use crate::events::{channels, EventBus};
use crate::git::GitDriver;
use crate::session::{AgentDescriptor, Session, SessionDescriptor};
use crate::settings::EngineSettings;

/// Branch disposal policy when a worktree is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCleanup {
    Keep,
    /// Delete only when fully merged (`-d` semantics); failure is ignored
    DeleteIfMerged,
    Force,
}

pub struct WorkspaceProvisioner {
    git: Arc<GitDriver>,
    events: EventBus,
    settings: EngineSettings,
}

impl WorkspaceProvisioner {
    pub fn new(git: Arc<GitDriver>, events: EventBus, settings: EngineSettings) -> Self {
        Self {
            git,
            events,
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Worktrees
    // ------------------------------------------------------------------

    /// Provision the worktree for a session branch. Idempotent: an existing
    /// worktree directory is treated as success and reused.
    pub async fn create(
        &self,
        repo: &Path,
        branch_name: &str,
        base_branch: &str,
        worktree_name: &str,
    ) -> EngineResult<PathBuf> {
        let worktree_path = repo.join(&self.settings.worktree_root).join(worktree_name);
        if worktree_path.exists() {
            tracing::debug!(path = %worktree_path.display(), "reusing existing worktree");
            return Ok(worktree_path);
        }
        if let Some(parent) = worktree_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !self.git.branch_exists(repo, branch_name).await? {
            self.create_branch_from_base(repo, branch_name, base_branch)
                .await?;
        }
        self.git
            .create_worktree(repo, branch_name, &worktree_path)
            .await?;

        self.rebind_remote(repo, &worktree_path).await;

        Ok(worktree_path)
    }

    /// Create `branch` from `base` via a momentary checkout of the base in
    /// the main repo. The previous HEAD is restored no matter what.
    async fn create_branch_from_base(
        &self,
        repo: &Path,
        branch: &str,
        base: &str,
    ) -> EngineResult<()> {
        let previous = self.git.current_branch(repo).await?;
        self.git.checkout(repo, base).await?;
        let created = self
            .git
            .create_branch(repo, branch)
            .await
            .map_err(EngineError::from);
        if previous != base {
            if let Err(err) = self.git.checkout(repo, &previous).await {
                tracing::error!(%err, branch = %previous, "failed to restore previous HEAD");
            }
        }
        created
    }

    /// When the repo is a sub-repository of a super-project, point the new
    /// worktree's origin at the parent's remote so agent pushes land there.
    /// Rebind failure falls back to the child remote with a warning event.
    async fn rebind_remote(&self, repo: &Path, worktree_path: &Path) {
        let parent = match self.git.superproject_root(repo).await {
            Ok(Some(parent)) => parent,
            Ok(None) => return,
            Err(err) => {
                tracing::debug!(%err, "superproject detection failed");
                return;
            }
        };

        let rebind = async {
            let url = self.git.remote_url(&parent).await?;
            self.git.set_remote_url(worktree_path, &url).await?;
            Ok::<_, EngineError>(url)
        };
        match rebind.await {
            Ok(url) => {
                tracing::info!(%url, worktree = %worktree_path.display(), "rebound worktree remote to super-project");
            }
            Err(err) => {
                tracing::warn!(%err, "remote rebind failed, keeping child remote");
                self.events.publish(
                    channels::WORKSPACE_REMOTE_REBIND_FAILED,
                    json!({
                        "worktreePath": worktree_path.to_string_lossy(),
                        "error": err.to_string(),
                    }),
                );
            }
        }
    }

    /// Force-remove the worktree, prune, and apply the branch policy.
    pub async fn remove(
        &self,
        repo: &Path,
        worktree_path: &Path,
        branch_name: &str,
        cleanup: BranchCleanup,
    ) -> EngineResult<()> {
        if worktree_path.exists() {
            self.git.remove_worktree(repo, worktree_path, true).await?;
        } else {
            self.git.prune_worktrees(repo).await?;
        }
        match cleanup {
            BranchCleanup::Keep => {}
            BranchCleanup::DeleteIfMerged => {
                if let Err(err) = self.git.delete_branch(repo, branch_name, false).await {
                    tracing::debug!(%err, branch = branch_name, "branch kept (not fully merged)");
                }
            }
            BranchCleanup::Force => {
                self.git.delete_branch(repo, branch_name, true).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Toolkit directory tree
    // ------------------------------------------------------------------

    pub fn toolkit_dir(&self, repo: &Path) -> PathBuf {
        repo.join(&self.settings.toolkit_dir)
    }

    pub fn sessions_dir(&self, repo: &Path) -> PathBuf {
        self.toolkit_dir(repo).join("sessions")
    }

    pub fn agents_dir(&self, repo: &Path) -> PathBuf {
        self.toolkit_dir(repo).join("agents")
    }

    pub fn activity_dir(&self, repo: &Path) -> PathBuf {
        self.toolkit_dir(repo).join("activity")
    }

    pub fn heartbeats_dir(&self, repo: &Path) -> PathBuf {
        self.toolkit_dir(repo).join("heartbeats")
    }

    pub fn commands_dir(&self, repo: &Path) -> PathBuf {
        self.toolkit_dir(repo).join("commands")
    }

    /// Ensure the toolkit tree and coordination directories exist, seeding
    /// `config.json` on first initialization.
    pub fn ensure_toolkit(&self, repo: &Path) -> EngineResult<()> {
        for dir in [
            self.sessions_dir(repo),
            self.agents_dir(repo),
            self.activity_dir(repo),
            self.heartbeats_dir(repo),
            self.commands_dir(repo),
            repo.join(&self.settings.coordination_dir).join("active-edits"),
            repo.join(&self.settings.coordination_dir)
                .join("completed-edits"),
        ] {
            fs::create_dir_all(dir)?;
        }

        let config_path = self.toolkit_dir(repo).join("config.json");
        if !config_path.exists() {
            let config = json!({
                "version": 1,
                "repoPath": repo.to_string_lossy(),
                "initialized": Utc::now().to_rfc3339(),
                "settings": &self.settings,
            });
            fs::write(&config_path, serde_json::to_string_pretty(&config)?)?;
        }

        self.ensure_git_excludes(repo)?;
        Ok(())
    }

    /// Keep engine artifacts out of `git add -A` and stashes by listing them
    /// in `.git/info/exclude`. The exclude file is shared by every worktree
    /// of the repository.
    fn ensure_git_excludes(&self, repo: &Path) -> EngineResult<()> {
        let common_dir = git_common_dir(repo);
        if !common_dir.exists() {
            return Ok(());
        }
        let exclude_path = common_dir.join("info").join("exclude");
        if let Some(parent) = exclude_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let existing = fs::read_to_string(&exclude_path).unwrap_or_default();
        let wanted = [
            format!("/{}/", self.settings.toolkit_dir),
            format!("/{}/", self.settings.coordination_dir),
            format!("/{}/", self.settings.worktree_root),
            "/.agent-config".to_string(),
            "/.devops-commit-*.msg".to_string(),
            "/.*-commit-msg".to_string(),
        ];
        let missing: Vec<&String> = wanted
            .iter()
            .filter(|line| !existing.lines().any(|existing_line| existing_line == line.as_str()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let mut contents = existing;
        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        for line in missing {
            contents.push_str(line);
            contents.push('\n');
        }
        fs::write(&exclude_path, contents)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session artifacts
    // ------------------------------------------------------------------

    pub fn write_session_descriptor(
        &self,
        repo: &Path,
        session: &Session,
        agent_id: &str,
    ) -> EngineResult<()> {
        let descriptor = SessionDescriptor::from_session(session, agent_id);
        let path = self
            .sessions_dir(repo)
            .join(format!("{}.json", session.session_id));
        fs::write(path, serde_json::to_string_pretty(&descriptor)?)?;
        Ok(())
    }

    pub fn write_agent_descriptor(
        &self,
        repo: &Path,
        descriptor: &AgentDescriptor,
    ) -> EngineResult<()> {
        let path = self
            .agents_dir(repo)
            .join(format!("{}.json", descriptor.agent_id));
        fs::write(path, serde_json::to_string_pretty(descriptor)?)?;
        Ok(())
    }

    /// Write the worktree `.agent-config` carrying identity and environment
    /// for the hosted agent.
    pub fn write_agent_config(
        &self,
        session: &Session,
        agent_id: &str,
    ) -> EngineResult<()> {
        let config = json!({
            "agentId": agent_id,
            "sessionId": session.session_id,
            "agentType": session.agent_type,
            "task": session.task,
            "branchName": session.branch_name,
            "baseBranch": session.base_branch,
            "repoPath": session.repo_path,
            "commitMessageFile": session.drop_file_name(),
        });
        let path = Path::new(&session.worktree_path).join(".agent-config");
        fs::write(path, serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }

    /// Record an agent heartbeat: `heartbeats/<agent_id>.beat` holds the
    /// latest timestamp.
    pub fn record_heartbeat(&self, repo: &Path, agent_id: &str) -> EngineResult<String> {
        let stamp = Utc::now().to_rfc3339();
        let path = self.heartbeats_dir(repo).join(format!("{agent_id}.beat"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &stamp)?;
        Ok(stamp)
    }

    /// Delete the session's descriptor files and drop files. Missing files
    /// are fine; this is also used by restart cleanup.
    pub fn remove_session_artifacts(&self, repo: &Path, session: &Session, agent_id: &str) {
        let paths = [
            self.sessions_dir(repo)
                .join(format!("{}.json", session.session_id)),
            self.agents_dir(repo).join(format!("{agent_id}.json")),
            self.heartbeats_dir(repo).join(format!("{agent_id}.beat")),
            repo.join(session.drop_file_name()),
            repo.join(session.shared_drop_file_name()),
        ];
        for path in paths {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), %err, "failed to remove session artifact");
                }
            }
        }
    }
}

/// Resolve the shared `.git` directory, following the `gitdir:` pointer when
/// `.git` is a file (sub-repositories, worktrees).
fn git_common_dir(repo: &Path) -> PathBuf {
    let dot_git = repo.join(".git");
    if dot_git.is_dir() {
        return dot_git;
    }
    if let Ok(contents) = fs::read_to_string(&dot_git) {
        if let Some(rest) = contents.trim().strip_prefix("gitdir:") {
            let gitdir = PathBuf::from(rest.trim());
            return if gitdir.is_absolute() {
                gitdir
            } else {
                repo.join(gitdir)
            };
        }
    }
    dot_git
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{new_session_id, AgentType, SessionStatus};
    use tempfile::TempDir;

    fn provisioner(settings: EngineSettings) -> WorkspaceProvisioner {
        let git = Arc::new(GitDriver::new(std::time::Duration::from_secs(30)));
        WorkspaceProvisioner::new(git, EventBus::default(), settings)
    }

    fn sample_session(repo: &Path) -> Session {
        let session_id = new_session_id();
        let now = Utc::now().to_rfc3339();
        Session {
            branch_name: crate::session::derive_branch_name(AgentType::Claude, &session_id),
            worktree_path: repo.join("wt").to_string_lossy().to_string(),
            session_id,
            agent_type: AgentType::Claude,
            task: "demo".to_string(),
            repo_path: repo.to_string_lossy().to_string(),
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

    #[test]
    fn test_ensure_toolkit_creates_tree_and_config() {
        let temp = TempDir::new().unwrap();
        let provisioner = provisioner(EngineSettings::default());
        provisioner.ensure_toolkit(temp.path()).unwrap();

        for sub in ["sessions", "agents", "activity", "heartbeats", "commands"] {
            assert!(temp.path().join(".devops-agent").join(sub).is_dir());
        }
        assert!(temp
            .path()
            .join(".file-coordination")
            .join("active-edits")
            .is_dir());

        let config_path = temp.path().join(".devops-agent").join("config.json");
        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(config["version"], 1);
        assert!(config["settings"]["autoCommit"].as_bool().unwrap());

        // Second run must not clobber the seeded config.
        let before = fs::read_to_string(&config_path).unwrap();
        provisioner.ensure_toolkit(temp.path()).unwrap();
        assert_eq!(fs::read_to_string(&config_path).unwrap(), before);
    }

    #[test]
    fn test_descriptor_and_heartbeat_files() {
        let temp = TempDir::new().unwrap();
        let provisioner = provisioner(EngineSettings::default());
        provisioner.ensure_toolkit(temp.path()).unwrap();

        let mut session = sample_session(temp.path());
        fs::create_dir_all(&session.worktree_path).unwrap();
        session.repo_path = temp.path().to_string_lossy().to_string();

        provisioner
            .write_session_descriptor(temp.path(), &session, "agent-1")
            .unwrap();
        provisioner.write_agent_config(&session, "agent-1").unwrap();
        provisioner.record_heartbeat(temp.path(), "agent-1").unwrap();

        let descriptor_path = temp
            .path()
            .join(".devops-agent/sessions")
            .join(format!("{}.json", session.session_id));
        let descriptor: SessionDescriptor =
            serde_json::from_str(&fs::read_to_string(descriptor_path).unwrap()).unwrap();
        assert_eq!(descriptor.session_id, session.session_id);
        assert_eq!(descriptor.agent_id, "agent-1");

        let agent_config: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(Path::new(&session.worktree_path).join(".agent-config")).unwrap(),
        )
        .unwrap();
        assert_eq!(agent_config["sessionId"], session.session_id.as_str());
        assert!(temp
            .path()
            .join(".devops-agent/heartbeats/agent-1.beat")
            .exists());
    }

    #[test]
    fn test_git_excludes_appended_once() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(".git")).unwrap();
        let provisioner = provisioner(EngineSettings::default());

        provisioner.ensure_toolkit(temp.path()).unwrap();
        let exclude = fs::read_to_string(temp.path().join(".git/info/exclude")).unwrap();
        assert!(exclude.contains("/.devops-agent/"));
        assert!(exclude.contains("/.worktrees/"));
        assert!(exclude.contains("/.agent-config"));
        assert!(exclude.contains("/.devops-commit-*.msg"));

        // Idempotent: a second pass adds nothing.
        provisioner.ensure_toolkit(temp.path()).unwrap();
        let again = fs::read_to_string(temp.path().join(".git/info/exclude")).unwrap();
        assert_eq!(exclude, again);
    }

    #[test]
    fn test_remove_session_artifacts_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        let provisioner = provisioner(EngineSettings::default());
        provisioner.ensure_toolkit(temp.path()).unwrap();
        let session = sample_session(temp.path());
        // Nothing written; removal must not error or panic.
        provisioner.remove_session_artifacts(temp.path(), &session, "agent-x");
    }
}

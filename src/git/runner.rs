//! Subprocess invocation of the host `git` tool.
//!
//! All driver operations funnel through [`GitDriver::run`], which serializes
//! invocations per repository path and bounds each one with a timeout.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::git::error::{classify_failure, GitError};

/// Async wrapper over the `git` binary.
///
/// Invocations against the same (canonicalized) working directory are
/// serialized through a per-path mutex so concurrent sessions cannot
/// interleave worktree mutations; distinct paths proceed in parallel.
pub struct GitDriver {
    timeout: Duration,
    repo_locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitDriver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            repo_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, cwd: &Path) -> Arc<Mutex<()>> {
        let key = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let mut locks = self.repo_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key).or_default().clone()
    }

    /// Run git in `cwd` and return trimmed stdout on success.
    pub(super) async fn run<I, S>(&self, cwd: &Path, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let lock = self.repo_lock(cwd);
        let _guard = lock.lock().await;
        self.run_unserialized(cwd, args).await
    }

    /// Run git without taking the per-repo lock. Only for callers that do not
    /// touch shared repository state (e.g. version probes).
    pub(super) async fn run_unserialized<I, S>(
        &self,
        cwd: &Path,
        args: I,
    ) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GitError::NotAvailable
            } else {
                GitError::Io(err)
            }
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(GitError::Io)?,
            Err(_) => return Err(GitError::Timeout(self.timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(classify_failure(output.status.code(), &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches(['\n', '\r'])
            .to_string())
    }

    /// Run git and report only whether it succeeded.
    pub(super) async fn run_check<I, S>(&self, cwd: &Path, args: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.run(cwd, args).await.is_ok()
    }
}

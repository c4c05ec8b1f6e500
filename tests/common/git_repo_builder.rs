//! Builder for creating test git repositories with a fluent API.
//!
//! # Example
//!
//! ```rust,ignore
//! let repo = GitRepoBuilder::new()
//!     .with_file("README.md", "hello")
//!     .commit("Initial commit")
//!     .with_branch("feature", true)
//!     .with_file("feature.txt", "new feature")
//!     .commit("Add feature")
//!     .build();
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

/// Test repository with optional bare origin.
pub struct TestRepo {
    temp: TempDir,
    origin: Option<TempDir>,
}

impl TestRepo {
    /// Path to the repository working tree.
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Path to the bare origin, if one was configured.
    pub fn origin_path(&self) -> Option<&Path> {
        self.origin.as_ref().map(|origin| origin.path())
    }

    /// Run git in the repository, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        run_git(self.temp.path(), args)
    }

    /// Run git in an arbitrary directory (e.g. a worktree), panicking on failure.
    pub fn git_in(&self, dir: &Path, args: &[&str]) -> String {
        run_git(dir, args)
    }

    /// Current HEAD commit hash.
    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"])
    }

    /// Current branch short name.
    pub fn current_branch(&self) -> String {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn write_file(&self, relative: &str, contents: &str) -> PathBuf {
        write_file(self.temp.path(), relative, contents)
    }

    /// Stage everything and commit in the main working tree.
    pub fn commit_all(&self, message: &str) -> String {
        self.git(&["add", "-A"]);
        self.git(&["commit", "--allow-empty", "-m", message]);
        self.head()
    }

    /// Stage everything and commit in a worktree.
    pub fn commit_all_in(&self, dir: &Path, message: &str) -> String {
        run_git(dir, &["add", "-A"]);
        run_git(dir, &["commit", "--allow-empty", "-m", message]);
        run_git(dir, &["rev-parse", "HEAD"])
    }
}

enum Operation {
    WriteFile { path: String, content: String },
    Commit { message: String },
    CreateBranch { name: String, checkout: bool },
    Checkout { branch: String },
}

/// Builder for creating test git repositories.
pub struct GitRepoBuilder {
    initial_branch: String,
    initial_commit_message: Option<String>,
    operations: Vec<Operation>,
    bare_origin: bool,
}

impl Default for GitRepoBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GitRepoBuilder {
    pub fn new() -> Self {
        Self {
            initial_branch: "main".to_string(),
            initial_commit_message: None,
            operations: Vec::new(),
            bare_origin: false,
        }
    }

    /// Create an initial empty commit after repo initialization.
    pub fn with_initial_commit(mut self, message: impl Into<String>) -> Self {
        self.initial_commit_message = Some(message.into());
        self
    }

    /// Write a file to the repository.
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.operations.push(Operation::WriteFile {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    /// Stage all changes and commit.
    pub fn commit(mut self, message: impl Into<String>) -> Self {
        self.operations.push(Operation::Commit {
            message: message.into(),
        });
        self
    }

    /// Create a new branch at the current HEAD.
    pub fn with_branch(mut self, name: impl Into<String>, checkout: bool) -> Self {
        self.operations.push(Operation::CreateBranch {
            name: name.into(),
            checkout,
        });
        self
    }

    /// Checkout an existing branch.
    pub fn checkout(mut self, branch: impl Into<String>) -> Self {
        self.operations.push(Operation::Checkout {
            branch: branch.into(),
        });
        self
    }

    /// Create a bare sibling repository, add it as `origin`, and push the
    /// current branch to it with tracking.
    pub fn with_bare_origin(mut self) -> Self {
        self.bare_origin = true;
        self
    }

    pub fn build(self) -> TestRepo {
        let temp = TempDir::new().expect("create temp dir");
        run_git(temp.path(), &["init"]);
        run_git(
            temp.path(),
            &[
                "symbolic-ref",
                "HEAD",
                &format!("refs/heads/{}", self.initial_branch),
            ],
        );
        run_git(temp.path(), &["config", "user.name", "Test User"]);
        run_git(temp.path(), &["config", "user.email", "test@example.com"]);
        run_git(temp.path(), &["config", "commit.gpgsign", "false"]);

        // Branch/checkout operations need at least one commit to exist.
        let needs_initial_commit =
            self.initial_commit_message.is_some() || !self.operations.is_empty();
        if needs_initial_commit {
            let message = self
                .initial_commit_message
                .unwrap_or_else(|| "Initial commit".to_string());
            run_git(temp.path(), &["commit", "--allow-empty", "-m", &message]);
        }

        for op in self.operations {
            match op {
                Operation::WriteFile { path, content } => {
                    write_file(temp.path(), &path, &content);
                }
                Operation::Commit { message } => {
                    run_git(temp.path(), &["add", "-A"]);
                    run_git(temp.path(), &["commit", "--allow-empty", "-m", &message]);
                }
                Operation::CreateBranch { name, checkout } => {
                    if checkout {
                        run_git(temp.path(), &["checkout", "-b", &name]);
                    } else {
                        run_git(temp.path(), &["branch", &name]);
                    }
                }
                Operation::Checkout { branch } => {
                    run_git(temp.path(), &["checkout", &branch]);
                }
            }
        }

        let origin = if self.bare_origin {
            let origin = TempDir::new().expect("create origin dir");
            run_git(origin.path(), &["init", "--bare"]);
            run_git(
                temp.path(),
                &["remote", "add", "origin", &origin.path().to_string_lossy()],
            );
            let branch = run_git(temp.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
            run_git(temp.path(), &["push", "-u", "origin", &branch]);
            Some(origin)
        } else {
            None
        };

        TestRepo { temp, origin }
    }
}

pub fn write_file(root: &Path, relative: &str, contents: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create file parent");
    }
    fs::write(&path, contents).expect("write file");
    path
}

pub fn run_git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("spawn git");
    if !output.status.success() {
        panic!(
            "git {:?} failed in {}: {}",
            args,
            cwd.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

//! Centralized error handling for the engine.
//!
//! This module provides a unified error handling approach with:
//! - Standardized error codes shared with consumers
//! - Clear error categories per component
//! - The uniform result envelope used by every request/response operation

use serde::Serialize;
use thiserror::Error;

use crate::git::GitError;

// ============================================================================
// Error Codes - Shared with consumers
// ============================================================================

/// Error code constants surfaced in result envelopes and events.
/// These are a stable taxonomy; consumers match on them.
pub mod codes {
    pub const INVALID_REPO: &str = "INVALID_REPO";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const ALREADY_EXISTS: &str = "ALREADY_EXISTS";
    pub const IO_FAILED: &str = "IO_FAILED";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const GIT_COMMIT_FAILED: &str = "GIT_COMMIT_FAILED";
    pub const GIT_PUSH_FAILED: &str = "GIT_PUSH_FAILED";
    pub const GIT_REBASE_CONFLICTS: &str = "GIT_REBASE_CONFLICTS";
    pub const GIT_FETCH_FAILED: &str = "GIT_FETCH_FAILED";
    pub const GIT_WORKTREE_FAILED: &str = "GIT_WORKTREE_FAILED";
    pub const GIT_TIMEOUT: &str = "GIT_TIMEOUT";
    pub const LOCK_CONFLICT: &str = "LOCK_CONFLICT";
    pub const COORDINATION_UNAVAILABLE: &str = "COORDINATION_UNAVAILABLE";
    pub const ORPHAN_DETECTED: &str = "ORPHAN_DETECTED";
    pub const RECOVERY_SKIPPED: &str = "RECOVERY_SKIPPED";
    pub const CANCELED: &str = "CANCELED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// A single blocking declaration reported inside a `LOCK_CONFLICT` error.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockConflictInfo {
    pub path: String,
    pub session_id: String,
    pub agent: String,
}

// ============================================================================
// Engine Error Type
// ============================================================================

/// The main error type covering everything the engine can fail with.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The supplied path is not a usable Git working tree
    #[error("invalid repository: {0}")]
    InvalidRepo(String),

    /// A session, repo, or record was requested that does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// An artifact that must be created already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from a Git invocation
    #[error(transparent)]
    Git(#[from] GitError),

    /// Another session holds live declarations covering the requested files
    #[error("files are claimed by other sessions ({} conflicts)", conflicts.len())]
    LockConflict { conflicts: Vec<LockConflictInfo> },

    /// The coordination directory could not be read; claims are denied
    #[error("coordination directory unavailable: {0}")]
    CoordinationUnavailable(String),

    /// The recovery sweep skipped a session
    #[error("recovery skipped: {0}")]
    RecoverySkipped(String),

    /// Expected durable state is gone (e.g. after an external wipe)
    #[error("stale state: {0}")]
    StaleState(String),

    /// The operation was canceled by session shutdown
    #[error("operation canceled")]
    Canceled,

    /// A non-Git operation exceeded its bounded timeout
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Serialization of persisted state failed
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Generic internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Get the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRepo(_) => codes::INVALID_REPO,
            EngineError::NotFound(_) => codes::NOT_FOUND,
            EngineError::AlreadyExists(_) => codes::ALREADY_EXISTS,
            EngineError::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                codes::PERMISSION_DENIED
            }
            EngineError::Io(_) => codes::IO_FAILED,
            EngineError::Git(err) => err.code(),
            EngineError::LockConflict { .. } => codes::LOCK_CONFLICT,
            EngineError::CoordinationUnavailable(_) => codes::COORDINATION_UNAVAILABLE,
            EngineError::RecoverySkipped(_) => codes::RECOVERY_SKIPPED,
            EngineError::StaleState(_) => codes::NOT_FOUND,
            EngineError::Canceled => codes::CANCELED,
            EngineError::Timeout(_) => codes::TIMEOUT,
            EngineError::Serde(_) => codes::IO_FAILED,
            EngineError::Internal(_) => codes::UNKNOWN,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

// ============================================================================
// Serializable Error for Consumers
// ============================================================================

/// Serializable error structure carried inside the failure envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    /// Blocking declarations, present only for `LOCK_CONFLICT`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<LockConflictInfo>>,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        let conflicts = match err {
            EngineError::LockConflict { conflicts } => Some(conflicts.clone()),
            _ => None,
        };
        ErrorResponse {
            code: err.code().to_string(),
            message: err.to_string(),
            conflicts,
        }
    }
}

// ============================================================================
// Result Envelope
// ============================================================================

/// Uniform result envelope for request/response operations:
/// `{ success: true, data }` or `{ success: false, error: { code, message } }`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(err: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorResponse::from(err)),
        }
    }
}

impl<T> From<Result<T, EngineError>> for Envelope<T> {
    fn from(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(data) => Envelope::ok(data),
            Err(err) => Envelope::err(&err),
        }
    }
}

/// Standard Result type for the engine.
pub type EngineResult<T> = Result<T, EngineError>;

//! Error taxonomy for the supsrc core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the filesystem watcher (C1).
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to start watcher for {path}: {source}")]
    Start {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("watched path vanished: {0}")]
    PathLost(PathBuf),

    #[error("failed to load ignore rules at {path}: {source}")]
    IgnoreLoad {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },
}

/// Errors classified on a failed Git operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GitErrorKind {
    #[error("path is not a git repository")]
    NotARepo,
    #[error("index is locked")]
    IndexLocked,
    #[error("network error")]
    Network,
    #[error("non-fast-forward push rejected")]
    NonFastForward,
    #[error("authentication failed")]
    Auth,
    #[error("{0}")]
    Generic(String),
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to open repository at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    #[error("repository has no working directory")]
    NoWorkdir,

    #[error("repository has no commits yet (unborn HEAD)")]
    UnbornHead,

    #[error("git operation failed: {kind}")]
    Operation {
        kind: GitErrorKind,
        #[source]
        source: git2::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Classify a raw `git2::Error` per the §7 error taxonomy.
    pub fn classify(source: git2::Error) -> Self {
        let kind = match source.code() {
            git2::ErrorCode::NotFound if source.class() == git2::ErrorClass::Repository => {
                GitErrorKind::NotARepo
            }
            git2::ErrorCode::Locked => GitErrorKind::IndexLocked,
            _ if source.class() == git2::ErrorClass::Net => GitErrorKind::Network,
            _ if source.class() == git2::ErrorClass::Ssh
            || source.class() == git2::ErrorClass::Http =>
            {
                GitErrorKind::Auth
            }
            git2::ErrorCode::NotFastForward => GitErrorKind::NonFastForward,
            _ => GitErrorKind::Generic(source.message().to_string()),
        };
        GitError::Operation { kind, source }
    }
}

/// Errors from the action workflow (C7).
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("status probe failed: {0}")]
    Status(String),

    #[error("staging failed: {0}")]
    Stage(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("llm hook vetoed changes: {0}")]
    ReviewVetoed(String),

    #[error("test hook failed with exit code {code:?}: {message}")]
    TestFailed { code: Option<i32>, message: String },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors from persisted per-repo state files.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state document: {0}")]
    InvalidDocument(String),

    #[error("failed to parse state document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level aggregated error for the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DaemonError> for tonic::Status {
    fn from(err: DaemonError) -> Self {
        match &err {
            DaemonError::RepoNotFound(_) => tonic::Status::not_found(err.to_string()),
            DaemonError::Git(GitError::Operation {
                    kind: GitErrorKind::NotARepo,
                    ..
            }) => tonic::Status::invalid_argument(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

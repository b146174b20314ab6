use std::path::PathBuf;

/// All errors produced by branchstore.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("conflict on {path}: expected ctime {expected}, found {}", fmt_ctime(.actual))]
    Conflict {
        path: String,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("watcher already registered: {0}")]
    WatcherExists(String),

    #[error("unknown watcher: {0}")]
    UnknownWatcher(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("branch closed: {0}")]
    BranchClosed(String),

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn fmt_ctime(actual: &Option<i64>) -> String {
    match actual {
        Some(ctime) => ctime.to_string(),
        None => "none (file absent)".into(),
    }
}

// ---------------------------------------------------------------------------
// Convenience constructors
// ---------------------------------------------------------------------------

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    pub fn invalid_branch_name(name: impl Into<String>) -> Self {
        Self::InvalidBranchName(name.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn branch_exists(name: impl Into<String>) -> Self {
        Self::BranchExists(name.into())
    }

    pub fn conflict(path: impl Into<String>, expected: i64, actual: Option<i64>) -> Self {
        Self::Conflict {
            path: path.into(),
            expected,
            actual,
        }
    }

    pub fn watcher_exists(id: impl Into<String>) -> Self {
        Self::WatcherExists(id.into())
    }

    pub fn unknown_watcher(id: impl Into<String>) -> Self {
        Self::UnknownWatcher(id.into())
    }

    pub fn unknown_subscription(id: impl Into<String>) -> Self {
        Self::UnknownSubscription(id.into())
    }

    pub fn branch_closed(name: impl Into<String>) -> Self {
        Self::BranchClosed(name.into())
    }

    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }

    pub fn storage_msg(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into().into())
    }

    pub fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.into().display(), err),
        ))
    }

    /// `true` for the optimistic-concurrency failure of a conditional write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

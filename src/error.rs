use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// A path or URI that cannot be mapped to a stable location key.
    #[error("Unresolvable location: {0}")]
    UnresolvableLocation(String),

    /// The backing store of a fragment failed its integrity check.
    #[error("Corrupt fragment: {0}")]
    CorruptFragment(String),

    #[error("Timed out after {timeout_ms}ms waiting for {lock} lock")]
    LockTimeout { lock: &'static str, timeout_ms: u64 },

    #[error("Unsupported snapshot format: {format} version {version}")]
    UnsupportedSnapshotFormat { format: String, version: String },

    #[error("Update of {location} failed: {reason}")]
    PartialUpdateFailure { location: String, reason: String },

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Watcher error: {0}")]
    Watcher(String),
}

impl IndexerError {
    /// Errors that mean the backing store must be rebuilt rather than used.
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexerError::CorruptFragment(_))
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

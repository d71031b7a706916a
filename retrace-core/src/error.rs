use thiserror::Error;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("compression error: {0}")]
    Compression(std::io::Error),

    #[error("invalid exclude pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: globset::Error,
    },

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient disk space: need {needed} bytes, available {available} bytes")]
    InsufficientStorage { needed: u64, available: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HistoryError {
    /// True for the transient SQLite write-contention error. Batches that
    /// fail this way are retried whole by the capture worker. The lock
    /// error may surface per statement or wrapped in a transaction
    /// begin/commit failure, so classification is by message.
    pub fn is_busy(&self) -> bool {
        self.to_string().contains("database is locked")
    }
}

pub type Result<T> = std::result::Result<T, HistoryError>;

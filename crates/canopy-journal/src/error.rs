use thiserror::Error;

/// Errors produced by journal backends.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serialization(String),

    #[error("journal corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
}

pub type JournalResult<T> = Result<T, JournalError>;

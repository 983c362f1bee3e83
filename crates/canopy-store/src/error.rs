use thiserror::Error;

use canopy_types::TypeError;

/// Errors produced by document stores and the translator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached or refused the operation. No partial
    /// effect has occurred when this is returned from a batch.
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The document was written by a newer schema than this build knows.
    #[error("unsupported document schema version {found} (current is {current})")]
    Schema { found: i64, current: i64 },

    #[error("malformed document: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Key(#[from] TypeError),
}

pub type StoreResult<T> = Result<T, StoreError>;

use thiserror::Error;

use canopy_cache::CacheError;
use canopy_store::StoreError;
use canopy_types::{SessionId, TypeError};

/// Errors produced by the repository facade.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("no such workspace: {0}")]
    NoSuchWorkspace(String),

    #[error("workspace already exists: {0}")]
    WorkspaceAlreadyExists(String),

    #[error("no such session: {0}")]
    NoSuchSession(SessionId),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Key(#[from] TypeError),
}

pub type RepoResult<T> = Result<T, RepoError>;

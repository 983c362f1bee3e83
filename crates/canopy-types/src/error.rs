use thiserror::Error;

/// Errors produced by type construction and parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("workspace id must not be empty")]
    EmptyWorkspaceId,

    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("identifier contains the reserved delimiter ':': {0}")]
    ReservedDelimiter(String),

    #[error("malformed node key: {0}")]
    MalformedKey(String),
}

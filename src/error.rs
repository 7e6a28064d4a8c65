//! Typed errors surfaced by the core operations.

use std::error::Error;
use std::fmt;

/// Failure kinds a core operation can surface to the boundary layer.
///
/// Each variant carries a human-readable detail string; mapping these to
/// user-visible responses is the boundary's job, never the core's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Both the primary and the fallback completion attempt failed.
    Completion(String),
    /// Similarity search against the vector index failed.
    Retrieval(String),
    /// Writing documents into the vector index failed.
    Upsert(String),
    /// Deleting documents from the vector index failed.
    Delete(String),
    /// The vector index connection could not be established.
    IndexInit(String),
    /// Malformed input rejected before any core call.
    Validation(String),
    /// The referenced session or agent does not exist.
    NotFound(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completion(detail) => write!(f, "completion failed: {detail}"),
            Self::Retrieval(detail) => write!(f, "retrieval failed: {detail}"),
            Self::Upsert(detail) => write!(f, "upsert failed: {detail}"),
            Self::Delete(detail) => write!(f, "delete failed: {detail}"),
            Self::IndexInit(detail) => write!(f, "index initialization failed: {detail}"),
            Self::Validation(detail) => write!(f, "invalid input: {detail}"),
            Self::NotFound(detail) => write!(f, "not found: {detail}"),
        }
    }
}

impl Error for CoreError {}

/// Convenience alias for fallible core operations.
pub type CoreResult<T> = Result<T, CoreError>;

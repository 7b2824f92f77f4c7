//! Crate-wide error type.
//!
//! Every layer (refs, committed, staging, catalog) reports through the same
//! taxonomy so callers can classify without knowing which manager failed.
//! We use `thiserror` for ergonomic error definition.

use thiserror::Error;

use crate::types::ObjectPath;

/// The error type for all catalog operations.
#[derive(Debug, Error)]
pub enum Error {
    /// an entity (repository, branch, commit, entry, ...) is absent
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// uniqueness violated on create
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    /// merge conflict, with the paths both sides changed
    #[error("merge conflict on {} path(s): {paths:?}", paths.len())]
    Conflict { paths: Vec<ObjectPath> },

    /// compare-and-set lost a race on a single key
    #[error("concurrent update on {key}")]
    CasFailed { key: String },

    /// a ref prefix matched more than one commit
    #[error("ambiguous ref: {0}")]
    AmbiguousRef(String),

    /// malformed input: bad identifiers, out-of-order change streams, ...
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// commit was requested with an empty staging area
    #[error("nothing to commit")]
    NothingToCommit,

    /// the operation's context was canceled
    #[error("operation canceled")]
    Canceled,

    /// record serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// canonical payload decoding failed
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// any other failure from the KV or blob backend
    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn invalid_input(reason: impl Into<String>) -> Self {
        Error::InvalidInput(reason.into())
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// check if this error is a conflict (merge or lost CAS race)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. } | Error::CasFailed { .. })
    }

    /// check if retrying the whole operation may succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::CasFailed { .. })
    }
}

/// result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

//! Storage layer error types
//!
//! Every backend operation returns [`StoreResult`]. The first four variants are
//! ordinary outcomes callers branch on; the rest mean the store itself is not
//! working and the operation failed outright.

use std::path::PathBuf;

use thiserror::Error;

/// the main error type for object and reference storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// no object or reference with this key
    #[error("not found: {0}")]
    NotFound(String),

    /// more than one object matched a short id
    #[error("ambiguous object prefix {prefix} ({nibbles} hex digits)")]
    Ambiguous { prefix: String, nibbles: usize },

    /// the reference already exists and the write was not forced
    #[error("reference already exists: {0}")]
    AlreadyExists(String),

    /// malformed glob, prefix length or name
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// a result buffer could not be allocated
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// a uniqueness guarantee of the tables did not hold
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// prepare/bind/execute/fetch failure or lost connection
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    /// error from libgit2 (hashing, pack indexing)
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (temporary pack files)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// stored payload could not be inflated or has the wrong length
    #[error("corrupt payload for {oid}: {reason}")]
    Corrupt { oid: String, reason: String },

    /// the object and reference tables are missing
    #[error("store not initialized: {0}")]
    NotInitialized(PathBuf),

    /// `create` found the tables already present
    #[error("store already initialized: {0}")]
    AlreadyInitialized(PathBuf),

    /// bad configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StorageError {
    /// check if this error indicates the object or reference doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    /// check if a short id matched several objects
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, StorageError::Ambiguous { .. })
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::AlreadyExists(_))
    }

    /// Expected outcomes the caller can branch on, as opposed to a
    /// malfunctioning store.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound(_)
                | StorageError::Ambiguous { .. }
                | StorageError::AlreadyExists(_)
                | StorageError::InvalidSpec(_)
        )
    }

    pub(crate) fn inconsistency(what: impl Into<String>) -> Self {
        let what = what.into();
        tracing::error!(%what, "uniqueness invariant violated");
        StorageError::InternalInconsistency(what)
    }
}

/// result type alias for storage operations
pub type StoreResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found = StorageError::NotFound("refs/heads/main".into());
        assert!(not_found.is_not_found());
        assert!(not_found.is_recoverable());
        assert!(!not_found.is_conflict());

        let conflict = StorageError::AlreadyExists("refs/heads/main".into());
        assert!(!conflict.is_not_found());
        assert!(conflict.is_conflict());
        assert!(conflict.is_recoverable());

        let ambiguous = StorageError::Ambiguous {
            prefix: "ab".into(),
            nibbles: 2,
        };
        assert!(ambiguous.is_ambiguous());
        assert!(ambiguous.is_recoverable());
    }

    #[test]
    fn test_malfunctions_are_not_recoverable() {
        let broken = StorageError::InternalInconsistency("two rows for HEAD".into());
        assert!(!broken.is_recoverable());

        let backend = StorageError::Backend(rusqlite::Error::QueryReturnedNoRows);
        assert!(!backend.is_recoverable());
        assert!(!backend.is_not_found());

        let oom = StorageError::OutOfMemory { requested: usize::MAX };
        assert!(!oom.is_recoverable());
    }
}

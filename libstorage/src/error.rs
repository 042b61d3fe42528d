//! Storage error types.
//!
//! All errors in the `libstorage` crate are represented by the
//! [`StorageError`] enum, which derives [`thiserror::Error`] for ergonomic
//! error handling. The variants follow the taxonomy the driver contract
//! exposes to its orchestrator: soft not-found conditions, retriable
//! busy-volume conditions, validation failures, and fatal backend problems.

use thiserror::Error;

/// Unified error type for storage-driver operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The named remote resource does not exist.
    ///
    /// This is a *soft* condition: operations that answer existence questions
    /// (such as `has_volume`) catch it internally and return a boolean.
    #[error("{0} not found")]
    NotFound(String),

    /// The volume is still held by another caller; retry later.
    #[error("volume {0} is in use")]
    InUse(String),

    /// The operation is not supported by this backend.
    #[error("operation not supported by this backend")]
    NotSupported,

    /// A configuration key failed its validator.
    #[error("invalid value for config key {key:?}: {reason}")]
    Validation {
        /// The offending configuration key.
        key: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The remote controller or a required local capability is unavailable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The remote controller returned an error.
    #[error("remote controller error: {0}")]
    Remote(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Create a [`StorageError::Remote`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn remote<E: std::fmt::Display>(e: E) -> Self {
        Self::Remote(e.to_string())
    }

    /// Create a [`StorageError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`StorageError::Validation`] for `key`.
    pub fn validation(key: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            key: key.to_owned(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the soft not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

//! Error kinds surfaced by the file-state cache.
//!
//! The cache reports failures as typed kinds rather than strings, because
//! most of them translate directly into SMB-level status codes at the
//! protocol layer: a sharing violation becomes `STATUS_SHARING_VIOLATION`,
//! a byte-range conflict becomes `STATUS_LOCK_NOT_GRANTED`, and so on.
//!
//! Every variant is serializable so task replies can carry failures across
//! the cluster unchanged. Cause chains are kept as nested boxed errors and
//! exposed through [`std::error::Error::source`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the cache.
pub type StateResult<T> = Result<T, StateError>;

/// Why a share-mode intersection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingReason {
    /// The current opener holds the file exclusively (shared access NONE).
    Exclusive,
    /// The requested sharing mode is not a subset of the current one.
    Mismatch,
    /// The current sharing mode does not allow the requested write access.
    WriteDisallowed,
    /// The requester asked for exclusive access to an already-open file.
    RequesterExclusive,
}

impl fmt::Display for SharingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            SharingReason::Exclusive => "file is open exclusively",
            SharingReason::Mismatch => "sharing mode mismatch",
            SharingReason::WriteDisallowed => "sharing mode disallows write",
            SharingReason::RequesterExclusive => "requester wants exclusive access",
        };
        f.write_str(msg)
    }
}

/// Failure kinds reported by cache operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum StateError {
    /// Share-mode intersection failed during a file open.
    #[error("sharing violation: {reason}")]
    SharingViolation {
        /// Reason code for the SMB response.
        reason: SharingReason,
    },

    /// CREATE disposition hit a file that is already open.
    #[error("file exists: {0}")]
    FileExists(String),

    /// Access refused for reasons other than sharing modes. Persistent
    /// cluster failures also surface through this kind, with the underlying
    /// error attached for operators.
    #[error("access denied: {detail}")]
    AccessDenied {
        /// Human-readable detail for the log.
        detail: String,
        /// Underlying failure, if any.
        #[source]
        cause: Option<Box<StateError>>,
    },

    /// An incompatible oplock is already present on the path.
    #[error("oplock already exists on {0}")]
    ExistingOpLock(String),

    /// Byte-range overlap with a lock held by a different owner.
    #[error("lock conflict on {path} at {offset}+{length}")]
    LockConflict {
        /// Normalized path of the file.
        path: String,
        /// Offset of the rejected lock.
        offset: u64,
        /// Length of the rejected lock.
        length: u64,
    },

    /// Remove of a byte-range lock that does not exist.
    #[error("not locked: {path} at {offset}+{length}")]
    NotLocked {
        /// Normalized path of the file.
        path: String,
        /// Offset of the missing lock.
        offset: u64,
        /// Length of the missing lock.
        length: u64,
    },

    /// The deferred-request queue rejected the request.
    #[error("failed to defer request: {0}")]
    DeferFailed(String),

    /// An oplock break was not acknowledged in time; every deferred request
    /// waiting on it fails with this kind through the thread-pool seam.
    #[error("oplock break timed out on {0}")]
    OplockBreakTimeout(String),

    /// Task dispatch failed in a retriable way (partition owner changed
    /// mid-flight, executor shut down). Retried once transparently by the
    /// task runtime before surfacing.
    #[error("cluster task failed: {0}")]
    ClusterTransient(String),

    /// Startup-time configuration error.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The state map is unreachable; the cache has declared itself down and
    /// rejects further operations until restarted.
    #[error("file state cache is down: {0}")]
    Fatal(String),
}

impl StateError {
    /// True for failures the task runtime may retry once transparently.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateError::ClusterTransient(_))
    }

    /// Wraps a persistent cluster failure the way the protocol layer needs
    /// it: an access denial with the original error attached as the cause.
    pub fn into_access_denied(self) -> StateError {
        StateError::AccessDenied {
            detail: "cluster operation failed".to_string(),
            cause: Some(Box::new(self)),
        }
    }
}

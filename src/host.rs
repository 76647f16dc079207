//! Interfaces between the cache core and its host file server.
//!
//! The cache does not parse protocol packets, own worker threads or talk
//! to clients; the hosting server does. These traits are the seams: the
//! host implements them and hands the implementations to the cache at
//! construction time. Everything here is deliberately narrow - only the
//! calls the core actually makes.

use async_trait::async_trait;

use crate::error::{StateError, StateResult};
use crate::state::oplock::OpLockType;
use crate::state::{FileState, StatusChangeReason};

/// An SMB request parked while an oplock break is in flight.
///
/// The packet is opaque to the cache; the session id and packet bytes are
/// whatever the host needs to resume processing later.
#[derive(Debug, Clone)]
pub struct DeferredRequest {
    /// Host-side session identifier.
    pub session_id: u64,
    /// The parked protocol packet.
    pub packet: Vec<u8>,
    /// Unix millis after which the deferral has outlived its lease.
    pub expires_at: i64,
}

/// The live oplock handle for a session on this node.
///
/// Holds protocol session references and therefore never leaves the node;
/// the replicated record only carries the owner and type.
#[async_trait]
pub trait LocalOpLock: Send + Sync {
    /// Current oplock type held by the session.
    fn lock_type(&self) -> OpLockType;

    /// Asks the owning client to give up the oplock.
    ///
    /// The host sends the break packet to the client; the acknowledgment
    /// arrives later through `change_oplock_type` or `clear_oplock`.
    async fn request_break(&self) -> StateResult<()>;

    /// True while a break has been requested but not acknowledged.
    fn break_in_progress(&self) -> bool;
}

/// Host-side oplock bookkeeping the core pings when cluster events settle
/// an oplock's fate.
pub trait OpLockManager: Send + Sync {
    /// Cancels any host-side break timer for the path; called when a break
    /// completes or the oplock type changes.
    fn cancel_break_timer(&self, path: &str);
}

/// Receives path-level change notifications fired from message handlers.
///
/// Delivery to clients (SMB change notify) is entirely the host's concern.
pub trait NotifyChangeHandler: Send + Sync {
    /// A file or folder appeared or disappeared at `path`.
    fn notify_file_changed(&self, reason: StatusChangeReason, path: &str);

    /// A path was renamed.
    fn notify_rename(&self, old_path: &str, new_path: &str);
}

/// The server's worker pool, used to reprocess deferred SMB requests once
/// an oplock break settles.
pub trait ThreadPool: Send + Sync {
    /// Hands a previously deferred request back for reprocessing.
    fn requeue_request(&self, path: &str, request: DeferredRequest);

    /// Reports a deferred request that cannot be resumed; the host fails
    /// the client request with the given error.
    fn fail_request(&self, path: &str, request: DeferredRequest, error: StateError);
}

/// Observer of state-cache lifecycle events.
///
/// All methods have no-op defaults so hosts implement only what they need.
pub trait FileStateListener: Send + Sync {
    /// A state record was created.
    fn file_state_created(&self, _state: &FileState) {}

    /// A state record was explicitly removed.
    fn file_state_removed(&self, _state: &FileState) {}

    /// A state record was renamed.
    fn file_state_renamed(&self, _old_path: &str, _new_path: &str) {}

    /// The reaper wants to drop an expired idle state. Return `false` to
    /// veto the removal; the state will be reconsidered next pass.
    fn file_state_expired(&self, _state: &FileState) -> bool {
        true
    }
}

/// Observer of cluster membership changes.
pub trait MembershipListener: Send + Sync {
    /// A member joined the cluster.
    fn member_joined(&self, node: &str);

    /// A member left the cluster.
    fn member_left(&self, node: &str);
}

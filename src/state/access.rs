//! File access arbitration: sharing modes, open parameters and tokens.
//!
//! The grant and release policies here are the heart of SMB open semantics.
//! Both run inside remote tasks on the key's owner node with the per-key
//! lock held, so they mutate the record directly and rely on the runtime
//! for atomicity.
//!
//! The sharing-mode bookkeeping follows the first-opener rule: the sharing
//! mode, owner node and process id are recorded when the open count goes
//! from zero to one and are never rewritten while the file stays open.
//! Later opens only intersect their request against the recorded values.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use crate::error::{SharingReason, StateError, StateResult};
use crate::state::oplock::{OpLockType, RemoteOpLock};
use crate::state::FileState;

bitflags! {
    /// Requested access to the file's contents.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct AccessMode: u32 {
        /// Read the file data.
        const READ   = 0x01;
        /// Write the file data.
        const WRITE  = 0x02;
        /// Delete the file.
        const DELETE = 0x04;
    }
}

impl AccessMode {
    /// True for a pure read request.
    pub fn is_read_only(self) -> bool {
        self.contains(AccessMode::READ) && !self.contains(AccessMode::WRITE)
    }

    /// True for a pure write request.
    pub fn is_write_only(self) -> bool {
        self.contains(AccessMode::WRITE) && !self.contains(AccessMode::READ)
    }
}

bitflags! {
    /// SMB sharing mode: which kinds of concurrent access the opener
    /// tolerates. The permissive default (all bits) applies while a file
    /// is closed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SharedAccess: u32 {
        /// Others may read.
        const READ   = 0x01;
        /// Others may write.
        const WRITE  = 0x02;
        /// Others may delete.
        const DELETE = 0x04;
    }
}

impl Default for SharedAccess {
    fn default() -> SharedAccess {
        SharedAccess::all()
    }
}

/// How the open request treats an existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenAction {
    /// Open an existing file.
    Open,
    /// Create a new file; fails when the path is already open.
    Create,
    /// Open the file, creating it when absent.
    OpenOrCreate,
}

/// Parameters of one file open request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenParams {
    /// Raw path as received from the protocol layer.
    pub path: String,
    /// Process id of the opening client.
    pub process_id: i64,
    /// Requested access.
    pub access: AccessMode,
    /// Sharing mode the opener grants to others.
    pub shared_access: SharedAccess,
    /// Disposition toward an existing file.
    pub open_action: OpenAction,
    /// SMB impersonation level of the request.
    pub impersonation: i32,
    /// Oplock requested with the open; only Batch and Exclusive are
    /// requestable here.
    pub requested_oplock: OpLockType,
    /// True when the target is a directory.
    pub directory: bool,
    /// True for an attributes-only open that bypasses sharing checks and
    /// does not count as an open handle.
    pub attributes_only: bool,
    /// Requesting node; filled in by the cache before dispatch.
    pub requester: NodeId,
}

impl OpenParams {
    /// Creates open parameters with the common fields; the rest default to
    /// a plain existing-file open.
    pub fn new(
        path: &str,
        process_id: i64,
        access: AccessMode,
        shared_access: SharedAccess,
    ) -> OpenParams {
        OpenParams {
            path: path.to_string(),
            process_id,
            access,
            shared_access,
            open_action: OpenAction::Open,
            impersonation: 0,
            requested_oplock: OpLockType::None,
            directory: false,
            attributes_only: false,
            requester: NodeId::new(""),
        }
    }
}

/// The serializable core of an access token; enough to release the grant
/// on any node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    /// Normalized path the token covers.
    pub path: String,
    /// Node the grant was issued to.
    pub owner_node: NodeId,
    /// Process id of the opener.
    pub process_id: i64,
    /// True when the grant was attributes-only and did not raise the open
    /// count.
    pub attributes_only: bool,
    /// Oplock granted together with the open, `None` when none was.
    pub granted_oplock: OpLockType,
}

/// Result of a successful grant, as returned by the GrantAccess task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Token core for the caller's access-token guard.
    pub token: TokenInfo,
    /// Oplock granted with this open, `None` when none.
    pub granted_oplock: OpLockType,
    /// False when an oplock cannot be granted because the file is already
    /// open elsewhere.
    pub oplock_available: bool,
    /// Oplock already held on the file, if any; the caller decides whether
    /// a break is needed before completing its request.
    pub existing_oplock: Option<RemoteOpLock>,
    /// Open count after the grant.
    pub open_count: u32,
    /// Snapshot of the record after the grant, for the caller's near-cache.
    pub state: FileState,
}

/// Result of the ReleaseAccess task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    /// Open count after the release.
    pub open_count: u32,
    /// True when the release also cleared the file's oplock.
    pub oplock_cleared: bool,
}

enum ShareDecision {
    Allow,
    AllowNoOplock,
    Deny(SharingReason),
}

/// Applies the share-mode intersection table for an open against an
/// already-open file.
fn check_share_modes(
    current: SharedAccess,
    requested_access: AccessMode,
    requested_share: SharedAccess,
) -> ShareDecision {
    if requested_access.is_read_only() && current.contains(SharedAccess::READ) {
        return ShareDecision::Allow;
    }
    if requested_access.is_write_only() && current.contains(SharedAccess::WRITE) {
        return ShareDecision::Allow;
    }
    if current.is_empty() {
        return ShareDecision::Deny(SharingReason::Exclusive);
    }
    if current & requested_share != requested_share {
        return ShareDecision::Deny(SharingReason::Mismatch);
    }
    if requested_share.is_empty() {
        return ShareDecision::Deny(SharingReason::RequesterExclusive);
    }
    if requested_access.contains(AccessMode::READ | AccessMode::WRITE)
        && current.contains(SharedAccess::WRITE)
    {
        return ShareDecision::AllowNoOplock;
    }
    if requested_access.contains(AccessMode::WRITE) {
        return ShareDecision::Deny(SharingReason::WriteDisallowed);
    }
    if requested_access.contains(AccessMode::READ) && !current.contains(SharedAccess::READ) {
        return ShareDecision::Deny(SharingReason::Mismatch);
    }
    // Delete/metadata access that survived the subset checks above.
    ShareDecision::Allow
}

impl FileState {
    /// Grants file access under the SMB open rules.
    ///
    /// Runs inside the GrantAccess task with the key lock held. The first
    /// opener records its sharing mode, node and process id and may be
    /// granted a Batch or Exclusive oplock; later openers are checked
    /// against the recorded values and never receive an oplock.
    pub(crate) fn grant_file_access(&mut self, params: &OpenParams) -> StateResult<AccessGrant> {
        if params.attributes_only {
            let token = TokenInfo {
                path: self.path().to_string(),
                owner_node: params.requester.clone(),
                process_id: params.process_id,
                attributes_only: true,
                granted_oplock: OpLockType::None,
            };
            return Ok(AccessGrant {
                token,
                granted_oplock: OpLockType::None,
                oplock_available: false,
                existing_oplock: self.oplock.clone(),
                open_count: self.open_count(),
                state: self.clone(),
            });
        }

        if self.open_count() == 0 {
            self.shared_access = params.shared_access;
            self.primary_owner = Some(params.requester.clone());
            self.process_id = params.process_id;
            self.impersonation = params.impersonation;

            let mut granted = OpLockType::None;
            if params.requested_oplock.is_exclusive_kind() && !params.directory {
                self.oplock = Some(RemoteOpLock::new(
                    params.requester.clone(),
                    params.requested_oplock,
                    self.path(),
                ));
                granted = params.requested_oplock;
            }
            let count = self.increment_open_count();

            let token = TokenInfo {
                path: self.path().to_string(),
                owner_node: params.requester.clone(),
                process_id: params.process_id,
                attributes_only: false,
                granted_oplock: granted,
            };
            return Ok(AccessGrant {
                token,
                granted_oplock: granted,
                oplock_available: true,
                existing_oplock: None,
                open_count: count,
                state: self.clone(),
            });
        }

        // Already open somewhere.
        if params.open_action == OpenAction::Create {
            return Err(StateError::FileExists(self.path().to_string()));
        }

        let same_opener = self.primary_owner.as_ref() == Some(&params.requester)
            && self.process_id == params.process_id
            && self.impersonation == params.impersonation;

        if !same_opener {
            match check_share_modes(self.shared_access, params.access, params.shared_access) {
                ShareDecision::Allow | ShareDecision::AllowNoOplock => {}
                ShareDecision::Deny(reason) => {
                    return Err(StateError::SharingViolation { reason });
                }
            }
        }

        // The first opener's sharing mode, node and process id stay as
        // recorded; only the count moves.
        let count = self.increment_open_count();

        let token = TokenInfo {
            path: self.path().to_string(),
            owner_node: params.requester.clone(),
            process_id: params.process_id,
            attributes_only: false,
            granted_oplock: OpLockType::None,
        };
        Ok(AccessGrant {
            token,
            granted_oplock: OpLockType::None,
            oplock_available: false,
            existing_oplock: self.oplock.clone(),
            open_count: count,
            state: self.clone(),
        })
    }

    /// Releases a grant made by [`FileState::grant_file_access`].
    ///
    /// Runs inside the ReleaseAccess task. Attributes-only tokens never
    /// touch the open count. When the last handle closes, or the token had
    /// an oplock granted with it, the file's oplock record is removed for
    /// the releasing owner.
    pub(crate) fn release_file_access(&mut self, token: &TokenInfo) -> ReleaseOutcome {
        if token.attributes_only {
            return ReleaseOutcome { open_count: self.open_count(), oplock_cleared: false };
        }

        let count = self.decrement_open_count();
        let mut cleared = false;
        if self.oplock.is_some() {
            if count == 0 {
                self.oplock = None;
                cleared = true;
            } else if token.granted_oplock != OpLockType::None {
                cleared = self.remove_oplock_owner(&token.owner_node);
            }
        }
        ReleaseOutcome { open_count: count, oplock_cleared: cleared }
    }
}

//! Opportunistic lock types and the oplock fields of a file state.
//!
//! The authoritative record only ever stores a [`RemoteOpLock`]: the
//! owner node, the oplock type and, for LevelII, the list of sharing
//! owners. The *local* oplock handle, which holds live SMB session
//! references and therefore cannot be serialized, lives in the per-node
//! state table and is never part of the replicated record.
//!
//! Invariant: an Exclusive or Batch oplock has exactly one owner; a LevelII
//! oplock has one or more owners; the states never mix.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::cluster::NodeId;
use crate::error::{StateError, StateResult};
use crate::host::LocalOpLock;
use crate::state::FileState;

/// Oplock type, ordered by the strength of the client-side caching promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpLockType {
    /// No oplock.
    None,
    /// Shared read-caching oplock; may have many owners.
    LevelII,
    /// Single-writer oplock.
    Exclusive,
    /// Single-writer oplock with long-lived handle caching.
    Batch,
}

impl OpLockType {
    /// True for the single-owner oplock kinds.
    pub fn is_exclusive_kind(self) -> bool {
        matches!(self, OpLockType::Exclusive | OpLockType::Batch)
    }
}

impl std::fmt::Display for OpLockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OpLockType::None => "None",
            OpLockType::LevelII => "LevelII",
            OpLockType::Exclusive => "Exclusive",
            OpLockType::Batch => "Batch",
        };
        f.write_str(name)
    }
}

/// The replicated view of an oplock: who owns it and of what type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOpLock {
    /// Node whose session holds the oplock (the first owner for LevelII).
    pub owner: NodeId,
    /// Oplock type.
    pub typ: OpLockType,
    /// Normalized path the oplock covers.
    pub path: String,
    /// Sharing owners; populated for LevelII only.
    pub level_ii_owners: SmallVec<[NodeId; 2]>,
}

impl RemoteOpLock {
    /// Creates an oplock record owned by `owner`.
    pub fn new(owner: NodeId, typ: OpLockType, path: &str) -> RemoteOpLock {
        let mut level_ii_owners = SmallVec::new();
        if typ == OpLockType::LevelII {
            level_ii_owners.push(owner.clone());
        }
        RemoteOpLock { owner, typ, path: path.to_string(), level_ii_owners }
    }

    /// True when `node` is an owner of this oplock.
    pub fn owned_by(&self, node: &NodeId) -> bool {
        match self.typ {
            OpLockType::LevelII => self.level_ii_owners.iter().any(|o| o == node),
            _ => self.owner == *node,
        }
    }
}

/// An oplock as seen by the node-local layers: either the live local handle
/// or the replicated record of a lock held elsewhere.
#[derive(Clone)]
pub enum OpLockRef {
    /// The handle of an oplock granted to a session on this node.
    Local(Arc<dyn LocalOpLock>),
    /// The replicated record of an oplock owned by some node.
    Remote(RemoteOpLock),
}

impl OpLockRef {
    /// The oplock type behind either variant.
    pub fn lock_type(&self) -> OpLockType {
        match self {
            OpLockRef::Local(handle) => handle.lock_type(),
            OpLockRef::Remote(remote) => remote.typ,
        }
    }
}

impl std::fmt::Debug for OpLockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpLockRef::Local(handle) => {
                f.debug_tuple("Local").field(&handle.lock_type()).finish()
            }
            OpLockRef::Remote(remote) => f.debug_tuple("Remote").field(remote).finish(),
        }
    }
}

impl FileState {
    /// The current oplock type, `None` when no oplock is held.
    pub fn oplock_type(&self) -> OpLockType {
        self.oplock.as_ref().map_or(OpLockType::None, |oplock| oplock.typ)
    }

    /// The replicated oplock record, if any.
    pub fn oplock(&self) -> Option<&RemoteOpLock> {
        self.oplock.as_ref()
    }

    /// True when an oplock of any type is held.
    pub fn has_oplock(&self) -> bool {
        self.oplock.is_some()
    }

    /// Installs an oplock, or joins an existing LevelII set.
    ///
    /// A LevelII request against a LevelII oplock adds the requester to the
    /// owner list. Anything else against an existing oplock fails with
    /// [`StateError::ExistingOpLock`]; the caller reports "oplock not
    /// available" to the client.
    pub fn set_oplock(&mut self, oplock: RemoteOpLock) -> StateResult<()> {
        match &mut self.oplock {
            None => {
                self.oplock = Some(oplock);
                Ok(())
            }
            Some(held) if held.typ == OpLockType::LevelII && oplock.typ == OpLockType::LevelII => {
                if !held.owned_by(&oplock.owner) {
                    held.level_ii_owners.push(oplock.owner);
                }
                Ok(())
            }
            Some(_) => Err(StateError::ExistingOpLock(self.path().to_string())),
        }
    }

    /// Removes the oplock unconditionally.
    pub fn clear_oplock(&mut self) {
        self.oplock = None;
    }

    /// Downgrades the oplock type.
    ///
    /// Valid transitions are Exclusive/Batch to LevelII (the owner becomes
    /// the single LevelII owner) and any type to None (equivalent to a
    /// clear). Everything else, including changes without an oplock
    /// present, is invalid.
    ///
    /// # Returns
    ///
    /// `Some(new_type)` on success, `None` for an invalid transition.
    pub fn change_oplock_type(&mut self, new_type: OpLockType) -> Option<OpLockType> {
        let mut held = self.oplock.take()?;
        match new_type {
            OpLockType::None => Some(OpLockType::None),
            OpLockType::LevelII if held.typ.is_exclusive_kind() => {
                held.typ = OpLockType::LevelII;
                held.level_ii_owners.clear();
                let owner = held.owner.clone();
                held.level_ii_owners.push(owner);
                self.oplock = Some(held);
                Some(OpLockType::LevelII)
            }
            _ => {
                self.oplock = Some(held);
                None
            }
        }
    }

    /// Removes one owner from the oplock.
    ///
    /// For LevelII the owner leaves the sharing list and the oplock is
    /// cleared when the list empties. An Exclusive/Batch oplock owned by
    /// `node` is cleared outright.
    ///
    /// # Returns
    ///
    /// `true` when the oplock was cleared entirely.
    pub fn remove_oplock_owner(&mut self, node: &NodeId) -> bool {
        let Some(mut held) = self.oplock.take() else {
            return false;
        };
        match held.typ {
            OpLockType::LevelII => {
                held.level_ii_owners.retain(|o| o != node);
                if held.level_ii_owners.is_empty() {
                    return true;
                }
                if held.owner == *node {
                    held.owner = held.level_ii_owners[0].clone();
                }
                self.oplock = Some(held);
                false
            }
            _ if held.owner == *node => true,
            _ => {
                self.oplock = Some(held);
                false
            }
        }
    }
}

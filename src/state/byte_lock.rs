//! Byte-range locks and the conflict rules applied to them.
//!
//! A file state carries an ordered list of byte-range locks. Each lock is
//! owned by exactly one `(owner_node, owner_id)` pair; the owner id is the
//! protocol-level lock owner handle (for SMB, the process id of the locking
//! client). SMB semantics allow an owner to re-lock a region it already
//! holds, so equal-owner overlap is permitted; overlap with a different
//! owner is a conflict.
//!
//! All mutating operations run inside remote tasks under the per-key lock,
//! so the list itself needs no internal synchronization.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::cluster::NodeId;
use crate::error::{StateError, StateResult};
use crate::state::FileState;

/// Lock list storage; inline for the common case of a handful of locks.
pub type LockList = SmallVec<[ByteRangeLock; 4]>;

/// One byte-range lock on a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRangeLock {
    /// First byte of the locked region.
    pub offset: u64,
    /// Length of the locked region in bytes.
    pub length: u64,
    /// Node the locking session is connected to.
    pub owner_node: NodeId,
    /// Protocol-level lock owner handle on that node.
    pub owner_id: i64,
}

impl ByteRangeLock {
    /// Creates a lock over `[offset, offset + length)`.
    pub fn new(offset: u64, length: u64, owner_node: NodeId, owner_id: i64) -> ByteRangeLock {
        ByteRangeLock { offset, length, owner_node, owner_id }
    }

    /// End of the locked region, saturating on the huge lengths SMB clients
    /// use for whole-file locks.
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// True when this lock covers any byte of `[offset, offset + length)`.
    ///
    /// Zero-length ranges never overlap anything.
    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        let other_end = offset.saturating_add(length);
        self.offset < other_end && offset < self.end()
    }

    /// True when both locks belong to the same `(node, owner)` pair.
    pub fn same_owner(&self, other: &ByteRangeLock) -> bool {
        self.owner_node == other.owner_node && self.owner_id == other.owner_id
    }

    /// True when this lock is owned by the given `(node, owner)` pair.
    pub fn owned_by(&self, node: &NodeId, owner_id: i64) -> bool {
        self.owner_node == *node && self.owner_id == owner_id
    }
}

impl FileState {
    /// Adds a byte-range lock, rejecting overlap with a different owner.
    ///
    /// # Returns
    ///
    /// `Ok(())` when the lock was appended, [`StateError::LockConflict`]
    /// when an existing lock of another owner covers part of the range.
    pub fn add_byte_lock(&mut self, lock: ByteRangeLock) -> StateResult<()> {
        for held in &self.lock_list {
            if held.overlaps(lock.offset, lock.length) && !held.same_owner(&lock) {
                return Err(StateError::LockConflict {
                    path: self.path().to_string(),
                    offset: lock.offset,
                    length: lock.length,
                });
            }
        }
        self.lock_list.push(lock);
        Ok(())
    }

    /// Removes the lock matching `lock` exactly (offset, length and owner).
    ///
    /// # Returns
    ///
    /// `Ok(())` when a matching lock was removed, [`StateError::NotLocked`]
    /// when no exact match exists.
    pub fn remove_byte_lock(&mut self, lock: &ByteRangeLock) -> StateResult<()> {
        match self.lock_list.iter().position(|held| held == lock) {
            Some(index) => {
                self.lock_list.remove(index);
                Ok(())
            }
            None => Err(StateError::NotLocked {
                path: self.path().to_string(),
                offset: lock.offset,
                length: lock.length,
            }),
        }
    }

    /// Returns the first lock overlapping the given range, if any.
    ///
    /// Used for IOCTL-style lock queries; the owner of the probe is not
    /// considered.
    pub fn test_byte_lock(&self, offset: u64, length: u64) -> Option<ByteRangeLock> {
        self.lock_list.iter().find(|held| held.overlaps(offset, length)).cloned()
    }

    /// Checks whether `(node, owner_id)` may read or write the given range.
    ///
    /// Access is denied when any overlapping lock belongs to a different
    /// owner. A lock owner always passes against its own locks.
    pub fn can_access_range(
        &self,
        offset: u64,
        length: u64,
        node: &NodeId,
        owner_id: i64,
        _write: bool,
    ) -> bool {
        self.lock_list
            .iter()
            .filter(|held| held.overlaps(offset, length))
            .all(|held| held.owned_by(node, owner_id))
    }

    /// Drops every lock owned by sessions on `node`.
    ///
    /// Used by the departed-member cleanup sweep.
    ///
    /// # Returns
    ///
    /// The number of locks removed.
    pub fn release_byte_locks_of(&mut self, node: &NodeId) -> usize {
        let before = self.lock_list.len();
        self.lock_list.retain(|held| held.owner_node != *node);
        before - self.lock_list.len()
    }

    /// Current byte-range locks, in the order they were granted.
    pub fn byte_locks(&self) -> &[ByteRangeLock] {
        &self.lock_list
    }

    /// True when any byte-range lock is held.
    pub fn has_byte_locks(&self) -> bool {
        !self.lock_list.is_empty()
    }
}

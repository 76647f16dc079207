//! Low-priority state updates and their per-request coalescing queue.
//!
//! Size, allocation and timestamp hints change constantly while a file is
//! being written; broadcasting each change would flood the topic. Instead,
//! every change made while serving one request is collected into an
//! [`UpdatePost`] and flushed once when the request completes: one remote
//! task applies the whole batch to the authoritative record and one
//! `FileStateUpdate` message tells the sibling nodes.
//!
//! The post is an explicit value threaded through the operations that feed
//! it; there is no global registry of pending updates.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::state::{FileState, FileStatus, StatusChangeReason};

bitflags! {
    /// Which fields of a [`StateUpdateValues`] batch are meaningful.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct UpdateMask: u16 {
        /// File existence status (and its change reason).
        const FILE_STATUS = 0x01;
        /// File size hint.
        const FILE_SIZE   = 0x02;
        /// Allocation size hint.
        const ALLOC_SIZE  = 0x04;
        /// Modification time hint.
        const MODIFY_DATE = 0x08;
        /// Change time hint.
        const CHANGE_DATE = 0x10;
        /// Retention hold expiry.
        const RETENTION   = 0x20;
    }
}

/// Field values for a batched update; only the fields named by the
/// accompanying [`UpdateMask`] are applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdateValues {
    /// New file status when `FILE_STATUS` is set.
    pub file_status: FileStatus,
    /// Reason recorded with the status change.
    pub change_reason: StatusChangeReason,
    /// New file size when `FILE_SIZE` is set.
    pub file_size: i64,
    /// New allocation size when `ALLOC_SIZE` is set.
    pub alloc_size: i64,
    /// New modification time when `MODIFY_DATE` is set.
    pub modify_time: i64,
    /// New change time when `CHANGE_DATE` is set.
    pub change_time: i64,
    /// New retention expiry when `RETENTION` is set.
    pub retention_expiry: i64,
}

impl Default for StateUpdateValues {
    fn default() -> StateUpdateValues {
        StateUpdateValues {
            file_status: FileStatus::Unknown,
            change_reason: StatusChangeReason::None,
            file_size: 0,
            alloc_size: 0,
            modify_time: 0,
            change_time: 0,
            retention_expiry: 0,
        }
    }
}

/// Coalescing queue for the low-priority updates of one request.
///
/// Created per request via the cache, filled by the setters below, and
/// flushed exactly once; flushing an empty post is a no-op.
#[derive(Debug, Clone)]
pub struct UpdatePost {
    path: String,
    mask: UpdateMask,
    values: StateUpdateValues,
}

impl UpdatePost {
    /// Creates an empty post for a normalized path.
    pub fn new(path: &str) -> UpdatePost {
        UpdatePost {
            path: path.to_string(),
            mask: UpdateMask::empty(),
            values: StateUpdateValues::default(),
        }
    }

    /// The normalized path this post targets.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fields queued so far.
    pub fn mask(&self) -> UpdateMask {
        self.mask
    }

    /// The queued field values.
    pub fn values(&self) -> &StateUpdateValues {
        &self.values
    }

    /// True when nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Queues a file status change.
    pub fn set_file_status(&mut self, status: FileStatus, reason: StatusChangeReason) {
        self.mask |= UpdateMask::FILE_STATUS;
        self.values.file_status = status;
        self.values.change_reason = reason;
    }

    /// Queues a file size change.
    pub fn set_file_size(&mut self, size: i64) {
        self.mask |= UpdateMask::FILE_SIZE;
        self.values.file_size = size;
    }

    /// Queues an allocation size change.
    pub fn set_alloc_size(&mut self, size: i64) {
        self.mask |= UpdateMask::ALLOC_SIZE;
        self.values.alloc_size = size;
    }

    /// Queues a modification time change.
    pub fn set_modify_time(&mut self, when: i64) {
        self.mask |= UpdateMask::MODIFY_DATE;
        self.values.modify_time = when;
    }

    /// Queues a change time change.
    pub fn set_change_time(&mut self, when: i64) {
        self.mask |= UpdateMask::CHANGE_DATE;
        self.values.change_time = when;
    }

    /// Queues a retention expiry change.
    pub fn set_retention_expiry(&mut self, when: i64) {
        self.mask |= UpdateMask::RETENTION;
        self.values.retention_expiry = when;
    }
}

impl FileState {
    /// Applies a batched update to the record.
    ///
    /// # Returns
    ///
    /// `true` when the batch changed the file status, so the caller can
    /// fire a change notification.
    pub(crate) fn apply_update(&mut self, mask: UpdateMask, values: &StateUpdateValues) -> bool {
        let mut status_changed = false;
        if mask.contains(UpdateMask::FILE_STATUS) {
            status_changed = self.set_file_status(values.file_status, values.change_reason);
        }
        if mask.contains(UpdateMask::FILE_SIZE) {
            self.set_file_size(values.file_size);
        }
        if mask.contains(UpdateMask::ALLOC_SIZE) {
            self.set_alloc_size(values.alloc_size);
        }
        if mask.contains(UpdateMask::MODIFY_DATE) {
            self.set_modify_time(values.modify_time);
        }
        if mask.contains(UpdateMask::CHANGE_DATE) {
            self.set_change_time(values.change_time);
        }
        if mask.contains(UpdateMask::RETENTION) {
            self.set_retention_expiry(values.retention_expiry);
        }
        status_changed
    }
}

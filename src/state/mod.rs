//! The file-state record and its low-level mutators.
//!
//! One [`FileState`] exists per normalized path and carries everything the
//! cluster must agree on to serve SMB semantics for that path: open counts
//! and sharing modes, the oplock record, byte-range locks, size and
//! timestamp hints, the file-data-update marker and named attributes.
//!
//! Mutators here are non-atomic in isolation. All atomicity comes from the
//! partitioned map's per-key lock: a record is only mutated inside a remote
//! task running on the key's owner node with the lock held. Everything in
//! the record is serializable; node-local companions (the live oplock
//! handle, deferred requests, near-cache metadata) live in the per-node and
//! near-cache layers instead.

pub mod access;
pub mod byte_lock;
pub mod oplock;
pub mod update;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;
use access::SharedAccess;
use byte_lock::LockList;
use oplock::RemoteOpLock;

/// Sentinel for a file id the back-end has not assigned yet.
pub const UNKNOWN_FILE_ID: i64 = -1;

/// Sentinel for an unset opener process id.
pub const NO_PROCESS_ID: i64 = -1;

/// Expiry deadline value marking a state that never expires.
pub const PERMANENT_STATE: i64 = -1;

/// Expiry deadline value for a state that has not been accessed yet.
/// Distinct from [`PERMANENT_STATE`]: the next access arms the window.
pub const NO_EXPIRY_SET: i64 = 0;

/// Milliseconds since the Unix epoch; the single clock source for expiry
/// deadlines and near-cache timestamps.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Existence status of the path on the back-end store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    /// Not checked against the back-end yet.
    Unknown,
    /// Path does not exist.
    NotExist,
    /// Path is a regular file.
    FileExists,
    /// Path is a directory.
    DirectoryExists,
}

/// Why the file status last changed; drives change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusChangeReason {
    /// No change recorded.
    None,
    /// A file was created at the path.
    FileCreated,
    /// A folder was created at the path.
    FolderCreated,
    /// The file was deleted.
    FileDeleted,
    /// The folder was deleted.
    FolderDeleted,
}

/// Where the file's data currently is relative to the back-end store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataStatus {
    /// Not tracked.
    Unknown,
    /// Queued for loading from the back-end.
    LoadWait,
    /// Load in progress.
    Loading,
    /// Local copy available.
    Available,
    /// Local copy modified, not written back yet.
    Updated,
    /// Queued for write-back.
    SaveWait,
    /// Write-back in progress.
    Saving,
    /// Write-back complete.
    Saved,
    /// Data deleted.
    Deleted,
    /// Path renamed while data was cached.
    Renamed,
    /// Delete pending until the last close.
    DeleteOnClose,
}

fn default_valid() -> bool {
    true
}

/// Coordination record for one normalized path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    path: String,
    file_status: FileStatus,
    change_reason: StatusChangeReason,
    file_id: i64,
    open_count: u32,
    pub(crate) shared_access: SharedAccess,
    pub(crate) primary_owner: Option<NodeId>,
    pub(crate) process_id: i64,
    pub(crate) impersonation: i32,
    file_size: i64,
    alloc_size: i64,
    modify_time: i64,
    change_time: i64,
    retention_expiry: i64,
    data_status: DataStatus,
    data_update_node: Option<NodeId>,
    pub(crate) oplock: Option<RemoteOpLock>,
    pub(crate) lock_list: LockList,
    attributes: HashMap<String, Vec<u8>>,
    expiry_at: i64,
    #[serde(default = "default_valid")]
    valid: bool,
}

impl FileState {
    /// Creates a fresh record for a normalized path.
    pub fn new(path: &str, status: FileStatus) -> FileState {
        FileState {
            path: path.to_string(),
            file_status: status,
            change_reason: StatusChangeReason::None,
            file_id: UNKNOWN_FILE_ID,
            open_count: 0,
            shared_access: SharedAccess::all(),
            primary_owner: None,
            process_id: NO_PROCESS_ID,
            impersonation: -1,
            file_size: 0,
            alloc_size: 0,
            modify_time: 0,
            change_time: 0,
            retention_expiry: 0,
            data_status: DataStatus::Unknown,
            data_update_node: None,
            oplock: None,
            lock_list: LockList::new(),
            attributes: HashMap::new(),
            expiry_at: NO_EXPIRY_SET,
            valid: true,
        }
    }

    /// The normalized path; also the partitioning key.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: &str) {
        self.path = path.to_string();
    }

    /// Existence status of the path.
    pub fn file_status(&self) -> FileStatus {
        self.file_status
    }

    /// Reason recorded with the last status change.
    pub fn change_reason(&self) -> StatusChangeReason {
        self.change_reason
    }

    /// Updates the file status, recording the reason.
    ///
    /// A transition to [`FileStatus::NotExist`] clears the file id and the
    /// attribute map, since both described an object that is gone.
    ///
    /// # Returns
    ///
    /// `true` when the status actually changed.
    pub fn set_file_status(&mut self, status: FileStatus, reason: StatusChangeReason) -> bool {
        if self.file_status == status {
            return false;
        }
        self.file_status = status;
        self.change_reason = reason;
        if status == FileStatus::NotExist {
            self.file_id = UNKNOWN_FILE_ID;
            self.attributes.clear();
        }
        true
    }

    /// Back-end identifier of the file, [`UNKNOWN_FILE_ID`] if unassigned.
    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    /// Sets the back-end identifier.
    pub fn set_file_id(&mut self, file_id: i64) {
        self.file_id = file_id;
    }

    /// Number of open handles across the cluster.
    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub(crate) fn increment_open_count(&mut self) -> u32 {
        self.open_count += 1;
        self.open_count
    }

    /// Decrements the open count, resetting the opener bookkeeping when the
    /// last handle closes: sharing mode back to the permissive default,
    /// primary owner and process id unset.
    pub(crate) fn decrement_open_count(&mut self) -> u32 {
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count == 0 {
            self.shared_access = SharedAccess::all();
            self.primary_owner = None;
            self.process_id = NO_PROCESS_ID;
            self.impersonation = -1;
        }
        self.open_count
    }

    /// Sharing mode granted by the first opener.
    pub fn shared_access(&self) -> SharedAccess {
        self.shared_access
    }

    /// Node of the first opener while the file is open.
    pub fn primary_owner(&self) -> Option<&NodeId> {
        self.primary_owner.as_ref()
    }

    /// Process id of the first opener, [`NO_PROCESS_ID`] when closed.
    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    /// File size hint in bytes.
    pub fn file_size(&self) -> i64 {
        self.file_size
    }

    /// Sets the file size hint.
    pub fn set_file_size(&mut self, size: i64) {
        self.file_size = size;
    }

    /// Allocation size hint in bytes.
    pub fn alloc_size(&self) -> i64 {
        self.alloc_size
    }

    /// Sets the allocation size hint.
    pub fn set_alloc_size(&mut self, size: i64) {
        self.alloc_size = size;
    }

    /// Last modification time hint, Unix millis.
    pub fn modify_time(&self) -> i64 {
        self.modify_time
    }

    /// Sets the modification time hint.
    pub fn set_modify_time(&mut self, when: i64) {
        self.modify_time = when;
    }

    /// Last change time hint, Unix millis.
    pub fn change_time(&self) -> i64 {
        self.change_time
    }

    /// Sets the change time hint.
    pub fn set_change_time(&mut self, when: i64) {
        self.change_time = when;
    }

    /// Retention hold expiry, Unix millis, `0` when none.
    pub fn retention_expiry(&self) -> i64 {
        self.retention_expiry
    }

    /// Sets the retention hold expiry.
    pub fn set_retention_expiry(&mut self, when: i64) {
        self.retention_expiry = when;
    }

    /// Data location status.
    pub fn data_status(&self) -> DataStatus {
        self.data_status
    }

    /// Sets the data location status.
    pub fn set_data_status(&mut self, status: DataStatus) {
        self.data_status = status;
    }

    /// Node currently writing cached data back to the store, if any.
    pub fn data_update_node(&self) -> Option<&NodeId> {
        self.data_update_node.as_ref()
    }

    /// Claims the data-update marker for `node`.
    ///
    /// # Returns
    ///
    /// `false` when another node already holds the marker.
    pub fn start_data_update(&mut self, node: &NodeId) -> bool {
        match &self.data_update_node {
            Some(holder) if holder != node => false,
            _ => {
                self.data_update_node = Some(node.clone());
                true
            }
        }
    }

    /// Releases the data-update marker.
    ///
    /// # Returns
    ///
    /// `true` only when `node` was the holder; the marker is cleared then.
    pub fn complete_data_update(&mut self, node: &NodeId) -> bool {
        if self.data_update_node.as_ref() == Some(node) {
            self.data_update_node = None;
            true
        } else {
            false
        }
    }

    /// Stores a named attribute, replacing any previous value.
    pub fn add_attribute(&mut self, name: &str, value: Vec<u8>) {
        self.attributes.insert(name.to_string(), value);
    }

    /// Fetches a named attribute.
    pub fn fetch_attribute(&self, name: &str) -> Option<&Vec<u8>> {
        self.attributes.get(name)
    }

    /// Removes a named attribute, returning its value.
    pub fn remove_attribute(&mut self, name: &str) -> Option<Vec<u8>> {
        self.attributes.remove(name)
    }

    /// Drops every attribute.
    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    /// Number of attributes held.
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Expiry deadline in Unix millis, [`PERMANENT_STATE`] for never.
    pub fn expiry_at(&self) -> i64 {
        self.expiry_at
    }

    /// Sets the expiry deadline directly.
    pub fn set_expiry_at(&mut self, when: i64) {
        self.expiry_at = when;
    }

    /// Pushes the expiry deadline `window_millis` past `now`.
    ///
    /// Called on every access so active states never expire.
    pub fn bump_expiry(&mut self, now: i64, window_millis: i64) {
        if self.expiry_at != PERMANENT_STATE {
            self.expiry_at = now + window_millis;
        }
    }

    /// True when the expiry deadline has passed.
    pub fn has_expired(&self, now: i64) -> bool {
        self.expiry_at != PERMANENT_STATE && self.expiry_at != NO_EXPIRY_SET && now > self.expiry_at
    }

    /// True when nothing pins the state: no open handles, no byte-range
    /// locks, no oplock and no data update in flight.
    pub fn can_expire(&self) -> bool {
        self.open_count == 0
            && self.lock_list.is_empty()
            && self.oplock.is_none()
            && self.data_update_node.is_none()
    }

    /// Validity marker mirrored into near-cache copies.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Sets the validity marker.
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    /// Rekeys the record for a rename: new path, file id and attributes
    /// cleared, status set from the rename kind.
    pub(crate) fn apply_rename(&mut self, new_path: &str, is_folder: bool) {
        self.path = new_path.to_string();
        self.file_id = UNKNOWN_FILE_ID;
        self.attributes.clear();
        self.file_status =
            if is_folder { FileStatus::DirectoryExists } else { FileStatus::FileExists };
    }

    /// Rekeys a record caught inside a renamed folder subtree: new path,
    /// file id and attributes cleared, existence status untouched.
    pub(crate) fn apply_rekey(&mut self, new_path: &str) {
        self.path = new_path.to_string();
        self.file_id = UNKNOWN_FILE_ID;
        self.attributes.clear();
    }
}

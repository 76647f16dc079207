//! Per-node state: the parts of a path's bookkeeping that never leave the
//! node.
//!
//! The live oplock handle holds open SMB session references and cannot be
//! serialized, so it lives here rather than in the replicated record. The
//! same table carries the deferred-request queue for each path, the break
//! timer guarding an in-flight oplock break, and optional local copies of
//! the file id and attributes for back-ends that want them cached while
//! the authoritative state is owned elsewhere.
//!
//! The table is keyed by the same normalized path as the main map.
//! Concurrent access to one path's data is serialized by the per-entry
//! mutex; the table mutex only guards the key lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::host::{DeferredRequest, LocalOpLock};

/// Upper bound on parked requests per path; beyond it deferral fails and
/// the client request is bounced instead of queued.
pub const MAX_DEFERRED_REQUESTS: usize = 16;

/// The node-local data of one path.
pub(crate) struct PerNodeData {
    /// Live oplock handle of a session on this node, if one holds the
    /// oplock.
    pub oplock: Option<Arc<dyn LocalOpLock>>,
    /// Requests parked until the oplock break settles.
    pub deferred: Vec<DeferredRequest>,
    /// Break-timeout timer for an in-flight break.
    pub break_timer: Option<JoinHandle<()>>,
    /// Local copy of the back-end file id, when a back-end caches it here.
    pub file_id: i64,
    /// Local attribute copies, when a back-end caches them here.
    pub attributes: HashMap<String, Vec<u8>>,
}

impl PerNodeData {
    fn new() -> PerNodeData {
        PerNodeData {
            oplock: None,
            deferred: Vec::new(),
            break_timer: None,
            file_id: crate::state::UNKNOWN_FILE_ID,
            attributes: HashMap::new(),
        }
    }

    /// Parks a request until the break settles.
    pub fn add_deferred(&mut self, request: DeferredRequest) -> StateResult<()> {
        if self.deferred.len() >= MAX_DEFERRED_REQUESTS {
            return Err(StateError::DeferFailed(format!(
                "deferred queue full ({MAX_DEFERRED_REQUESTS} requests)"
            )));
        }
        self.deferred.push(request);
        Ok(())
    }

    /// Takes all parked requests, leaving the queue empty.
    pub fn take_deferred(&mut self) -> Vec<DeferredRequest> {
        std::mem::take(&mut self.deferred)
    }

    /// Stops the break timer, if one is running.
    pub fn cancel_break_timer(&mut self) {
        if let Some(timer) = self.break_timer.take() {
            timer.abort();
        }
    }
}

/// One path's slot in the per-node table.
pub(crate) struct PerNodeEntry {
    data: Mutex<PerNodeData>,
}

impl PerNodeEntry {
    fn new() -> Arc<PerNodeEntry> {
        Arc::new(PerNodeEntry { data: Mutex::new(PerNodeData::new()) })
    }

    /// Locks this path's data. Never hold the guard across an await.
    pub fn lock(&self) -> MutexGuard<'_, PerNodeData> {
        self.data.lock().expect("per-node entry poisoned")
    }
}

/// The node-local table, keyed by normalized path.
pub(crate) struct PerNodeState {
    entries: Mutex<HashMap<String, Arc<PerNodeEntry>>>,
    debug: bool,
}

impl PerNodeState {
    pub fn new(debug: bool) -> PerNodeState {
        PerNodeState { entries: Mutex::new(HashMap::new()), debug }
    }

    /// Looks up the entry for a path.
    pub fn get(&self, path: &str) -> Option<Arc<PerNodeEntry>> {
        self.entries.lock().expect("per-node table poisoned").get(path).cloned()
    }

    /// Looks up or creates the entry for a path.
    pub fn get_or_create(&self, path: &str) -> Arc<PerNodeEntry> {
        let mut entries = self.entries.lock().expect("per-node table poisoned");
        if let Some(entry) = entries.get(path) {
            return entry.clone();
        }
        if self.debug {
            debug!(path, "per-node entry created");
        }
        let entry = PerNodeEntry::new();
        entries.insert(path.to_string(), entry.clone());
        entry
    }

    /// Drops the entry for a path, returning it so the caller can settle
    /// any parked requests.
    pub fn remove(&self, path: &str) -> Option<Arc<PerNodeEntry>> {
        let removed = self.entries.lock().expect("per-node table poisoned").remove(path);
        if removed.is_some() && self.debug {
            debug!(path, "per-node entry removed");
        }
        removed
    }

    /// Rekeys the entry for a renamed path.
    ///
    /// The locally cached file id and attributes described the old object
    /// and are dropped with the rename.
    pub fn rename(&self, old_path: &str, new_path: &str) {
        let mut entries = self.entries.lock().expect("per-node table poisoned");
        if let Some(entry) = entries.remove(old_path) {
            {
                let mut data = entry.lock();
                data.file_id = crate::state::UNKNOWN_FILE_ID;
                data.attributes.clear();
            }
            entries.insert(new_path.to_string(), entry);
        }
    }

    /// Rekeys every entry under a renamed folder prefix.
    pub fn rename_folder(&self, old_prefix: &str, new_prefix: &str) {
        let mut entries = self.entries.lock().expect("per-node table poisoned");
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| crate::path::is_under_folder(key, old_prefix))
            .cloned()
            .collect();
        for old_key in moved {
            if let Some(new_key) = crate::path::rebase(&old_key, old_prefix, new_prefix) {
                if let Some(entry) = entries.remove(&old_key) {
                    {
                        let mut data = entry.lock();
                        data.file_id = crate::state::UNKNOWN_FILE_ID;
                        data.attributes.clear();
                    }
                    entries.insert(new_key, entry);
                }
            }
        }
    }
}

//! The near-cache: a local, bounded-staleness replica of recently used
//! states.
//!
//! Entries are clones of the authoritative record admitted whenever this
//! node creates a state or gets one back from a remote task it dispatched.
//! A clone stays readable until its TTL runs out, the key disappears from
//! the main map, or a remote mutation is observed; the latter only marks
//! the entry invalid, and invalid reads fall through to the main map.
//!
//! Entry metadata (admit time, last access, hit count, validity) is kept
//! in atomics beside the cloned state, so concurrent readers never take a
//! write lock; the clone itself is only replaced wholesale. When a new
//! clone replaces an old one the metadata carries across.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::cluster::NodeId;
use crate::path;
use crate::state::{now_millis, FileState};

/// Hit/miss statistics of one near-cache.
#[derive(Debug, Default)]
pub(crate) struct NearCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    admits: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of the near-cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearCacheSnapshot {
    /// Reads served from a valid entry.
    pub hits: u64,
    /// Reads that found no usable entry.
    pub misses: u64,
    /// Entries admitted or refreshed.
    pub admits: u64,
    /// Entries dropped by TTL or map events.
    pub evictions: u64,
    /// Entries marked invalid by observed remote mutations.
    pub invalidations: u64,
    /// Entries currently held.
    pub entries: usize,
}

struct NearEntry {
    state: RwLock<FileState>,
    added_at: AtomicI64,
    last_access: AtomicI64,
    remote_update: AtomicI64,
    hits: AtomicU64,
    valid: AtomicBool,
}

impl NearEntry {
    fn new(state: FileState, now: i64) -> NearEntry {
        NearEntry {
            state: RwLock::new(state),
            added_at: AtomicI64::new(now),
            last_access: AtomicI64::new(now),
            remote_update: AtomicI64::new(0),
            hits: AtomicU64::new(0),
            valid: AtomicBool::new(true),
        }
    }
}

/// Node-local replica cache keyed by normalized path.
pub(crate) struct NearCache {
    timeout_millis: i64,
    entries: RwLock<HashMap<String, Arc<NearEntry>>>,
    stats: NearCacheStats,
    debug: bool,
}

impl NearCache {
    pub fn new(timeout_millis: i64, debug: bool) -> NearCache {
        NearCache {
            timeout_millis,
            entries: RwLock::new(HashMap::new()),
            stats: NearCacheStats::default(),
            debug,
        }
    }

    fn entry(&self, path: &str) -> Option<Arc<NearEntry>> {
        self.entries.read().expect("near cache poisoned").get(path).cloned()
    }

    /// Looks up a path, counting a hit only for a valid entry.
    pub fn get(&self, path: &str) -> Option<FileState> {
        let Some(entry) = self.entry(path) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if !entry.valid.load(Ordering::Acquire) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        entry.last_access.store(now_millis(), Ordering::Relaxed);
        entry.hits.fetch_add(1, Ordering::Relaxed);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        let state = entry.state.read().expect("near entry poisoned").clone();
        Some(state)
    }

    /// Admits a state clone, or refreshes the existing entry for its path.
    ///
    /// A refresh keeps the admit time and hit count of the old entry and
    /// turns the entry valid again.
    pub fn admit(&self, state: FileState) {
        let now = now_millis();
        let path = state.path().to_string();
        if let Some(entry) = self.entry(&path) {
            *entry.state.write().expect("near entry poisoned") = state;
            entry.last_access.store(now, Ordering::Relaxed);
            entry.valid.store(true, Ordering::Release);
        } else {
            let mut entries = self.entries.write().expect("near cache poisoned");
            entries.insert(path.clone(), Arc::new(NearEntry::new(state, now)));
        }
        self.stats.admits.fetch_add(1, Ordering::Relaxed);
        if self.debug {
            debug!(path = %path, "near-cache admit");
        }
    }

    /// Marks the entry for `path` invalid after an observed remote
    /// mutation; subsequent reads fall through to the main map.
    pub fn invalidate(&self, path: &str) {
        if let Some(entry) = self.entry(path) {
            entry.valid.store(false, Ordering::Release);
            entry.remote_update.store(now_millis(), Ordering::Relaxed);
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            if self.debug {
                debug!(path, "near-cache invalidate");
            }
        }
    }

    /// Validity of the entry for `path`, `None` when nothing is cached.
    pub fn entry_valid(&self, path: &str) -> Option<bool> {
        self.entry(path).map(|entry| entry.valid.load(Ordering::Acquire))
    }

    /// Drops the entry for `path`.
    pub fn remove(&self, path: &str) -> Option<FileState> {
        let entry = self.entries.write().expect("near cache poisoned").remove(path)?;
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        if self.debug {
            debug!(path, "near-cache evict");
        }
        let state = entry.state.read().expect("near entry poisoned").clone();
        Some(state)
    }

    /// Rekeys a single entry after a rename, clearing the per-file fields
    /// a rename makes stale.
    pub fn rename(&self, old_path: &str, new_path: &str, is_folder: bool) {
        let mut entries = self.entries.write().expect("near cache poisoned");
        if let Some(entry) = entries.remove(old_path) {
            entry
                .state
                .write()
                .expect("near entry poisoned")
                .apply_rename(new_path, is_folder);
            entries.insert(new_path.to_string(), entry);
        }
    }

    /// Rekeys every entry under a renamed folder prefix.
    pub fn rename_folder(&self, old_prefix: &str, new_prefix: &str) {
        let mut entries = self.entries.write().expect("near cache poisoned");
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| path::is_under_folder(key, old_prefix))
            .cloned()
            .collect();
        for old_key in moved {
            if let Some(new_key) = path::rebase(&old_key, old_prefix, new_prefix) {
                if let Some(entry) = entries.remove(&old_key) {
                    entry.state.write().expect("near entry poisoned").apply_rekey(&new_key);
                    entries.insert(new_key, entry);
                }
            }
        }
    }

    /// Records the node holding a fresher copy of the file's data on the
    /// local replica, if one is cached.
    pub fn record_data_update(&self, path: &str, node: &NodeId, start: bool) {
        if let Some(entry) = self.entry(path) {
            let mut state = entry.state.write().expect("near entry poisoned");
            if start {
                state.start_data_update(node);
            } else {
                state.complete_data_update(node);
            }
        }
    }

    /// Drops entries whose last access is older than the TTL.
    ///
    /// # Returns
    ///
    /// The number of entries dropped.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut entries = self.entries.write().expect("near cache poisoned");
        let before = entries.len();
        entries.retain(|_, entry| {
            now - entry.last_access.load(Ordering::Relaxed) <= self.timeout_millis
        });
        let dropped = before - entries.len();
        if dropped > 0 {
            self.stats.evictions.fetch_add(dropped as u64, Ordering::Relaxed);
            if self.debug {
                debug!(dropped, "near-cache TTL sweep");
            }
        }
        dropped
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.read().expect("near cache poisoned").len()
    }

    /// Snapshot of the statistics counters.
    pub fn snapshot(&self) -> NearCacheSnapshot {
        NearCacheSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            admits: self.stats.admits.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

//! The partitioned state map and its per-key distributed lock.
//!
//! Storage is sharded by partition index so a shard mutex is only ever
//! contended by keys of the same partition. The per-key lock is the single
//! serialization point for everything that mutates a record: remote task
//! bodies take it before loading and release it after storing. It is
//! reentrant per holder and hands the key over to queued waiters in FIFO
//! order.
//!
//! Entry listeners observe Added/Updated/Removed/Evicted events; the
//! near-cache registers one to drop replicas of keys that disappear.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::cluster::partition::{hash_key, DEFAULT_PARTITION_COUNT};
use crate::cluster::NodeId;
use crate::state::FileState;

/// Kind of change an entry listener is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEvent {
    /// A key was stored for the first time.
    Added,
    /// An existing key was overwritten.
    Updated,
    /// A key was removed explicitly.
    Removed,
    /// A key was dropped by the expiry reaper.
    Evicted,
}

/// Observer of map entry changes.
pub trait EntryListener: Send + Sync {
    /// Called after the map applied the change for `key`.
    fn entry_event(&self, event: EntryEvent, key: &str);
}

struct Waiter {
    owner: u64,
    node: NodeId,
    wake: oneshot::Sender<()>,
}

struct KeyLockEntry {
    holder: u64,
    holder_node: NodeId,
    depth: u32,
    waiters: VecDeque<Waiter>,
}

/// Reentrant per-key lock table.
///
/// Holders are identified by a fabric-unique id (normally the task id) plus
/// the node the holder runs on; the node is recorded so locks abandoned by
/// a departed member can be force-released.
struct KeyLockTable {
    inner: Mutex<HashMap<Arc<str>, KeyLockEntry>>,
}

impl KeyLockTable {
    fn new() -> KeyLockTable {
        KeyLockTable { inner: Mutex::new(HashMap::new()) }
    }

    async fn lock(&self, key: &str, owner: u64, node: &NodeId) {
        loop {
            let wait = {
                let mut table = self.inner.lock().expect("key lock table poisoned");
                match table.get_mut(key) {
                    None => {
                        table.insert(
                            Arc::from(key),
                            KeyLockEntry {
                                holder: owner,
                                holder_node: node.clone(),
                                depth: 1,
                                waiters: VecDeque::new(),
                            },
                        );
                        None
                    }
                    Some(entry) if entry.holder == owner => {
                        entry.depth += 1;
                        None
                    }
                    Some(entry) => {
                        let (wake, wait) = oneshot::channel();
                        entry.waiters.push_back(Waiter { owner, node: node.clone(), wake });
                        Some(wait)
                    }
                }
            };
            let Some(wait) = wait else {
                return;
            };
            // Granted by the previous holder's unlock. An error means the
            // entry went away before the grant; take the lock again.
            if wait.await.is_ok() {
                return;
            }
        }
    }

    fn unlock(&self, key: &str, owner: u64) {
        let mut table = self.inner.lock().expect("key lock table poisoned");
        let Some(entry) = table.get_mut(key) else {
            warn!(key, owner, "unlock of a key that is not locked");
            return;
        };
        if entry.holder != owner {
            warn!(key, owner, holder = entry.holder, "unlock by a non-holder");
            return;
        }
        entry.depth -= 1;
        if entry.depth > 0 {
            return;
        }
        // Hand the key to the first waiter that is still listening.
        while let Some(waiter) = entry.waiters.pop_front() {
            if waiter.wake.send(()).is_ok() {
                entry.holder = waiter.owner;
                entry.holder_node = waiter.node;
                entry.depth = 1;
                return;
            }
        }
        table.remove(key);
    }

    /// Force-releases every lock held from `node`, waking queued waiters.
    fn abandon_node(&self, node: &NodeId) {
        let mut table = self.inner.lock().expect("key lock table poisoned");
        table.retain(|key, entry| {
            if entry.holder_node != *node {
                return true;
            }
            debug!(key = key.as_ref(), node = %node, "releasing lock of departed member");
            while let Some(waiter) = entry.waiters.pop_front() {
                if waiter.wake.send(()).is_ok() {
                    entry.holder = waiter.owner;
                    entry.holder_node = waiter.node;
                    entry.depth = 1;
                    return true;
                }
            }
            false
        });
    }
}

/// Partitioned map of normalized path to [`FileState`].
pub struct StateMap {
    name: String,
    shards: Vec<Mutex<HashMap<Arc<str>, FileState>>>,
    locks: KeyLockTable,
    listeners: RwLock<Vec<Arc<dyn EntryListener>>>,
}

impl StateMap {
    /// Creates the map for the named cluster.
    pub fn new(name: &str) -> StateMap {
        let mut shards = Vec::with_capacity(DEFAULT_PARTITION_COUNT);
        for _ in 0..DEFAULT_PARTITION_COUNT {
            shards.push(Mutex::new(HashMap::new()));
        }
        StateMap {
            name: name.to_string(),
            shards,
            locks: KeyLockTable::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Map name, which is the cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition index of a key; also its shard index.
    pub fn partition_of(&self, key: &str) -> usize {
        (hash_key(key) % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<Arc<str>, FileState>> {
        &self.shards[self.partition_of(key)]
    }

    /// Registers an entry listener.
    pub fn add_listener(&self, listener: Arc<dyn EntryListener>) {
        self.listeners.write().expect("listener list poisoned").push(listener);
    }

    fn fire(&self, event: EntryEvent, key: &str) {
        trace!(map = %self.name, ?event, key, "entry event");
        let listeners = self.listeners.read().expect("listener list poisoned").clone();
        for listener in listeners {
            listener.entry_event(event, key);
        }
    }

    /// Returns a clone of the record stored under `key`.
    pub fn get(&self, key: &str) -> Option<FileState> {
        self.shard(key).lock().expect("map shard poisoned").get(key).cloned()
    }

    /// Stores a record, firing Added or Updated.
    pub fn put(&self, key: &str, state: FileState) {
        let existed = {
            let mut shard = self.shard(key).lock().expect("map shard poisoned");
            shard.insert(Arc::from(key), state).is_some()
        };
        self.fire(if existed { EntryEvent::Updated } else { EntryEvent::Added }, key);
    }

    /// Stores a record only when the key is vacant.
    ///
    /// # Returns
    ///
    /// The pre-existing record when the key was occupied, `None` when the
    /// new record was stored.
    pub fn put_if_absent(&self, key: &str, state: FileState) -> Option<FileState> {
        let existing = {
            let mut shard = self.shard(key).lock().expect("map shard poisoned");
            match shard.get(key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    shard.insert(Arc::from(key), state);
                    None
                }
            }
        };
        if existing.is_none() {
            self.fire(EntryEvent::Added, key);
        }
        existing
    }

    /// Removes a record, firing Removed.
    pub fn remove(&self, key: &str) -> Option<FileState> {
        let removed = self.shard(key).lock().expect("map shard poisoned").remove(key);
        if removed.is_some() {
            self.fire(EntryEvent::Removed, key);
        }
        removed
    }

    /// Removes a record on behalf of the expiry reaper, firing Evicted.
    pub fn evict(&self, key: &str) -> Option<FileState> {
        let removed = self.shard(key).lock().expect("map shard poisoned").remove(key);
        if removed.is_some() {
            self.fire(EntryEvent::Evicted, key);
        }
        removed
    }

    /// Number of records across all partitions.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("map shard poisoned").len()).sum()
    }

    /// True when the map holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the keys stored in the given partitions.
    ///
    /// Used for the reaper's local-key iteration and the departed-member
    /// sweep; the snapshot is taken shard by shard and may miss concurrent
    /// inserts, which both callers tolerate.
    pub fn keys_in_partitions(&self, partitions: &[usize]) -> Vec<String> {
        let mut keys = Vec::new();
        for &partition in partitions {
            if let Some(shard) = self.shards.get(partition) {
                let shard = shard.lock().expect("map shard poisoned");
                keys.extend(shard.keys().map(|k| k.to_string()));
            }
        }
        keys
    }

    /// Takes the per-key lock for `owner` running on `node`, waiting in
    /// FIFO order behind the current holder.
    pub async fn lock(&self, key: &str, owner: u64, node: &NodeId) {
        self.locks.lock(key, owner, node).await;
    }

    /// Releases one level of the per-key lock held by `owner`.
    pub fn unlock(&self, key: &str, owner: u64) {
        self.locks.unlock(key, owner);
    }

    /// Force-releases locks held from a departed member.
    pub fn abandon_locks_of_node(&self, node: &NodeId) {
        self.locks.abandon_node(node);
    }
}

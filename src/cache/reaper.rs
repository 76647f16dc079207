//! The expiry reaper: drops idle states and stale near-cache entries.
//!
//! One daemon task per node wakes on a fixed interval and walks the keys
//! of the partitions this node owns. A state goes only when nothing pins
//! it - no open handles, no byte-range locks, no oplock - and its expiry
//! deadline has passed, and the state listener gets a chance to veto the
//! removal. The same pass sweeps near-cache entries whose last access is
//! older than the TTL.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::CacheInner;
use crate::config::DebugFlags;
use crate::state::now_millis;

impl CacheInner {
    /// Starts the reaper loop for this node.
    pub(crate) fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh node
            // does not reap before it has served anything.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                inner.expire_pass().await;
            }
        })
    }

    /// One reaper pass over the locally owned keys and the near-cache.
    pub(crate) async fn expire_pass(&self) {
        let now = now_millis();
        let owned = self.fabric.owned_partitions(&self.node);
        let listener = self.state_listener();
        let mut scanned = 0usize;
        let mut expired = 0usize;

        for key in self.map.keys_in_partitions(&owned) {
            scanned += 1;
            let Some(state) = self.map.get(&key) else {
                continue;
            };
            if !state.can_expire() || !state.has_expired(now) {
                continue;
            }
            if let Some(listener) = &listener {
                if !listener.file_state_expired(&state) {
                    continue;
                }
            }

            // Re-check under the key lock; a task may have revived the
            // state between the snapshot and here.
            let lock_id = self.fabric.next_task_id();
            self.map.lock(&key, lock_id, &self.node).await;
            if let Some(current) = self.map.get(&key) {
                if current.can_expire() && current.has_expired(now) {
                    self.map.evict(&key);
                    self.per_node.remove(&key);
                    expired += 1;
                }
            }
            self.map.unlock(&key, lock_id);
        }

        let swept = self.near.as_ref().map(|near| near.sweep_expired(now));

        if self.config.has_debug(DebugFlags::EXPIRE) {
            debug!(scanned, expired, "expiry pass complete");
        }
        if let (Some(near), Some(swept)) = (&self.near, swept) {
            if self.config.has_debug(DebugFlags::NEAR_CACHE) {
                let stats = near.snapshot();
                debug!(
                    swept,
                    hits = stats.hits,
                    misses = stats.misses,
                    entries = stats.entries,
                    "near-cache statistics"
                );
            }
        }
    }
}

//! Membership change events and the departed-member cleanup sweep.
//!
//! When the cluster reports a member gone, every surviving node walks the
//! keys of the partitions it owns and scrubs the departed node out of
//! them: open-count bookkeeping of opens made through that node, its
//! byte-range locks, its oplocks. Each key is mutated under the per-key
//! lock; the sweep is best-effort and imposes no ordering across keys.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::map::StateMap;
use crate::cluster::NodeId;
use crate::state::access::SharedAccess;

/// A cluster membership change.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A member joined.
    Joined(NodeId),
    /// A member left or was dropped by the failure detector.
    Left(NodeId),
}

/// Counters describing one cleanup sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupStats {
    /// States whose opener bookkeeping was reset.
    pub opens_reset: usize,
    /// Byte-range locks removed.
    pub locks_removed: usize,
    /// Oplocks cleared.
    pub oplocks_cleared: usize,
}

/// Scrubs a departed member from the states in the given partitions.
///
/// # Arguments
///
/// * `map` - the shared state map
/// * `local` - the node running the sweep
/// * `partitions` - partitions this node owns under the new table
/// * `departed` - the member that left
/// * `next_lock_id` - allocator for key-lock holder ids
pub(crate) async fn cleanup_departed(
    map: &Arc<StateMap>,
    local: &NodeId,
    partitions: &[usize],
    departed: &NodeId,
    next_lock_id: impl Fn() -> u64,
    debug_enabled: bool,
) -> CleanupStats {
    let mut stats = CleanupStats::default();

    for key in map.keys_in_partitions(partitions) {
        let lock_id = next_lock_id();
        map.lock(&key, lock_id, local).await;

        if let Some(mut state) = map.get(&key) {
            let mut touched = false;

            if state.primary_owner() == Some(departed) {
                // The first opener's node is gone; drop its open and return
                // the sharing mode to the permissive default.
                state.decrement_open_count();
                state.shared_access = SharedAccess::all();
                stats.opens_reset += 1;
                touched = true;
            }

            let removed = state.release_byte_locks_of(departed);
            if removed > 0 {
                stats.locks_removed += removed;
                touched = true;
            }

            if state.oplock().is_some_and(|oplock| oplock.owned_by(departed)) {
                state.remove_oplock_owner(departed);
                stats.oplocks_cleared += 1;
                touched = true;
            }

            if touched {
                if debug_enabled {
                    debug!(key = %key, departed = %departed, "cleaned state of departed member");
                }
                map.put(&key, state);
            }
        }

        map.unlock(&key, lock_id);
    }

    info!(
        departed = %departed,
        opens_reset = stats.opens_reset,
        locks_removed = stats.locks_removed,
        oplocks_cleared = stats.oplocks_cleared,
        "departed member cleanup complete"
    );
    stats
}

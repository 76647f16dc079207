//! Cluster fabric: node identity, membership and the shared primitives the
//! cache is built on.
//!
//! The cache relies on three distributed primitives with well-defined
//! semantics: a partitioned map with per-key single-owner semantics, a
//! task runtime that executes closures on a key's owner node, and a
//! best-effort ordered pub/sub topic. [`ClusterFabric`] is the
//! in-process implementation of all three: every cache node in the process
//! joins the same fabric, which carries the partition table, the shared
//! state storage and the message bus. All records that cross node boundaries
//! are serde-serializable, so a network transport can be layered underneath
//! by a host without touching the cache core.

pub mod map;
pub mod membership;
pub mod partition;
pub mod task;
pub mod topic;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use map::StateMap;
use membership::MembershipEvent;
use partition::PartitionTable;
use task::DispatchedTask;
use topic::ClusterMessage;

/// Name of one cluster member.
///
/// Node names are assigned by the host (typically the server's host name)
/// and are stable for the lifetime of the member.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from a host-assigned name.
    pub fn new(name: &str) -> NodeId {
        NodeId(name.to_string())
    }

    /// The node name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Channel endpoints registered by a node when it joins the fabric.
pub(crate) struct NodeChannels {
    /// Remote tasks addressed to this node.
    pub tasks: mpsc::UnboundedSender<DispatchedTask>,
    /// Topic messages for this node's dispatcher.
    pub messages: mpsc::UnboundedSender<ClusterMessage>,
    /// Membership change notifications.
    pub membership: mpsc::UnboundedSender<MembershipEvent>,
}

struct FabricInner {
    members: Vec<NodeId>,
    nodes: HashMap<NodeId, NodeChannels>,
    partitions: PartitionTable,
}

/// The in-process cluster backing one or more cache nodes.
///
/// One fabric corresponds to one named cluster. Nodes join on
/// `start_cluster` and leave on `shutdown_cluster`; the membership change
/// recomputes the partition table and is broadcast to every remaining
/// member.
pub struct ClusterFabric {
    name: String,
    map: Arc<StateMap>,
    inner: Mutex<FabricInner>,
    next_task_id: AtomicU64,
}

impl ClusterFabric {
    /// Creates a fabric for the named cluster.
    pub fn new(cluster_name: &str) -> Arc<ClusterFabric> {
        Arc::new(ClusterFabric {
            name: cluster_name.to_string(),
            map: Arc::new(StateMap::new(cluster_name)),
            inner: Mutex::new(FabricInner {
                members: Vec::new(),
                nodes: HashMap::new(),
                partitions: PartitionTable::new(partition::DEFAULT_PARTITION_COUNT),
            }),
            next_task_id: AtomicU64::new(1),
        })
    }

    /// Cluster name this fabric was created for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared partitioned state map.
    pub(crate) fn map(&self) -> Arc<StateMap> {
        self.map.clone()
    }

    /// Allocates a fabric-unique id for a task or lock holder.
    pub(crate) fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Current member list, in join order.
    pub fn members(&self) -> Vec<NodeId> {
        self.inner.lock().expect("fabric lock poisoned").members.clone()
    }

    /// The node currently owning the partition of `key`.
    pub fn partition_owner(&self, key: &str) -> Option<NodeId> {
        let inner = self.inner.lock().expect("fabric lock poisoned");
        inner.partitions.owner_of_key(key, &inner.members).cloned()
    }

    /// Partition indexes owned by `node` under the current table.
    pub(crate) fn owned_partitions(&self, node: &NodeId) -> Vec<usize> {
        let inner = self.inner.lock().expect("fabric lock poisoned");
        inner.partitions.owned_by(node, &inner.members)
    }

    /// Registers a member and its channel endpoints.
    ///
    /// Fails when a member with the same name is already present. The new
    /// membership is announced to every member, including the joiner.
    pub(crate) fn join(&self, node: NodeId, channels: NodeChannels) -> StateResult<()> {
        let mut inner = self.inner.lock().expect("fabric lock poisoned");
        if inner.nodes.contains_key(&node) {
            return Err(StateError::ConfigInvalid(format!(
                "node '{node}' is already a member of cluster '{}'",
                self.name
            )));
        }
        inner.members.push(node.clone());
        inner.nodes.insert(node.clone(), channels);
        debug!(cluster = %self.name, node = %node, members = inner.members.len(), "member joined");
        Self::announce(&inner, MembershipEvent::Joined(node));
        Ok(())
    }

    /// Removes a member, rebalances partitions and notifies the survivors.
    ///
    /// Key locks held by the departed member are force-released so queued
    /// waiters can make progress.
    pub(crate) fn leave(&self, node: &NodeId) {
        let mut inner = self.inner.lock().expect("fabric lock poisoned");
        if inner.nodes.remove(node).is_none() {
            return;
        }
        inner.members.retain(|m| m != node);
        debug!(cluster = %self.name, node = %node, members = inner.members.len(), "member left");
        Self::announce(&inner, MembershipEvent::Left(node.clone()));
        drop(inner);
        self.map.abandon_locks_of_node(node);
    }

    /// Drops a member without a clean leave, as a failure detector would.
    ///
    /// Used by hosts and tests to simulate a crashed node; survivors run the
    /// same departed-member cleanup as for a clean leave.
    pub fn remove_member(&self, node: &NodeId) {
        self.leave(node);
    }

    fn announce(inner: &FabricInner, event: MembershipEvent) {
        for (name, channels) in &inner.nodes {
            if channels.membership.send(event.clone()).is_err() {
                warn!(node = %name, "membership channel closed");
            }
        }
    }

    /// Ships a task to the partition owner of its routing key.
    ///
    /// The reply arrives through the oneshot carried inside `task`. Fails
    /// with [`StateError::ClusterTransient`] when the cluster has no members
    /// or the owner's executor is gone; the task runtime retries once.
    pub(crate) fn send_task(&self, task: DispatchedTask) -> StateResult<()> {
        let inner = self.inner.lock().expect("fabric lock poisoned");
        let owner = inner
            .partitions
            .owner_of_key(&task.envelope.key, &inner.members)
            .ok_or_else(|| StateError::ClusterTransient("cluster has no members".to_string()))?;
        let channels = inner.nodes.get(owner).ok_or_else(|| {
            StateError::ClusterTransient(format!("partition owner {owner} not registered"))
        })?;
        channels.tasks.send(task).map_err(|_| {
            StateError::ClusterTransient("partition owner executor is shut down".to_string())
        })
    }

    /// Publishes a message to the topic.
    ///
    /// Targeted messages reach only the addressed node; broadcasts reach
    /// every member including the publisher (listeners filter their own
    /// messages where required). Delivery is best-effort.
    pub(crate) fn publish(&self, message: ClusterMessage) {
        let inner = self.inner.lock().expect("fabric lock poisoned");
        match message.target.clone() {
            topic::MessageTarget::Node(node) => {
                if let Some(channels) = inner.nodes.get(&node) {
                    let _ = channels.messages.send(message);
                }
            }
            topic::MessageTarget::AllNodes => {
                for channels in inner.nodes.values() {
                    let _ = channels.messages.send(message.clone());
                }
            }
        }
    }
}

impl fmt::Debug for ClusterFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("fabric lock poisoned");
        f.debug_struct("ClusterFabric")
            .field("name", &self.name)
            .field("members", &inner.members)
            .finish()
    }
}

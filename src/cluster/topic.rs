//! The cluster topic: typed messages broadcast between cache nodes.
//!
//! One logical topic per cluster. Publishing is fire-and-forget with
//! at-least-once, per-publisher-ordered delivery; each node drains its
//! subscription on a single dispatcher task, so handling on a node is
//! serialized. Messages carry node-local side effects only - the
//! authoritative record was already changed through a remote task before
//! anything is published.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cluster::{ClusterFabric, NodeId};
use crate::state::update::{StateUpdateValues, UpdateMask};

/// Version tag carried by every message envelope.
pub const MESSAGE_WIRE_VERSION: u8 = 1;

/// Addressing of one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageTarget {
    /// Every member, including the publisher.
    AllNodes,
    /// One member.
    Node(NodeId),
}

/// The message kinds the cache publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateMessage {
    /// Ask the owning node to break its local oplock; deferred requests on
    /// the publisher wait for the matching notify.
    OpLockBreakRequest {
        /// Normalized path of the oplocked file.
        path: String,
        /// The owner as known to the publisher, for logging and
        /// cross-checks.
        owner: Option<NodeId>,
    },
    /// The oplock on `path` is gone; cancel break timers, requeue deferred
    /// requests, invalidate near-cache copies.
    OpLockBreakNotify {
        /// Normalized path.
        path: String,
    },
    /// The oplock on `path` changed type; near-cache copies are stale and
    /// deferred requests waiting on the change can resume.
    OpLockTypeChange {
        /// Normalized path.
        path: String,
    },
    /// Low-priority flush of size/alloc/timestamp/status values.
    FileStateUpdate {
        /// Normalized path.
        path: String,
        /// Fields present in `values`.
        mask: UpdateMask,
        /// The flushed values.
        values: StateUpdateValues,
    },
    /// A path (possibly a folder subtree) was renamed.
    RenameState {
        /// Normalized old path.
        old_path: String,
        /// Normalized new path.
        new_path: String,
        /// True for a folder rename; receivers sweep keys under the old
        /// prefix.
        is_folder: bool,
    },
    /// A node started or finished writing cached data back to the store.
    DataUpdate {
        /// Normalized path.
        path: String,
        /// The node holding (or releasing) the fresher copy.
        node: NodeId,
        /// True at start, false at completion.
        start: bool,
    },
}

impl StateMessage {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            StateMessage::OpLockBreakRequest { .. } => "OpLockBreakRequest",
            StateMessage::OpLockBreakNotify { .. } => "OpLockBreakNotify",
            StateMessage::OpLockTypeChange { .. } => "OpLockTypeChange",
            StateMessage::FileStateUpdate { .. } => "FileStateUpdate",
            StateMessage::RenameState { .. } => "RenameState",
            StateMessage::DataUpdate { .. } => "DataUpdate",
        }
    }
}

/// One message as it travels the topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMessage {
    /// Wire version, [`MESSAGE_WIRE_VERSION`].
    pub version: u8,
    /// Addressing.
    pub target: MessageTarget,
    /// Publishing node.
    pub from: NodeId,
    /// Payload.
    pub body: StateMessage,
}

/// Publish handle bound to one node and topic.
pub(crate) struct TopicPublisher {
    fabric: Arc<ClusterFabric>,
    topic: String,
    node: NodeId,
    debug: bool,
}

impl TopicPublisher {
    pub fn new(
        fabric: Arc<ClusterFabric>,
        topic: &str,
        node: NodeId,
        debug: bool,
    ) -> TopicPublisher {
        TopicPublisher { fabric, topic: topic.to_string(), node, debug }
    }

    /// Publishes a message; best-effort, never blocks.
    pub fn publish(&self, target: MessageTarget, body: StateMessage) {
        if self.debug {
            debug!(
                topic = %self.topic,
                message = body.name(),
                ?target,
                "publishing cluster message"
            );
        }
        self.fabric.publish(ClusterMessage {
            version: MESSAGE_WIRE_VERSION,
            target,
            from: self.node.clone(),
            body,
        });
    }
}

/// Receiver side: the cache implements this to apply message side effects.
#[async_trait]
pub(crate) trait MessageListener: Send + Sync {
    async fn on_message(&self, message: ClusterMessage);
}

/// Starts the dispatcher task draining a node's subscription.
pub(crate) fn spawn_dispatcher(
    mut messages: mpsc::UnboundedReceiver<ClusterMessage>,
    listener: Arc<dyn MessageListener>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            listener.on_message(message).await;
        }
        trace!("message dispatcher finished");
    })
}

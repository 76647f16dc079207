//! The clustered file-state cache itself.
//!
//! [`ClusterFileStateCache`] is what the hosting file server talks to: it
//! owns one node's view of the cluster - near-cache, per-node state, task
//! dispatcher, topic publisher - and exposes the open/close, oplock,
//! byte-lock, rename and data-update operations the protocol layer needs.
//!
//! Every operation that changes a record is shipped as a remote task to
//! the key's partition owner and executed there under the per-key lock;
//! the caller blocks on the task's future. Observable changes are then
//! published on the cluster topic so sibling nodes can invalidate their
//! near-caches, requeue deferred requests and fire change notifications.

pub mod near;
pub mod oplock;
pub mod per_node;
pub mod rename;
pub mod reaper;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::map::{EntryEvent, EntryListener, StateMap};
use crate::cluster::membership::{cleanup_departed, MembershipEvent};
use crate::cluster::task::{StateTask, TaskDispatcher, TaskExecutor, TaskOptions, TaskReply};
use crate::cluster::topic::{
    self, ClusterMessage, MessageListener, MessageTarget, StateMessage, TopicPublisher,
};
use crate::cluster::{ClusterFabric, NodeChannels, NodeId};
use crate::config::{ClusterConfig, DebugFlags};
use crate::error::{StateError, StateResult};
use crate::host::{FileStateListener, MembershipListener, NotifyChangeHandler, OpLockManager, ThreadPool};
use crate::path;
use crate::state::access::{OpenParams, TokenInfo};
use crate::state::byte_lock::ByteRangeLock;
use crate::state::oplock::{OpLockRef, OpLockType, RemoteOpLock};
use crate::state::update::{StateUpdateValues, UpdateMask, UpdatePost};
use crate::state::{now_millis, FileState, FileStatus, StatusChangeReason, UNKNOWN_FILE_ID};
use near::{NearCache, NearCacheSnapshot};
use per_node::PerNodeState;

/// The host-implemented collaborators one cache node needs.
pub struct CacheHosts {
    /// Oplock timer bookkeeping on the host side.
    pub oplock_manager: Arc<dyn OpLockManager>,
    /// Change-notification sink.
    pub notify_handler: Arc<dyn NotifyChangeHandler>,
    /// Worker pool that reprocesses deferred requests.
    pub thread_pool: Arc<dyn ThreadPool>,
}

/// Token returned by a successful access grant.
///
/// The token must be surrendered through
/// [`ClusterFileStateCache::release_file_access`] to drop the open count
/// again. Dropping an unreleased token logs the leak; there is no
/// finalizer magic that releases it for the caller.
#[derive(Debug)]
pub struct AccessToken {
    info: TokenInfo,
    oplock_available: bool,
    existing_oplock: Option<RemoteOpLock>,
    open_count: u32,
    released: bool,
}

impl AccessToken {
    /// Normalized path the token covers.
    pub fn path(&self) -> &str {
        &self.info.path
    }

    /// Oplock granted together with the open, `None` when none was.
    pub fn granted_oplock(&self) -> OpLockType {
        self.info.granted_oplock
    }

    /// False when an oplock could not be granted because the file was
    /// already open elsewhere.
    pub fn oplock_available(&self) -> bool {
        self.oplock_available
    }

    /// Oplock already held on the file at grant time, if any.
    pub fn existing_oplock(&self) -> Option<&RemoteOpLock> {
        self.existing_oplock.as_ref()
    }

    /// True for an attributes-only token that holds no open count.
    pub fn attributes_only(&self) -> bool {
        self.info.attributes_only
    }

    /// Open count right after this grant.
    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    /// True once the token has been released.
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        if !self.released && !self.info.attributes_only {
            warn!(
                path = %self.info.path,
                process_id = self.info.process_id,
                "access token dropped without release; open count leaked"
            );
        }
    }
}

/// Forwards map entry events into the near-cache: replicas of keys that
/// disappear from the main map are dropped.
struct NearEntryListener {
    near: Arc<NearCache>,
}

impl EntryListener for NearEntryListener {
    fn entry_event(&self, event: EntryEvent, key: &str) {
        if matches!(event, EntryEvent::Removed | EntryEvent::Evicted) {
            self.near.remove(key);
        }
    }
}

/// Logs map entry traffic when the `ClusterEntry` debug flag is set.
struct EntryDebugListener;

impl EntryListener for EntryDebugListener {
    fn entry_event(&self, event: EntryEvent, key: &str) {
        debug!(?event, key, "map entry event");
    }
}

/// Adapter giving the topic dispatcher an owned handle on the cache.
struct MessageHandler {
    inner: Arc<CacheInner>,
}

#[async_trait]
impl MessageListener for MessageHandler {
    async fn on_message(&self, message: ClusterMessage) {
        self.inner.handle_message(message).await;
    }
}

pub(crate) struct CacheInner {
    pub(crate) config: ClusterConfig,
    pub(crate) node: NodeId,
    pub(crate) fabric: Arc<ClusterFabric>,
    pub(crate) map: Arc<StateMap>,
    pub(crate) dispatcher: TaskDispatcher,
    pub(crate) publisher: TopicPublisher,
    pub(crate) near: Option<Arc<NearCache>>,
    pub(crate) per_node: PerNodeState,
    pub(crate) hosts: CacheHosts,
    pub(crate) state_listener: RwLock<Option<Arc<dyn FileStateListener>>>,
    membership_listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// One node of the clustered file-state cache.
pub struct ClusterFileStateCache {
    inner: Arc<CacheInner>,
}

impl ClusterFileStateCache {
    /// Creates a cache node bound to the fabric of its cluster.
    ///
    /// The node does nothing until [`ClusterFileStateCache::start_cluster`]
    /// is called.
    pub fn new(
        config: ClusterConfig,
        node_name: &str,
        fabric: Arc<ClusterFabric>,
        hosts: CacheHosts,
    ) -> ClusterFileStateCache {
        let node = NodeId::new(node_name);
        let near = if config.near_cache_disabled {
            None
        } else {
            Some(Arc::new(NearCache::new(
                config.near_cache_timeout.as_millis() as i64,
                config.has_debug(DebugFlags::NEAR_CACHE),
            )))
        };
        let dispatcher = TaskDispatcher::new(
            fabric.clone(),
            node.clone(),
            config.has_debug(DebugFlags::REMOTE_TASK),
            config.has_debug(DebugFlags::REMOTE_TIMING),
        );
        let publisher = TopicPublisher::new(
            fabric.clone(),
            &config.cluster_topic,
            node.clone(),
            config.has_debug(DebugFlags::CLUSTER_MESSAGE),
        );
        let per_node = PerNodeState::new(config.has_debug(DebugFlags::PER_NODE));
        let map = fabric.map();
        ClusterFileStateCache {
            inner: Arc::new(CacheInner {
                config,
                node,
                fabric,
                map,
                dispatcher,
                publisher,
                near,
                per_node,
                hosts,
                state_listener: RwLock::new(None),
                membership_listeners: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Joins the cluster and starts this node's worker tasks: the task
    /// executor, the topic dispatcher, the membership listener and the
    /// expiry reaper.
    pub fn start_cluster(&self) -> StateResult<()> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (membership_tx, membership_rx) = mpsc::unbounded_channel();

        if let Err(error) = inner.fabric.join(
            inner.node.clone(),
            NodeChannels { tasks: task_tx, messages: message_tx, membership: membership_tx },
        ) {
            inner.running.store(false, Ordering::SeqCst);
            return Err(error);
        }

        if let Some(near) = &inner.near {
            inner.map.add_listener(Arc::new(NearEntryListener { near: near.clone() }));
        }
        if inner.config.has_debug(DebugFlags::CLUSTER_ENTRY) {
            inner.map.add_listener(Arc::new(EntryDebugListener));
        }

        let executor = TaskExecutor::new(
            inner.map.clone(),
            inner.node.clone(),
            inner.config.state_expiry.as_millis() as i64,
            inner.config.has_debug(DebugFlags::REMOTE_TASK),
            inner.config.has_debug(DebugFlags::REMOTE_TIMING),
        );

        let mut workers = inner.workers.lock().expect("worker list poisoned");
        workers.push(executor.spawn(task_rx));
        workers.push(topic::spawn_dispatcher(
            message_rx,
            Arc::new(MessageHandler { inner: inner.clone() }),
        ));
        workers.push(inner.spawn_membership(membership_rx));
        workers.push(inner.spawn_reaper());
        drop(workers);

        info!(
            cluster = %inner.config.cluster_name,
            topic = %inner.config.cluster_topic,
            node = %inner.node,
            "file state cache started"
        );
        Ok(())
    }

    /// Leaves the cluster and stops this node's workers. Survivors observe
    /// the departure and clean up opens, locks and oplocks made through
    /// this node.
    pub fn shutdown_cluster(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        inner.fabric.leave(&inner.node);
        for worker in inner.workers.lock().expect("worker list poisoned").drain(..) {
            worker.abort();
        }
        info!(node = %inner.node, "file state cache stopped");
    }

    /// Registers the state lifecycle listener (created/removed/expired/
    /// renamed). Only one listener is kept; later calls replace it.
    pub fn set_state_listener(&self, listener: Arc<dyn FileStateListener>) {
        *self.inner.state_listener.write().expect("listener poisoned") = Some(listener);
    }

    /// Adds a membership listener.
    pub fn add_membership_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.inner
            .membership_listeners
            .write()
            .expect("listener poisoned")
            .push(listener);
    }

    /// This node's name.
    pub fn local_node(&self) -> &str {
        self.inner.node.as_str()
    }

    /// Current cluster member names, in join order.
    pub fn members(&self) -> Vec<String> {
        self.inner.fabric.members().iter().map(|m| m.as_str().to_string()).collect()
    }

    /// The node currently owning the partition of `path`.
    pub fn partition_owner(&self, path: &str) -> Option<String> {
        let norm = self.inner.normalize(path);
        self.inner.fabric.partition_owner(&norm).map(|n| n.as_str().to_string())
    }

    /// Near-cache statistics, `None` when the near-cache is disabled.
    pub fn near_cache_stats(&self) -> Option<NearCacheSnapshot> {
        self.inner.near.as_ref().map(|near| near.snapshot())
    }

    /// Validity of this node's near-cache entry for a path: `Some(false)`
    /// after an observed remote mutation, `None` when nothing is cached
    /// (or the near-cache is disabled).
    pub fn near_entry_valid(&self, path: &str) -> Option<bool> {
        let norm = self.inner.normalize(path);
        self.inner.near.as_ref()?.entry_valid(&norm)
    }

    /// Normalizes a path the way the cache does internally.
    pub fn normalize_path(&self, path: &str) -> String {
        self.inner.normalize(path)
    }

    /// Looks up the state for a path: near-cache first, then the main map.
    ///
    /// A plain lookup does not admit the state into the near-cache; only
    /// creations and task results do.
    pub fn find_state(&self, path: &str) -> Option<FileState> {
        if self.inner.ensure_running().is_err() {
            return None;
        }
        let norm = self.inner.normalize(path);
        self.inner.lookup(&norm)
    }

    /// Looks up or lazily creates the state for a path.
    ///
    /// A newly created state starts with the given status, an expiry
    /// window in the future, and is admitted into this node's near-cache.
    pub fn find_or_create_state(
        &self,
        path: &str,
        initial_status: FileStatus,
    ) -> StateResult<FileState> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let norm = inner.normalize(path);

        if let Some(near) = &inner.near {
            if let Some(state) = near.get(&norm) {
                return Ok(state);
            }
        }

        let mut fresh = FileState::new(&norm, initial_status);
        fresh.bump_expiry(now_millis(), inner.config.state_expiry.as_millis() as i64);
        match inner.map.put_if_absent(&norm, fresh.clone()) {
            Some(existing) => Ok(existing),
            None => {
                if inner.config.has_debug(DebugFlags::STATE_CACHE) {
                    debug!(path = %norm, ?initial_status, "state created");
                }
                if let Some(near) = &inner.near {
                    near.admit(fresh.clone());
                }
                if let Some(listener) = inner.state_listener() {
                    listener.file_state_created(&fresh);
                }
                Ok(fresh)
            }
        }
    }

    /// Removes the state for a path from the map, the near-cache and the
    /// per-node table.
    pub fn remove_state(&self, path: &str) -> Option<FileState> {
        let inner = &self.inner;
        if inner.ensure_running().is_err() {
            return None;
        }
        let norm = inner.normalize(path);
        let removed = inner.map.remove(&norm);
        if let Some(near) = &inner.near {
            near.remove(&norm);
        }
        inner.per_node.remove(&norm);
        if let Some(state) = &removed {
            if inner.config.has_debug(DebugFlags::STATE_CACHE) {
                debug!(path = %norm, "state removed");
            }
            if let Some(listener) = inner.state_listener() {
                listener.file_state_removed(state);
            }
        }
        removed
    }

    /// Renames a path, atomically rekeying its state; for folders, every
    /// state under the old prefix follows on every node.
    pub async fn rename_state(
        &self,
        old_path: &str,
        new_path: &str,
        is_folder: bool,
    ) -> StateResult<()> {
        self.inner.rename_state(old_path, new_path, is_folder).await
    }

    /// Grants file access under the SMB open rules.
    ///
    /// # Errors
    ///
    /// [`StateError::SharingViolation`], [`StateError::FileExists`] and
    /// [`StateError::AccessDenied`] translate to the matching SMB status
    /// codes; persistent cluster failures also surface as access denials
    /// with the cause attached.
    pub async fn grant_file_access(
        &self,
        params: OpenParams,
        initial_status: FileStatus,
    ) -> StateResult<AccessToken> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let mut params = params;
        let norm = inner.normalize(&params.path);
        params.path = norm.clone();
        params.requester = inner.node.clone();

        let reply = inner
            .dispatcher
            .dispatch(
                &norm,
                StateTask::GrantAccess { params, initial_status },
                TaskOptions::LOCK_STATE,
            )
            .await;

        match reply {
            Ok(TaskReply::Access(grant)) => {
                if inner.config.has_debug(DebugFlags::FILE_ACCESS) {
                    debug!(
                        path = %norm,
                        open_count = grant.open_count,
                        oplock = %grant.granted_oplock,
                        "file access granted"
                    );
                }
                if let Some(near) = &inner.near {
                    near.admit(grant.state.clone());
                }
                Ok(AccessToken {
                    info: grant.token,
                    oplock_available: grant.oplock_available,
                    existing_oplock: grant.existing_oplock,
                    open_count: grant.open_count,
                    released: false,
                })
            }
            Ok(_) => Err(CacheInner::unexpected_reply("GrantAccess")),
            Err(error) if error.is_transient() => Err(error.into_access_denied()),
            Err(error) => Err(error),
        }
    }

    /// Releases a grant, returning the open count that remains.
    ///
    /// When the last handle closes, or the token carried a granted oplock,
    /// the local oplock handle is settled as well; a break that was in
    /// progress is announced to the cluster so deferred requests elsewhere
    /// unblock.
    pub async fn release_file_access(&self, token: AccessToken) -> StateResult<u32> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let mut token = token;

        let reply = inner
            .dispatcher
            .dispatch(
                &token.info.path,
                StateTask::ReleaseAccess { token: token.info.clone() },
                TaskOptions::LOCK_STATE,
            )
            .await?;

        let TaskReply::Released(outcome) = reply else {
            return Err(CacheInner::unexpected_reply("ReleaseAccess"));
        };
        token.released = true;

        if let Some(near) = &inner.near {
            near.invalidate(&token.info.path);
        }
        if outcome.oplock_cleared || outcome.open_count == 0 {
            inner.settle_local_oplock(&token.info.path, true);
        }
        if inner.config.has_debug(DebugFlags::FILE_ACCESS) {
            debug!(
                path = %token.info.path,
                open_count = outcome.open_count,
                "file access released"
            );
        }
        Ok(outcome.open_count)
    }

    /// Attaches a local oplock handle for a grant.
    ///
    /// When the access arbiter already granted the oplock during the open,
    /// this is a local acknowledgement and no remote task is sent.
    ///
    /// # Errors
    ///
    /// [`StateError::ExistingOpLock`] when an incompatible oplock is
    /// already present.
    pub async fn add_oplock(
        &self,
        token: &AccessToken,
        handle: Arc<dyn crate::host::LocalOpLock>,
    ) -> StateResult<bool> {
        self.inner.add_oplock(token, handle).await
    }

    /// Removes the oplock on a path and announces it to the cluster.
    pub async fn clear_oplock(&self, path: &str) -> StateResult<()> {
        self.inner.clear_oplock(path).await
    }

    /// Removes this node from the owner set of a shared (LevelII) oplock;
    /// the oplock is cleared entirely when the owner set empties.
    pub async fn remove_oplock_owner(&self, path: &str) -> StateResult<()> {
        self.inner.remove_oplock_owner(path).await
    }

    /// The oplock on a path as this node sees it: the live local handle
    /// when a session here owns it, otherwise the replicated record of the
    /// remote owner.
    pub fn find_oplock(&self, path: &str) -> Option<OpLockRef> {
        let norm = self.inner.normalize(path);
        self.inner.find_oplock(&norm)
    }

    /// Downgrades the oplock type on a path.
    ///
    /// # Returns
    ///
    /// The new type, or `None` when the transition was invalid.
    pub async fn change_oplock_type(
        &self,
        path: &str,
        new_type: OpLockType,
    ) -> StateResult<Option<OpLockType>> {
        self.inner.change_oplock_type(path, new_type).await
    }

    /// Defers a request behind an oplock break, triggering the break when
    /// one is not already in flight.
    ///
    /// # Errors
    ///
    /// [`StateError::DeferFailed`] when the deferred queue rejects the
    /// request.
    pub async fn request_oplock_break(
        &self,
        path: &str,
        session_id: u64,
        packet: Vec<u8>,
    ) -> StateResult<()> {
        self.inner.request_oplock_break(path, session_id, packet).await
    }

    /// Adds a byte-range lock.
    ///
    /// # Errors
    ///
    /// [`StateError::LockConflict`] when the range overlaps a lock of a
    /// different owner.
    pub async fn add_byte_lock(&self, path: &str, lock: ByteRangeLock) -> StateResult<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let norm = inner.normalize(path);
        let reply = inner
            .dispatcher
            .dispatch(&norm, StateTask::AddByteLock { lock }, TaskOptions::LOCK_STATE)
            .await?;
        inner.absorb_state_reply("AddByteLock", &norm, reply, DebugFlags::BYTE_LOCK)
    }

    /// Removes a byte-range lock by exact match.
    ///
    /// # Errors
    ///
    /// [`StateError::NotLocked`] when no matching lock exists.
    pub async fn remove_byte_lock(&self, path: &str, lock: ByteRangeLock) -> StateResult<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let norm = inner.normalize(path);
        let reply = inner
            .dispatcher
            .dispatch(&norm, StateTask::RemoveByteLock { lock }, TaskOptions::LOCK_STATE)
            .await?;
        inner.absorb_state_reply("RemoveByteLock", &norm, reply, DebugFlags::BYTE_LOCK)
    }

    /// Returns the first byte-range lock overlapping the given range.
    pub async fn test_byte_lock(
        &self,
        path: &str,
        offset: u64,
        length: u64,
    ) -> StateResult<Option<ByteRangeLock>> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let norm = inner.normalize(path);
        let reply = inner
            .dispatcher
            .dispatch(&norm, StateTask::TestByteLock { offset, length }, TaskOptions::LOCK_STATE)
            .await?;
        match reply {
            TaskReply::MatchingLock(found) => Ok(found),
            _ => Err(CacheInner::unexpected_reply("TestByteLock")),
        }
    }

    /// Checks whether the caller may read the given range.
    pub async fn can_read_file(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        process_id: i64,
    ) -> StateResult<bool> {
        self.inner.check_byte_access(path, offset, length, process_id, false).await
    }

    /// Checks whether the caller may write the given range.
    pub async fn can_write_file(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        process_id: i64,
    ) -> StateResult<bool> {
        self.inner.check_byte_access(path, offset, length, process_id, true).await
    }

    /// Claims the file-data-update marker for this node.
    ///
    /// # Returns
    ///
    /// `false` when another node is already writing the file's data back.
    pub async fn start_data_update(&self, path: &str) -> StateResult<bool> {
        self.inner.data_update(path, true).await
    }

    /// Releases the file-data-update marker.
    ///
    /// # Returns
    ///
    /// `false` when this node did not hold the marker.
    pub async fn complete_data_update(&self, path: &str) -> StateResult<bool> {
        self.inner.data_update(path, false).await
    }

    /// Sets the existence status of a path and, when it changed, tells the
    /// cluster and fires the local change notification.
    pub async fn update_file_status(
        &self,
        path: &str,
        status: FileStatus,
        reason: StatusChangeReason,
    ) -> StateResult<bool> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let norm = inner.normalize(path);
        let reply = inner
            .dispatcher
            .dispatch(
                &norm,
                StateTask::UpdateFileStatus { status, reason },
                TaskOptions::LOCK_STATE,
            )
            .await?;
        let TaskReply::Flag(changed) = reply else {
            return Err(CacheInner::unexpected_reply("UpdateFileStatus"));
        };
        if changed {
            if inner.config.has_debug(DebugFlags::FILE_STATUS) {
                debug!(path = %norm, ?status, ?reason, "file status updated");
            }
            if let Some(near) = &inner.near {
                near.invalidate(&norm);
            }
            let values = StateUpdateValues {
                file_status: status,
                change_reason: reason,
                ..StateUpdateValues::default()
            };
            inner.publisher.publish(
                MessageTarget::AllNodes,
                StateMessage::FileStateUpdate {
                    path: norm.clone(),
                    mask: UpdateMask::FILE_STATUS,
                    values,
                },
            );
            inner.hosts.notify_handler.notify_file_changed(reason, &norm);
        }
        Ok(changed)
    }

    /// Begins a coalescing post for low-priority updates of `path`.
    ///
    /// Thread the post through the request and flush it once at the end
    /// with [`ClusterFileStateCache::flush_update_post`].
    pub fn begin_update_post(&self, path: &str) -> UpdatePost {
        UpdatePost::new(&self.inner.normalize(path))
    }

    /// Flushes a post: one remote task applies the batch, one message
    /// tells the siblings. Flushing an empty post is a no-op.
    pub async fn flush_update_post(&self, post: UpdatePost) -> StateResult<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        if post.is_empty() {
            return Ok(());
        }
        let mask = post.mask();
        let values = post.values().clone();
        inner
            .dispatcher
            .dispatch(
                post.path(),
                StateTask::ApplyUpdates { mask, values: values.clone() },
                TaskOptions::LOCK_STATE,
            )
            .await?;
        if let Some(near) = &inner.near {
            near.invalidate(post.path());
        }
        inner.publisher.publish(
            MessageTarget::AllNodes,
            StateMessage::FileStateUpdate { path: post.path().to_string(), mask, values: values.clone() },
        );
        if mask.contains(UpdateMask::FILE_STATUS) {
            inner.hosts.notify_handler.notify_file_changed(values.change_reason, post.path());
        }
        Ok(())
    }

    /// Stores a node-local attribute copy for a path.
    ///
    /// Attributes cached here belong to this node's back-end; the
    /// authoritative attribute map lives in the replicated record.
    pub fn add_attribute(&self, path: &str, name: &str, value: Vec<u8>) {
        let norm = self.inner.normalize(path);
        self.inner
            .per_node
            .get_or_create(&norm)
            .lock()
            .attributes
            .insert(name.to_string(), value);
    }

    /// Fetches a node-local attribute copy.
    pub fn fetch_attribute(&self, path: &str, name: &str) -> Option<Vec<u8>> {
        let norm = self.inner.normalize(path);
        self.inner.per_node.get(&norm)?.lock().attributes.get(name).cloned()
    }

    /// Removes a node-local attribute copy.
    pub fn remove_attribute(&self, path: &str, name: &str) -> Option<Vec<u8>> {
        let norm = self.inner.normalize(path);
        self.inner.per_node.get(&norm)?.lock().attributes.remove(name)
    }

    /// Caches the back-end file id locally for a path.
    pub fn set_local_file_id(&self, path: &str, file_id: i64) {
        let norm = self.inner.normalize(path);
        self.inner.per_node.get_or_create(&norm).lock().file_id = file_id;
    }

    /// The locally cached back-end file id, if one was stored.
    pub fn local_file_id(&self, path: &str) -> Option<i64> {
        let norm = self.inner.normalize(path);
        let entry = self.inner.per_node.get(&norm)?;
        let file_id = entry.lock().file_id;
        (file_id != UNKNOWN_FILE_ID).then_some(file_id)
    }
}

impl CacheInner {
    pub(crate) fn normalize(&self, raw: &str) -> String {
        path::normalize(raw, self.config.case_sensitive)
    }

    pub(crate) fn ensure_running(&self) -> StateResult<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StateError::Fatal("file state cache is not started".to_string()))
        }
    }

    pub(crate) fn state_listener(&self) -> Option<Arc<dyn FileStateListener>> {
        self.state_listener.read().expect("listener poisoned").clone()
    }

    pub(crate) fn unexpected_reply(task: &str) -> StateError {
        StateError::ClusterTransient(format!("unexpected reply for {task} task"))
    }

    /// Near-cache first, then the main map.
    pub(crate) fn lookup(&self, norm: &str) -> Option<FileState> {
        if let Some(near) = &self.near {
            if let Some(state) = near.get(norm) {
                return Some(state);
            }
        }
        self.map.get(norm)
    }

    /// Admits a state-carrying task reply into the near-cache.
    fn absorb_state_reply(
        &self,
        task: &str,
        norm: &str,
        reply: TaskReply,
        flag: DebugFlags,
    ) -> StateResult<()> {
        let TaskReply::State(state) = reply else {
            return Err(Self::unexpected_reply(task));
        };
        if self.config.has_debug(flag) {
            debug!(path = %norm, task, "state task complete");
        }
        if let Some(near) = &self.near {
            near.admit(*state);
        }
        Ok(())
    }

    async fn check_byte_access(
        &self,
        path: &str,
        offset: u64,
        length: u64,
        process_id: i64,
        write: bool,
    ) -> StateResult<bool> {
        self.ensure_running()?;
        let norm = self.normalize(path);

        // With at most one opener there is nobody to conflict with; skip
        // the cluster round-trip. The gate reads the main map, not a
        // near-cache replica that may predate a second opener.
        match self.map.get(&norm) {
            Some(state) if state.open_count() > 1 => {}
            _ => return Ok(true),
        }

        let reply = self
            .dispatcher
            .dispatch(
                &norm,
                StateTask::CheckByteAccess {
                    offset,
                    length,
                    owner_id: process_id,
                    node: self.node.clone(),
                    write,
                },
                TaskOptions::LOCK_STATE,
            )
            .await?;
        match reply {
            TaskReply::Flag(allowed) => Ok(allowed),
            _ => Err(Self::unexpected_reply("CheckByteAccess")),
        }
    }

    async fn data_update(&self, path: &str, start: bool) -> StateResult<bool> {
        self.ensure_running()?;
        let norm = self.normalize(path);
        let reply = self
            .dispatcher
            .dispatch(
                &norm,
                StateTask::FileDataUpdate { node: self.node.clone(), start },
                TaskOptions::LOCK_STATE,
            )
            .await?;
        let TaskReply::Flag(accepted) = reply else {
            return Err(Self::unexpected_reply("FileDataUpdate"));
        };
        if accepted {
            if self.config.has_debug(DebugFlags::FILE_DATA_UPDATE) {
                debug!(path = %norm, start, "file data update");
            }
            if let Some(near) = &self.near {
                near.record_data_update(&norm, &self.node, start);
            }
            self.publisher.publish(
                MessageTarget::AllNodes,
                StateMessage::DataUpdate { path: norm, node: self.node.clone(), start },
            );
        }
        Ok(accepted)
    }

    fn spawn_membership(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MembershipEvent::Joined(node) => {
                        if inner.config.has_debug(DebugFlags::MEMBERSHIP) {
                            debug!(node = %node, "member joined");
                        }
                        for listener in inner.membership_listeners() {
                            listener.member_joined(node.as_str());
                        }
                    }
                    MembershipEvent::Left(node) => {
                        if node == inner.node {
                            continue;
                        }
                        if inner.config.has_debug(DebugFlags::MEMBERSHIP) {
                            debug!(node = %node, "member left");
                        }
                        let owned = inner.fabric.owned_partitions(&inner.node);
                        cleanup_departed(
                            &inner.map,
                            &inner.node,
                            &owned,
                            &node,
                            || inner.fabric.next_task_id(),
                            inner.config.has_debug(DebugFlags::CLEANUP),
                        )
                        .await;
                        for listener in inner.membership_listeners() {
                            listener.member_left(node.as_str());
                        }
                    }
                }
            }
        })
    }

    fn membership_listeners(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.membership_listeners.read().expect("listener poisoned").clone()
    }

    /// Applies the node-local side effects of a topic message.
    async fn handle_message(self: &Arc<Self>, message: ClusterMessage) {
        if self.config.has_debug(DebugFlags::CLUSTER_MESSAGE) {
            debug!(message = message.body.name(), from = %message.from, "cluster message received");
        }
        let own = message.from == self.node;
        match message.body {
            StateMessage::OpLockBreakRequest { path, .. } => {
                if !own {
                    self.handle_break_request(&path).await;
                }
            }
            StateMessage::OpLockBreakNotify { path } => {
                if !own {
                    self.handle_break_settled(&path);
                }
            }
            StateMessage::OpLockTypeChange { path } => {
                if !own {
                    self.handle_type_change(&path);
                }
            }
            StateMessage::FileStateUpdate { path, mask, values } => {
                if !own {
                    if let Some(near) = &self.near {
                        near.invalidate(&path);
                    }
                    if mask.contains(UpdateMask::FILE_STATUS) {
                        self.hosts.notify_handler.notify_file_changed(values.change_reason, &path);
                    }
                }
            }
            StateMessage::RenameState { old_path, new_path, is_folder } => {
                self.handle_rename_message(own, &old_path, &new_path, is_folder).await;
            }
            StateMessage::DataUpdate { path, node, start } => {
                if !own {
                    if let Some(near) = &self.near {
                        near.record_data_update(&path, &node, start);
                    }
                }
            }
        }
    }
}

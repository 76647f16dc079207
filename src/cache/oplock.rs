//! The oplock engine: grants, breaks, type changes and deferred requests.
//!
//! The replicated oplock record moves through remote tasks like everything
//! else; what lives here is the node-local half of the protocol. Breaking
//! an oplock owned by a session on this node goes through the live handle;
//! breaking one owned elsewhere publishes a targeted break request and
//! parks the triggering request in the deferred queue. Either way a break
//! timer bounds the wait: when the matching notify or type-change arrives
//! the timer dies and the deferred requests go back to the worker pool,
//! and when it fires first they fail with a break timeout.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{AccessToken, CacheInner};
use crate::cluster::task::{StateTask, TaskOptions, TaskReply};
use crate::cluster::topic::{MessageTarget, StateMessage};
use crate::config::DebugFlags;
use crate::error::{StateError, StateResult};
use crate::host::{DeferredRequest, LocalOpLock};
use crate::state::now_millis;
use crate::state::oplock::{OpLockRef, OpLockType, RemoteOpLock};

impl CacheInner {
    /// Attaches a local oplock handle, installing the replicated record
    /// when the access arbiter did not already do so during the open.
    pub(crate) async fn add_oplock(
        &self,
        token: &AccessToken,
        handle: Arc<dyn LocalOpLock>,
    ) -> StateResult<bool> {
        self.ensure_running()?;
        let path = token.path().to_string();

        if token.granted_oplock() != OpLockType::None {
            // The grant already wrote the record; this is the local
            // acknowledgement that pairs the live handle with it.
            self.per_node.get_or_create(&path).lock().oplock = Some(handle);
            if self.config.has_debug(DebugFlags::OPLOCK) {
                debug!(path = %path, oplock = %token.granted_oplock(), "oplock handle attached");
            }
            return Ok(true);
        }

        let record = RemoteOpLock::new(self.node.clone(), handle.lock_type(), &path);
        let reply = self
            .dispatcher
            .dispatch(&path, StateTask::AddOpLock { oplock: record }, TaskOptions::LOCK_STATE)
            .await?;
        let TaskReply::Flag(added) = reply else {
            return Err(Self::unexpected_reply("AddOpLock"));
        };
        self.per_node.get_or_create(&path).lock().oplock = Some(handle);
        if let Some(near) = &self.near {
            near.invalidate(&path);
        }
        if self.config.has_debug(DebugFlags::OPLOCK) {
            debug!(path = %path, "oplock added");
        }
        Ok(added)
    }

    /// Clears the oplock record, announces it, and settles the local
    /// handle and deferred requests.
    pub(crate) async fn clear_oplock(&self, path: &str) -> StateResult<()> {
        self.ensure_running()?;
        let norm = self.normalize(path);
        let reply = self
            .dispatcher
            .dispatch(&norm, StateTask::ClearOpLock, TaskOptions::LOCK_STATE)
            .await?;
        if !matches!(reply, TaskReply::Unit) {
            return Err(Self::unexpected_reply("ClearOpLock"));
        }
        if let Some(near) = &self.near {
            near.remove(&norm);
        }
        self.publisher
            .publish(MessageTarget::AllNodes, StateMessage::OpLockBreakNotify { path: norm.clone() });
        self.settle_local_oplock(&norm, false);
        if self.config.has_debug(DebugFlags::OPLOCK) {
            debug!(path = %norm, "oplock cleared");
        }
        Ok(())
    }

    /// Downgrades the oplock type and, on success, announces the change so
    /// siblings invalidate their replicas and requeue deferred requests.
    pub(crate) async fn change_oplock_type(
        &self,
        path: &str,
        new_type: OpLockType,
    ) -> StateResult<Option<OpLockType>> {
        self.ensure_running()?;
        let norm = self.normalize(path);
        let reply = self
            .dispatcher
            .dispatch(&norm, StateTask::ChangeOpLockType { new_type }, TaskOptions::LOCK_STATE)
            .await?;
        let TaskReply::NewOpLockType(changed) = reply else {
            return Err(Self::unexpected_reply("ChangeOpLockType"));
        };
        if let Some(new_type) = changed {
            if self.config.has_debug(DebugFlags::OPLOCK) {
                debug!(path = %norm, oplock = %new_type, "oplock type changed");
            }
            if let Some(near) = &self.near {
                near.remove(&norm);
            }
            self.publisher.publish(
                MessageTarget::AllNodes,
                StateMessage::OpLockTypeChange { path: norm.clone() },
            );
            // The break (if one was pending) has settled into the new
            // type; local waiters can go again.
            self.requeue_deferred(&norm);
            self.hosts.oplock_manager.cancel_break_timer(&norm);
        }
        Ok(changed)
    }

    /// Removes this node from the oplock's owner set; a LevelII oplock
    /// that loses its last owner is cleared and announced.
    pub(crate) async fn remove_oplock_owner(&self, path: &str) -> StateResult<()> {
        self.ensure_running()?;
        let norm = self.normalize(path);
        let reply = self
            .dispatcher
            .dispatch(
                &norm,
                StateTask::RemoveOpLockOwner { owner: self.node.clone() },
                TaskOptions::LOCK_STATE,
            )
            .await?;
        let TaskReply::State(state) = reply else {
            return Err(Self::unexpected_reply("RemoveOpLockOwner"));
        };
        let cleared = !state.has_oplock();
        if let Some(near) = &self.near {
            near.admit(*state);
        }
        if cleared {
            self.publisher.publish(
                MessageTarget::AllNodes,
                StateMessage::OpLockBreakNotify { path: norm.clone() },
            );
            self.settle_local_oplock(&norm, false);
        } else if let Some(entry) = self.per_node.get(&norm) {
            entry.lock().oplock = None;
        }
        if self.config.has_debug(DebugFlags::OPLOCK) {
            debug!(path = %norm, cleared, "oplock owner removed");
        }
        Ok(())
    }

    /// The oplock on a path as seen from this node: the live handle when a
    /// local session owns it, otherwise the replicated record.
    pub(crate) fn find_oplock(&self, norm: &str) -> Option<OpLockRef> {
        if let Some(entry) = self.per_node.get(norm) {
            if let Some(handle) = entry.lock().oplock.clone() {
                return Some(OpLockRef::Local(handle));
            }
        }
        // The authoritative record, not a near-cache replica that may
        // predate the oplock.
        self.map.get(norm).and_then(|state| state.oplock().cloned()).map(OpLockRef::Remote)
    }

    /// Parks a request behind an oplock break, starting the break when
    /// none is in flight yet.
    pub(crate) async fn request_oplock_break(
        self: &Arc<Self>,
        path: &str,
        session_id: u64,
        packet: Vec<u8>,
    ) -> StateResult<()> {
        self.ensure_running()?;
        let norm = self.normalize(path);

        let Some(oplock) = self.find_oplock(&norm) else {
            return Ok(());
        };

        let entry = self.per_node.get_or_create(&norm);
        let lease = now_millis() + self.config.oplock_break_timeout.as_millis() as i64;
        entry.lock().add_deferred(DeferredRequest { session_id, packet, expires_at: lease })?;

        match oplock {
            OpLockRef::Local(handle) => {
                if !handle.break_in_progress() {
                    if self.config.has_debug(DebugFlags::OPLOCK) {
                        debug!(path = %norm, "breaking local oplock");
                    }
                    handle.request_break().await?;
                }
                // Otherwise the break is already in flight and the new
                // deferral rides it.
            }
            OpLockRef::Remote(remote) if remote.owned_by(&self.node) => {
                // The record names this node but no live handle backs it
                // (the session is gone); clear it cluster-wide and let the
                // deferred request go straight back out.
                warn!(path = %norm, "oplock record without a local handle; clearing");
                self.dispatcher
                    .dispatch(&norm, StateTask::ClearOpLock, TaskOptions::LOCK_STATE)
                    .await?;
                self.publisher.publish(
                    MessageTarget::AllNodes,
                    StateMessage::OpLockBreakNotify { path: norm.clone() },
                );
                self.settle_local_oplock(&norm, false);
                return Ok(());
            }
            OpLockRef::Remote(remote) => {
                if self.config.has_debug(DebugFlags::OPLOCK) {
                    debug!(path = %norm, owner = %remote.owner, "requesting remote oplock break");
                }
                self.publisher.publish(
                    MessageTarget::Node(remote.owner.clone()),
                    StateMessage::OpLockBreakRequest {
                        path: norm.clone(),
                        owner: Some(remote.owner),
                    },
                );
            }
        }

        self.start_break_timer(&norm);
        Ok(())
    }

    /// A sibling asked this node to break its oplock.
    pub(crate) async fn handle_break_request(self: &Arc<Self>, path: &str) {
        let handle = self.per_node.get(path).and_then(|entry| entry.lock().oplock.clone());
        match handle {
            Some(handle) if !handle.break_in_progress() => {
                if self.config.has_debug(DebugFlags::OPLOCK) {
                    debug!(path, "breaking local oplock on remote request");
                }
                if let Err(error) = handle.request_break().await {
                    warn!(path, %error, "oplock break request failed");
                }
            }
            Some(_) => {}
            None => {
                // The cluster thinks this node holds an oplock it no
                // longer has; clear the record so the requester unblocks.
                warn!(path, "break requested for an oplock with no local handle");
                if let Err(error) = self
                    .dispatcher
                    .dispatch(path, StateTask::ClearOpLock, TaskOptions::LOCK_STATE)
                    .await
                {
                    warn!(path, %error, "failed to clear orphaned oplock");
                    return;
                }
                self.publisher.publish(
                    MessageTarget::AllNodes,
                    StateMessage::OpLockBreakNotify { path: path.to_string() },
                );
            }
        }
    }

    /// A break-notify arrived: the oplock is gone everywhere.
    pub(crate) fn handle_break_settled(&self, path: &str) {
        if let Some(near) = &self.near {
            near.remove(path);
        }
        self.settle_local_oplock(path, false);
    }

    /// A type-change arrived: replicas are stale, deferred requests may
    /// resume, but any local handle stays with its session.
    pub(crate) fn handle_type_change(&self, path: &str) {
        if let Some(near) = &self.near {
            near.remove(path);
        }
        self.requeue_deferred(path);
        self.hosts.oplock_manager.cancel_break_timer(path);
    }

    /// Drops the local handle and break timer for a path, requeues its
    /// deferred requests, and optionally announces a break that was in
    /// progress.
    pub(crate) fn settle_local_oplock(&self, path: &str, publish_if_breaking: bool) {
        let Some(entry) = self.per_node.get(path) else {
            self.hosts.oplock_manager.cancel_break_timer(path);
            return;
        };
        let (handle, deferred) = {
            let mut data = entry.lock();
            data.cancel_break_timer();
            (data.oplock.take(), data.take_deferred())
        };
        self.hosts.oplock_manager.cancel_break_timer(path);
        let was_breaking = handle.is_some_and(|h| h.break_in_progress());
        for request in deferred {
            self.hosts.thread_pool.requeue_request(path, request);
        }
        if was_breaking && publish_if_breaking {
            self.publisher.publish(
                MessageTarget::AllNodes,
                StateMessage::OpLockBreakNotify { path: path.to_string() },
            );
        }
    }

    /// Requeues deferred requests without touching the oplock handle.
    fn requeue_deferred(&self, path: &str) {
        if let Some(entry) = self.per_node.get(path) {
            let deferred = {
                let mut data = entry.lock();
                data.cancel_break_timer();
                data.take_deferred()
            };
            for request in deferred {
                self.hosts.thread_pool.requeue_request(path, request);
            }
        }
    }

    /// Arms (or re-arms) the break timer for a path.
    fn start_break_timer(self: &Arc<Self>, path: &str) {
        let entry = self.per_node.get_or_create(path);
        let inner = self.clone();
        let timer_path = path.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(inner.config.oplock_break_timeout).await;
            inner.break_timed_out(&timer_path);
        });
        let mut data = entry.lock();
        data.cancel_break_timer();
        data.break_timer = Some(timer);
    }

    /// The break wait ran out; every deferred request fails.
    fn break_timed_out(&self, path: &str) {
        let Some(entry) = self.per_node.get(path) else {
            return;
        };
        let deferred = {
            let mut data = entry.lock();
            data.break_timer = None;
            data.take_deferred()
        };
        if deferred.is_empty() {
            return;
        }
        warn!(path, failed = deferred.len(), "oplock break timed out");
        for request in deferred {
            self.hosts.thread_pool.fail_request(
                path,
                request,
                StateError::OplockBreakTimeout(path.to_string()),
            );
        }
    }
}

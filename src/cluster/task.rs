//! The remote-task runtime: typed operations executed on a key's owner.
//!
//! Every mutation of a file state is expressed as a [`StateTask`] shipped
//! to the node owning the routing key's partition. The task body runs
//! there against the authoritative record, normally with the per-key lock
//! held, and its typed [`TaskReply`] travels back through a oneshot the
//! dispatching thread awaits. Dispatch is deliberately synchronous from
//! the caller's point of view: one protocol request thread blocks on one
//! task, which keeps the semantics easy to reason about.
//!
//! A dispatch that fails in a retriable way (no members yet, owner's
//! executor gone, reply channel torn down mid-flight) is retried once
//! transparently before the error surfaces.

use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::cluster::map::StateMap;
use crate::cluster::{ClusterFabric, NodeId};
use crate::error::{StateError, StateResult};
use crate::state::access::{AccessGrant, OpenParams, ReleaseOutcome, TokenInfo};
use crate::state::byte_lock::ByteRangeLock;
use crate::state::oplock::{OpLockType, RemoteOpLock};
use crate::state::update::{StateUpdateValues, UpdateMask};
use crate::state::{now_millis, FileState, FileStatus, StatusChangeReason};

/// Version tag carried by every task envelope.
pub const TASK_WIRE_VERSION: u8 = 1;

bitflags! {
    /// Execution options of one task.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskOptions: u8 {
        /// Take the per-key lock before loading, release after storing.
        const LOCK_STATE = 0x01;
        /// Skip the write-back; the task manages the map itself.
        const NO_UPDATE  = 0x02;
        /// Detail logging for this task.
        const DEBUG      = 0x04;
        /// Report elapsed and lock-wait time.
        const TIMING     = 0x08;
    }
}

/// The typed operations the cache ships to partition owners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StateTask {
    /// Grant file access under the SMB open rules, creating the state when
    /// absent.
    GrantAccess {
        /// Open request parameters.
        params: OpenParams,
        /// Status for a lazily created state.
        initial_status: FileStatus,
    },
    /// Release a previous grant.
    ReleaseAccess {
        /// Token core identifying the grant.
        token: TokenInfo,
    },
    /// Install an oplock record.
    AddOpLock {
        /// The replicated oplock to install.
        oplock: RemoteOpLock,
    },
    /// Remove the oplock record unconditionally.
    ClearOpLock,
    /// Downgrade the oplock type.
    ChangeOpLockType {
        /// Requested new type.
        new_type: OpLockType,
    },
    /// Remove one owner from the oplock.
    RemoveOpLockOwner {
        /// Owner node to remove.
        owner: NodeId,
    },
    /// Add a byte-range lock.
    AddByteLock {
        /// Lock to add.
        lock: ByteRangeLock,
    },
    /// Remove a byte-range lock by exact match.
    RemoveByteLock {
        /// Lock to remove.
        lock: ByteRangeLock,
    },
    /// Find the first lock overlapping a range.
    TestByteLock {
        /// Range start.
        offset: u64,
        /// Range length.
        length: u64,
    },
    /// Check whether a range may be read or written.
    CheckByteAccess {
        /// Range start.
        offset: u64,
        /// Range length.
        length: u64,
        /// Lock owner handle of the caller.
        owner_id: i64,
        /// Node the caller's session is connected to.
        node: NodeId,
        /// True for a write check.
        write: bool,
    },
    /// Set the file existence status.
    UpdateFileStatus {
        /// New status.
        status: FileStatus,
        /// Reason for the change.
        reason: StatusChangeReason,
    },
    /// Apply a coalesced batch of low-priority updates.
    ApplyUpdates {
        /// Fields present in the batch.
        mask: UpdateMask,
        /// Batched values.
        values: StateUpdateValues,
    },
    /// Claim or release the file-data-update marker.
    FileDataUpdate {
        /// Node making the claim.
        node: NodeId,
        /// True to start an update, false to complete one.
        start: bool,
    },
    /// Rekey the record to a new path. Runs with `NO_UPDATE`; the body
    /// removes the old key and stores under the new one itself.
    Rename {
        /// Normalized destination path.
        new_path: String,
        /// True when a folder is being renamed.
        is_folder: bool,
    },
}

impl StateTask {
    /// Short name for logging.
    fn name(&self) -> &'static str {
        match self {
            StateTask::GrantAccess { .. } => "GrantAccess",
            StateTask::ReleaseAccess { .. } => "ReleaseAccess",
            StateTask::AddOpLock { .. } => "AddOpLock",
            StateTask::ClearOpLock => "ClearOpLock",
            StateTask::ChangeOpLockType { .. } => "ChangeOpLockType",
            StateTask::RemoveOpLockOwner { .. } => "RemoveOpLockOwner",
            StateTask::AddByteLock { .. } => "AddByteLock",
            StateTask::RemoveByteLock { .. } => "RemoveByteLock",
            StateTask::TestByteLock { .. } => "TestByteLock",
            StateTask::CheckByteAccess { .. } => "CheckByteAccess",
            StateTask::UpdateFileStatus { .. } => "UpdateFileStatus",
            StateTask::ApplyUpdates { .. } => "ApplyUpdates",
            StateTask::FileDataUpdate { .. } => "FileDataUpdate",
            StateTask::Rename { .. } => "Rename",
        }
    }
}

/// Typed result of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskReply {
    /// GrantAccess result.
    Access(Box<AccessGrant>),
    /// ReleaseAccess result.
    Released(ReleaseOutcome),
    /// Boolean result (AddOpLock, UpdateFileStatus, FileDataUpdate,
    /// CheckByteAccess, Rename).
    Flag(bool),
    /// No payload (ClearOpLock).
    Unit,
    /// ChangeOpLockType result; `None` marks an invalid transition.
    NewOpLockType(Option<OpLockType>),
    /// Updated record (RemoveOpLockOwner, AddByteLock, RemoveByteLock).
    State(Box<FileState>),
    /// TestByteLock result.
    MatchingLock(Option<ByteRangeLock>),
}

/// A task envelope as it travels to the owner node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Wire version, [`TASK_WIRE_VERSION`].
    pub version: u8,
    /// Fabric-unique task id; doubles as the key-lock holder id.
    pub id: u64,
    /// Routing key: the normalized path.
    pub key: String,
    /// Dispatching node.
    pub from: NodeId,
    /// Execution options.
    pub options: TaskOptions,
    /// The operation itself.
    pub task: StateTask,
}

/// An envelope paired with its reply channel; the in-process transport
/// moves this to the owner's executor.
pub(crate) struct DispatchedTask {
    pub envelope: TaskEnvelope,
    pub reply: oneshot::Sender<StateResult<TaskReply>>,
}

/// Dispatch handle used by a cache node to run tasks on key owners.
pub(crate) struct TaskDispatcher {
    fabric: Arc<ClusterFabric>,
    node: NodeId,
    debug: bool,
    /// Options stamped onto every envelope this node dispatches, on top of
    /// the per-call ones; carries the configured debug/timing flags.
    default_options: TaskOptions,
}

impl TaskDispatcher {
    pub fn new(
        fabric: Arc<ClusterFabric>,
        node: NodeId,
        debug: bool,
        timing: bool,
    ) -> TaskDispatcher {
        let mut default_options = TaskOptions::empty();
        if debug {
            default_options |= TaskOptions::DEBUG;
        }
        if timing {
            default_options |= TaskOptions::TIMING;
        }
        TaskDispatcher { fabric, node, debug, default_options }
    }

    /// Ships a task to the owner of `key` and waits for its reply.
    ///
    /// Retries exactly once on a transient dispatch failure; everything
    /// else surfaces unchanged.
    pub async fn dispatch(
        &self,
        key: &str,
        task: StateTask,
        options: TaskOptions,
    ) -> StateResult<TaskReply> {
        let mut last_error = None;
        for attempt in 0..2 {
            let (reply, wait) = oneshot::channel();
            let envelope = TaskEnvelope {
                version: TASK_WIRE_VERSION,
                id: self.fabric.next_task_id(),
                key: key.to_string(),
                from: self.node.clone(),
                options: options | self.default_options,
                task: task.clone(),
            };
            if self.debug {
                debug!(
                    task = task.name(),
                    key,
                    id = envelope.id,
                    attempt,
                    "dispatching remote task"
                );
            }
            match self.fabric.send_task(DispatchedTask { envelope, reply }) {
                Ok(()) => match wait.await {
                    Ok(Err(error)) if error.is_transient() && attempt == 0 => {
                        last_error = Some(error);
                    }
                    Ok(result) => return result,
                    Err(_) => {
                        last_error = Some(StateError::ClusterTransient(
                            "task reply channel closed".to_string(),
                        ));
                    }
                },
                Err(error) if error.is_transient() && attempt == 0 => {
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(last_error
            .unwrap_or_else(|| StateError::ClusterTransient("task dispatch failed".to_string())))
    }
}

/// Per-node executor that runs tasks addressed to this node.
pub(crate) struct TaskExecutor {
    map: Arc<StateMap>,
    node: NodeId,
    state_expiry_millis: i64,
    debug: bool,
    timing: bool,
}

impl TaskExecutor {
    pub fn new(
        map: Arc<StateMap>,
        node: NodeId,
        state_expiry_millis: i64,
        debug: bool,
        timing: bool,
    ) -> Arc<TaskExecutor> {
        Arc::new(TaskExecutor { map, node, state_expiry_millis, debug, timing })
    }

    /// Starts the executor loop draining `tasks`.
    ///
    /// Each task runs on its own tokio task so a body waiting on a key
    /// lock never stalls tasks for other keys; per-key ordering comes from
    /// the lock's FIFO handoff.
    pub fn spawn(
        self: &Arc<TaskExecutor>,
        mut tasks: mpsc::UnboundedReceiver<DispatchedTask>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            while let Some(task) = tasks.recv().await {
                let executor = executor.clone();
                tokio::spawn(async move {
                    let reply = executor.run(&task.envelope).await;
                    // A dropped receiver means the caller gave up; the work
                    // is already committed either way.
                    let _ = task.reply.send(reply);
                });
            }
            trace!("task executor finished");
        })
    }

    async fn run(&self, envelope: &TaskEnvelope) -> StateResult<TaskReply> {
        let started = Instant::now();
        let locked = envelope.options.contains(TaskOptions::LOCK_STATE);
        if locked {
            self.map.lock(&envelope.key, envelope.id, &self.node).await;
        }
        let lock_wait = started.elapsed();

        let result = self.execute(envelope);

        if locked {
            self.map.unlock(&envelope.key, envelope.id);
        }
        if self.timing || envelope.options.contains(TaskOptions::TIMING) {
            debug!(
                task = envelope.task.name(),
                key = %envelope.key,
                id = envelope.id,
                elapsed_us = started.elapsed().as_micros() as u64,
                lock_wait_us = lock_wait.as_micros() as u64,
                "task timing"
            );
        }
        result
    }

    fn execute(&self, envelope: &TaskEnvelope) -> StateResult<TaskReply> {
        if self.debug || envelope.options.contains(TaskOptions::DEBUG) {
            debug!(
                task = envelope.task.name(),
                key = %envelope.key,
                from = %envelope.from,
                "executing remote task"
            );
        }

        // Rename manages the map itself: remove under the old key, store
        // under the new one.
        if let StateTask::Rename { new_path, is_folder } = &envelope.task {
            let Some(mut state) = self.map.remove(&envelope.key) else {
                return Ok(TaskReply::Flag(false));
            };
            state.apply_rename(new_path, *is_folder);
            state.set_valid(true);
            self.map.put(new_path, state);
            return Ok(TaskReply::Flag(true));
        }

        // Load the record, creating it lazily; a record nothing ends up
        // pinning simply expires later.
        let mut state = self.map.get(&envelope.key).unwrap_or_else(|| {
            let status = match &envelope.task {
                StateTask::GrantAccess { initial_status, .. } => *initial_status,
                _ => FileStatus::Unknown,
            };
            FileState::new(&envelope.key, status)
        });

        let reply = Self::apply(&envelope.task, &mut state)?;

        state.bump_expiry(now_millis(), self.state_expiry_millis);
        state.set_valid(true);
        if !envelope.options.contains(TaskOptions::NO_UPDATE) {
            self.map.put(&envelope.key, state);
        }
        Ok(reply)
    }

    /// The task bodies proper: pure mutations of the loaded record.
    fn apply(task: &StateTask, state: &mut FileState) -> StateResult<TaskReply> {
        match task {
            StateTask::GrantAccess { params, .. } => {
                let grant = state.grant_file_access(params)?;
                Ok(TaskReply::Access(Box::new(grant)))
            }
            StateTask::ReleaseAccess { token } => {
                Ok(TaskReply::Released(state.release_file_access(token)))
            }
            StateTask::AddOpLock { oplock } => {
                state.set_oplock(oplock.clone())?;
                Ok(TaskReply::Flag(true))
            }
            StateTask::ClearOpLock => {
                state.clear_oplock();
                Ok(TaskReply::Unit)
            }
            StateTask::ChangeOpLockType { new_type } => {
                Ok(TaskReply::NewOpLockType(state.change_oplock_type(*new_type)))
            }
            StateTask::RemoveOpLockOwner { owner } => {
                state.remove_oplock_owner(owner);
                Ok(TaskReply::State(Box::new(state.clone())))
            }
            StateTask::AddByteLock { lock } => {
                state.add_byte_lock(lock.clone())?;
                Ok(TaskReply::State(Box::new(state.clone())))
            }
            StateTask::RemoveByteLock { lock } => {
                state.remove_byte_lock(lock)?;
                Ok(TaskReply::State(Box::new(state.clone())))
            }
            StateTask::TestByteLock { offset, length } => {
                Ok(TaskReply::MatchingLock(state.test_byte_lock(*offset, *length)))
            }
            StateTask::CheckByteAccess { offset, length, owner_id, node, write } => {
                Ok(TaskReply::Flag(state.can_access_range(
                    *offset, *length, node, *owner_id, *write,
                )))
            }
            StateTask::UpdateFileStatus { status, reason } => {
                Ok(TaskReply::Flag(state.set_file_status(*status, *reason)))
            }
            StateTask::ApplyUpdates { mask, values } => {
                Ok(TaskReply::Flag(state.apply_update(*mask, values)))
            }
            StateTask::FileDataUpdate { node, start } => {
                let accepted = if *start {
                    state.start_data_update(node)
                } else {
                    state.complete_data_update(node)
                };
                Ok(TaskReply::Flag(accepted))
            }
            StateTask::Rename { .. } => unreachable!("rename handled before load"),
        }
    }
}

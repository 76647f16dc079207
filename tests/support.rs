#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cluster_filestate::config::ClusterConfig;
use cluster_filestate::error::{StateError, StateResult};
use cluster_filestate::host::{
    DeferredRequest, FileStateListener, LocalOpLock, NotifyChangeHandler, OpLockManager,
    ThreadPool,
};
use cluster_filestate::state::oplock::OpLockType;
use cluster_filestate::state::{FileState, StatusChangeReason};
use cluster_filestate::{CacheHosts, ClusterFabric, ClusterFileStateCache};

/// Records break-timer cancellations.
#[derive(Default)]
pub struct RecordingOpLockManager {
    pub cancelled: Mutex<Vec<String>>,
}

impl OpLockManager for RecordingOpLockManager {
    fn cancel_break_timer(&self, path: &str) {
        self.cancelled.lock().expect("cancelled list").push(path.to_string());
    }
}

/// Records change notifications and renames.
#[derive(Default)]
pub struct RecordingNotifyHandler {
    pub changes: Mutex<Vec<(StatusChangeReason, String)>>,
    pub renames: Mutex<Vec<(String, String)>>,
}

impl NotifyChangeHandler for RecordingNotifyHandler {
    fn notify_file_changed(&self, reason: StatusChangeReason, path: &str) {
        self.changes.lock().expect("changes list").push((reason, path.to_string()));
    }

    fn notify_rename(&self, old_path: &str, new_path: &str) {
        self.renames
            .lock()
            .expect("renames list")
            .push((old_path.to_string(), new_path.to_string()));
    }
}

/// Records requeued and failed deferred requests.
#[derive(Default)]
pub struct RecordingThreadPool {
    pub requeued: Mutex<Vec<(String, DeferredRequest)>>,
    pub failed: Mutex<Vec<(String, DeferredRequest, StateError)>>,
}

impl ThreadPool for RecordingThreadPool {
    fn requeue_request(&self, path: &str, request: DeferredRequest) {
        self.requeued.lock().expect("requeued list").push((path.to_string(), request));
    }

    fn fail_request(&self, path: &str, request: DeferredRequest, error: StateError) {
        self.failed.lock().expect("failed list").push((path.to_string(), request, error));
    }
}

/// A scriptable local oplock handle.
pub struct TestOpLock {
    typ: OpLockType,
    break_requested: AtomicBool,
    breaking: AtomicBool,
}

impl TestOpLock {
    pub fn new(typ: OpLockType) -> Arc<TestOpLock> {
        Arc::new(TestOpLock {
            typ,
            break_requested: AtomicBool::new(false),
            breaking: AtomicBool::new(false),
        })
    }

    pub fn break_requested(&self) -> bool {
        self.break_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalOpLock for TestOpLock {
    fn lock_type(&self) -> OpLockType {
        self.typ
    }

    async fn request_break(&self) -> StateResult<()> {
        self.break_requested.store(true, Ordering::SeqCst);
        self.breaking.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn break_in_progress(&self) -> bool {
        self.breaking.load(Ordering::SeqCst)
    }
}

/// A state listener that can veto expiry and records events.
#[derive(Default)]
pub struct RecordingStateListener {
    pub veto_expiry: AtomicBool,
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub expired_asked: Mutex<Vec<String>>,
    pub renamed: Mutex<Vec<(String, String)>>,
}

impl FileStateListener for RecordingStateListener {
    fn file_state_created(&self, state: &FileState) {
        self.created.lock().expect("created list").push(state.path().to_string());
    }

    fn file_state_removed(&self, state: &FileState) {
        self.removed.lock().expect("removed list").push(state.path().to_string());
    }

    fn file_state_renamed(&self, old_path: &str, new_path: &str) {
        self.renamed
            .lock()
            .expect("renamed list")
            .push((old_path.to_string(), new_path.to_string()));
    }

    fn file_state_expired(&self, state: &FileState) -> bool {
        self.expired_asked.lock().expect("expired list").push(state.path().to_string());
        !self.veto_expiry.load(Ordering::SeqCst)
    }
}

/// One started cache node plus its recording collaborators.
pub struct TestNode {
    pub cache: ClusterFileStateCache,
    pub oplock_manager: Arc<RecordingOpLockManager>,
    pub notify: Arc<RecordingNotifyHandler>,
    pub pool: Arc<RecordingThreadPool>,
}

/// Default configuration for test clusters.
pub fn test_config() -> ClusterConfig {
    ClusterConfig::new("testcluster", "testtopic").expect("test config")
}

/// Builds and starts a node on the given fabric.
pub fn start_node(fabric: &Arc<ClusterFabric>, name: &str) -> TestNode {
    start_node_with(fabric, name, test_config())
}

/// Builds and starts a node with a custom configuration.
pub fn start_node_with(
    fabric: &Arc<ClusterFabric>,
    name: &str,
    config: ClusterConfig,
) -> TestNode {
    let oplock_manager = Arc::new(RecordingOpLockManager::default());
    let notify = Arc::new(RecordingNotifyHandler::default());
    let pool = Arc::new(RecordingThreadPool::default());
    let cache = ClusterFileStateCache::new(
        config,
        name,
        fabric.clone(),
        CacheHosts {
            oplock_manager: oplock_manager.clone(),
            notify_handler: notify.clone(),
            thread_pool: pool.clone(),
        },
    );
    cache.start_cluster().expect("start cluster");
    TestNode { cache, oplock_manager, notify, pool }
}

/// Lets in-flight topic messages and spawned handlers drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

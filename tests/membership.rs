mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cluster_filestate::host::MembershipListener;
use cluster_filestate::state::access::{AccessMode, OpenParams, SharedAccess};
use cluster_filestate::state::byte_lock::ByteRangeLock;
use cluster_filestate::state::oplock::OpLockType;
use cluster_filestate::state::FileStatus;
use cluster_filestate::{ClusterFabric, NodeId};

#[derive(Default)]
struct RecordingMembership {
    joined: Mutex<Vec<String>>,
    left: Mutex<Vec<String>>,
}

impl MembershipListener for RecordingMembership {
    fn member_joined(&self, node: &str) {
        self.joined.lock().expect("joined list").push(node.to_string());
    }

    fn member_left(&self, node: &str) {
        self.left.lock().expect("left list").push(node.to_string());
    }
}

const PATH: &str = "\\SHARE\\HELD.TXT";

#[tokio::test]
async fn departed_member_leaves_no_locks_or_oplocks_behind() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");
    let membership = Arc::new(RecordingMembership::default());
    n1.cache.add_membership_listener(membership.clone());

    let n2 = support::start_node(&fabric, "N2");
    support::settle().await;
    assert_eq!(n1.cache.members(), vec!["N1".to_string(), "N2".to_string()]);

    // N2 opens with an exclusive oplock and holds a byte-range lock.
    let mut params = OpenParams::new(
        PATH,
        5,
        AccessMode::READ | AccessMode::WRITE,
        SharedAccess::READ,
    );
    params.requested_oplock = OpLockType::Exclusive;
    let token = n2
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open on n2");
    assert_eq!(token.granted_oplock(), OpLockType::Exclusive);
    n2.cache
        .add_byte_lock(PATH, ByteRangeLock::new(0, 64, NodeId::new("N2"), 5))
        .await
        .expect("lock on n2");

    let state = n1.cache.find_state(PATH).expect("state");
    assert_eq!(state.open_count(), 1);
    assert_eq!(state.oplock_type(), OpLockType::Exclusive);
    assert_eq!(state.byte_locks().len(), 1);

    // N2 goes away without releasing anything.
    std::mem::forget(token);
    n2.cache.shutdown_cluster();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(n1.cache.members(), vec!["N1".to_string()]);
    assert_eq!(membership.left.lock().expect("left list").as_slice(), &["N2".to_string()]);

    // The survivor's sweep scrubbed every trace of N2.
    let state = n1.cache.find_state(PATH).expect("state survives");
    assert_eq!(state.open_count(), 0);
    assert_eq!(state.oplock_type(), OpLockType::None);
    assert!(state.byte_locks().is_empty());
    assert_eq!(state.shared_access(), SharedAccess::all());
    assert!(state.primary_owner().is_none());
}

#[tokio::test]
async fn join_is_announced_to_existing_members() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");
    // Let the node's own join event drain before listening.
    support::settle().await;
    let membership = Arc::new(RecordingMembership::default());
    n1.cache.add_membership_listener(membership.clone());

    let _n2 = support::start_node(&fabric, "N2");
    support::settle().await;

    assert_eq!(
        membership.joined.lock().expect("joined list").as_slice(),
        &["N2".to_string()]
    );
}

#[tokio::test]
async fn duplicate_node_name_is_rejected() {
    let fabric = ClusterFabric::new("testcluster");
    let _n1 = support::start_node(&fabric, "N1");

    let config = support::test_config();
    let cache = cluster_filestate::ClusterFileStateCache::new(
        config,
        "N1",
        fabric.clone(),
        cluster_filestate::CacheHosts {
            oplock_manager: Arc::new(support::RecordingOpLockManager::default()),
            notify_handler: Arc::new(support::RecordingNotifyHandler::default()),
            thread_pool: Arc::new(support::RecordingThreadPool::default()),
        },
    );
    assert!(cache.start_cluster().is_err(), "same name must not join twice");
}

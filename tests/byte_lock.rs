mod support;

use cluster_filestate::error::StateError;
use cluster_filestate::state::access::{AccessMode, OpenParams, SharedAccess};
use cluster_filestate::state::byte_lock::ByteRangeLock;
use cluster_filestate::state::FileStatus;
use cluster_filestate::{ClusterFabric, NodeId};

const PATH: &str = "\\SHARE\\LOCKS.DAT";

fn lock(offset: u64, length: u64, node: &str, owner_id: i64) -> ByteRangeLock {
    ByteRangeLock::new(offset, length, NodeId::new(node), owner_id)
}

#[tokio::test]
async fn overlapping_lock_of_other_owner_conflicts() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");
    let n2 = support::start_node(&fabric, "N2");

    n1.cache.find_or_create_state(PATH, FileStatus::FileExists).expect("state");

    n1.cache.add_byte_lock(PATH, lock(0, 100, "N1", 7)).await.expect("first lock");

    let err = n2
        .cache
        .add_byte_lock(PATH, lock(50, 10, "N2", 7))
        .await
        .expect_err("cross-node overlap");
    match err {
        StateError::LockConflict { offset, length, .. } => {
            assert_eq!(offset, 50);
            assert_eq!(length, 10);
        }
        other => panic!("expected LockConflict, got {other:?}"),
    }

    // The same owner may re-lock inside its own region.
    n1.cache.add_byte_lock(PATH, lock(50, 10, "N1", 7)).await.expect("same-owner overlap");

    let state = n2.cache.find_state(PATH).expect("state present");
    assert_eq!(state.byte_locks().len(), 2);
}

#[tokio::test]
async fn remove_requires_exact_match() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");

    n1.cache.add_byte_lock(PATH, lock(10, 20, "N1", 5)).await.expect("add");

    let err = n1
        .cache
        .remove_byte_lock(PATH, lock(10, 21, "N1", 5))
        .await
        .expect_err("length mismatch");
    assert!(matches!(err, StateError::NotLocked { .. }), "unexpected error: {err:?}");

    n1.cache.remove_byte_lock(PATH, lock(10, 20, "N1", 5)).await.expect("remove");
    let err = n1
        .cache
        .remove_byte_lock(PATH, lock(10, 20, "N1", 5))
        .await
        .expect_err("already removed");
    assert!(matches!(err, StateError::NotLocked { .. }), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_byte_lock_returns_first_overlap() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");

    n1.cache.add_byte_lock(PATH, lock(0, 10, "N1", 1)).await.expect("add");
    n1.cache.add_byte_lock(PATH, lock(100, 50, "N1", 2)).await.expect("add");

    let found = n1.cache.test_byte_lock(PATH, 120, 5).await.expect("test");
    let found = found.expect("overlap expected");
    assert_eq!(found.offset, 100);
    assert_eq!(found.owner_id, 2);

    let none = n1.cache.test_byte_lock(PATH, 20, 50).await.expect("test");
    assert!(none.is_none());
}

#[tokio::test]
async fn read_write_checks_respect_lock_ownership() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");
    let n2 = support::start_node(&fabric, "N2");

    // Two openers, so the checks actually go to the cluster.
    let share = SharedAccess::READ | SharedAccess::WRITE;
    let token_1 = n1
        .cache
        .grant_file_access(
            OpenParams::new(PATH, 7, AccessMode::READ | AccessMode::WRITE, share),
            FileStatus::FileExists,
        )
        .await
        .expect("open n1");
    let token_2 = n2
        .cache
        .grant_file_access(
            OpenParams::new(PATH, 9, AccessMode::READ | AccessMode::WRITE, share),
            FileStatus::FileExists,
        )
        .await
        .expect("open n2");

    n1.cache.add_byte_lock(PATH, lock(0, 100, "N1", 7)).await.expect("lock");

    // The lock owner passes; everyone else is blocked on the range.
    assert!(n1.cache.can_write_file(PATH, 10, 10, 7).await.expect("owner write"));
    assert!(n1.cache.can_read_file(PATH, 10, 10, 7).await.expect("owner read"));
    assert!(!n2.cache.can_write_file(PATH, 10, 10, 7).await.expect("foreign write"));
    assert!(!n2.cache.can_read_file(PATH, 10, 10, 7).await.expect("foreign read"));

    // Outside the locked range everyone passes.
    assert!(n2.cache.can_write_file(PATH, 200, 10, 9).await.expect("unlocked range"));

    n2.cache.release_file_access(token_2).await.expect("release n2");
    n1.cache.release_file_access(token_1).await.expect("release n1");
}

#[tokio::test]
async fn single_opener_check_short_circuits_locally() {
    let fabric = ClusterFabric::new("testcluster");
    let n1 = support::start_node(&fabric, "N1");

    let token = n1
        .cache
        .grant_file_access(
            OpenParams::new(PATH, 7, AccessMode::WRITE, SharedAccess::empty()),
            FileStatus::FileExists,
        )
        .await
        .expect("open");
    n1.cache.add_byte_lock(PATH, lock(0, 100, "N1", 7)).await.expect("lock");

    // One opener means nobody to conflict with; even a foreign process id
    // passes without a cluster round-trip.
    assert!(n1.cache.can_write_file(PATH, 10, 10, 99).await.expect("short circuit"));

    n1.cache.release_file_access(token).await.expect("release");
}

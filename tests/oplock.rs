mod support;

use std::time::Duration;

use cluster_filestate::error::StateError;
use cluster_filestate::state::access::{AccessMode, OpenParams, SharedAccess};
use cluster_filestate::state::oplock::OpLockType;
use cluster_filestate::state::FileStatus;
use cluster_filestate::ClusterFabric;

use support::TestOpLock;

const PATH: &str = "C:\\DATA\\REPORT.DOC";

fn shared_open(process_id: i64) -> OpenParams {
    OpenParams::new(
        PATH,
        process_id,
        AccessMode::READ | AccessMode::WRITE,
        SharedAccess::READ | SharedAccess::WRITE,
    )
}

#[tokio::test]
async fn batch_oplock_granted_on_first_open() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Batch;
    let token = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open with oplock");
    assert_eq!(token.granted_oplock(), OpLockType::Batch);
    assert!(token.oplock_available());

    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::Batch);
    assert_eq!(state.oplock().map(|o| o.owner.as_str()), Some("NODEA"));

    a.cache.release_file_access(token).await.expect("release");

    // Releasing the last handle takes the oplock with it.
    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::None);
}

#[tokio::test]
async fn oplock_never_granted_to_directories() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Batch;
    params.directory = true;
    let token = a
        .cache
        .grant_file_access(params, FileStatus::DirectoryExists)
        .await
        .expect("open directory");
    assert_eq!(token.granted_oplock(), OpLockType::None);

    a.cache.release_file_access(token).await.expect("release");
}

#[tokio::test]
async fn second_opener_breaks_batch_oplock_and_deferred_request_resumes() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Batch;
    let token_a = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open with oplock");
    let handle = TestOpLock::new(OpLockType::Batch);
    assert!(a.cache.add_oplock(&token_a, handle.clone()).await.expect("attach handle"));

    // Second opener gets in (shares are compatible) but no oplock.
    let token_b = b
        .cache
        .grant_file_access(shared_open(20), FileStatus::FileExists)
        .await
        .expect("second open");
    assert!(!token_b.oplock_available());
    assert_eq!(
        token_b.existing_oplock().map(|o| o.typ),
        Some(OpLockType::Batch),
        "second opener must see the existing oplock"
    );

    // The host on B parks its request and asks for the break.
    b.cache
        .request_oplock_break(PATH, 77, vec![0xde, 0xad])
        .await
        .expect("defer request");
    support::settle().await;
    assert!(handle.break_requested(), "break must reach the owner's handle");

    // A's client acks by giving the oplock up.
    a.cache.clear_oplock(PATH).await.expect("clear oplock");
    support::settle().await;

    let requeued = b.pool.requeued.lock().expect("requeued list");
    assert_eq!(requeued.len(), 1, "deferred request must be requeued");
    assert_eq!(requeued[0].0, PATH);
    assert_eq!(requeued[0].1.session_id, 77);
    drop(requeued);

    let state = b.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::None);

    b.cache.release_file_access(token_b).await.expect("release b");
    a.cache.release_file_access(token_a).await.expect("release a");
}

#[tokio::test]
async fn add_oplock_fails_when_another_node_holds_one() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Exclusive;
    let token_a = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open with oplock");
    assert!(a
        .cache
        .add_oplock(&token_a, TestOpLock::new(OpLockType::Exclusive))
        .await
        .expect("attach"));

    let token_b = b
        .cache
        .grant_file_access(shared_open(20), FileStatus::FileExists)
        .await
        .expect("second open");
    let err = b
        .cache
        .add_oplock(&token_b, TestOpLock::new(OpLockType::Exclusive))
        .await
        .expect_err("existing oplock");
    assert!(matches!(err, StateError::ExistingOpLock(_)), "unexpected error: {err:?}");

    b.cache.release_file_access(token_b).await.expect("release b");
    a.cache.release_file_access(token_a).await.expect("release a");
}

#[tokio::test]
async fn level_ii_oplock_shares_owners() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let token_a = a
        .cache
        .grant_file_access(shared_open(10), FileStatus::FileExists)
        .await
        .expect("open a");
    let token_b = b
        .cache
        .grant_file_access(shared_open(20), FileStatus::FileExists)
        .await
        .expect("open b");

    assert!(a
        .cache
        .add_oplock(&token_a, TestOpLock::new(OpLockType::LevelII))
        .await
        .expect("level ii a"));
    assert!(b
        .cache
        .add_oplock(&token_b, TestOpLock::new(OpLockType::LevelII))
        .await
        .expect("level ii b"));

    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::LevelII);
    let owners = state.oplock().expect("oplock").level_ii_owners.clone();
    assert_eq!(owners.len(), 2);

    // Owners leave one by one; the record clears with the last one.
    a.cache.remove_oplock_owner(PATH).await.expect("remove a");
    let state = b.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::LevelII);
    assert_eq!(state.oplock().expect("oplock").level_ii_owners.len(), 1);

    b.cache.remove_oplock_owner(PATH).await.expect("remove b");
    let state = b.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::None);

    b.cache.release_file_access(token_b).await.expect("release b");
    a.cache.release_file_access(token_a).await.expect("release a");
}

#[tokio::test]
async fn change_oplock_type_downgrades_batch_to_level_ii() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Batch;
    let token = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open with oplock");

    let changed = a
        .cache
        .change_oplock_type(PATH, OpLockType::LevelII)
        .await
        .expect("change type");
    assert_eq!(changed, Some(OpLockType::LevelII));

    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.oplock_type(), OpLockType::LevelII);

    // Upgrades are not a type change.
    let invalid = a
        .cache
        .change_oplock_type(PATH, OpLockType::Batch)
        .await
        .expect("change attempt");
    assert_eq!(invalid, None);

    a.cache.release_file_access(token).await.expect("release");
}

#[tokio::test]
async fn break_timeout_fails_deferred_requests() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let mut config = support::test_config();
    config.oplock_break_timeout = Duration::from_millis(100);
    let b = support::start_node_with(&fabric, "NODEB", config);

    let mut params = shared_open(10);
    params.requested_oplock = OpLockType::Batch;
    let token_a = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("open with oplock");
    assert!(a
        .cache
        .add_oplock(&token_a, TestOpLock::new(OpLockType::Batch))
        .await
        .expect("attach"));

    b.cache
        .request_oplock_break(PATH, 9, vec![1])
        .await
        .expect("defer request");

    // The owner never acks; the break timer fires instead.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let failed = b.pool.failed.lock().expect("failed list");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].1.session_id, 9);
    assert!(
        matches!(failed[0].2, StateError::OplockBreakTimeout(_)),
        "unexpected error: {:?}",
        failed[0].2
    );
    drop(failed);
    assert!(b.pool.requeued.lock().expect("requeued list").is_empty());

    a.cache.release_file_access(token_a).await.expect("release");
}

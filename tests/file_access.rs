mod support;

use cluster_filestate::error::{SharingReason, StateError};
use cluster_filestate::state::access::{AccessMode, OpenAction, OpenParams, SharedAccess};
use cluster_filestate::state::oplock::OpLockType;
use cluster_filestate::state::FileStatus;
use cluster_filestate::ClusterFabric;

const PATH: &str = "C:\\FOO.TXT";

fn open_params(process_id: i64, access: AccessMode, share: SharedAccess) -> OpenParams {
    OpenParams::new(PATH, process_id, access, share)
}

#[tokio::test]
async fn write_denied_when_share_mode_disallows_write() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let token = a
        .cache
        .grant_file_access(
            open_params(10, AccessMode::WRITE, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect("first open");
    assert_eq!(token.open_count(), 1);
    assert_eq!(token.granted_oplock(), OpLockType::None);

    let err = b
        .cache
        .grant_file_access(
            open_params(20, AccessMode::WRITE, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect_err("second writer must be denied");
    match err {
        StateError::SharingViolation { reason } => {
            assert_eq!(reason, SharingReason::WriteDisallowed);
        }
        other => panic!("expected SharingViolation, got {other:?}"),
    }

    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.open_count(), 1);

    let count = a.cache.release_file_access(token).await.expect("release");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn first_opener_fields_survive_later_grants() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let token_a = a
        .cache
        .grant_file_access(
            open_params(10, AccessMode::READ, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect("first open");

    let token_b = b
        .cache
        .grant_file_access(
            open_params(20, AccessMode::READ, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect("compatible reader");
    assert_eq!(token_b.open_count(), 2);
    assert!(!token_b.oplock_available());

    // The sharing mode, owner node and process id stay with the first
    // opener.
    let state = b.cache.find_state(PATH).expect("state present");
    assert_eq!(state.shared_access(), SharedAccess::READ);
    assert_eq!(state.primary_owner().map(|n| n.as_str()), Some("NODEA"));
    assert_eq!(state.process_id(), 10);

    assert_eq!(b.cache.release_file_access(token_b).await.expect("release b"), 1);
    assert_eq!(a.cache.release_file_access(token_a).await.expect("release a"), 0);

    // Last close resets the opener bookkeeping to the permissive default.
    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.shared_access(), SharedAccess::all());
    assert!(state.primary_owner().is_none());
}

#[tokio::test]
async fn create_disposition_fails_on_open_file() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    let token = a
        .cache
        .grant_file_access(
            open_params(10, AccessMode::WRITE, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect("first open");

    let mut params = open_params(20, AccessMode::WRITE, SharedAccess::READ);
    params.open_action = OpenAction::Create;
    let err = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect_err("create on open file");
    assert!(matches!(err, StateError::FileExists(_)), "unexpected error: {err:?}");

    a.cache.release_file_access(token).await.expect("release");
}

#[tokio::test]
async fn same_process_reopen_bypasses_share_check() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    // Exclusive hold: no sharing allowed.
    let token = a
        .cache
        .grant_file_access(
            open_params(10, AccessMode::WRITE, SharedAccess::empty()),
            FileStatus::FileExists,
        )
        .await
        .expect("exclusive open");

    // Same node, same process, same impersonation: allowed regardless.
    let token2 = a
        .cache
        .grant_file_access(
            open_params(10, AccessMode::WRITE, SharedAccess::empty()),
            FileStatus::FileExists,
        )
        .await
        .expect("same-process reopen");
    assert_eq!(token2.open_count(), 2);

    // A different process hits the exclusive hold.
    let err = a
        .cache
        .grant_file_access(
            open_params(11, AccessMode::READ, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect_err("different process");
    match err {
        StateError::SharingViolation { reason } => assert_eq!(reason, SharingReason::Exclusive),
        other => panic!("expected SharingViolation, got {other:?}"),
    }

    a.cache.release_file_access(token2).await.expect("release 2");
    a.cache.release_file_access(token).await.expect("release 1");
}

#[tokio::test]
async fn attributes_only_access_does_not_count_as_open() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    let mut params = open_params(10, AccessMode::READ, SharedAccess::empty());
    params.attributes_only = true;
    let token = a
        .cache
        .grant_file_access(params, FileStatus::FileExists)
        .await
        .expect("attributes-only open");
    assert!(token.attributes_only());
    assert_eq!(token.open_count(), 0);

    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.open_count(), 0);

    // Attributes-only release leaves the count alone as well.
    let count = a.cache.release_file_access(token).await.expect("release");
    assert_eq!(count, 0);
}

#[tokio::test]
async fn open_counts_balance_across_nodes() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    let share = SharedAccess::READ | SharedAccess::WRITE;
    let mut tokens = Vec::new();
    for pid in 0..4i64 {
        let node = if pid % 2 == 0 { &a } else { &b };
        tokens.push(
            node.cache
                .grant_file_access(
                    open_params(pid, AccessMode::READ, share),
                    FileStatus::FileExists,
                )
                .await
                .expect("open"),
        );
    }
    let state = a.cache.find_state(PATH).expect("state present");
    assert_eq!(state.open_count(), 4);

    let mut remaining = 4;
    for (index, token) in tokens.into_iter().enumerate() {
        let node = if index % 2 == 0 { &a } else { &b };
        remaining -= 1;
        let count = node.cache.release_file_access(token).await.expect("release");
        assert_eq!(count, remaining);
    }
}

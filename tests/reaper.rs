mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cluster_filestate::state::access::{AccessMode, OpenParams, SharedAccess};
use cluster_filestate::state::FileStatus;
use cluster_filestate::ClusterFabric;

use support::RecordingStateListener;

const PATH: &str = "\\TMP\\IDLE.TXT";

fn fast_expiry_config() -> cluster_filestate::config::ClusterConfig {
    let mut config = support::test_config();
    config.state_expiry = Duration::from_millis(150);
    config.reaper_interval = Duration::from_millis(100);
    config
}

#[tokio::test]
async fn open_state_survives_expiry() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node_with(&fabric, "NODEA", fast_expiry_config());

    let token = a
        .cache
        .grant_file_access(
            OpenParams::new(PATH, 5, AccessMode::READ, SharedAccess::READ),
            FileStatus::FileExists,
        )
        .await
        .expect("open");

    // Well past the expiry window and several reaper cycles.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(
        a.cache.find_state(PATH).is_some(),
        "an open state must never be reaped"
    );

    a.cache.release_file_access(token).await.expect("release");
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(
        a.cache.find_state(PATH).is_none(),
        "a closed idle state must expire"
    );
}

#[tokio::test]
async fn listener_can_veto_expiry() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node_with(&fabric, "NODEA", fast_expiry_config());
    let listener = Arc::new(RecordingStateListener::default());
    listener.veto_expiry.store(true, Ordering::SeqCst);
    a.cache.set_state_listener(listener.clone());

    a.cache.find_or_create_state(PATH, FileStatus::FileExists).expect("state");

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(a.cache.find_state(PATH).is_some(), "vetoed state must stay");
    assert!(
        !listener.expired_asked.lock().expect("expired list").is_empty(),
        "the listener must have been consulted"
    );

    listener.veto_expiry.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(a.cache.find_state(PATH).is_none(), "state expires once the veto lifts");
}

#[tokio::test]
async fn byte_locks_pin_a_state() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node_with(&fabric, "NODEA", fast_expiry_config());

    a.cache
        .add_byte_lock(
            PATH,
            cluster_filestate::state::byte_lock::ByteRangeLock::new(
                0,
                10,
                cluster_filestate::NodeId::new("NODEA"),
                5,
            ),
        )
        .await
        .expect("lock");

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(
        a.cache.find_state(PATH).is_some(),
        "a locked state must never be reaped"
    );
}

#[tokio::test]
async fn stale_near_cache_entries_are_swept() {
    let fabric = ClusterFabric::new("testcluster");
    let mut config = fast_expiry_config();
    config.near_cache_timeout = Duration::from_millis(200);
    let a = support::start_node_with(&fabric, "NODEA", config);

    a.cache.find_or_create_state(PATH, FileStatus::FileExists).expect("state");
    let admitted = a.cache.near_cache_stats().expect("stats");
    assert_eq!(admitted.entries, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = a.cache.near_cache_stats().expect("stats");
    assert_eq!(stats.entries, 0, "stale replica must be swept");
    assert!(stats.evictions >= 1);
}

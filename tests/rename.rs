mod support;

use cluster_filestate::state::{FileStatus, UNKNOWN_FILE_ID};
use cluster_filestate::ClusterFabric;

#[tokio::test]
async fn file_rename_rekeys_the_state() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");

    a.cache.find_or_create_state("\\DIR\\OLD.TXT", FileStatus::FileExists).expect("state");
    a.cache
        .rename_state("\\DIR\\OLD.TXT", "\\DIR\\NEW.TXT", false)
        .await
        .expect("rename");
    support::settle().await;

    assert!(a.cache.find_state("\\DIR\\OLD.TXT").is_none());
    let state = a.cache.find_state("\\DIR\\NEW.TXT").expect("renamed state");
    assert_eq!(state.path(), "\\DIR\\NEW.TXT");
    assert_eq!(state.file_status(), FileStatus::FileExists);
    assert_eq!(state.file_id(), UNKNOWN_FILE_ID);
}

#[tokio::test]
async fn folder_rename_sweeps_the_subtree_on_every_node() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    a.cache.find_or_create_state("\\FOO\\A.TXT", FileStatus::FileExists).expect("state");
    b.cache
        .find_or_create_state("\\FOO\\BAR\\B.TXT", FileStatus::FileExists)
        .expect("state");
    // A state outside the subtree must not move.
    a.cache.find_or_create_state("\\FOOD.TXT", FileStatus::FileExists).expect("state");

    a.cache.rename_state("\\FOO", "\\BAZ", true).await.expect("rename folder");
    support::settle().await;

    assert!(a.cache.find_state("\\FOO\\A.TXT").is_none());
    assert!(b.cache.find_state("\\FOO\\BAR\\B.TXT").is_none());

    let moved_a = b.cache.find_state("\\BAZ\\A.TXT").expect("moved state");
    assert_eq!(moved_a.file_id(), UNKNOWN_FILE_ID);
    assert_eq!(moved_a.file_status(), FileStatus::FileExists);
    let moved_b = a.cache.find_state("\\BAZ\\BAR\\B.TXT").expect("moved nested state");
    assert_eq!(moved_b.path(), "\\BAZ\\BAR\\B.TXT");

    // The folder itself resolves at its new path.
    let folder = a.cache.find_state("\\BAZ").expect("folder state");
    assert_eq!(folder.file_status(), FileStatus::DirectoryExists);

    // Prefix match is by whole components.
    assert!(a.cache.find_state("\\FOOD.TXT").is_some());
}

#[tokio::test]
async fn rename_rewrites_sibling_side_tables_and_notifies() {
    let fabric = ClusterFabric::new("testcluster");
    let a = support::start_node(&fabric, "NODEA");
    let b = support::start_node(&fabric, "NODEB");

    b.cache.find_or_create_state("\\FOO\\A.TXT", FileStatus::FileExists).expect("state");
    b.cache.add_attribute("\\FOO\\A.TXT", "DBFileId", vec![1, 2, 3]);

    a.cache.rename_state("\\FOO", "\\BAZ", true).await.expect("rename folder");
    support::settle().await;

    // The sibling learned about the rename through the topic.
    let renames = b.notify.renames.lock().expect("renames");
    assert_eq!(renames.as_slice(), &[("\\FOO".to_string(), "\\BAZ".to_string())]);
    drop(renames);

    // Local attribute copies described the old object and are gone.
    assert!(b.cache.fetch_attribute("\\BAZ\\A.TXT", "DBFileId").is_none());
    assert!(b.cache.fetch_attribute("\\FOO\\A.TXT", "DBFileId").is_none());

    // The publisher does not notify itself.
    assert!(a.notify.renames.lock().expect("renames").is_empty());
}

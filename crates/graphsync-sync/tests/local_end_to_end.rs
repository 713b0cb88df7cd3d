//! End-to-end passes over a real directory through the throttled local lister

mod common;

use std::path::Path;
use std::sync::Arc;

use graphsync_core::config::SyncConfig;
use graphsync_core::domain::{ConnectorName, ContainerRef, ExternalId, Principal};
use graphsync_core::ports::IGraphSyncStore;
use graphsync_connector::{
    AdaptiveRateLimiter, LocalDirectoryLister, RetryPolicy, ThrottledLister, LOCAL_CONNECTOR,
};
use graphsync_sync::ReconciliationEngine;
use tempfile::TempDir;

use common::sqlite_store;

fn local_container() -> ContainerRef {
    ContainerRef::parse("acme", LOCAL_CONNECTOR, "share").unwrap()
}

fn local_engine(root: &Path, store: Arc<dyn IGraphSyncStore>) -> ReconciliationEngine {
    let lister = LocalDirectoryLister::new(ConnectorName::new(LOCAL_CONNECTOR).unwrap())
        .with_root(local_container(), root)
        .with_user(Principal::new("alice", None));
    let throttled = ThrottledLister::new(
        Arc::new(lister),
        Arc::new(AdaptiveRateLimiter::with_defaults()),
        RetryPolicy::none(),
    );
    ReconciliationEngine::new(Arc::new(throttled), store, &SyncConfig::default())
}

#[tokio::test]
async fn test_rename_on_disk_keeps_record_identity() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("a.pdf"), b"%PDF-1.7 quarterly numbers").unwrap();
    std::fs::write(dir.path().join("b.csv"), b"id,total\n1,42\n").unwrap();

    let store = sqlite_store().await;
    let engine = local_engine(dir.path(), store.clone());
    let container = local_container();

    let full = engine.run_full_sync(&container).await.unwrap();
    assert_eq!(full.counters.created, 2);

    let group = store.get_record_group(&container).await.unwrap().unwrap();
    assert_eq!(group.name(), dir.path().file_name().unwrap().to_str().unwrap());

    let original = store
        .get_record_by_external_id(&container, &ExternalId::new("a.pdf").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.version(), 1);
    assert_eq!(original.path(), "/a.pdf");
    assert_eq!(original.mime_type(), Some("application/pdf"));

    std::fs::rename(dir.path().join("a.pdf"), dir.path().join("a_renamed.pdf")).unwrap();
    let incremental = engine.run_incremental_sync(&container, None).await.unwrap();

    assert_eq!(incremental.counters.moved, 1);
    assert_eq!(incremental.counters.created, 0);
    assert_eq!(store.count_records(&container).await.unwrap(), 2);

    let renamed = store
        .get_record_by_external_id(&container, &ExternalId::new("a_renamed.pdf").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.id(), original.id());
    assert_eq!(renamed.record_name(), "a_renamed.pdf");
    assert_eq!(renamed.version(), 2);
    assert!(store
        .get_record_by_external_id(&container, &ExternalId::new("a.pdf").unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_nested_directories_and_deletion() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("reports/2026")).unwrap();
    std::fs::write(dir.path().join("reports/2026/q1.txt"), b"q1").unwrap();
    std::fs::write(dir.path().join("reports/2026/q2.txt"), b"q2").unwrap();

    let store = sqlite_store().await;
    let engine = local_engine(dir.path(), store.clone());
    let container = local_container();

    engine.run_full_sync(&container).await.unwrap();
    let q2 = store
        .get_record_by_external_id(&container, &ExternalId::new("reports/2026/q2.txt").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(q2.path(), "/reports/2026/q2.txt");
    assert_eq!(
        q2.parent_external_id(),
        Some(&ExternalId::new("reports/2026").unwrap())
    );

    std::fs::remove_file(dir.path().join("reports/2026/q1.txt")).unwrap();
    let report = engine.run_full_sync(&container).await.unwrap();

    assert_eq!(report.counters.deleted, 1);
    assert_eq!(store.count_records(&container).await.unwrap(), 3);
}

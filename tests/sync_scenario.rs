//! Sync and queue scenarios through the `Client` façade over an in-memory remote.

use std::sync::Arc;
use std::time::Duration;
use xfer_core::testing::{epoch, MemoryConnector, MemoryFs};
use xfer_lib::{
    AppConfig, Client, ConflictPolicy, ConnectionProfile, Event, Scheme, SyncDirection,
    SyncRequest, TransferRequest, TransferState, XfrError,
};

fn client(connector: &MemoryConnector, dir: &tempfile::TempDir) -> Client {
    let mut config = AppConfig::default();
    config.known_hosts_path = Some(dir.path().join("known_hosts"));
    config.transfer.retry_base_ms = 1;
    config.transfer.retry_max_ms = 5;
    Client::with_connector(config, Arc::new(connector.clone()))
}

fn profile() -> ConnectionProfile {
    ConnectionProfile::new(Scheme::Sftp, "files.example.com").with_username("deploy")
}

async fn within<F: std::future::Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("timed out")
}

#[tokio::test]
async fn test_local_only_file_uploads_once_and_second_run_is_empty() {
    let remote = MemoryFs::new();
    remote.add_dir("/srv/www");
    let connector = MemoryConnector::new(remote.clone());
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("site");
    std::fs::create_dir_all(&local_root).unwrap();
    std::fs::write(local_root.join("new.txt"), b"hello sync").unwrap();

    let client = client(&connector, &dir);
    let mut rx = client.subscribe();
    let request = SyncRequest::new(profile(), &local_root, "/srv/www", SyncDirection::Upload);

    let report = within(client.start_sync(request.clone())).await.unwrap();
    assert_eq!(report.plan.transfers().count(), 1);
    assert_eq!(report.plan.deletes().count(), 0);
    assert_eq!(report.failed, 0);
    assert_eq!(remote.read("/srv/www/new.txt").unwrap(), b"hello sync");

    let mut plan_ready = 0;
    let mut completed = None;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            Event::SyncPlanReady { summary } => {
                assert_eq!(summary.uploads, 1);
                plan_ready += 1;
            }
            Event::SyncCompleted { failed, .. } => completed = Some(failed),
            _ => {}
        }
    }
    assert_eq!(plan_ready, 1);
    assert_eq!(completed, Some(0));

    let second = within(client.preview_sync(&request)).await.unwrap();
    assert!(second.is_empty(), "{:?}", second.actions);
    client.shutdown().await;
}

#[tokio::test]
async fn test_newer_wins_both_ways_then_idempotent() {
    let remote = MemoryFs::new();
    remote.add_file("/data/report.csv", b"remote,newer".to_vec(), epoch(2_000_000_000));
    remote.add_file("/data/stale.txt", b"old".to_vec(), epoch(1_000));
    let connector = MemoryConnector::new(remote.clone());
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("data");
    std::fs::create_dir_all(&local_root).unwrap();
    std::fs::write(local_root.join("report.csv"), b"local").unwrap();
    std::fs::write(local_root.join("stale.txt"), b"fresh local").unwrap();

    let client = client(&connector, &dir);
    let request = SyncRequest::new(profile(), &local_root, "/data", SyncDirection::Bidirectional)
        .with_policy(ConflictPolicy::NewerWins);

    let report = within(client.start_sync(request.clone())).await.unwrap();
    assert_eq!(report.plan.summary.downloads, 1);
    assert_eq!(report.plan.summary.uploads, 1);
    assert_eq!(std::fs::read(local_root.join("report.csv")).unwrap(), b"remote,newer");
    assert_eq!(remote.read("/data/stale.txt").unwrap(), b"fresh local");

    assert!(within(client.preview_sync(&request)).await.unwrap().is_empty());

    let stats = client.queue_stats();
    assert_eq!((stats.total, stats.completed), (2, 2));
    assert_eq!(client.clear_finished(), 2);
    assert!(client.tasks().is_empty());
}

#[tokio::test]
async fn test_failed_transfer_is_counted_and_retryable() {
    let remote = MemoryFs::new();
    remote.add_file("/in/a.bin", vec![9u8; 32], epoch(0));
    let connector = MemoryConnector::new(remote);
    connector.fail_next_transfers(1, XfrError::authentication("permission denied (publickey)"));
    let dir = tempfile::tempdir().unwrap();
    let client = client(&connector, &dir);

    let request = SyncRequest::new(profile(), dir.path().join("in"), "/in", SyncDirection::Download);
    let report = within(client.start_sync(request)).await.unwrap();
    assert_eq!(report.failed, 1);

    let id = report.tasks[0];
    assert_eq!(client.task(id).unwrap().state, TransferState::Failed);
    client.retry(id).unwrap();
    let task = within(client.transfers().wait_terminal(id)).await.unwrap();
    assert_eq!(task.state, TransferState::Completed);
    assert_eq!(std::fs::read(dir.path().join("in/a.bin")).unwrap(), vec![9u8; 32]);
}

#[tokio::test]
async fn test_cancel_returns_capacity_through_client() {
    let remote = MemoryFs::new();
    remote.add_file("/big.bin", vec![1u8; 8192], epoch(0));
    remote.add_file("/small.bin", vec![2u8; 8], epoch(0));
    let connector = MemoryConnector::new(remote).with_chunking(64, Duration::from_millis(5));
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.pool.max_sessions_per_profile = 1;
    let client = Client::with_connector(config, Arc::new(connector.clone()));
    let p = profile();

    let big = client
        .enqueue_transfer(TransferRequest::download(p.clone(), "/big.bin", dir.path().join("big.bin")))
        .unwrap();
    within(async {
        while client.task(big).map(|t| t.offset == 0).unwrap_or(true) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    client.cancel(big).unwrap();
    assert_eq!(client.task(big).unwrap().state, TransferState::Cancelled);

    let small = client
        .enqueue_transfer(TransferRequest::download(p, "/small.bin", dir.path().join("small.bin")))
        .unwrap();
    let task = within(client.transfers().wait_terminal(small)).await.unwrap();
    assert_eq!(task.state, TransferState::Completed);
    // Partial output of the cancelled task stays in place.
    assert!(dir.path().join("big.bin").exists());
}

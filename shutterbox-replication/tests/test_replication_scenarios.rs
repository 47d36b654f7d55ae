//! End-to-end replication loop on a paused clock: manager, scheduler, queue,
//! worker and log together, against an in-memory remote.

use chrono::Utc;
use shutterbox::{BlobStore, LocalBlobStore, LocalLog, MemoryLockStore, Record, StoreConfig};
use shutterbox_replication::notify::NoopNotifier;
use shutterbox_replication::scheduler::SchedulerState;
use shutterbox_replication::{
    BatchOutcome, Collaborators, LogRemoteStore, MemoryRemoteStore, RemoteStore,
    ReplicationConfig, ReplicationManager,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Node {
    _tmp: TempDir,
    manager: Arc<ReplicationManager>,
    log: Arc<LocalLog>,
    blobs: Arc<LocalBlobStore>,
}

fn node(config: ReplicationConfig, remote: Arc<dyn RemoteStore>, locks: MemoryLockStore) -> Node {
    let tmp = TempDir::new().unwrap();
    let store = StoreConfig::for_dir(tmp.path());
    let log = Arc::new(LocalLog::open(&store.log_dir()).unwrap());
    let blobs = Arc::new(LocalBlobStore::new(store.blob_dir.clone()));
    let manager = ReplicationManager::new(
        config,
        &store,
        Collaborators {
            log: Arc::clone(&log),
            blobs: blobs.clone(),
            locks: Arc::new(locks),
            remote: Some(remote),
            notifier: Arc::new(NoopNotifier),
        },
    );
    Node {
        _tmp: tmp,
        manager,
        log,
        blobs,
    }
}

fn kiosk(remote: &Arc<MemoryRemoteStore>) -> Node {
    node(
        ReplicationConfig::for_tests(Some("mem://")),
        remote.clone(),
        MemoryLockStore::new(),
    )
}

fn append_ordered(log: &LocalLog, n: usize) {
    let base = Utc::now() - chrono::Duration::minutes(10);
    for i in 0..n {
        log.append(
            Record::with_id(format!("cap-{:02}", i))
                .created_at(base + chrono::Duration::seconds(i as i64)),
        )
        .unwrap();
    }
}

/// Let the clock run `d` and the dispatcher settle.
async fn advance(d: Duration) {
    tokio::time::sleep(d + Duration::from_millis(10)).await;
}

/// (attempt, delay_ms) of the pending replication tick.
fn pending_tick(manager: &ReplicationManager) -> Option<(u32, u64)> {
    match manager.status().sync.state {
        SchedulerState::Scheduled {
            attempt, delay_ms, ..
        } => Some((attempt, delay_ms)),
        SchedulerState::Idle => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_backlog_drains_then_polls() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let n = kiosk(&remote);
    append_ordered(&n.log, 15);

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert_eq!(remote.len(), 10);
    assert_eq!(n.log.count_unreplicated(), 5);
    // The oldest ten went first.
    assert!(n.log.get("cap-09").unwrap().replicated);
    assert!(!n.log.get("cap-10").unwrap().replicated);
    assert_eq!(pending_tick(&n.manager), Some((0, 2_000)));

    advance(Duration::from_secs(2)).await;

    assert_eq!(remote.len(), 15);
    assert_eq!(n.log.count_unreplicated(), 0);
    assert_eq!(pending_tick(&n.manager), Some((0, 30_000)));
    assert_eq!(
        n.manager.status().last_outcome,
        Some(BatchOutcome::Replicated {
            replicated: 5,
            rejected: 0,
            remaining: 0
        })
    );
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_backoff_after_failures_then_reset() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.fail_next(3);
    let n = kiosk(&remote);
    append_ordered(&n.log, 3);

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;
    assert_eq!(pending_tick(&n.manager), Some((1, 2_000)));

    advance(Duration::from_secs(2)).await;
    assert_eq!(pending_tick(&n.manager), Some((2, 4_000)));

    advance(Duration::from_secs(4)).await;
    assert_eq!(pending_tick(&n.manager), Some((3, 8_000)));
    assert_eq!(n.log.get("cap-00").unwrap().attempt_count, 3);
    assert!(remote.is_empty());

    advance(Duration::from_secs(8)).await;
    assert_eq!(pending_tick(&n.manager), Some((0, 30_000)));
    assert_eq!(remote.len(), 3);
    assert_eq!(remote.calls(), 4);

    let r = n.log.get("cap-00").unwrap();
    assert!(r.replicated);
    assert_eq!(r.attempt_count, 0);
    assert!(r.last_error.is_none());
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_leaves_every_record_unreplicated() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_offline(true);
    let n = kiosk(&remote);
    append_ordered(&n.log, 5);

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert_eq!(n.log.count_unreplicated(), 5);
    for r in n.log.list_unreplicated(10) {
        assert!(!r.replicated);
        assert_eq!(r.attempt_count, 1);
    }
    assert!(matches!(
        n.manager.status().last_outcome,
        Some(BatchOutcome::Failed { attempt: 0, .. })
    ));
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_blob_survives_until_replicated() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_offline(true);
    let mut config = ReplicationConfig::for_tests(Some("mem://"));
    config.delete_blob_after_sync = true;
    let n = node(config, remote.clone(), MemoryLockStore::new());

    let payload = n.blobs.put("cap-00", b"jpeg").unwrap();
    n.log.append(Record::with_id("cap-00").payload(payload)).unwrap();

    n.manager.start().unwrap();
    advance(Duration::from_secs(60)).await;
    assert!(!n.log.get("cap-00").unwrap().replicated);
    assert!(n.blobs.path_for("cap-00").exists());

    assert!(remote.blob("cap-00").is_none());

    remote.set_offline(false);
    advance(Duration::from_secs(60)).await;
    let record = n.log.get("cap-00").unwrap();
    assert!(record.replicated);
    assert_eq!(record.payload_ref.remote_url.as_deref(), Some("/uploads/cap-00.jpg"));
    // The remote copy exists before the local one goes.
    assert_eq!(remote.blob("cap-00").unwrap(), b"jpeg");
    assert!(!n.blobs.path_for("cap-00").exists());
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_expired_record_reaped_while_remote_down() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_offline(true);
    let n = kiosk(&remote);

    let payload = n.blobs.put("ancient", b"jpeg").unwrap();
    n.log
        .append(
            Record::with_id("ancient")
                .created_at(Utc::now() - chrono::Duration::days(45))
                .payload(payload),
        )
        .unwrap();
    n.log.append(Record::with_id("recent")).unwrap();

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert!(n.log.get("ancient").is_none());
    assert!(!n.blobs.path_for("ancient").exists());
    assert!(n.log.get("recent").is_some());
    assert!(remote.is_empty());
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_after_lost_ack_is_harmless() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let n = kiosk(&remote);
    append_ordered(&n.log, 2);

    // The remote committed an earlier push whose local mark never happened.
    let first = n.log.get("cap-00").unwrap();
    remote.upsert_batch("test-node", &[first]).await.unwrap();

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert_eq!(remote.len(), 2);
    assert_eq!(n.log.count_unreplicated(), 0);
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_manual_trigger_skips_the_wait() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let n = kiosk(&remote);

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;
    assert_eq!(n.manager.status().last_outcome, Some(BatchOutcome::Idle));
    assert_eq!(pending_tick(&n.manager), Some((0, 30_000)));

    n.log.append(Record::with_id("late")).unwrap();
    assert!(n.manager.trigger_now());
    advance(Duration::ZERO).await;
    assert!(n.log.get("late").unwrap().replicated);

    // The superseded 30s tick is dropped; only the rescheduled one runs.
    let runs = n.manager.status().sync.runs;
    assert_eq!(runs, 2);
    advance(Duration::from_secs(30)).await;
    assert_eq!(n.manager.status().sync.runs, runs + 1);
    n.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_second_process_stands_by_until_lock_frees() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let locks = MemoryLockStore::new();
    let a = node(
        ReplicationConfig::for_tests(Some("mem://")),
        remote.clone(),
        locks.clone(),
    );
    let b = node(
        ReplicationConfig::for_tests(Some("mem://")),
        remote.clone(),
        locks.handle(),
    );
    b.log.append(Record::with_id("from-b")).unwrap();

    a.manager.start().unwrap();
    b.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert!(a.manager.status().sync_active);
    assert!(!b.manager.status().sync_active);
    assert!(!b.manager.trigger_now());
    assert!(!b.log.get("from-b").unwrap().replicated);

    a.manager.shutdown();
    // Standby re-checks once per sync lock TTL (600s).
    advance(Duration::from_secs(600)).await;

    assert!(b.manager.status().sync_active);
    assert!(b.log.get("from-b").unwrap().replicated);
    b.manager.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_kiosk_to_central_log() {
    let central_dir = TempDir::new().unwrap();
    let central = Arc::new(LocalLog::open(central_dir.path()).unwrap());
    let n = node(
        ReplicationConfig::for_tests(Some("mem://")),
        Arc::new(LogRemoteStore::new(Arc::clone(&central))),
        MemoryLockStore::new(),
    );
    append_ordered(&n.log, 3);

    n.manager.start().unwrap();
    advance(Duration::ZERO).await;

    assert_eq!(central.len(), 3);
    assert!(central.get("cap-01").unwrap().replicated);
    assert_eq!(n.log.count_unreplicated(), 0);
    n.manager.shutdown();
}

use super::client::HttpRemoteStore;
use super::config::ReplicationConfig;
use super::notify::{NoopNotifier, Notifier, SmsNotifier};
use super::queue::{run_dispatcher, Job, JobHandler, JobQueue};
use super::remote::RemoteStore;
use super::scheduler::{next_tick, Scheduler};
use super::types::{BatchOutcome, ReplicationStatus};
use super::worker::{ReplicationWorker, WorkerSettings};
use async_trait::async_trait;
use shutterbox::reaper::run_reap;
use shutterbox::{
    BlobStore, FileLockStore, LocalBlobStore, LocalLog, LockStore, Result, RetentionPolicy,
    ShutterboxError, StoreConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub const SYNC_LOCK: &str = "sync-lock";
pub const REAP_LOCK: &str = "reap-lock";

/// Everything the manager drives. Built by [`ReplicationManager::from_config`]
/// in production; tests wire in-memory stores.
pub struct Collaborators {
    pub log: Arc<LocalLog>,
    pub blobs: Arc<dyn BlobStore>,
    pub locks: Arc<dyn LockStore>,
    /// `None` runs standalone: reaping only.
    pub remote: Option<Arc<dyn RemoteStore>>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Duty {
    Sync,
    Reap,
}

impl Duty {
    fn key(self) -> &'static str {
        match self {
            Duty::Sync => SYNC_LOCK,
            Duty::Reap => REAP_LOCK,
        }
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the two periodic jobs (replication and reaping) of one process.
///
/// Each job is seeded only by the process holding its Scheduling Lock. The
/// others stand by and re-check once per lock TTL, so a crashed holder is
/// replaced after its lock expires.
pub struct ReplicationManager {
    me: Weak<ReplicationManager>,
    config: ReplicationConfig,
    log: Arc<LocalLog>,
    blobs: Arc<dyn BlobStore>,
    locks: Arc<dyn LockStore>,
    worker: Option<ReplicationWorker>,
    retention: RetentionPolicy,
    reap_interval: Duration,
    queue: JobQueue,
    receiver: Mutex<Option<UnboundedReceiver<Job>>>,
    sync: Scheduler,
    reap: Scheduler,
    sync_held: AtomicBool,
    reap_held: AtomicBool,
    stopped: AtomicBool,
    last_outcome: Mutex<Option<BatchOutcome>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(config: ReplicationConfig, store: &StoreConfig, deps: Collaborators) -> Arc<Self> {
        let worker = deps.remote.map(|remote| {
            ReplicationWorker::new(
                Arc::clone(&deps.log),
                remote,
                deps.notifier,
                Arc::clone(&deps.blobs),
                WorkerSettings::from(&config),
            )
        });
        let (queue, receiver) = JobQueue::new();

        Arc::new_cyclic(|me| ReplicationManager {
            me: me.clone(),
            config,
            log: deps.log,
            blobs: deps.blobs,
            locks: deps.locks,
            worker,
            retention: store.retention_policy(),
            reap_interval: Duration::from_secs(store.reap_interval_secs.max(1)),
            queue,
            receiver: Mutex::new(Some(receiver)),
            sync: Scheduler::new("replicate"),
            reap: Scheduler::new("reap"),
            sync_held: AtomicBool::new(false),
            reap_held: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_outcome: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Production wiring: on-disk log, blob directory and lock directory,
    /// HTTP remote when configured, SMS when a gateway is set.
    pub fn from_config(config: ReplicationConfig, store: &StoreConfig) -> Result<Arc<Self>> {
        let log = Arc::new(LocalLog::open_with_threshold(
            &store.log_dir(),
            store.compact_threshold,
        )?);
        let locks = Arc::new(FileLockStore::open(&store.lock_dir())?);
        let blobs = Arc::new(LocalBlobStore::new(store.blob_dir.clone()));

        let remote: Option<Arc<dyn RemoteStore>> = config.remote_url.as_deref().map(|url| {
            Arc::new(HttpRemoteStore::new(
                url,
                Duration::from_secs(config.remote_timeout_secs.max(1)),
            )) as Arc<dyn RemoteStore>
        });

        let notifier: Arc<dyn Notifier> = match config.sms_url.as_deref() {
            Some(url) => Arc::new(SmsNotifier::new(
                url,
                config.sms_sender.as_deref().unwrap_or("Shutterbox"),
                config.public_url.as_deref().unwrap_or(""),
            )),
            None => Arc::new(NoopNotifier),
        };

        Ok(Self::new(
            config,
            store,
            Collaborators {
                log,
                blobs,
                locks,
                remote,
                notifier,
            },
        ))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<LocalLog> {
        &self.log
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.is_some()
    }

    /// Start the dispatcher and claim whichever periodic jobs this process
    /// can get the lock for. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let rx = locked(&self.receiver)
            .take()
            .ok_or_else(|| ShutterboxError::Config("replication manager already started".into()))?;
        let dispatcher = tokio::spawn(run_dispatcher(rx, self.me.clone()));
        locked(&self.tasks).push(dispatcher);

        if self.worker.is_some() {
            self.claim_duty(Duty::Sync);
        } else {
            tracing::info!("[SYNC] no remote configured, replication disabled");
        }
        self.claim_duty(Duty::Reap);
        Ok(())
    }

    /// Run a replication tick now, superseding the pending one. False when
    /// replication is disabled or another process holds the schedule.
    pub fn trigger_now(&self) -> bool {
        if self.worker.is_none()
            || self.stopped.load(Ordering::SeqCst)
            || !self.sync_held.load(Ordering::SeqCst)
        {
            return false;
        }
        tracing::info!("[SYNC] manual trigger");
        self.schedule(Duty::Sync, Duration::ZERO, 0);
        true
    }

    /// Probe the remote; `None` when running standalone.
    pub async fn remote_reachable(&self) -> Option<bool> {
        match &self.worker {
            Some(worker) => Some(worker.remote().ping().await),
            None => None,
        }
    }

    pub fn status(&self) -> ReplicationStatus {
        let stats = self.log.stats();
        ReplicationStatus {
            node_id: self.config.node_id.clone(),
            replication_enabled: self.is_enabled(),
            remote_url: self.config.remote_url.clone(),
            sync_active: self.sync_held.load(Ordering::SeqCst),
            reap_active: self.reap_held.load(Ordering::SeqCst),
            sync: self.sync.snapshot(),
            reap: self.reap.snapshot(),
            unreplicated: stats.unreplicated,
            dead_lettered: stats.dead_lettered,
            last_outcome: locked(&self.last_outcome).clone(),
        }
    }

    /// Stop scheduling, cancel background tasks and release held locks.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sync.stop();
        self.reap.stop();
        for handle in locked(&self.tasks).drain(..) {
            handle.abort();
        }
        for duty in [Duty::Sync, Duty::Reap] {
            if self.held(duty).swap(false, Ordering::SeqCst) {
                if let Err(e) = self.locks.release(duty.key()) {
                    tracing::warn!("[LOCK] failed to release {}: {}", duty.key(), e);
                }
            }
        }
        tracing::info!("[SYNC] replication manager stopped");
    }

    fn held(&self, duty: Duty) -> &AtomicBool {
        match duty {
            Duty::Sync => &self.sync_held,
            Duty::Reap => &self.reap_held,
        }
    }

    fn scheduler(&self, duty: Duty) -> &Scheduler {
        match duty {
            Duty::Sync => &self.sync,
            Duty::Reap => &self.reap,
        }
    }

    fn ttl(&self, duty: Duty) -> Duration {
        match duty {
            Duty::Sync => self.config.sync_lock_ttl(),
            Duty::Reap => self.config.reap_lock_ttl(),
        }
    }

    fn claim_duty(&self, duty: Duty) {
        match self.locks.acquire(duty.key(), self.ttl(duty)) {
            Ok(true) => {
                tracing::info!("[LOCK] {} acquired {}", self.locks.holder(), duty.key());
                self.held(duty).store(true, Ordering::SeqCst);
                self.schedule(duty, Duration::ZERO, 0);
            }
            Ok(false) => {
                tracing::info!("[LOCK] {} held by another process, standing by", duty.key());
                self.standby(duty);
            }
            Err(e) => {
                tracing::warn!("[LOCK] failed to acquire {}: {}", duty.key(), e);
                self.standby(duty);
            }
        }
    }

    /// Re-check the lock once per TTL until it can be taken.
    fn standby(&self, duty: Duty) {
        let me = self.me.clone();
        let ttl = self.ttl(duty);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                let Some(manager) = me.upgrade() else {
                    return;
                };
                if manager.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match manager.locks.acquire(duty.key(), ttl) {
                    Ok(true) => {
                        tracing::info!(
                            "[LOCK] {} took over {}",
                            manager.locks.holder(),
                            duty.key()
                        );
                        manager.held(duty).store(true, Ordering::SeqCst);
                        manager.schedule(duty, Duration::ZERO, 0);
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("[LOCK] standby check for {} failed: {}", duty.key(), e)
                    }
                }
            }
        });
        locked(&self.tasks).push(handle);
    }

    /// Renew the lock for `until_next` plus one TTL, so the lease always
    /// outlives the next queued tick. A lost lock drops this process back to
    /// standby instead of running or rescheduling the job.
    fn hold_duty(&self, duty: Duty, until_next: Duration) -> bool {
        let lease = until_next.saturating_add(self.ttl(duty));
        match self.locks.renew(duty.key(), lease) {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!("[LOCK] lost {} to another process", duty.key());
                self.held(duty).store(false, Ordering::SeqCst);
                self.standby(duty);
                false
            }
            Err(e) => {
                // Coordination store trouble; keep going, a duplicate tick is harmless.
                tracing::warn!("[LOCK] failed to renew {}: {}", duty.key(), e);
                true
            }
        }
    }

    fn schedule(&self, duty: Duty, delay: Duration, attempt: u32) {
        let scheduler = self.scheduler(duty);
        let Some(ticket) = scheduler.schedule(delay, attempt) else {
            return;
        };
        let job = match duty {
            Duty::Sync => Job::Replicate { attempt, ticket },
            Duty::Reap => Job::Reap { ticket },
        };
        if let Err(e) = self.queue.enqueue(job, delay) {
            tracing::warn!("[SYNC] failed to enqueue {:?}: {}", job, e);
            scheduler.cancel();
        }
    }

    async fn replicate(&self, ticket: u64) {
        let Some(attempt) = self.sync.claim(ticket) else {
            tracing::debug!("[SYNC] dropping superseded tick {}", ticket);
            return;
        };
        let Some(worker) = &self.worker else {
            return;
        };
        if !self.hold_duty(Duty::Sync, Duration::ZERO) {
            return;
        }

        let outcome = worker.run_batch(attempt).await;
        let decision = next_tick(&outcome, &self.config.intervals(), &self.config.backoff());

        match &outcome {
            BatchOutcome::Failed { reason, .. } => tracing::warn!(
                attempt,
                delay_ms = decision.delay.as_millis() as u64,
                "[SYNC] attempt failed ({}), retrying in {}s",
                reason,
                decision.delay.as_secs()
            ),
            BatchOutcome::Replicated { remaining, .. } if *remaining > 0 => tracing::debug!(
                delay_ms = decision.delay.as_millis() as u64,
                "[SYNC] {} pending, draining",
                remaining
            ),
            _ => {}
        }

        *locked(&self.last_outcome) = Some(outcome);
        if self.hold_duty(Duty::Sync, decision.delay) {
            self.schedule(Duty::Sync, decision.delay, decision.attempt);
        }
    }

    async fn reap(&self, ticket: u64) {
        if self.reap.claim(ticket).is_none() {
            tracing::debug!("[REAP] dropping superseded run {}", ticket);
            return;
        }
        if !self.hold_duty(Duty::Reap, Duration::ZERO) {
            return;
        }

        let log = Arc::clone(&self.log);
        let blobs = Arc::clone(&self.blobs);
        let policy = self.retention.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || run_reap(&log, blobs.as_ref(), &policy)).await
        {
            tracing::warn!("[REAP] run task failed: {}", e);
        }

        if self.hold_duty(Duty::Reap, self.reap_interval) {
            self.schedule(Duty::Reap, self.reap_interval, 0);
        }
    }
}

#[async_trait]
impl JobHandler for ReplicationManager {
    async fn handle(&self, job: Job) {
        match job {
            Job::Replicate { ticket, .. } => self.replicate(ticket).await,
            Job::Reap { ticket } => self.reap(ticket).await,
        }
    }
}

impl Drop for ReplicationManager {
    fn drop(&mut self) {
        for handle in locked(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::scheduler::SchedulerState;
    use shutterbox::{MemoryLockStore, Record};
    use tempfile::TempDir;

    fn manager(
        tmp: &TempDir,
        remote: Option<Arc<MemoryRemoteStore>>,
        locks: MemoryLockStore,
    ) -> Arc<ReplicationManager> {
        let store = StoreConfig::for_dir(tmp.path());
        let log = Arc::new(LocalLog::open(&store.log_dir()).unwrap());
        ReplicationManager::new(
            ReplicationConfig::for_tests(remote.as_ref().map(|_| "mem://")),
            &store,
            Collaborators {
                log,
                blobs: Arc::new(LocalBlobStore::new(store.blob_dir.clone())),
                locks: Arc::new(locks),
                remote: remote.map(|r| r as Arc<dyn RemoteStore>),
                notifier: Arc::new(NoopNotifier),
            },
        )
    }

    #[test]
    fn test_standalone_manager() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, None, MemoryLockStore::new());
        assert!(!m.is_enabled());
        assert_eq!(m.node_id(), "test-node");
        assert!(!m.trigger_now());
        let status = m.status();
        assert!(!status.replication_enabled);
        assert!(status.last_outcome.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let m = manager(&tmp, None, MemoryLockStore::new());
        m.start().unwrap();
        assert!(m.start().is_err());
        m.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_runs_immediately() {
        let tmp = TempDir::new().unwrap();
        let remote = Arc::new(MemoryRemoteStore::new());
        let m = manager(&tmp, Some(Arc::clone(&remote)), MemoryLockStore::new());
        m.log().append(Record::with_id("a")).unwrap();

        m.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(remote.len(), 1);
        assert!(m.log().get("a").unwrap().replicated);
        let status = m.status();
        assert!(status.sync_active);
        assert!(status.reap_active);
        assert_eq!(
            status.last_outcome,
            Some(BatchOutcome::Replicated {
                replicated: 1,
                rejected: 0,
                remaining: 0
            })
        );
        m.shutdown();
    }

    fn reaper_only(tmp: &TempDir, locks: MemoryLockStore) -> Arc<ReplicationManager> {
        let mut store = StoreConfig::for_dir(tmp.path());
        store.reap_interval_secs = 2;
        let mut config = ReplicationConfig::for_tests(None);
        config.reap_lock_ttl_secs = 1;
        let log = Arc::new(LocalLog::open(&store.log_dir()).unwrap());
        ReplicationManager::new(
            config,
            &store,
            Collaborators {
                log,
                blobs: Arc::new(LocalBlobStore::new(store.blob_dir.clone())),
                locks: Arc::new(locks),
                remote: None,
                notifier: Arc::new(NoopNotifier),
            },
        )
    }

    // Lock expiry follows the wall clock, so this runs in real time.
    #[tokio::test]
    async fn test_lease_outlives_interval_longer_than_ttl() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        let locks = MemoryLockStore::new();
        let a = reaper_only(&tmp_a, locks.handle());
        let b = reaper_only(&tmp_b, locks.handle());

        a.start().unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        b.start().unwrap();
        // B re-checks every second across two of A's reap intervals.
        tokio::time::sleep(Duration::from_millis(5_000)).await;

        let a_status = a.status();
        let b_status = b.status();
        assert!(a_status.reap_active);
        assert!(a_status.reap.runs >= 2);
        assert!(!b_status.reap_active);
        assert_eq!(b_status.reap.runs, 0);
        assert_eq!(b_status.reap.state, SchedulerState::Idle);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_is_not_reacquired_on_tick() {
        let tmp = TempDir::new().unwrap();
        let locks = MemoryLockStore::new();
        let other = locks.handle();
        let m = manager(&tmp, None, locks);

        m.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(m.status().reap_active);

        // Another holder takes the key once this one lets it go.
        m.locks.release(REAP_LOCK).unwrap();
        assert!(other.acquire(REAP_LOCK, Duration::from_secs(86_400)).unwrap());

        assert!(!m.hold_duty(Duty::Reap, Duration::from_secs(60)));
        assert!(!m.status().reap_active);
        assert!(other.renew(REAP_LOCK, Duration::from_secs(60)).unwrap());
        m.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_locks() {
        let tmp = TempDir::new().unwrap();
        let locks = MemoryLockStore::new();
        let other = locks.handle();
        let m = manager(&tmp, Some(Arc::new(MemoryRemoteStore::new())), locks);

        m.start().unwrap();
        assert!(!other.acquire(SYNC_LOCK, Duration::from_secs(600)).unwrap());
        m.shutdown();
        assert!(other.acquire(SYNC_LOCK, Duration::from_secs(600)).unwrap());
        assert!(other.acquire(REAP_LOCK, Duration::from_secs(600)).unwrap());
        assert!(!m.trigger_now());
    }
}

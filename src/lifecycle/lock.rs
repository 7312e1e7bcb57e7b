use super::Clock;
use crate::storage::{CheckpointManager, Lease, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Single-flight guard around dispatch cycles.
///
/// Held state lives in two places: an in-process flag that rejects
/// overlapping cycles without touching the store, and a lease in the
/// checkpoint store that survives restarts. A lease whose expiry has passed
/// belongs to a holder that died and may be taken over, and so does a live
/// lease written under this lock's own owner id.
pub struct ProcessingLock {
    checkpoints: CheckpointManager,
    held: Arc<AtomicBool>,
    owner: String,
    lease: Duration,
    keep_alive: Option<Duration>,
    clock: Clock,
}

impl ProcessingLock {
    pub fn new(
        checkpoints: CheckpointManager,
        lease: Duration,
        keep_alive: Option<Duration>,
        clock: Clock,
    ) -> Self {
        Self {
            checkpoints,
            held: Arc::new(AtomicBool::new(false)),
            owner: default_owner(),
            lease,
            keep_alive,
            clock,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether a guard from this process is currently alive
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Take the lock, or return `None` when another cycle holds a live lease.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>, StorageError> {
        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Processing lock already held in this process");
            return Ok(None);
        }

        match self.claim_lease().await {
            Ok(Some(lease)) => {
                let keep_alive = self.keep_alive.map(|interval| {
                    spawn_keep_alive(
                        self.checkpoints.clone(),
                        lease,
                        self.lease,
                        interval,
                        self.clock.clone(),
                    )
                });
                Ok(Some(LockGuard {
                    checkpoints: self.checkpoints.clone(),
                    held: self.held.clone(),
                    keep_alive,
                    released: false,
                }))
            }
            Ok(None) => {
                self.held.store(false, Ordering::SeqCst);
                Ok(None)
            }
            Err(e) => {
                self.held.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn claim_lease(&self) -> Result<Option<Lease>, StorageError> {
        let now = (self.clock)();

        match self.checkpoints.lease().await {
            Ok(Some(existing)) if existing.owner == self.owner => info!(
                owner = %existing.owner,
                expires_at = %existing.expires_at,
                "Reclaiming processing lease left by this owner"
            ),
            Ok(Some(existing)) if !existing.is_expired(now) => {
                info!(
                    owner = %existing.owner,
                    expires_at = %existing.expires_at,
                    "Processing lease held elsewhere"
                );
                return Ok(None);
            }
            Ok(Some(existing)) => warn!(
                owner = %existing.owner,
                expired_at = %existing.expires_at,
                "Taking over expired processing lease"
            ),
            Ok(None) => {}
            Err(StorageError::Corrupt { message, .. }) => {
                warn!(error = %message, "Replacing unreadable processing lease")
            }
            Err(e) => return Err(e),
        }

        let lease = Lease {
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: now + lease_span(self.lease),
        };
        self.checkpoints.set_lease(&lease).await?;
        if self.keep_alive.is_some() {
            if let Err(e) = self.checkpoints.touch_keepalive(now).await {
                if let Err(clear) = self.checkpoints.clear_lease().await {
                    warn!(error = %clear, "Failed to clear processing lease after failed acquire");
                }
                return Err(e);
            }
        }

        debug!(owner = %lease.owner, expires_at = %lease.expires_at, "Processing lease acquired");
        Ok(Some(lease))
    }
}

/// Proof of holding the processing lock. Call [`LockGuard::release`] on every
/// exit path; dropping an unreleased guard schedules the release instead.
pub struct LockGuard {
    checkpoints: CheckpointManager,
    held: Arc<AtomicBool>,
    keep_alive: Option<KeepAlive>,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        if let Some(keep_alive) = self.keep_alive.take() {
            keep_alive.stop().await;
        }

        let result = self.checkpoints.clear_lease().await;
        self.held.store(false, Ordering::SeqCst);
        debug!("Processing lease released");
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!("Processing lock dropped without release, clearing lease");
        let keep_alive = self.keep_alive.take();
        let checkpoints = self.checkpoints.clone();
        let held = self.held.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // The in-process flag stays set until the stored lease is gone
                handle.spawn(async move {
                    if let Some(keep_alive) = keep_alive {
                        keep_alive.stop().await;
                    }
                    if let Err(e) = checkpoints.clear_lease().await {
                        warn!(error = %e, "Failed to clear processing lease");
                    }
                    held.store(false, Ordering::SeqCst);
                });
            }
            Err(_) => {
                if let Some(keep_alive) = keep_alive {
                    keep_alive.task.abort();
                }
                held.store(false, Ordering::SeqCst);
            }
        }
    }
}

struct KeepAlive {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl KeepAlive {
    /// Stop refreshing and wait until a write already in flight has landed
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Keep-alive task failed");
            }
        }
    }
}

fn spawn_keep_alive(
    checkpoints: CheckpointManager,
    mut lease: Lease,
    span: Duration,
    interval: Duration,
    clock: Clock,
) -> KeepAlive {
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stopped.wait_for(|&stop| stop) => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let now = clock();
            lease.expires_at = now + lease_span(span);

            if let Err(e) = checkpoints.set_lease(&lease).await {
                warn!(error = %e, "Failed to extend processing lease");
                continue;
            }
            if let Err(e) = checkpoints.touch_keepalive(now).await {
                warn!(error = %e, "Failed to write keep-alive");
            }
        }
    });

    KeepAlive { stop, task }
}

fn lease_span(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1))
}

fn default_owner() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::checkpoint::{KEEPALIVE_KEY, PROCESSING_KEY};
    use crate::storage::{CheckpointStore, MemoryCheckpointStore};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    /// Checkpoint store that refuses to write the keep-alive key
    #[derive(Default)]
    struct NoKeepAliveStore {
        inner: MemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for NoKeepAliveStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            if key == KEEPALIVE_KEY {
                return Err(StorageError::Database("keep-alive write refused".to_string()));
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key).await
        }
    }

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap())
    }

    fn lock(store: Arc<MemoryCheckpointStore>, keep_alive: Option<Duration>) -> ProcessingLock {
        ProcessingLock::new(
            CheckpointManager::new(store),
            Duration::from_secs(7200),
            keep_alive,
            fixed_clock(),
        )
        .with_owner("test:1")
    }

    #[tokio::test]
    async fn test_second_acquire_is_refused() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let lock = lock(store.clone(), None);

        let guard = lock.try_acquire().await.unwrap().expect("first acquire");
        assert!(lock.is_held());
        assert!(lock.try_acquire().await.unwrap().is_none());

        guard.release().await.unwrap();
        assert!(!lock.is_held());
        assert_eq!(store.get(PROCESSING_KEY).await.unwrap(), None);

        let again = lock.try_acquire().await.unwrap();
        assert!(again.is_some());
        again.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_live_lease_from_other_owner_blocks() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let other = lock(store.clone(), None).with_owner("other:2");
        let mine = lock(store.clone(), None);

        let guard = other.try_acquire().await.unwrap().unwrap();
        assert!(mine.try_acquire().await.unwrap().is_none());
        assert!(!mine.is_held());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let manager = CheckpointManager::new(store.clone());
        let stale = Lease {
            owner: "crashed:9".to_string(),
            acquired_at: Utc.with_ymd_and_hms(2024, 5, 15, 6, 0, 0).unwrap(),
            expires_at: Utc.with_ymd_and_hms(2024, 5, 15, 8, 0, 0).unwrap(),
        };
        manager.set_lease(&stale).await.unwrap();

        let lock = lock(store.clone(), None);
        let guard = lock.try_acquire().await.unwrap().expect("takeover");
        assert_eq!(manager.lease().await.unwrap().unwrap().owner, "test:1");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_own_live_lease_is_reclaimed() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let manager = CheckpointManager::new(store.clone());
        manager
            .set_lease(&Lease {
                owner: "test:1".to_string(),
                acquired_at: Utc.with_ymd_and_hms(2024, 5, 15, 8, 30, 0).unwrap(),
                expires_at: Utc.with_ymd_and_hms(2024, 5, 15, 10, 30, 0).unwrap(),
            })
            .await
            .unwrap();

        let lock = lock(store.clone(), None);
        let guard = lock.try_acquire().await.unwrap().expect("reclaim");
        let lease = manager.lease().await.unwrap().unwrap();
        assert_eq!(lease.acquired_at, Utc.with_ymd_and_hms(2024, 5, 15, 9, 0, 0).unwrap());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_no_lease() {
        let store = Arc::new(NoKeepAliveStore::default());
        let manager = CheckpointManager::new(store.clone());
        let lock = ProcessingLock::new(
            manager.clone(),
            Duration::from_secs(7200),
            Some(Duration::from_secs(60)),
            fixed_clock(),
        )
        .with_owner("test:1");

        assert!(lock.try_acquire().await.is_err());
        assert!(!lock.is_held());
        assert_eq!(store.get(PROCESSING_KEY).await.unwrap(), None);

        // Another process is not locked out by the failed attempt
        let other = ProcessingLock::new(manager, Duration::from_secs(7200), None, fixed_clock())
            .with_owner("other:2");
        let guard = other.try_acquire().await.unwrap();
        assert!(guard.is_some());
        guard.unwrap().release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_outlasts_keep_alive_writes() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let lock = lock(store.clone(), Some(Duration::from_millis(5)));

        let guard = lock.try_acquire().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        guard.release().await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get(PROCESSING_KEY).await.unwrap(), None);
        assert_eq!(store.get(KEEPALIVE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keepalive_key_scoped_to_lock() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let lock = lock(store.clone(), Some(Duration::from_secs(60)));

        let guard = lock.try_acquire().await.unwrap().unwrap();
        assert!(store.get(KEEPALIVE_KEY).await.unwrap().is_some());

        guard.release().await.unwrap();
        assert_eq!(store.get(KEEPALIVE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_guard_still_releases() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let lock = lock(store.clone(), None);

        let guard = lock.try_acquire().await.unwrap().unwrap();
        drop(guard);

        for _ in 0..50 {
            if !lock.is_held() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_held());
        assert_eq!(store.get(PROCESSING_KEY).await.unwrap(), None);
    }
}

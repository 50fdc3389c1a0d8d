use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use ridepool_core::repository::FastStore;
use ridepool_core::{Clock, CoreError, CoreResult};

/// Proof of a live lock on one resource key
#[derive(Debug, Clone)]
pub struct Lease {
    key: String,
    token: String,
    acquired_at: DateTime<Utc>,
    duration: Duration,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Short-lived named mutual exclusion over the shared fast store.
///
/// A lock is a key holding a random owner token with a TTL, so a holder that
/// crashes only blocks the resource for one lease. Release compares the
/// token first and never removes a lock that has since been re-acquired by
/// someone else.
#[derive(Clone)]
pub struct LockCoordinator {
    store: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
}

impl LockCoordinator {
    pub fn new(store: Arc<dyn FastStore>, clock: Arc<dyn Clock>, retry_interval: Duration) -> Self {
        Self {
            store,
            clock,
            retry_interval,
        }
    }

    /// Try to take the lock until `max_wait` runs out.
    pub async fn acquire(&self, key: &str, max_wait: Duration, lease_duration: Duration) -> CoreResult<Lease> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + max_wait;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if self.store.set_nx(key, &token, lease_duration).await? {
                debug!("Lock {} acquired after {} attempt(s)", key, attempts);
                return Ok(Lease {
                    key: key.to_string(),
                    token,
                    acquired_at: self.clock.now(),
                    duration: lease_duration,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("Gave up on lock {} after {} attempt(s)", key, attempts);
                return Err(CoreError::LockTimeout(key.to_string()));
            }
            sleep(self.retry_interval.min(deadline - now)).await;
        }
    }

    /// Release the lock if it is still ours. Returns false when the lease had
    /// already expired.
    pub async fn release(&self, lease: &Lease) -> CoreResult<bool> {
        let released = self.store.delete_if_eq(&lease.key, &lease.token).await?;
        if !released {
            warn!(
                "Lease on {} expired before release (held since {})",
                lease.key, lease.acquired_at
            );
        }
        Ok(released)
    }

    pub async fn is_held(&self, lease: &Lease) -> CoreResult<bool> {
        let owner = self.store.get(&lease.key).await?;
        Ok(owner.as_deref() == Some(lease.token.as_str()))
    }

    /// Run `action` while holding the lock on `key`.
    ///
    /// The lock is released afterwards whether the action succeeded or not.
    /// A failed release is only logged: the lease expires on its own.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        max_wait: Duration,
        lease_duration: Duration,
        action: F,
    ) -> CoreResult<T>
    where
        F: FnOnce(Lease) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let lease = self.acquire(key, max_wait, lease_duration).await?;
        let result = action(lease.clone()).await;

        if let Err(e) = self.release(&lease).await {
            warn!("Failed to release lock {}: {}", key, e);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridepool_store::memory::{InMemoryFastStore, ManualClock};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn coordinator() -> (Arc<ManualClock>, Arc<InMemoryFastStore>, LockCoordinator) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryFastStore::new(clock.clone()));
        let lock = LockCoordinator::new(store.clone(), clock.clone(), Duration::from_millis(5));
        (clock, store, lock)
    }

    #[tokio::test]
    async fn test_contended_lock_times_out_without_running_action() {
        let (_clock, _store, lock) = coordinator();
        let _held = lock
            .acquire("route:a:2026-01-01", Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();

        let ran = AtomicBool::new(false);
        let result = lock
            .with_lock("route:a:2026-01-01", Duration::from_millis(30), Duration::from_secs(5), |_| async {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CoreError::LockTimeout(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_release_new_owner() {
        let (clock, _store, lock) = coordinator();
        let key = "route:b:2026-01-01";

        let first = lock.acquire(key, Duration::ZERO, Duration::from_secs(5)).await.unwrap();
        clock.advance(chrono::Duration::seconds(6));

        let second = lock.acquire(key, Duration::ZERO, Duration::from_secs(5)).await.unwrap();
        assert!(!lock.release(&first).await.unwrap());
        assert!(lock.is_held(&second).await.unwrap());
        assert!(!lock.is_held(&first).await.unwrap());
        assert!(lock.release(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_released_after_failed_action() {
        let (_clock, _store, lock) = coordinator();
        let key = "route:c:2026-01-01";

        let result: CoreResult<()> = lock
            .with_lock(key, Duration::ZERO, Duration::from_secs(5), |_| async {
                Err(CoreError::Conflict("seat 1".to_string()))
            })
            .await;
        assert!(matches!(result, Err(CoreError::Conflict(_))));

        assert!(lock.acquire(key, Duration::ZERO, Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fast_store_outage_is_an_error_not_a_timeout() {
        let (_clock, store, lock) = coordinator();
        store.set_available(false);

        let result = lock.acquire("route:d:2026-01-01", Duration::from_millis(20), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CoreError::FastStore(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_critical_sections_never_overlap() {
        let (_clock, _store, lock) = coordinator();
        let inside = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            tasks.push(tokio::spawn(async move {
                lock.with_lock("route:e:2026-01-01", Duration::from_secs(5), Duration::from_secs(5), |_| async {
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    entered.fetch_add(1, Ordering::SeqCst);
                    inside.store(false, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 8);
    }
}

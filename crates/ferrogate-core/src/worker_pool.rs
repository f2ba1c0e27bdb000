//! Worker Pool Manager (C4): one bounded queue + worker set per provider.
//!
//! Grounded in `sblanchard-SerialAgent`'s `TaskRunner`
//! (`crates/gateway/src/runtime/tasks.rs`): a `RwLock<HashMap<String,
//! Arc<Semaphore>>>` lazily creates one semaphore per key on first use,
//! exactly `pool_for` below does per provider. That source has no admission
//! queue in front of its semaphore (callers just `spawn` and `acquire`), so
//! the bounded `mpsc` channel gating admission ahead of the semaphore here —
//! sized to `BufferSize(p)` — is this crate's own addition, not ported from
//! anywhere in the corpus.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use ferrogate_common::CoreError;
use ferrogate_protocol::ProviderId;

/// One provider's admission gate plus concurrency limiter.
struct WorkerPool {
    semaphore: Arc<Semaphore>,
    /// Bounds how many tasks may be admitted ahead of execution; `None` when
    /// `DropExcessRequests=true` (or `BufferSize=0`, which degenerates to the
    /// same immediate-rejection semantics — see `new` below), since admission
    /// there is a single atomic check rather than a queue.
    admission: Option<mpsc::Sender<()>>,
    /// Cancelled by `cleanup`: unblocks any task parked on
    /// `admission.reserve()` or the concurrency `acquire_owned()` below with
    /// `RequestCancelled` instead of letting it wait indefinitely.
    shutdown: CancellationToken,
    concurrency: usize,
}

impl WorkerPool {
    fn new(concurrency: usize, buffer_size: usize, drop_excess: bool) -> Self {
        let concurrency = concurrency.max(1);
        // BufferSize=0 means "no queueing configured"; admitting one slot
        // anyway (the old `buffer_size.max(1)` floor) would silently accept
        // one more queued request than the operator configured. Degenerate
        // to DropExcessRequests semantics instead of rounding the bound up.
        let drop_excess = drop_excess || buffer_size == 0;
        let shutdown = CancellationToken::new();
        let admission = if drop_excess {
            None
        } else {
            let (tx, mut rx) = mpsc::channel(buffer_size);
            // rx is never read: capacity itself is the resource we gate on.
            // A background holder keeps `rx` alive so `tx.reserve` observes
            // the real channel, not an immediately-closed one; it drops `rx`
            // (closing the channel) once `shutdown` fires, which wakes any
            // reservation blocked on admission with an error.
            let shutdown_bg = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = async { while rx.recv().await.is_some() {} } => {}
                    _ = shutdown_bg.cancelled() => {}
                }
            });
            Some(tx)
        };
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            admission,
            shutdown,
            concurrency,
        }
    }
}

/// Manages one [`WorkerPool`] per provider, created lazily on first submit
/// (§4.4), matching the credential pool's lazy-registration style.
pub struct WorkerPoolManager {
    pools: tokio::sync::RwLock<HashMap<String, Arc<WorkerPool>>>,
}

impl Default for WorkerPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPoolManager {
    pub fn new() -> Self {
        Self {
            pools: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn pool_for(
        &self,
        provider: &ProviderId,
        concurrency: usize,
        buffer_size: usize,
        drop_excess: bool,
    ) -> Arc<WorkerPool> {
        let key = provider.to_string();
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&key) {
                return pool.clone();
            }
        }
        let mut pools = self.pools.write().await;
        pools
            .entry(key)
            .or_insert_with(|| Arc::new(WorkerPool::new(concurrency, buffer_size, drop_excess)))
            .clone()
    }

    /// Admits one task for `provider`, then runs `task` while holding a
    /// concurrency permit. Only `concurrency` tasks run at once per provider;
    /// tasks for other providers are unaffected.
    pub async fn submit<F, Fut, T>(
        &self,
        provider: &ProviderId,
        concurrency: usize,
        buffer_size: usize,
        drop_excess: bool,
        task: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let pool = self
            .pool_for(provider, concurrency, buffer_size, drop_excess)
            .await;

        if pool.shutdown.is_cancelled() {
            return Err(CoreError::cancelled());
        }

        match &pool.admission {
            None => {
                // DropExcessRequests=true (or BufferSize=0): no free permit
                // and no queue means "full" — try_acquire fails fast.
                let Ok(permit) = pool.semaphore.clone().try_acquire_owned() else {
                    return Err(CoreError::worker_queue_full(provider.as_str()));
                };
                let result = task().await;
                drop(permit);
                Ok(result)
            }
            Some(admission) => {
                // Blocks until either a queue slot is reserved (bounded by
                // BufferSize) or cleanup cancels this provider's pool — a
                // task still waiting to be admitted is "queued", so it is
                // cancelled rather than left to wait indefinitely.
                let reservation = tokio::select! {
                    biased;
                    _ = pool.shutdown.cancelled() => return Err(CoreError::cancelled()),
                    res = admission.reserve() => res.map_err(|_| CoreError::cancelled())?,
                };

                // Already dequeued but still waiting for a concurrency slot:
                // still pre-execution, so also cancellable on shutdown.
                let permit = tokio::select! {
                    biased;
                    _ = pool.shutdown.cancelled() => return Err(CoreError::cancelled()),
                    res = pool.semaphore.clone().acquire_owned() => res.map_err(|_| CoreError::cancelled())?,
                };
                drop(reservation);

                let result = task().await;
                drop(permit);
                Ok(result)
            }
        }
    }

    /// `Cleanup`: closes the admission gate for `provider`, cancelling any
    /// task still queued or waiting for a concurrency slot with
    /// `RequestCancelled`, then waits for tasks already executing (holding a
    /// permit) to finish, bounded by `drain_timeout` (the provider's own
    /// `request_timeout_ms`) before returning.
    pub async fn cleanup(&self, provider_key: &str, drain_timeout: std::time::Duration) {
        let pool = {
            let pools = self.pools.read().await;
            pools.get(provider_key).cloned()
        };
        let Some(pool) = pool else { return };
        pool.shutdown.cancel();
        let _ = tokio::time::timeout(drain_timeout, pool.semaphore.acquire_many(pool.concurrency as u32)).await;
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_at_most_concurrency_tasks_at_once() {
        let manager = WorkerPoolManager::new();
        let provider = ProviderId::OpenAI;
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            let manager = &manager;
            let provider = provider.clone();
            handles.push(async move {
                manager
                    .submit(&provider, 2, 8, false, || async move {
                        let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(cur, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            });
        }
        futures_util::future::join_all(handles).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn drop_excess_rejects_when_no_permits_free() {
        let manager = WorkerPoolManager::new();
        let provider = ProviderId::OpenAI;

        let manager = Arc::new(manager);
        let m1 = manager.clone();
        let p1 = provider.clone();
        let holder = tokio::spawn(async move {
            m1.submit(&p1, 1, 1, true, || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = manager
            .submit(&provider, 1, 1, true, || async {})
            .await
            .unwrap_err();
        assert_eq!(err.kind, ferrogate_common::ErrorKind::WorkerQueueFull);
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cleanup_rejects_new_submissions() {
        let manager = WorkerPoolManager::new();
        let provider = ProviderId::OpenAI;
        manager
            .submit(&provider, 1, 1, false, || async {})
            .await
            .unwrap();
        manager.cleanup(&provider.to_string(), Duration::from_millis(50)).await;

        let err = manager
            .submit(&provider, 1, 1, false, || async {})
            .await
            .unwrap_err();
        assert_eq!(err.kind, ferrogate_common::ErrorKind::RequestCancelled);
    }

    #[tokio::test]
    async fn cleanup_cancels_a_task_still_blocked_on_admission() {
        let manager = Arc::new(WorkerPoolManager::new());
        let provider = ProviderId::OpenAI;

        // Occupy the only concurrency permit so the next submit blocks on
        // acquiring one, then queue a second task behind a buffer of 1.
        let m1 = manager.clone();
        let p1 = provider.clone();
        let holder = tokio::spawn(async move {
            m1.submit(&p1, 1, 1, false, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let m2 = manager.clone();
        let p2 = provider.clone();
        let queued = tokio::spawn(async move { m2.submit(&p2, 1, 1, false, || async {}).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager
            .cleanup(&provider.to_string(), Duration::from_millis(10))
            .await;

        let err = queued.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ferrogate_common::ErrorKind::RequestCancelled);
        holder.abort();
    }

    #[tokio::test]
    async fn cleanup_waits_for_in_flight_task_within_drain_timeout() {
        let manager = Arc::new(WorkerPoolManager::new());
        let provider = ProviderId::OpenAI;
        let finished = Arc::new(AtomicU32::new(0));

        let m1 = manager.clone();
        let p1 = provider.clone();
        let f1 = finished.clone();
        let holder = tokio::spawn(async move {
            m1.submit(&p1, 1, 1, false, || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                f1.store(1, Ordering::SeqCst);
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager
            .cleanup(&provider.to_string(), Duration::from_millis(200))
            .await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        holder.await.unwrap().unwrap();
    }
}

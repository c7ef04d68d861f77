use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::device::DeviceSlot;
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct QueueStats {
    submitted: u64,
    completed: u64,
    failed: u64,
    rejected: u64,
    timed_out: u64,
    total_processing_time: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatsSnapshot {
    pub capacity: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub avg_processing_ms: f64,
}

/// Bounded admission in front of the blocking thread pool.
///
/// A job holds one admission slot from submission until its blocking work
/// actually returns, and one permit of its device while it runs. Submissions
/// beyond `capacity` are refused at once rather than queued.
pub struct InferenceQueue {
    capacity: usize,
    timeout: Duration,
    admission: Arc<Semaphore>,
    shutdown: CancellationToken,
    next_job_id: AtomicU64,
    stats: Arc<RwLock<QueueStats>>,
}

impl InferenceQueue {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            timeout,
            admission: Arc::new(Semaphore::new(capacity)),
            shutdown: CancellationToken::new(),
            next_job_id: AtomicU64::new(0),
            stats: Arc::new(RwLock::new(QueueStats::default())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `job` on the blocking pool under a device permit and the queue
    /// deadline. The job receives a token that is cancelled when the deadline
    /// passes or the queue shuts down, and should check it between steps.
    pub async fn submit<T, F>(&self, operation: &'static str, slot: &DeviceSlot, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T> + Send + 'static,
    {
        let admission = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.stats.write().rejected += 1;
                warn!(operation, capacity = self.capacity, "Inference queue full, rejecting job");
                return Err(EngineError::QueueFull {
                    capacity: self.capacity,
                });
            }
            Err(TryAcquireError::Closed) => return Err(EngineError::Shutdown),
        };

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = self.shutdown.child_token();
        let span = tracing::info_span!("job", id, operation, device = %slot.label());
        self.stats.write().submitted += 1;

        let start = Instant::now();
        let slot = slot.clone();
        let token = cancel.clone();
        let blocking_span = span.clone();
        let work = async move {
            let device_permit = slot.acquire().await?;
            debug!(waited_ms = start.elapsed().as_millis() as u64, "Device acquired");
            tokio::task::spawn_blocking(move || {
                let _admission = admission;
                let _device_permit = device_permit;
                let _enter = blocking_span.enter();
                job(&token)
            })
            .await
            .map_err(|e| EngineError::inference(format!("inference task failed: {e}")))?
        }
        .instrument(span.clone());

        let outcome = tokio::time::timeout(self.timeout, work).await;
        let elapsed = start.elapsed();
        let _enter = span.enter();
        match outcome {
            Ok(Ok(value)) => {
                let mut stats = self.stats.write();
                stats.completed += 1;
                stats.total_processing_time += elapsed;
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                Ok(value)
            }
            Ok(Err(e)) => {
                self.stats.write().failed += 1;
                error!(error = %e, "Job failed");
                Err(e)
            }
            Err(_) => {
                cancel.cancel();
                self.stats.write().timed_out += 1;
                warn!(timeout_secs = self.timeout.as_secs_f64(), "Job timed out, cancelling");
                Err(EngineError::Timeout {
                    operation: operation.to_string(),
                    duration: self.timeout,
                })
            }
        }
    }

    /// Stop admitting jobs and cancel the ones in flight.
    pub fn shutdown(&self) {
        info!("Shutting down inference queue");
        self.admission.close();
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        let stats = self.stats.read();
        let avg_processing_ms = if stats.completed > 0 {
            stats.total_processing_time.as_secs_f64() * 1000.0 / stats.completed as f64
        } else {
            0.0
        };
        QueueStatsSnapshot {
            capacity: self.capacity,
            in_flight: self.capacity - self.admission.available_permits(),
            submitted: stats.submitted,
            completed: stats.completed,
            failed: stats.failed,
            rejected: stats.rejected,
            timed_out: stats.timed_out,
            avg_processing_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceManager;
    use std::sync::atomic::AtomicBool;

    fn cpu_slot(concurrency: usize) -> DeviceSlot {
        DeviceManager::new("cpu", concurrency)
            .unwrap()
            .resolve(None)
            .unwrap()
    }

    /// Blocks until cancelled or `limit` passes.
    fn wait_for_cancel(token: &CancellationToken, limit: Duration) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < limit {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_job_completion() {
        let queue = InferenceQueue::new(4, Duration::from_secs(5));
        let slot = cpu_slot(1);
        let value = queue.submit("classify", &slot, |_| Ok(41 + 1)).await.unwrap();
        assert_eq!(value, 42);

        let err = queue
            .submit("classify", &slot, |_| -> Result<()> { Err(EngineError::inference("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Inference { .. }));

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_immediately() {
        let queue = Arc::new(InferenceQueue::new(1, Duration::from_secs(5)));
        let slot = cpu_slot(1);

        let busy = {
            let queue = queue.clone();
            let slot = slot.clone();
            tokio::spawn(async move {
                queue
                    .submit("generate", &slot, |_| {
                        std::thread::sleep(Duration::from_millis(200));
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let err = queue.submit("generate", &slot, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { capacity: 1 }));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(queue.stats().rejected, 1);

        busy.await.unwrap().unwrap();
        queue.submit("generate", &slot, |_| Ok(())).await.unwrap();
    }

    #[tokio::test]
    async fn test_device_permit_serialises_jobs() {
        let queue = Arc::new(InferenceQueue::new(8, Duration::from_secs(5)));
        let slot = cpu_slot(1);
        let running = Arc::new(AtomicU64::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let jobs: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let slot = slot.clone();
                let running = running.clone();
                let overlap = overlap.clone();
                tokio::spawn(async move {
                    queue
                        .submit("generate", &slot, move |_| {
                            if running.fetch_add(1, Ordering::SeqCst) > 0 {
                                overlap.store(true, Ordering::SeqCst);
                            }
                            std::thread::sleep(Duration::from_millis(10));
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for job in futures::future::join_all(jobs).await {
            job.unwrap().unwrap();
        }
        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timeout_cancels_job() {
        let queue = InferenceQueue::new(2, Duration::from_millis(50));
        let slot = cpu_slot(1);
        let observed = Arc::new(AtomicBool::new(false));

        let flag = observed.clone();
        let err = queue
            .submit("generate", &slot, move |token| {
                let result = wait_for_cancel(token, Duration::from_secs(5));
                flag.store(result.is_err(), Ordering::SeqCst);
                result
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observed.load(Ordering::SeqCst));
        assert_eq!(queue.stats().timed_out, 1);
        assert_eq!(queue.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_jobs() {
        let queue = InferenceQueue::new(2, Duration::from_secs(1));
        let slot = cpu_slot(1);
        queue.shutdown();
        assert!(queue.is_shut_down());
        let err = queue.submit("classify", &slot, |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, EngineError::Shutdown));
    }
}

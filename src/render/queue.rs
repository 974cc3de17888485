use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, SystemTime},
};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::{
    sync::{Semaphore, SemaphorePermit},
    time::{Instant, sleep, timeout},
};
use tracing::{debug, warn};

use super::{
    config::EngineConfig,
    error::{BoxError, DrawingError},
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bounded-concurrency gate for drawing jobs.
///
/// At most `max_concurrent` jobs hold a drawing permit; at most
/// `max_queue_size` more may wait for one. Anything beyond that is rejected
/// with [`DrawingError::QueueFull`] instead of queueing without bound.
#[derive(Debug)]
pub struct DrawingQueue {
    permits: Semaphore,
    capacity: AtomicUsize,
    /// Permits still to be withdrawn after a shrinking reload.
    permit_debt: AtomicUsize,
    max_queue_size: AtomicUsize,
    drawing_timeout_ms: AtomicU64,
    idle_timeout_ms: AtomicU64,
    pending: AtomicUsize,
    active: AtomicUsize,
    draining: AtomicBool,
    epoch: Instant,
    epoch_wall: SystemTime,
    last_activity_ms: AtomicU64,
}

/// Immutable snapshot of the queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub active_count: usize,
    pub is_full: bool,
    pub last_activity: SystemTime,
}

impl DrawingQueue {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            permits: Semaphore::new(config.max_concurrent),
            capacity: AtomicUsize::new(config.max_concurrent),
            permit_debt: AtomicUsize::new(0),
            max_queue_size: AtomicUsize::new(config.max_queue_size),
            drawing_timeout_ms: AtomicU64::new(duration_ms(config.drawing_timeout)),
            idle_timeout_ms: AtomicU64::new(duration_ms(config.idle_timeout)),
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            epoch: Instant::now(),
            epoch_wall: SystemTime::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Run `job` once a drawing permit is available.
    ///
    /// The job future is dropped, and thereby cancelled, when it outlives the
    /// drawing timeout. Counters and the permit are restored on every exit
    /// path, including unwinding.
    pub async fn submit<T, F>(&self, job: F) -> Result<T, DrawingError>
    where
        F: Future<Output = Result<T, BoxError>>,
    {
        let capacity = self.max_queue_size.load(Ordering::Acquire);
        if self.pending.load(Ordering::Acquire) >= capacity {
            return Err(self.reject(capacity));
        }

        while self.draining.load(Ordering::Acquire) {
            sleep(DRAIN_POLL_INTERVAL).await;
        }

        let pending = PendingSlot::enter(self)?;
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DrawingError::Closed)?;
        drop(pending);

        let active = ActiveSlot::enter(self, permit);
        let deadline = Duration::from_millis(self.drawing_timeout_ms.load(Ordering::Acquire));
        let outcome = timeout(deadline, job).await;
        histogram!("feedcard_drawing_ms").record(active.started.elapsed().as_secs_f64() * 1000.0);
        drop(active);

        match outcome {
            Ok(result) => {
                counter!("feedcard_drawing_completed_total").increment(1);
                result.map_err(DrawingError::Job)
            }
            Err(_) => {
                counter!("feedcard_drawing_timeout_total").increment(1);
                warn!(
                    target = "render::queue",
                    op = "submit",
                    result = "timeout",
                    timeout_ms = deadline.as_millis() as u64,
                    "Drawing job cancelled at its deadline"
                );
                Err(DrawingError::Timeout { after: deadline })
            }
        }
    }

    /// Pause new admissions and wait until no job is drawing.
    ///
    /// Jobs already waiting for a permit keep their place; only submissions
    /// that have not yet been counted as pending are held back.
    pub async fn await_all_completed(&self) {
        self.draining.store(true, Ordering::Release);
        let _reset = DrainFlag(&self.draining);
        while self.active.load(Ordering::Acquire) > 0 {
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    pub fn status(&self) -> QueueStatus {
        let pending_count = self.pending.load(Ordering::Acquire);
        QueueStatus {
            pending_count,
            active_count: self.active.load(Ordering::Acquire),
            is_full: pending_count >= self.max_queue_size.load(Ordering::Acquire),
            last_activity: self.epoch_wall
                + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire)),
        }
    }

    pub fn is_idle_timeout(&self) -> bool {
        let idle_timeout = Duration::from_millis(self.idle_timeout_ms.load(Ordering::Acquire));
        self.active.load(Ordering::Acquire) == 0 && self.idle_for() >= idle_timeout
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Refuse further work. Waiters and later submissions get [`DrawingError::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }

    /// Apply limits from a reloaded configuration.
    ///
    /// Growing adds permits immediately. Shrinking withdraws idle permits now
    /// and the remainder as running jobs hand theirs back.
    pub fn apply_limits(&self, config: &EngineConfig) {
        self.max_queue_size
            .store(config.max_queue_size, Ordering::Release);
        self.drawing_timeout_ms
            .store(duration_ms(config.drawing_timeout), Ordering::Release);
        self.idle_timeout_ms
            .store(duration_ms(config.idle_timeout), Ordering::Release);

        let previous = self.capacity.swap(config.max_concurrent, Ordering::AcqRel);
        if config.max_concurrent > previous {
            let mut grow = config.max_concurrent - previous;
            let settled = self.settle_debt(grow);
            grow -= settled;
            if grow > 0 {
                self.permits.add_permits(grow);
            }
        } else if config.max_concurrent < previous {
            let shrink = previous - config.max_concurrent;
            let withdrawn = self.permits.forget_permits(shrink);
            self.permit_debt
                .fetch_add(shrink - withdrawn, Ordering::AcqRel);
        }

        debug!(
            target = "render::queue",
            op = "apply_limits",
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            permit_debt = self.permit_debt.load(Ordering::Acquire),
            "Drawing queue limits updated"
        );
    }

    fn reject(&self, capacity: usize) -> DrawingError {
        counter!("feedcard_drawing_rejected_total").increment(1);
        warn!(
            target = "render::queue",
            op = "submit",
            result = "queue_full",
            capacity,
            "Drawing queue is full; rejecting job"
        );
        DrawingError::QueueFull { capacity }
    }

    fn settle_debt(&self, available: usize) -> usize {
        let mut settled = 0;
        let _ = self
            .permit_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| {
                settled = debt.min(available);
                Some(debt - settled)
            });
        settled
    }

    fn take_one_debt(&self) -> bool {
        self.permit_debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok()
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(duration_ms(self.epoch.elapsed()), Ordering::Release);
    }

    fn publish_gauges(&self) {
        gauge!("feedcard_drawing_pending").set(self.pending.load(Ordering::Acquire) as f64);
        gauge!("feedcard_drawing_active").set(self.active.load(Ordering::Acquire) as f64);
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

struct PendingSlot<'a> {
    queue: &'a DrawingQueue,
}

impl<'a> PendingSlot<'a> {
    fn enter(queue: &'a DrawingQueue) -> Result<Self, DrawingError> {
        let capacity = queue.max_queue_size.load(Ordering::Acquire);
        queue
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (pending < capacity).then_some(pending + 1)
            })
            .map_err(|_| queue.reject(capacity))?;
        queue.publish_gauges();
        Ok(Self { queue })
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.queue.pending.fetch_sub(1, Ordering::AcqRel);
        self.queue.publish_gauges();
    }
}

struct ActiveSlot<'a> {
    queue: &'a DrawingQueue,
    permit: Option<SemaphorePermit<'a>>,
    started: Instant,
}

impl<'a> ActiveSlot<'a> {
    fn enter(queue: &'a DrawingQueue, permit: SemaphorePermit<'a>) -> Self {
        queue.active.fetch_add(1, Ordering::AcqRel);
        queue.touch();
        queue.publish_gauges();
        Self {
            queue,
            permit: Some(permit),
            started: Instant::now(),
        }
    }
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.queue.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(permit) = self.permit.take() {
            if self.queue.take_one_debt() {
                permit.forget();
            } else {
                drop(permit);
            }
        }
        self.queue.touch();
        self.queue.publish_gauges();
    }
}

struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    fn config(max_concurrent: usize, max_queue_size: usize) -> EngineConfig {
        EngineConfig {
            max_concurrent,
            max_queue_size,
            drawing_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            ..Default::default()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_beyond_concurrency_plus_backlog() {
        let queue = Arc::new(DrawingQueue::new(&config(2, 3)));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut blocked = Vec::new();
        for _ in 0..5 {
            let queue = Arc::clone(&queue);
            let mut release = release_rx.clone();
            blocked.push(tokio::spawn(async move {
                queue
                    .submit(async move {
                        let _ = release.wait_for(|open| *open).await;
                        Ok::<_, BoxError>(())
                    })
                    .await
            }));
        }
        settle().await;

        let status = queue.status();
        assert_eq!(status.active_count, 2);
        assert_eq!(status.pending_count, 3);
        assert!(status.is_full);

        let rejected = queue.submit(async { Ok::<_, BoxError>(()) }).await;
        assert!(matches!(rejected, Err(DrawingError::QueueFull { capacity: 3 })));

        release_tx.send(true).expect("release blocked jobs");
        for handle in blocked {
            handle.await.expect("join").expect("job completes");
        }
        let status = queue.status();
        assert_eq!((status.active_count, status.pending_count), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_slow_jobs_and_frees_the_slot() {
        let queue = DrawingQueue::new(&EngineConfig {
            drawing_timeout: Duration::from_millis(200),
            ..config(1, 1)
        });

        let result = queue
            .submit(async {
                sleep(Duration::from_secs(10)).await;
                Ok::<_, BoxError>(())
            })
            .await;
        assert!(matches!(result, Err(DrawingError::Timeout { after }) if after == Duration::from_millis(200)));
        assert_eq!(queue.status().active_count, 0);

        let value = queue.submit(async { Ok::<_, BoxError>(7) }).await;
        assert_eq!(value.expect("slot was freed"), 7);
    }

    #[tokio::test]
    async fn job_errors_are_wrapped() {
        let queue = DrawingQueue::new(&config(1, 1));
        let result = queue
            .submit(async { Err::<(), BoxError>("bad layout".into()) })
            .await;
        assert!(matches!(result, Err(DrawingError::Job(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_holds_new_admissions_until_idle() {
        let queue = Arc::new(DrawingQueue::new(&config(1, 4)));
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let running = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .submit(async move {
                        let _ = finish_rx.await;
                        Ok::<_, BoxError>(())
                    })
                    .await
            })
        };
        settle().await;
        assert_eq!(queue.status().active_count, 1);

        let drain = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.await_all_completed().await })
        };
        settle().await;
        assert!(queue.is_draining());

        let late = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.submit(async { Ok::<_, BoxError>(()) }).await })
        };
        sleep(Duration::from_millis(350)).await;
        assert_eq!(queue.status().pending_count, 0);
        assert!(!late.is_finished());

        finish_tx.send(()).expect("finish running job");
        running.await.expect("join").expect("running job");
        drain.await.expect("drain completes");
        assert!(!queue.is_draining());
        late.await.expect("join").expect("late job admitted after drain");
    }

    #[tokio::test]
    async fn closed_queue_refuses_work() {
        let queue = DrawingQueue::new(&config(1, 1));
        queue.close();
        let result = queue.submit(async { Ok::<_, BoxError>(()) }).await;
        assert!(matches!(result, Err(DrawingError::Closed)));
        assert_eq!(queue.status().pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_tracks_last_activity() {
        let queue = DrawingQueue::new(&EngineConfig {
            idle_timeout: Duration::from_secs(30),
            ..config(1, 1)
        });
        queue
            .submit(async { Ok::<_, BoxError>(()) })
            .await
            .expect("job");
        assert!(!queue.is_idle_timeout());

        sleep(Duration::from_secs(31)).await;
        assert!(queue.is_idle_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn shrinking_withdraws_permits_as_jobs_finish() {
        let queue = Arc::new(DrawingQueue::new(&config(2, 4)));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut running = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            let mut release = release_rx.clone();
            running.push(tokio::spawn(async move {
                queue
                    .submit(async move {
                        let _ = release.wait_for(|open| *open).await;
                        Ok::<_, BoxError>(())
                    })
                    .await
            }));
        }
        settle().await;
        assert_eq!(queue.status().active_count, 2);

        queue.apply_limits(&config(1, 4));
        release_tx.send(true).expect("release");
        for handle in running {
            handle.await.expect("join").expect("job");
        }
        assert_eq!(queue.permits.available_permits(), 1);

        queue.apply_limits(&config(3, 4));
        assert_eq!(queue.permits.available_permits(), 3);
    }
}

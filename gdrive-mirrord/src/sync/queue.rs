use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;
type Starter<T, E> = Box<dyn FnOnce() -> BoxFuture<T, E> + Send>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum JobError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("job was dropped before it ran")]
    Cancelled,
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Failure report published on the pool's error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolError {
    pub job_id: u64,
    pub message: String,
}

/// Deferred unit of work. Dropping it unrun settles its handle with
/// [`JobError::Cancelled`].
pub struct Job<T, E> {
    pub id: u64,
    starter: Starter<T, E>,
    result: oneshot::Sender<Result<T, JobError<E>>>,
}

impl<T, E> Job<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    /// Runs the job on its own task so a panic settles only this job.
    async fn run(self) -> Result<(), String> {
        let starter = self.starter;
        let outcome = match tokio::spawn(async move { starter().await }).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JobError::Failed(err)),
            Err(join) => Err(JobError::Panicked(join.to_string())),
        };
        let report = match &outcome {
            Ok(_) => Ok(()),
            Err(err) => Err(err.to_string()),
        };
        // The caller may have stopped waiting; the job still counts as settled.
        let _ = self.result.send(outcome);
        report
    }
}

pub struct JobHandle<T, E> {
    id: u64,
    rx: oneshot::Receiver<Result<T, JobError<E>>>,
}

impl<T, E> JobHandle<T, E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn result(self) -> Result<T, JobError<E>> {
        self.rx.await.unwrap_or(Err(JobError::Cancelled))
    }
}

/// Strict FIFO of deferred jobs.
pub struct JobQueue<T, E> {
    inner: VecDeque<Job<T, E>>,
    next_id: u64,
}

impl<T, E> Default for JobQueue<T, E> {
    fn default() -> Self {
        Self {
            inner: VecDeque::new(),
            next_id: 1,
        }
    }
}

impl<T, E> JobQueue<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn push<F, Fut>(&mut self, starter: F) -> JobHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.inner.push_back(Job {
            id,
            starter: Box::new(move || Box::pin(starter()) as BoxFuture<T, E>),
            result: tx,
        });
        JobHandle { id, rx }
    }
}

impl<T, E> JobQueue<T, E> {
    pub fn pop(&mut self) -> Result<Job<T, E>, QueueError> {
        self.inner.pop_front().ok_or(QueueError::Empty)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Drains a [`JobQueue`] with at most `capacity` jobs in flight.
pub struct JobPool<T, E> {
    inner: Arc<PoolInner<T, E>>,
}

struct PoolInner<T, E> {
    queue: Mutex<JobQueue<T, E>>,
    capacity: usize,
    size: AtomicUsize,
    settled: AtomicU64,
    errors: broadcast::Sender<PoolError>,
}

impl<T, E> Clone for JobPool<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> JobPool<T, E>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (errors, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PoolInner {
                queue: Mutex::new(JobQueue::default()),
                capacity: capacity.max(1),
                size: AtomicUsize::new(0),
                settled: AtomicU64::new(0),
                errors,
            }),
        }
    }

    pub fn push<F, Fut>(&self, starter: F) -> JobHandle<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.queue().push(starter)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Jobs currently in flight.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queue().len()
    }

    pub fn settled(&self) -> u64 {
        self.inner.settled.load(Ordering::SeqCst)
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<PoolError> {
        self.inner.errors.subscribe()
    }

    /// Launches `min(capacity - size, queued)` jobs and returns once every job
    /// of this batch has settled. Returns the batch size.
    pub async fn tick(&self) -> usize {
        let batch = {
            let mut queue = self.queue();
            let free = self
                .inner
                .capacity
                .saturating_sub(self.inner.size.load(Ordering::SeqCst));
            let take = free.min(queue.len());
            let mut batch = Vec::with_capacity(take);
            while batch.len() < take {
                match queue.pop() {
                    Ok(job) => batch.push(job),
                    Err(QueueError::Empty) => break,
                }
            }
            self.inner.size.fetch_add(batch.len(), Ordering::SeqCst);
            batch
        };

        let launched = batch.len();
        join_all(batch.into_iter().map(|job| self.launch(job))).await;
        launched
    }

    async fn launch(&self, job: Job<T, E>) {
        let job_id = job.id;
        let report = job.run().await;
        self.inner.size.fetch_sub(1, Ordering::SeqCst);
        self.inner.settled.fetch_add(1, Ordering::SeqCst);
        if let Err(message) = report {
            tracing::debug!(job_id, error = %message, "pool job failed");
            let _ = self.inner.errors.send(PoolError { job_id, message });
        }
    }

    /// Fires [`JobPool::tick`] every `interval` without waiting for earlier
    /// batches, so a slow job only holds its own slot.
    pub fn start(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if pool.queued() == 0 {
                            continue;
                        }
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            pool.tick().await;
                        });
                    }
                }
            }
        })
    }

    fn queue(&self) -> MutexGuard<'_, JobQueue<T, E>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::time::Instant;

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue: JobQueue<&'static str, String> = JobQueue::default();
        let first = queue.push(|| async { Ok("A") });
        let second = queue.push(|| async { Ok("B") });

        assert_eq!(queue.pop().unwrap().id, first.id());
        assert_eq!(queue.pop().unwrap().id, second.id());
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_on_empty_returns_error() {
        let mut queue: JobQueue<(), String> = JobQueue::default();
        assert!(matches!(queue.pop(), Err(QueueError::Empty)));
    }

    #[tokio::test]
    async fn dropped_job_settles_as_cancelled() {
        let mut queue: JobQueue<u32, String> = JobQueue::default();
        let handle = queue.push(|| async { Ok(1) });
        drop(queue.pop().unwrap());
        assert!(matches!(handle.result().await, Err(JobError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_bounds_wall_time_and_each_job_settles_once() {
        let pool: JobPool<usize, String> = JobPool::new(2);
        let runs = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..5)
            .map(|n| {
                let runs = Arc::clone(&runs);
                pool.push(move || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(n)
                })
            })
            .collect();

        let started = Instant::now();
        let cancel = CancellationToken::new();
        let runner = pool.start(Duration::from_millis(10), cancel.clone());

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.result().await.unwrap());
        }
        let elapsed = started.elapsed();
        cancel.cancel();
        runner.await.unwrap();

        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(pool.settled(), 5);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn tick_launches_at_most_free_slots() {
        let pool: JobPool<u32, String> = JobPool::new(2);
        let a = pool.push(|| async { Ok(1) });
        let b = pool.push(|| async { Ok(2) });
        let c = pool.push(|| async { Ok(3) });

        assert_eq!(pool.tick().await, 2);
        assert_eq!(pool.queued(), 1);
        assert_eq!(pool.tick().await, 1);
        assert_eq!(a.result().await.unwrap(), 1);
        assert_eq!(b.result().await.unwrap(), 2);
        assert_eq!(c.result().await.unwrap(), 3);
        assert_eq!(pool.tick().await, 0);
    }

    #[tokio::test]
    async fn failures_are_reported_without_aborting_siblings() {
        let pool: JobPool<u32, String> = JobPool::new(4);
        let mut errors = pool.subscribe_errors();
        let bad = pool.push(|| async { Err("disk full".to_string()) });
        let good = pool.push(|| async { Ok(7) });

        assert_eq!(pool.tick().await, 2);

        assert!(matches!(bad.result().await, Err(JobError::Failed(msg)) if msg == "disk full"));
        assert_eq!(good.result().await.unwrap(), 7);
        let reported = errors.recv().await.unwrap();
        assert_eq!(reported.message, "disk full");
    }

    #[tokio::test]
    async fn panicking_job_frees_its_slot_and_spares_siblings() {
        let pool: JobPool<u32, String> = JobPool::new(2);
        let mut errors = pool.subscribe_errors();
        let bad = pool.push(|| async { panic!("boom") });
        let good = pool.push(|| async { Ok(1) });

        assert_eq!(pool.tick().await, 2);

        assert!(matches!(bad.result().await, Err(JobError::Panicked(_))));
        assert_eq!(good.result().await.unwrap(), 1);
        assert_eq!(pool.size(), 0);
        assert!(errors.recv().await.unwrap().message.contains("panicked"));

        let next = pool.push(|| async { Ok(2) });
        assert_eq!(pool.tick().await, 1);
        assert_eq!(next.result().await.unwrap(), 2);
    }
}

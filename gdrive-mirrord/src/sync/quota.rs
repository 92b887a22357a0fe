//! Adaptive rolling-window rate limiter for remote API calls.
//!
//! Jobs wait in submission order until a tick admits them. A counted job
//! needs both a quota slot (`queries` minus counted starts inside the last
//! `seconds`) and a concurrency slot; an uncounted job only needs the latter,
//! so cheap calls can overtake counted ones stuck behind the budget.
//!
//! Rate-limit failures halve the budget, a saturated window grows it by one
//! back towards the initial limit, and no change lands sooner than `seconds`
//! after the previous one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use gdrive_core::DriveError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, SyncEvent};

pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
pub const DEFAULT_CONCURRENCY_CAP: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("invalid quota limit {queries} queries / {seconds}s")]
    InvalidLimit { queries: u32, seconds: u32 },
    #[error("quota limiter stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum RunError<E> {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("{0}")]
    Job(E),
}

impl<E> RunError<E> {
    pub fn into_job(self) -> Option<E> {
        match self {
            RunError::Job(err) => Some(err),
            RunError::Quota(_) => None,
        }
    }
}

/// Lets the limiter tell rate-limit failures apart from every other error.
pub trait QuotaSignal {
    fn is_quota_exceeded(&self) -> bool;
}

impl QuotaSignal for DriveError {
    fn is_quota_exceeded(&self) -> bool {
        self.is_rate_limited()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimit {
    pub queries: u32,
    pub seconds: u32,
    /// Unix milliseconds.
    pub effective_from: i64,
}

impl QuotaLimit {
    fn window_ms(&self) -> i64 {
        i64::from(self.seconds) * 1000
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaJob {
    pub id: u64,
    pub label: String,
    pub submitted_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
    pub counts_toward_quota: bool,
}

impl QuotaJob {
    fn is_queued(&self) -> bool {
        self.started_at.is_none()
    }

    fn is_running(&self) -> bool {
        self.started_at.is_some() && self.finished_at.is_none()
    }
}

/// Contents of `quota.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    #[serde(default)]
    pub limit: Option<QuotaLimit>,
    #[serde(default)]
    pub jobs: Vec<QuotaJob>,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub tick: Duration,
    pub concurrency_cap: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            concurrency_cap: DEFAULT_CONCURRENCY_CAP,
        }
    }
}

/// Result of one admission pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub admitted: Vec<u64>,
    pub limit_changed: Option<QuotaLimit>,
}

/// Clock-free limiter bookkeeping. Every operation takes `now` in unix
/// milliseconds.
#[derive(Debug, Default)]
pub struct QuotaState {
    limit: Option<QuotaLimit>,
    ceiling: Option<QuotaLimit>,
    jobs: Vec<QuotaJob>,
    next_id: u64,
    next_speedup_at: Option<i64>,
    changed: bool,
}

impl QuotaState {
    pub fn limit(&self) -> Option<QuotaLimit> {
        self.limit
    }

    pub fn jobs(&self) -> &[QuotaJob] {
        &self.jobs
    }

    /// Installs the starting budget unless a restored one is active, and
    /// remembers it as the ceiling for [`QuotaState::speedup`]. A restored
    /// limit above the ceiling is lowered to it. Returns the limit when it
    /// changed.
    pub fn set_initial_limit(
        &mut self,
        queries: u32,
        seconds: u32,
        now: i64,
    ) -> Result<Option<QuotaLimit>, QuotaError> {
        validate(queries, seconds)?;
        let initial = QuotaLimit {
            queries,
            seconds,
            effective_from: 0,
        };
        self.ceiling = Some(initial);
        self.next_speedup_at = Some(now + initial.window_ms());
        if let Some(current) = self.limit.as_mut() {
            if current.queries <= queries {
                return Ok(None);
            }
            current.queries = queries;
            self.changed = true;
            return Ok(Some(*current));
        }
        self.limit = Some(initial);
        self.changed = true;
        Ok(Some(initial))
    }

    /// Swaps the active limit unless the current one is younger than its own
    /// window. Returns whether the new limit was applied.
    pub fn set_limit(&mut self, queries: u32, seconds: u32, now: i64) -> Result<bool, QuotaError> {
        validate(queries, seconds)?;
        if let Some(current) = self.limit {
            if now - current.effective_from < current.window_ms() {
                tracing::debug!(queries, seconds, "quota change rejected by hysteresis");
                return Ok(false);
            }
            if current.queries == queries && current.seconds == seconds {
                return Ok(false);
            }
        }
        self.limit = Some(QuotaLimit {
            queries,
            seconds,
            effective_from: now,
        });
        self.changed = true;
        Ok(true)
    }

    /// Halves `queries`, rounding up, never below one.
    pub fn slowdown(&mut self, now: i64) -> Option<QuotaLimit> {
        let current = self.limit?;
        let queries = current.queries.div_ceil(2).max(1);
        match self.set_limit(queries, current.seconds, now) {
            Ok(true) => self.limit,
            _ => None,
        }
    }

    /// Grows `queries` by one when the window was saturated, capped at the
    /// initial limit.
    pub fn speedup(&mut self, now: i64) -> Option<QuotaLimit> {
        let current = self.limit?;
        let ceiling = self.ceiling?;
        if current.queries >= ceiling.queries || !self.saturated(&current, now) {
            return None;
        }
        match self.set_limit(current.queries + 1, current.seconds, now) {
            Ok(true) => self.limit,
            _ => None,
        }
    }

    pub fn submit(&mut self, label: &str, counts_toward_quota: bool, now: i64) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.jobs.push(QuotaJob {
            id,
            label: label.to_string(),
            submitted_at: now,
            started_at: None,
            finished_at: None,
            counts_toward_quota,
        });
        self.changed = true;
        id
    }

    /// Marks a job done. A job that never started is forgotten instead.
    pub fn finish(&mut self, id: u64, now: i64) {
        let Some(pos) = self.jobs.iter().position(|job| job.id == id) else {
            return;
        };
        if self.jobs[pos].is_queued() {
            self.jobs.remove(pos);
        } else if self.jobs[pos].finished_at.is_none() {
            self.jobs[pos].finished_at = Some(now);
        } else {
            return;
        }
        self.changed = true;
    }

    /// One limiter tick: prune, run a due speedup check, admit.
    pub fn tick(&mut self, now: i64, concurrency_cap: usize) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        let Some(limit) = self.limit else {
            return outcome;
        };
        self.prune(&limit, now);

        if let Some(due) = self.next_speedup_at
            && now >= due
        {
            outcome.limit_changed = self.speedup(now);
            let window = self.limit.map_or(limit.window_ms(), |l| l.window_ms());
            self.next_speedup_at = Some(now + window);
        }

        let limit = self.limit.unwrap_or(limit);
        let running = self.jobs.iter().filter(|job| job.is_running()).count();
        let mut concurrency_slots = concurrency_cap.saturating_sub(running);
        let mut quota_slots =
            (limit.queries as usize).saturating_sub(self.counted_within(&limit, now));

        for job in self.jobs.iter_mut().filter(|job| job.is_queued()) {
            if concurrency_slots == 0 {
                break;
            }
            if job.counts_toward_quota {
                if quota_slots == 0 {
                    continue;
                }
                quota_slots -= 1;
            }
            concurrency_slots -= 1;
            job.started_at = Some(now);
            outcome.admitted.push(job.id);
        }
        if !outcome.admitted.is_empty() {
            self.changed = true;
        }
        outcome
    }

    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            limit: self.limit,
            jobs: self.jobs.clone(),
        }
    }

    /// Restores a saved limit and window history. Unstarted jobs lost their
    /// work with the old process and are dropped; interrupted ones are
    /// treated as finished so they still count against the window.
    pub fn restore(&mut self, snapshot: QuotaSnapshot) {
        if let Some(limit) = snapshot.limit
            && validate(limit.queries, limit.seconds).is_ok()
        {
            self.limit = Some(limit);
        }
        self.jobs = snapshot
            .jobs
            .into_iter()
            .filter_map(|mut job| {
                let started = job.started_at?;
                job.finished_at.get_or_insert(started);
                Some(job)
            })
            .collect();
        self.next_id = self.jobs.iter().map(|job| job.id).max().unwrap_or(0);
        self.changed = true;
    }

    fn prune(&mut self, limit: &QuotaLimit, now: i64) {
        let window_start = now - limit.window_ms();
        let before = self.jobs.len();
        self.jobs.retain(|job| match (job.started_at, job.finished_at) {
            (Some(started), Some(_)) => started >= window_start,
            _ => true,
        });
        if self.jobs.len() != before {
            self.changed = true;
        }
    }

    fn counted_within(&self, limit: &QuotaLimit, now: i64) -> usize {
        let window_start = now - limit.window_ms();
        self.jobs
            .iter()
            .filter(|job| job.counts_toward_quota)
            .filter(|job| job.started_at.is_some_and(|started| started >= window_start))
            .count()
    }

    fn saturated(&self, limit: &QuotaLimit, now: i64) -> bool {
        let waiting = self
            .jobs
            .iter()
            .any(|job| job.counts_toward_quota && job.is_queued());
        waiting && self.counted_within(limit, now) >= limit.queries as usize
    }
}

fn validate(queries: u32, seconds: u32) -> Result<(), QuotaError> {
    if queries == 0 || seconds == 0 {
        return Err(QuotaError::InvalidLimit { queries, seconds });
    }
    Ok(())
}

type SaveHandler = Arc<dyn Fn(QuotaSnapshot) + Send + Sync>;

/// Shared handle to the limiter. Nothing is admitted until
/// [`QuotaLimiter::start`] runs the tick loop.
#[derive(Clone)]
pub struct QuotaLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    state: Mutex<QuotaState>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    save_handler: Mutex<Option<SaveHandler>>,
    stopped: AtomicBool,
    config: QuotaConfig,
    events: EventBus,
    epoch_ms: i64,
    epoch: Instant,
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig, events: EventBus) -> Self {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(QuotaState::default()),
                waiters: Mutex::new(HashMap::new()),
                save_handler: Mutex::new(None),
                stopped: AtomicBool::new(false),
                config,
                events,
                epoch_ms,
                epoch: Instant::now(),
            }),
        }
    }

    /// Wall-clock milliseconds that follow the tokio clock, so paused-time
    /// tests see the window move.
    pub fn now_ms(&self) -> i64 {
        self.inner.epoch_ms + self.inner.epoch.elapsed().as_millis() as i64
    }

    pub fn limit(&self) -> Option<QuotaLimit> {
        self.state().limit()
    }

    pub fn set_initial_limit(&self, queries: u32, seconds: u32) -> Result<(), QuotaError> {
        let now = self.now_ms();
        let installed = self.state().set_initial_limit(queries, seconds, now)?;
        if let Some(limit) = installed {
            self.announce(limit);
        }
        Ok(())
    }

    pub fn set_limit(&self, queries: u32, seconds: u32) -> Result<bool, QuotaError> {
        let now = self.now_ms();
        let (applied, limit) = {
            let mut state = self.state();
            let applied = state.set_limit(queries, seconds, now)?;
            (applied, state.limit())
        };
        if applied && let Some(limit) = limit {
            self.announce(limit);
        }
        Ok(applied)
    }

    pub fn set_save_handler<F>(&self, handler: F)
    where
        F: Fn(QuotaSnapshot) + Send + Sync + 'static,
    {
        *self
            .inner
            .save_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        self.state().snapshot()
    }

    pub fn restore(&self, snapshot: QuotaSnapshot) {
        self.state().restore(snapshot);
    }

    /// Waits for admission, runs `f` and reports its result. A rate-limit
    /// failure slows the limiter down and is still returned to the caller.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        counts_toward_quota: bool,
        f: F,
    ) -> Result<T, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: QuotaSignal,
    {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state();
            let mut waiters = self.waiters();
            if self.inner.stopped.load(Ordering::SeqCst) {
                return Err(QuotaError::Stopped.into());
            }
            let id = state.submit(label, counts_toward_quota, self.now_ms());
            waiters.insert(id, tx);
            id
        };
        let guard = FinishGuard { limiter: self, id };

        rx.await.map_err(|_| QuotaError::Stopped)?;
        tracing::trace!(job_id = id, label, "quota job admitted");
        let result = f().await;

        if let Err(err) = &result
            && err.is_quota_exceeded()
        {
            let now = self.now_ms();
            let slowed = self.state().slowdown(now);
            match slowed {
                Some(limit) => {
                    tracing::warn!(
                        label,
                        queries = limit.queries,
                        seconds = limit.seconds,
                        "rate limited, slowing down"
                    );
                    self.announce(limit);
                }
                None => tracing::debug!(label, "rate limited, limit unchanged"),
            }
        }
        drop(guard);
        result.map_err(RunError::Job)
    }

    /// Spawns the tick loop. Cancelling it releases every waiting job with
    /// [`QuotaError::Stopped`].
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter.inner.config.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => limiter.tick(),
                }
            }
            {
                let mut waiters = limiter.waiters();
                limiter.inner.stopped.store(true, Ordering::SeqCst);
                waiters.clear();
            }
            tracing::debug!("quota limiter stopped");
        })
    }

    fn tick(&self) {
        let now = self.now_ms();
        let (outcome, snapshot) = {
            let mut state = self.state();
            let outcome = state.tick(now, self.inner.config.concurrency_cap);
            let snapshot = state.take_changed().then(|| state.snapshot());
            (outcome, snapshot)
        };

        if let Some(limit) = outcome.limit_changed {
            tracing::info!(
                queries = limit.queries,
                seconds = limit.seconds,
                "window saturated, speeding up"
            );
            self.announce(limit);
        }

        let mut abandoned = Vec::new();
        {
            let mut waiters = self.waiters();
            for id in outcome.admitted {
                let delivered = waiters.remove(&id).is_some_and(|tx| tx.send(()).is_ok());
                if !delivered {
                    abandoned.push(id);
                }
            }
        }
        if !abandoned.is_empty() {
            let mut state = self.state();
            for id in abandoned {
                state.finish(id, now);
            }
        }

        if let Some(snapshot) = snapshot {
            let handler = self
                .inner
                .save_handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                handler(snapshot);
            }
        }
    }

    fn announce(&self, limit: QuotaLimit) {
        self.inner.events.emit(SyncEvent::QuotaLimit {
            queries: limit.queries,
            seconds: limit.seconds,
        });
    }

    fn state(&self) -> MutexGuard<'_, QuotaState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.inner
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles the job's bookkeeping even when the caller stops polling.
struct FinishGuard<'a> {
    limiter: &'a QuotaLimiter,
    id: u64,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        let now = self.limiter.now_ms();
        self.limiter.waiters().remove(&self.id);
        self.limiter.state().finish(self.id, now);
    }
}

#[cfg(test)]
#[path = "quota_tests.rs"]
mod tests;

//! Collection job queue with repeatable schedules, bounded workers and
//! retry with exponential backoff.
//!
//! ## Job Sources
//!
//! - **Repeatable schedules**: one timer task per target, keyed by target id,
//!   enqueues a `scheduled` job every interval. Re-scheduling with a new
//!   interval cancels the old timer before arming the new one.
//! - **Manual triggers**: one-off jobs that jump ahead of scheduled ones.
//! - **Retries**: failed jobs with a transient error come back after a
//!   backoff delay until the attempt budget is spent.
//!
//! A single dispatcher task hands waiting jobs to workers, bounded by a
//! semaphore. All background tasks stop through `CancellationToken`s.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fleet::error::FleetError;
use crate::fleet::types::{QueueStats, RepeatableSchedule, TriggerKind};

/// Upper bound on a single retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// How long shutdown waits for running jobs.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One unit of work: collect metrics for a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub target_id: String,
    pub trigger: TriggerKind,
    /// 1 for the first attempt.
    pub attempt: u32,
}

impl Job {
    pub fn new(target_id: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            target_id: target_id.into(),
            trigger,
            attempt: 1,
        }
    }

    fn retry(&self) -> Self {
        Self {
            target_id: self.target_id.clone(),
            trigger: TriggerKind::Retry,
            attempt: self.attempt + 1,
        }
    }
}

/// How a job that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Nothing to do for this target any more; its schedule is removed.
    Skipped(String),
}

/// Work performed for each dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobOutcome, FleetError>;
}

struct QueuedJob {
    priority: u8,
    seq: u64,
    job: Job,
}

impl QueuedJob {
    fn priority_of(trigger: TriggerKind) -> u8 {
        match trigger {
            TriggerKind::Manual => 2,
            TriggerKind::Retry => 1,
            TriggerKind::Scheduled => 0,
        }
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // Max-heap: higher priority first, then FIFO
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Repeatable {
    interval: Duration,
    token: CancellationToken,
    next_run_at: Arc<Mutex<Instant>>,
}

/// Settings for [`SchedulingQueue`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    /// Total attempts per job, the first one included.
    pub attempts: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub backoff: Duration,
}

pub struct SchedulingQueue {
    handler: Arc<dyn JobHandler>,
    settings: QueueSettings,
    waiting: Mutex<BinaryHeap<QueuedJob>>,
    seq: AtomicU64,
    notify: Arc<Notify>,
    workers: Arc<Semaphore>,
    repeatables: DashMap<String, Repeatable>,
    active: AtomicUsize,
    delayed: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    paused: AtomicBool,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulingQueue {
    pub fn new(handler: Arc<dyn JobHandler>, settings: QueueSettings) -> Self {
        let concurrency = settings.concurrency.max(1);
        Self {
            handler,
            settings: QueueSettings {
                concurrency,
                attempts: settings.attempts.max(1),
                backoff: settings.backoff,
            },
            waiting: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
            workers: Arc::new(Semaphore::new(concurrency)),
            repeatables: DashMap::new(),
            active: AtomicUsize::new(0),
            delayed: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Start handing waiting jobs to workers. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let Ok(mut dispatcher) = self.dispatcher.lock() else {
            return;
        };
        if dispatcher.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let workers = self.workers.clone();
        let notify = self.notify.clone();
        let token = self.shutdown.clone();
        *dispatcher = Some(tokio::spawn(dispatch(weak, workers, notify, token)));
        info!(
            "Collection queue started with {} worker(s)",
            self.settings.concurrency
        );
    }

    /// Arm a repeatable schedule for `target_id`.
    ///
    /// Returns `false` when an identical schedule already exists. A different
    /// interval replaces the existing schedule, so there is never more than
    /// one per target.
    pub fn schedule(self: &Arc<Self>, target_id: &str, interval: Duration) -> bool {
        let interval = interval.max(Duration::from_millis(1));

        let repeatable = match self.repeatables.entry(target_id.to_string()) {
            Entry::Occupied(existing) if existing.get().interval == interval => return false,
            Entry::Occupied(mut existing) => {
                let repeatable = self.spawn_repeatable(target_id, interval);
                let previous = existing.insert(repeatable);
                previous.token.cancel();
                info!(
                    "Re-armed schedule for {}: {:?} -> {:?}",
                    target_id, previous.interval, interval
                );
                return true;
            }
            Entry::Vacant(slot) => slot.insert(self.spawn_repeatable(target_id, interval)),
        };
        info!(
            "Scheduled metrics collection for {} every {:?}",
            target_id, repeatable.interval
        );
        true
    }

    fn spawn_repeatable(self: &Arc<Self>, target_id: &str, interval: Duration) -> Repeatable {
        let token = self.shutdown.child_token();
        let next_run_at = Arc::new(Mutex::new(Instant::now() + interval));

        let weak = Arc::downgrade(self);
        let task_token = token.clone();
        let task_next = next_run_at.clone();
        let target_id = target_id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(queue) = weak.upgrade() else { break };
                        if let Ok(mut next) = task_next.lock() {
                            *next = Instant::now() + interval;
                        }
                        queue.push_scheduled(&target_id);
                    }
                }
            }
            debug!("Schedule for {} stopped", target_id);
        });

        Repeatable {
            interval,
            token,
            next_run_at,
        }
    }

    /// Remove the repeatable schedule of `target_id`, if any.
    pub fn unschedule(&self, target_id: &str) -> bool {
        match self.repeatables.remove(target_id) {
            Some((_, repeatable)) => {
                repeatable.token.cancel();
                info!("Removed metrics schedule for {}", target_id);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, target_id: &str) -> bool {
        self.repeatables.contains_key(target_id)
    }

    pub fn schedule_interval(&self, target_id: &str) -> Option<Duration> {
        self.repeatables.get(target_id).map(|r| r.interval)
    }

    /// Enqueue a one-off job ahead of scheduled ones.
    pub fn enqueue(&self, target_id: &str) {
        self.push(Job::new(target_id, TriggerKind::Manual));
    }

    /// Scheduled jobs are dropped while one for the same target is waiting.
    fn push_scheduled(&self, target_id: &str) {
        let duplicate = self.waiting.lock().is_ok_and(|waiting| {
            waiting
                .iter()
                .any(|q| q.job.target_id == target_id && q.job.trigger == TriggerKind::Scheduled)
        });
        if duplicate {
            debug!("Collection for {} already waiting, skipping tick", target_id);
            return;
        }
        self.push(Job::new(target_id, TriggerKind::Scheduled));
    }

    fn push(&self, job: Job) {
        let queued = QueuedJob {
            priority: QueuedJob::priority_of(job.trigger),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            job,
        };
        debug!(
            "Queued {} job for {} (attempt {})",
            queued.job.trigger, queued.job.target_id, queued.job.attempt
        );
        if let Ok(mut waiting) = self.waiting.lock() {
            waiting.push(queued);
        }
        self.notify.notify_one();
    }

    fn pop_ready(&self) -> Option<Job> {
        if self.paused.load(Ordering::SeqCst) {
            return None;
        }
        self.waiting
            .lock()
            .ok()
            .and_then(|mut waiting| waiting.pop())
            .map(|queued| queued.job)
    }

    /// Delay before the attempt following `attempt`.
    pub(crate) fn retry_delay(&self, attempt: u32) -> Duration {
        ExponentialBuilder::default()
            .with_min_delay(self.settings.backoff)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_factor(2.0)
            .with_max_times(self.settings.attempts as usize)
            .build()
            .nth(attempt.saturating_sub(1) as usize)
            .unwrap_or(MAX_RETRY_DELAY)
    }

    async fn run_job(self: Arc<Self>, job: Job) {
        let result = self.handler.handle(&job).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(JobOutcome::Completed) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(JobOutcome::Skipped(reason)) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                info!("Skipped collection for {}: {}", job.target_id, reason);
                self.unschedule(&job.target_id);
            }
            Err(e) => {
                if matches!(e, FleetError::CircuitOpen { .. }) {
                    self.unschedule(&job.target_id);
                }

                if e.is_retryable() && job.attempt < self.settings.attempts {
                    let delay = self.retry_delay(job.attempt);
                    warn!(
                        "Collection for {} failed (attempt {}/{}), retrying in {:?}: {}",
                        job.target_id, job.attempt, self.settings.attempts, delay, e
                    );
                    self.retry_later(job.retry(), delay);
                } else {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    error!(
                        "Collection for {} failed permanently after {} attempt(s): {}",
                        job.target_id, job.attempt, e
                    );
                }
            }
        }
    }

    fn retry_later(self: &Arc<Self>, job: Job, delay: Duration) {
        self.delayed.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(queue) = weak.upgrade() {
                        queue.delayed.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                _ = tokio::time::sleep(delay) => {
                    if let Some(queue) = weak.upgrade() {
                        queue.delayed.fetch_sub(1, Ordering::SeqCst);
                        queue.push(job);
                    }
                }
            }
        });
    }

    /// Stop dispatching; waiting jobs and schedules are kept.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Collection queue paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        info!("Collection queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Drop waiting jobs and reset the completed and failed counters.
    ///
    /// Returns the number of waiting jobs dropped.
    pub fn clean(&self) -> usize {
        let dropped = self
            .waiting
            .lock()
            .map(|mut waiting| {
                let count = waiting.len();
                waiting.clear();
                count
            })
            .unwrap_or(0);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        info!("Cleaned collection queue, dropped {} waiting job(s)", dropped);
        dropped
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let mut repeatable: Vec<RepeatableSchedule> = self
            .repeatables
            .iter()
            .map(|entry| {
                let next = entry
                    .next_run_at
                    .lock()
                    .map(|next| *next)
                    .unwrap_or(now);
                let remaining = next.saturating_duration_since(now);
                RepeatableSchedule {
                    target_id: entry.key().clone(),
                    interval_secs: entry.interval.as_secs(),
                    next_run_at: (chrono::Utc::now()
                        + chrono::Duration::milliseconds(remaining.as_millis() as i64))
                    .to_rfc3339(),
                }
            })
            .collect();
        repeatable.sort_by(|a, b| a.target_id.cmp(&b.target_id));

        QueueStats {
            waiting: self.waiting.lock().map(|w| w.len()).unwrap_or(0),
            active: self.active.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            delayed: self.delayed.load(Ordering::SeqCst),
            paused: self.is_paused(),
            repeatable,
        }
    }

    /// Stop every background task and wait briefly for running jobs.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.repeatables.clear();

        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let all = self.settings.concurrency as u32;
        if tokio::time::timeout(SHUTDOWN_GRACE, self.workers.acquire_many(all))
            .await
            .is_err()
        {
            warn!(
                "Collection queue shut down with {} job(s) still running",
                self.active.load(Ordering::SeqCst)
            );
        }
        info!("Collection queue stopped");
    }
}

async fn dispatch(
    weak: Weak<SchedulingQueue>,
    workers: Arc<Semaphore>,
    notify: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = workers.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = loop {
            let Some(queue) = weak.upgrade() else { return };
            if let Some(job) = queue.pop_ready() {
                break job;
            }
            drop(queue);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = notify.notified() => {}
            }
        };

        let Some(queue) = weak.upgrade() else { return };
        queue.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            queue.run_job(job).await;
            drop(permit);
        });
    }
    debug!("Collection dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Handler that records jobs and answers from a per-target script.
    #[derive(Default)]
    struct RecordingHandler {
        jobs: Mutex<Vec<Job>>,
        failures: Mutex<HashMap<String, FleetError>>,
        skips: Mutex<HashMap<String, String>>,
        delay: Mutex<Option<Duration>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl RecordingHandler {
        fn fail(&self, target_id: &str, error: FleetError) {
            self.failures
                .lock()
                .unwrap()
                .insert(target_id.to_string(), error);
        }

        fn jobs_for(&self, target_id: &str) -> Vec<Job> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.target_id == target_id)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &Job) -> Result<JobOutcome, FleetError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.jobs.lock().unwrap().push(job.clone());

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if let Some(reason) = self.skips.lock().unwrap().get(&job.target_id) {
                return Ok(JobOutcome::Skipped(reason.clone()));
            }
            match self.failures.lock().unwrap().get(&job.target_id) {
                Some(error) => Err(error.clone()),
                None => Ok(JobOutcome::Completed),
            }
        }
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            concurrency: 5,
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    fn queue_with(handler: Arc<RecordingHandler>, settings: QueueSettings) -> Arc<SchedulingQueue> {
        let queue = Arc::new(SchedulingQueue::new(handler, settings));
        queue.start();
        queue
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    mod scheduling {
        use super::*;

        #[tokio::test]
        async fn test_interval_change_leaves_one_schedule() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler, settings());

            assert!(queue.schedule("web-1", Duration::from_secs(300)));
            assert!(!queue.schedule("web-1", Duration::from_secs(300)));
            assert!(queue.schedule("web-1", Duration::from_secs(600)));

            let stats = queue.stats();
            assert_eq!(stats.repeatable.len(), 1);
            assert_eq!(stats.repeatable[0].target_id, "web-1");
            assert_eq!(stats.repeatable[0].interval_secs, 600);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_schedule_fires_repeatedly() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler.clone(), settings());

            queue.schedule("web-1", Duration::from_millis(30));
            tokio::time::sleep(Duration::from_millis(140)).await;

            let jobs = handler.jobs_for("web-1");
            assert!(jobs.len() >= 2, "got {} jobs", jobs.len());
            assert!(jobs.iter().all(|j| j.trigger == TriggerKind::Scheduled));
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_unschedule_stops_timer() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler.clone(), settings());

            queue.schedule("web-1", Duration::from_millis(20));
            assert!(queue.unschedule("web-1"));
            assert!(!queue.unschedule("web-1"));
            settle().await;

            assert!(handler.jobs_for("web-1").is_empty());
            assert!(queue.stats().repeatable.is_empty());
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_skipped_job_removes_schedule() {
            let handler = Arc::new(RecordingHandler::default());
            handler
                .skips
                .lock()
                .unwrap()
                .insert("web-1".to_string(), "metrics disabled".to_string());
            let queue = queue_with(handler.clone(), settings());

            queue.schedule("web-1", Duration::from_millis(20));
            settle().await;

            assert!(!queue.is_scheduled("web-1"));
            assert_eq!(handler.jobs_for("web-1").len(), 1);
            queue.shutdown().await;
        }
    }

    mod dispatching {
        use super::*;

        #[tokio::test]
        async fn test_manual_job_runs() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler.clone(), settings());

            queue.enqueue("web-1");
            settle().await;

            let jobs = handler.jobs_for("web-1");
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].trigger, TriggerKind::Manual);
            assert_eq!(queue.stats().completed, 1);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_concurrency_is_bounded() {
            let handler = Arc::new(RecordingHandler::default());
            *handler.delay.lock().unwrap() = Some(Duration::from_millis(40));
            let queue = queue_with(
                handler.clone(),
                QueueSettings {
                    concurrency: 2,
                    ..settings()
                },
            );

            for i in 0..6 {
                queue.enqueue(&format!("web-{}", i));
            }
            tokio::time::sleep(Duration::from_millis(300)).await;

            assert_eq!(handler.jobs.lock().unwrap().len(), 6);
            assert_eq!(handler.max_running.load(Ordering::SeqCst), 2);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_manual_jobs_jump_the_queue() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = Arc::new(SchedulingQueue::new(handler.clone(), settings()));

            queue.push(Job::new("scheduled-1", TriggerKind::Scheduled));
            queue.push(Job::new("scheduled-2", TriggerKind::Scheduled));
            queue.enqueue("manual-1");

            assert_eq!(queue.pop_ready().unwrap().target_id, "manual-1");
            assert_eq!(queue.pop_ready().unwrap().target_id, "scheduled-1");
            assert_eq!(queue.pop_ready().unwrap().target_id, "scheduled-2");
        }

        #[tokio::test]
        async fn test_pause_holds_jobs_until_resume() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler.clone(), settings());

            queue.pause();
            queue.enqueue("web-1");
            settle().await;
            assert!(handler.jobs_for("web-1").is_empty());
            assert_eq!(queue.stats().waiting, 1);
            assert!(queue.stats().paused);

            queue.resume();
            settle().await;
            assert_eq!(handler.jobs_for("web-1").len(), 1);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_clean_drops_waiting_jobs() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = queue_with(handler.clone(), settings());

            queue.pause();
            queue.enqueue("web-1");
            queue.enqueue("web-2");
            assert_eq!(queue.clean(), 2);
            queue.resume();
            settle().await;

            assert!(handler.jobs.lock().unwrap().is_empty());
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_duplicate_scheduled_job_is_dropped() {
            let handler = Arc::new(RecordingHandler::default());
            let queue = Arc::new(SchedulingQueue::new(handler, settings()));

            queue.push_scheduled("web-1");
            queue.push_scheduled("web-1");
            queue.enqueue("web-1");

            assert_eq!(queue.stats().waiting, 2);
        }
    }

    mod retries {
        use super::*;

        #[test]
        fn test_backoff_doubles() {
            let queue = SchedulingQueue::new(
                Arc::new(RecordingHandler::default()),
                QueueSettings {
                    concurrency: 1,
                    attempts: 3,
                    backoff: Duration::from_secs(5),
                },
            );
            assert_eq!(queue.retry_delay(1), Duration::from_secs(5));
            assert_eq!(queue.retry_delay(2), Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_transient_failure_is_retried_up_to_attempts() {
            let handler = Arc::new(RecordingHandler::default());
            handler.fail("web-1", FleetError::from_transport("Connection refused"));
            let queue = queue_with(handler.clone(), settings());

            queue.enqueue("web-1");
            tokio::time::sleep(Duration::from_millis(300)).await;

            let jobs = handler.jobs_for("web-1");
            assert_eq!(jobs.len(), 3);
            assert_eq!(jobs[0].attempt, 1);
            assert_eq!(jobs[2].attempt, 3);
            assert_eq!(jobs[2].trigger, TriggerKind::Retry);
            let stats = queue.stats();
            assert_eq!(stats.failed, 1);
            assert_eq!(stats.delayed, 0);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_releases_pending_retries() {
            let handler = Arc::new(RecordingHandler::default());
            handler.fail("web-1", FleetError::from_transport("Connection reset by peer"));
            let queue = queue_with(
                handler.clone(),
                QueueSettings {
                    backoff: Duration::from_secs(60),
                    ..settings()
                },
            );

            queue.enqueue("web-1");
            settle().await;
            assert_eq!(queue.stats().delayed, 1);

            queue.shutdown().await;
            settle().await;

            assert_eq!(queue.stats().delayed, 0);
            assert_eq!(handler.jobs_for("web-1").len(), 1);
        }

        #[tokio::test]
        async fn test_permanent_failure_is_not_retried() {
            let handler = Arc::new(RecordingHandler::default());
            handler.fail("web-1", FleetError::UnsupportedPlatform("windows".into()));
            let queue = queue_with(handler.clone(), settings());

            queue.enqueue("web-1");
            settle().await;

            assert_eq!(handler.jobs_for("web-1").len(), 1);
            assert_eq!(queue.stats().failed, 1);
            queue.shutdown().await;
        }

        #[tokio::test]
        async fn test_circuit_open_removes_schedule() {
            let handler = Arc::new(RecordingHandler::default());
            handler.fail(
                "web-1",
                FleetError::CircuitOpen {
                    target_id: "web-1".into(),
                    failures: 10,
                },
            );
            let queue = queue_with(handler.clone(), settings());

            queue.schedule("web-1", Duration::from_millis(20));
            settle().await;

            assert!(!queue.is_scheduled("web-1"));
            assert_eq!(handler.jobs_for("web-1").len(), 1);
            queue.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_schedules() {
        let handler = Arc::new(RecordingHandler::default());
        let queue = queue_with(handler.clone(), settings());

        queue.schedule("web-1", Duration::from_millis(20));
        queue.shutdown().await;
        let before = handler.jobs.lock().unwrap().len();
        settle().await;

        assert_eq!(handler.jobs.lock().unwrap().len(), before);
        assert!(queue.stats().repeatable.is_empty());
    }
}

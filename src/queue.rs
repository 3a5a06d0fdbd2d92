use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Timelike, Utc};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::error::Result;

/// Completed jobs kept per queue for observability; older are dropped.
pub const COMPLETED_RETENTION: usize = 100;

/// Failed jobs kept per queue; older are dropped.
pub const FAILED_RETENTION: usize = 500;

/// The three logical queues of the subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    TrackingMonitor,
    WebhookDelivery,
    ExpirationCleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [
        QueueName::TrackingMonitor,
        QueueName::WebhookDelivery,
        QueueName::ExpirationCleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::TrackingMonitor => "tracking-monitor",
            QueueName::WebhookDelivery => "webhook-delivery",
            QueueName::ExpirationCleanup => "expiration-cleanup",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay between a failed attempt and the next one.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `base * 2^(n-1)` for the n-th failure.
    Exponential { base: Duration },
    Fixed(Duration),
}

impl Backoff {
    /// Delay after `failed_attempts` (1-based) failures.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        match self {
            Backoff::Exponential { base } => {
                let pow = 2u32.saturating_pow(failed_attempts.saturating_sub(1));
                base.saturating_mul(pow)
            }
            Backoff::Fixed(delay) => *delay,
        }
    }
}

/// Execution policy attached to a queue's consumer.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    /// Attempts per job (or per repeating invocation) before it is failed.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Random extra delay added to each back-off, up to this bound.
    pub jitter: Duration,
}

impl QueuePolicy {
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.backoff.delay(failed_attempts) + jitter
    }
}

/// Per-queue policies; defaults match the production schedule.
#[derive(Debug, Clone, Copy)]
pub struct QueuePolicies {
    pub monitor: QueuePolicy,
    pub delivery: QueuePolicy,
    pub cleanup: QueuePolicy,
}

impl Default for QueuePolicies {
    fn default() -> Self {
        Self {
            monitor: QueuePolicy {
                max_attempts: 3,
                backoff: Backoff::Exponential {
                    base: Duration::from_secs(60),
                },
                jitter: Duration::ZERO,
            },
            delivery: QueuePolicy {
                max_attempts: 4,
                backoff: Backoff::Exponential {
                    base: Duration::from_secs(60),
                },
                jitter: Duration::ZERO,
            },
            cleanup: QueuePolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::from_secs(300)),
                jitter: Duration::ZERO,
            },
        }
    }
}

impl QueuePolicies {
    pub fn get(&self, name: QueueName) -> QueuePolicy {
        match name {
            QueueName::TrackingMonitor => self.monitor,
            QueueName::WebhookDelivery => self.delivery,
            QueueName::ExpirationCleanup => self.cleanup,
        }
    }
}

/// When a repeating job fires.
#[derive(Debug, Clone, Copy)]
pub enum RepeatSchedule {
    Every(Duration),
    /// Top of every hour.
    Hourly,
}

/// A unit of work handed to a [`JobHandler`].
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub payload: Value,
    /// Failed attempts so far for this invocation; 0 on the first run.
    pub attempts_made: u32,
}

/// Consumer callback for one queue.
///
/// Returning `Err` re-schedules the job with back-off until the
/// queue's attempt budget is exhausted.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

/// Occupancy snapshot for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

/// Durable job scheduling across the three queues.
///
/// At-least-once: a handler that dies mid-job sees the job again once
/// the visibility window lapses, with its attempt counter advanced.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a one-shot job. A job id already waiting or delayed in this
    /// queue is coalesced into the existing instance.
    async fn enqueue(&self, queue: QueueName, job_id: &str, payload: Value) -> Result<()>;

    /// Add (or replace) a repeating job. At most one queued instance
    /// per job id exists at any time; a fire that would overlap a
    /// pending instance is skipped.
    async fn add_repeating(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: Value,
        schedule: RepeatSchedule,
    ) -> Result<()>;

    /// Drop the repeating schedule and any pending instance for the id.
    async fn remove_scheduled(&self, queue: QueueName, job_id: &str) -> Result<()>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts>;

    /// Attach a consumer to the queue. May be called more than once to
    /// add concurrency; handlers coordinate through the visibility
    /// window only.
    async fn process(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> Result<()>;

    /// Stop consumers. In-flight jobs are surrendered for redelivery.
    async fn close(&self) -> Result<()>;
}

/// Duration until the next top of the hour, by wall clock.
fn until_next_hour() -> Duration {
    let now = Utc::now();
    let seconds_into_hour = u64::from(now.minute()) * 60 + u64::from(now.second());
    Duration::from_secs(3600 - seconds_into_hour.min(3599))
}

fn first_fire(schedule: RepeatSchedule) -> Instant {
    match schedule {
        RepeatSchedule::Every(period) => Instant::now() + period,
        RepeatSchedule::Hourly => Instant::now() + until_next_hour(),
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Delayed entry ordered earliest-first.
#[derive(Debug)]
struct DelayedJob {
    due: Instant,
    id: String,
}

impl Eq for DelayedJob {}

impl PartialEq for DelayedJob {
    fn eq(&self, other: &Self) -> bool {
        self.due.eq(&other.due)
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.due.cmp(&self.due)
    }
}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct JobRecord {
    payload: Value,
    attempts_made: u32,
}

struct RepeatState {
    payload: Value,
    schedule: RepeatSchedule,
    next_fire: Instant,
}

#[derive(Default)]
struct QueueState {
    records: HashMap<String, JobRecord>,
    ready: VecDeque<String>,
    delayed: BinaryHeap<DelayedJob>,
    active: HashMap<String, Instant>,
    repeats: HashMap<String, RepeatState>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

struct QueuePane {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-memory queue backend for tests and single-process deployments.
///
/// Implements the full contract (delays, repeats, retention, stall
/// re-queue) without surviving a restart; the Redis backend is the
/// durable one.
pub struct InMemoryQueue {
    panes: HashMap<QueueName, Arc<QueuePane>>,
    policies: QueuePolicies,
    visibility_timeout: Duration,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_policies(QueuePolicies::default())
    }

    pub fn with_policies(policies: QueuePolicies) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let panes = QueueName::ALL
            .into_iter()
            .map(|name| {
                (
                    name,
                    Arc::new(QueuePane {
                        state: Mutex::new(QueueState::default()),
                        notify: Notify::new(),
                    }),
                )
            })
            .collect();
        Self {
            panes,
            policies,
            visibility_timeout: Duration::from_secs(30),
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn pane(&self, name: QueueName) -> Arc<QueuePane> {
        // All variants are inserted at construction.
        self.panes[&name].clone()
    }
}

/// Move due delayed jobs and due repeat fires to ready; re-queue
/// stalled active jobs with their attempt counter advanced.
fn promote(state: &mut QueueState, now: Instant) {
    while let Some(entry) = state.delayed.peek() {
        if entry.due > now {
            break;
        }
        let entry = state.delayed.pop().expect("peeked");
        if state.records.contains_key(&entry.id) && !state.ready.contains(&entry.id) {
            state.ready.push_back(entry.id);
        }
    }

    let stalled: Vec<String> = state
        .active
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in stalled {
        state.active.remove(&id);
        if let Some(record) = state.records.get_mut(&id) {
            record.attempts_made += 1;
            state.ready.push_back(id);
        }
    }

    let due: Vec<String> = state
        .repeats
        .iter()
        .filter(|(_, repeat)| repeat.next_fire <= now)
        .map(|(id, _)| id.clone())
        .collect();
    for id in due {
        let repeat = state.repeats.get_mut(&id).expect("present");
        // One queued instance per job id: skip the fire when the
        // previous instance is still pending.
        if !state.records.contains_key(&id) {
            state.records.insert(
                id.clone(),
                JobRecord {
                    payload: repeat.payload.clone(),
                    attempts_made: 0,
                },
            );
            state.ready.push_back(id.clone());
        }
        repeat.next_fire = match repeat.schedule {
            RepeatSchedule::Every(period) => {
                let mut next = repeat.next_fire + period;
                while next <= now {
                    next += period;
                }
                next
            }
            RepeatSchedule::Hourly => now + until_next_hour(),
        };
    }
}

/// Earliest instant at which anything becomes runnable.
fn next_due(state: &QueueState) -> Option<Instant> {
    let delayed = state.delayed.peek().map(|entry| entry.due);
    let repeat = state.repeats.values().map(|r| r.next_fire).min();
    let stalled = state.active.values().min().copied();
    [delayed, repeat, stalled].into_iter().flatten().min()
}

enum Claim {
    Run(Job),
    Idle(Option<Instant>),
}

fn claim(state: &mut QueueState, visibility: Duration, now: Instant) -> Claim {
    promote(state, now);
    while let Some(id) = state.ready.pop_front() {
        // Lazily skip ids whose record was removed.
        let Some(record) = state.records.get(&id) else {
            continue;
        };
        if state.active.contains_key(&id) {
            continue;
        }
        state.active.insert(id.clone(), now + visibility);
        return Claim::Run(Job {
            id,
            payload: record.payload.clone(),
            attempts_made: record.attempts_made,
        });
    }
    Claim::Idle(next_due(state))
}

fn push_retained(ring: &mut VecDeque<String>, id: String, cap: usize) {
    ring.push_back(id);
    while ring.len() > cap {
        ring.pop_front();
    }
}

async fn consumer_loop(
    pane: Arc<QueuePane>,
    name: QueueName,
    handler: Arc<dyn JobHandler>,
    policy: QueuePolicy,
    visibility: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(component = "queue", queue = %name, "consumer started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut state = pane.state.lock().await;
            claim(&mut state, visibility, Instant::now())
        };

        match next {
            Claim::Run(job) => {
                debug!(component = "queue", queue = %name, job_id = %job.id,
                       attempts_made = job.attempts_made, "running job");
                let result = handler.handle(&job).await;

                let mut state = pane.state.lock().await;
                state.active.remove(&job.id);
                match result {
                    Ok(()) => {
                        state.records.remove(&job.id);
                        push_retained(&mut state.completed, job.id, COMPLETED_RETENTION);
                    }
                    Err(err) => {
                        if let Some(record) = state.records.get_mut(&job.id) {
                            record.attempts_made += 1;
                            let failures = record.attempts_made;
                            if failures < policy.max_attempts {
                                let due = Instant::now() + policy.delay(failures);
                                state.delayed.push(DelayedJob {
                                    due,
                                    id: job.id.clone(),
                                });
                                debug!(component = "queue", queue = %name, job_id = %job.id,
                                       failures, error = %err, "job failed, retry scheduled");
                            } else {
                                state.records.remove(&job.id);
                                push_retained(&mut state.failed, job.id.clone(), FAILED_RETENTION);
                                error!(component = "queue", queue = %name, job_id = %job.id,
                                       failures, error = %err, "job failed permanently");
                            }
                        }
                    }
                }
            }
            Claim::Idle(due) => {
                if let Some(due) = due {
                    tokio::select! {
                        _ = pane.notify.notified() => {}
                        _ = sleep_until(due) => {}
                        _ = shutdown.changed() => {}
                    }
                } else {
                    tokio::select! {
                        _ = pane.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
    info!(component = "queue", queue = %name, "consumer stopped");
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, queue: QueueName, job_id: &str, payload: Value) -> Result<()> {
        let pane = self.pane(queue);
        {
            let mut state = pane.state.lock().await;
            if state.records.contains_key(job_id) {
                return Ok(());
            }
            state.records.insert(
                job_id.to_string(),
                JobRecord {
                    payload,
                    attempts_made: 0,
                },
            );
            state.ready.push_back(job_id.to_string());
        }
        // notify_one stores a permit, so a consumer between claim and
        // wait still sees this job.
        pane.notify.notify_one();
        Ok(())
    }

    async fn add_repeating(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: Value,
        schedule: RepeatSchedule,
    ) -> Result<()> {
        let pane = self.pane(queue);
        {
            let mut state = pane.state.lock().await;
            state.repeats.insert(
                job_id.to_string(),
                RepeatState {
                    payload,
                    schedule,
                    next_fire: first_fire(schedule),
                },
            );
        }
        pane.notify.notify_one();
        Ok(())
    }

    async fn remove_scheduled(&self, queue: QueueName, job_id: &str) -> Result<()> {
        let pane = self.pane(queue);
        let mut state = pane.state.lock().await;
        state.repeats.remove(job_id);
        state.records.remove(job_id);
        state.active.remove(job_id);
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts> {
        let pane = self.pane(queue);
        let state = pane.state.lock().await;
        let waiting = state
            .ready
            .iter()
            .filter(|id| state.records.contains_key(*id) && !state.active.contains_key(*id))
            .count();
        let delayed = state
            .delayed
            .iter()
            .filter(|entry| state.records.contains_key(&entry.id))
            .count()
            + state.repeats.len();
        Ok(QueueCounts {
            waiting,
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            delayed,
        })
    }

    async fn process(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> Result<()> {
        let pane = self.pane(queue);
        let policy = self.policies.get(queue);
        let shutdown = self.shutdown_tx.subscribe();
        let visibility = self.visibility_timeout;
        let handle = tokio::spawn(consumer_loop(
            pane, queue, handler, policy, visibility, shutdown,
        ));
        self.handles.lock().await.push(handle);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for pane in self.panes.values() {
            pane.notify.notify_waiters();
        }
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::WebhookError;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(WebhookError::internal(format!("failure {call}")))
            } else {
                Ok(())
            }
        }
    }

    // Polling step is coarse so paused-clock auto-advance can cross
    // multi-minute back-off windows within the iteration budget.
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_for_counts(
        queue: &InMemoryQueue,
        name: QueueName,
        cond: impl Fn(QueueCounts) -> bool,
    ) -> QueueCounts {
        for _ in 0..2000 {
            let counts = queue.counts(name).await.unwrap();
            if cond(counts) {
                return counts;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("counts condition not reached");
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(60));
        assert_eq!(backoff.delay(2), Duration::from_secs(120));
        assert_eq!(backoff.delay(3), Duration::from_secs(240));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_secs(300));
        assert_eq!(backoff.delay(1), Duration::from_secs(300));
        assert_eq!(backoff.delay(5), Duration::from_secs(300));
    }

    #[test]
    fn jitter_bounds_extra_delay() {
        let policy = QueuePolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
            jitter: Duration::from_millis(100),
        };
        for _ in 0..50 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_job_runs_once() {
        let queue = InMemoryQueue::new();
        let handler = CountingHandler::new(0);
        queue
            .process(QueueName::WebhookDelivery, handler.clone())
            .await
            .unwrap();
        queue
            .enqueue(QueueName::WebhookDelivery, "job-1", json!({"k": 1}))
            .await
            .unwrap();

        wait_for(|| handler.calls() == 1).await;
        let counts =
            wait_for_counts(&queue, QueueName::WebhookDelivery, |c| c.completed == 1).await;
        assert_eq!(counts.waiting, 0);
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_retries_until_exhausted() {
        let queue = InMemoryQueue::new();
        let handler = CountingHandler::new(u32::MAX);
        queue
            .process(QueueName::WebhookDelivery, handler.clone())
            .await
            .unwrap();
        queue
            .enqueue(QueueName::WebhookDelivery, "job-1", json!({}))
            .await
            .unwrap();

        // Delivery policy allows 4 attempts total.
        wait_for(|| handler.calls() == 4).await;
        let counts = wait_for_counts(&queue, QueueName::WebhookDelivery, |c| c.failed == 1).await;
        assert_eq!(counts.delayed, 0);
        assert_eq!(handler.calls(), 4);
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn handler_sees_advancing_attempt_counter() {
        struct AttemptRecorder {
            seen: Mutex<Vec<u32>>,
        }

        #[async_trait]
        impl JobHandler for AttemptRecorder {
            async fn handle(&self, job: &Job) -> Result<()> {
                self.seen.lock().await.push(job.attempts_made);
                Err(WebhookError::internal("always fails"))
            }
        }

        let recorder = Arc::new(AttemptRecorder {
            seen: Mutex::new(Vec::new()),
        });
        let queue = InMemoryQueue::new();
        queue
            .process(QueueName::TrackingMonitor, recorder.clone())
            .await
            .unwrap();
        queue
            .enqueue(QueueName::TrackingMonitor, "job-1", json!({}))
            .await
            .unwrap();

        wait_for(|| {
            let seen = recorder.seen.try_lock().map(|s| s.len()).unwrap_or(0);
            seen == 3
        })
        .await;
        assert_eq!(*recorder.seen.lock().await, vec![0, 1, 2]);
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_job_fires_repeatedly() {
        let queue = InMemoryQueue::new();
        let handler = CountingHandler::new(0);
        queue
            .process(QueueName::TrackingMonitor, handler.clone())
            .await
            .unwrap();
        queue
            .add_repeating(
                QueueName::TrackingMonitor,
                "reg-1",
                json!({}),
                RepeatSchedule::Every(Duration::from_secs(10)),
            )
            .await
            .unwrap();

        wait_for(|| handler.calls() >= 3).await;
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn remove_scheduled_stops_repeats() {
        let queue = InMemoryQueue::new();
        let handler = CountingHandler::new(0);
        queue
            .process(QueueName::TrackingMonitor, handler.clone())
            .await
            .unwrap();
        queue
            .add_repeating(
                QueueName::TrackingMonitor,
                "reg-1",
                json!({}),
                RepeatSchedule::Every(Duration::from_secs(10)),
            )
            .await
            .unwrap();
        wait_for(|| handler.calls() >= 1).await;

        queue
            .remove_scheduled(QueueName::TrackingMonitor, "reg-1")
            .await
            .unwrap();
        let calls = handler.calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handler.calls(), calls);

        let counts = queue.counts(QueueName::TrackingMonitor).await.unwrap();
        assert_eq!(counts.delayed, 0);
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueue_coalesces() {
        let queue = InMemoryQueue::new();
        queue
            .enqueue(QueueName::WebhookDelivery, "job-1", json!({"v": 1}))
            .await
            .unwrap();
        queue
            .enqueue(QueueName::WebhookDelivery, "job-1", json!({"v": 2}))
            .await
            .unwrap();

        let counts = queue.counts(QueueName::WebhookDelivery).await.unwrap();
        assert_eq!(counts.waiting, 1);
        queue.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retry_uses_backoff_delay() {
        let queue = InMemoryQueue::new();
        let handler = CountingHandler::new(1);
        queue
            .process(QueueName::WebhookDelivery, handler.clone())
            .await
            .unwrap();
        queue
            .enqueue(QueueName::WebhookDelivery, "job-1", json!({}))
            .await
            .unwrap();

        wait_for(|| handler.calls() == 1).await;
        // The retry sits in the delayed set until ~60s of virtual time passes.
        wait_for_counts(&queue, QueueName::WebhookDelivery, |c| c.delayed == 1).await;

        wait_for(|| handler.calls() == 2).await;
        wait_for_counts(&queue, QueueName::WebhookDelivery, |c| c.completed == 1).await;
        queue.close().await.unwrap();
    }
}

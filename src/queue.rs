//! Animation job queue - bounded concurrency, priorities, cancellation
//!
//! **Why**: Letting every component run its own animation loop starves the
//! frame budget. The queue admits jobs up to a size cap, promotes them into a
//! bounded set of running slots by (priority, FIFO), and steps each running
//! job once per frame until it settles.
//!
//! **Used by**: callers via `add`/`cancel`/`pause`; pumped by a persistent
//! scheduler callback registered through `attach()`
//!
//! # Job Model
//!
//! A job is a step function `FnMut(&mut JobCx) -> JobPoll` polled once per
//! frame while RUNNING. It cooperates with cancellation by checking
//! `cx.is_cancelled()`; nothing is force-terminated. States:
//!
//! `Pending -> Running -> {Completed | Cancelled | Error}`, plus
//! `Running -> Paused -> Pending` via pause/resume (resume re-queues with a
//! fresh cancellation source; any mid-animation progress bookkeeping is the
//! job's own responsibility).
//!
//! Settled jobs are removed immediately - only rolling statistics remain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::debug;
use serde::Serialize;
use uuid::Uuid;

use crate::cancel::{CancelSource, CancelToken};
use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::priority::Priority;
use crate::sched::{CallbackId, FrameScheduler, TickInfo};

/// Rolling samples kept for wait/exec time averages.
const STAT_SAMPLES: usize = 50;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs stepped concurrently (running slots).
    pub max_concurrent: usize,
    /// Live jobs (pending + running + paused) before `add` refuses.
    pub max_queue_size: usize,
    /// Default per-job timeout; a job that does not settle in time errors.
    pub job_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_size: 100,
            job_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        JobId(s.to_string())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Error => "error",
        }
    }
}

/// What a step function reports back each frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPoll {
    /// Keep stepping next frame.
    Pending,
    /// Job finished; invoke `on_complete` and remove.
    Complete,
    /// Job failed; invoke `on_error` and remove.
    Failed(String),
}

/// Per-step context handed to the job.
pub struct JobCx {
    /// Clock reading for this frame.
    pub now: Instant,
    /// Time since the previous frame.
    pub delta: Duration,
    /// Time since the job was promoted to RUNNING.
    pub elapsed: Duration,
    /// Job-writable progress, 0.0..=1.0, persisted between steps.
    pub progress: f32,
    cancel: CancelToken,
}

impl JobCx {
    /// Whether cancellation has been requested. Cooperative: the step should
    /// return promptly when this turns true.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token for handing to helper code spawned by the step.
    pub fn token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

pub type StepFn = Box<dyn FnMut(&mut JobCx) -> JobPoll + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(&str) + Send>;

/// Admission options for [`AnimationQueue::add`].
#[derive(Default)]
pub struct JobOptions {
    pub priority: Priority,
    /// Grouping tag for `cancel_by_tag`.
    pub tag: Option<String>,
    /// Stable id; generated from a UUID when `None`.
    pub id: Option<String>,
    /// Override of `QueueConfig::job_timeout`.
    pub timeout: Option<Duration>,
    pub on_complete: Option<CompleteFn>,
    pub on_error: Option<ErrorFn>,
    pub on_cancel: Option<CompleteFn>,
}

/// A step function plus its options, for [`AnimationQueue::add_batch`].
pub struct JobSpec {
    pub step: StepFn,
    pub options: JobOptions,
}

impl JobSpec {
    pub fn new<F>(step: F, options: JobOptions) -> Self
    where
        F: FnMut(&mut JobCx) -> JobPoll + Send + 'static,
    {
        Self {
            step: Box::new(step),
            options,
        }
    }
}

/// Read-only view of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub state: JobState,
    pub priority: Priority,
    pub progress: f32,
    pub tag: Option<String>,
}

/// Read-only queue statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: u64,
    pub cancelled: u64,
    pub errored: u64,
    /// Live job counts per tier, indexed by `Priority::index()`.
    pub by_priority: [usize; 5],
    /// Rolling average queued -> promoted, last 50 promotions.
    pub avg_wait_ms: f64,
    /// Rolling average promoted -> settled, last 50 settlements.
    pub avg_exec_ms: f64,
}

struct Job {
    priority: Priority,
    state: JobState,
    tag: Option<String>,
    /// Taken while the step runs outside the lock, restored on `Pending`.
    step: Option<StepFn>,
    queued_at: Instant,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
    timeout: Duration,
    source: CancelSource,
    progress: f32,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
    on_cancel: Option<CompleteFn>,
}

struct QueueInner {
    /// Insertion-ordered: iteration order breaks priority ties FIFO.
    jobs: IndexMap<String, Job>,
    running: usize,
    completed: u64,
    cancelled: u64,
    errored: u64,
    wait_samples: VecDeque<f64>,
    exec_samples: VecDeque<f64>,
}

/// Lifecycle callbacks collected under the lock, invoked after release.
enum Notice {
    Done(CompleteFn),
    Error(ErrorFn, String),
}

/// The animation queue. Explicitly constructed, shared by `Arc`.
pub struct AnimationQueue {
    inner: Mutex<QueueInner>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl AnimationQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Use the same clock as the scheduler that pumps this queue.
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                jobs: IndexMap::new(),
                running: 0,
                completed: 0,
                cancelled: 0,
                errored: 0,
                wait_samples: VecDeque::new(),
                exec_samples: VecDeque::new(),
            }),
            config,
            clock,
        }
    }

    /// Register the pump as a persistent callback on `scheduler`. Critical
    /// priority so slots are refilled before regular frame work runs.
    pub fn attach(self: &Arc<Self>, scheduler: &FrameScheduler) -> CallbackId {
        let queue = Arc::clone(self);
        scheduler.schedule_persistent(move |tick| queue.pump(tick), Priority::Critical)
    }

    // ========== Admission ==========

    /// Queue a job. Refuses when `max_queue_size` live jobs exist.
    pub fn add<F>(&self, step: F, options: JobOptions) -> Result<JobId, QueueError>
    where
        F: FnMut(&mut JobCx) -> JobPoll + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        self.admit(&mut inner, Box::new(step), options)
    }

    /// Queue several jobs atomically: all admitted or none.
    pub fn add_batch(&self, specs: Vec<JobSpec>) -> Result<Vec<JobId>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.len() + specs.len() > self.config.max_queue_size {
            return Err(QueueError::QueueFull(inner.jobs.len()));
        }
        for spec in &specs {
            if let Some(id) = &spec.options.id {
                if inner.jobs.contains_key(id.as_str()) {
                    return Err(QueueError::DuplicateJob(id.clone()));
                }
            }
        }
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.admit(&mut inner, spec.step, spec.options)?);
        }
        Ok(ids)
    }

    fn admit(
        &self,
        inner: &mut QueueInner,
        step: StepFn,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if inner.jobs.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull(inner.jobs.len()));
        }
        let id = options
            .id
            .unwrap_or_else(|| format!("job-{}", Uuid::new_v4().simple()));
        if inner.jobs.contains_key(&id) {
            return Err(QueueError::DuplicateJob(id));
        }

        let timeout = options.timeout.unwrap_or(self.config.job_timeout);
        inner.jobs.insert(
            id.clone(),
            Job {
                priority: options.priority,
                state: JobState::Pending,
                tag: options.tag,
                step: Some(step),
                queued_at: self.clock.now(),
                started_at: None,
                deadline: None,
                timeout,
                source: CancelSource::new(),
                progress: 0.0,
                on_complete: options.on_complete,
                on_error: options.on_error,
                on_cancel: options.on_cancel,
            },
        );
        debug!("job '{}' queued ({} live)", id, inner.jobs.len());
        Ok(JobId(id))
    }

    // ========== Pump ==========

    /// One frame of queue work: time out and step running jobs, then promote
    /// pending jobs into freed slots. Normally called via [`Self::attach`].
    pub fn pump(&self, tick: &TickInfo) {
        let now = tick.now;
        let mut notices: Vec<Notice> = Vec::new();

        // Phase 1: under the lock, settle timeouts and extract step fns.
        struct StepItem {
            id: String,
            step: StepFn,
            cx: JobCx,
        }
        let mut steps: Vec<StepItem> = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let running_ids: Vec<String> = inner
                .jobs
                .iter()
                .filter(|(_, j)| j.state == JobState::Running)
                .map(|(id, _)| id.clone())
                .collect();

            for id in running_ids {
                let timed_out = inner
                    .jobs
                    .get(&id)
                    .is_some_and(|j| j.deadline.is_some_and(|d| now >= d));
                if timed_out {
                    if let Some(notice) = Self::settle(
                        &mut inner,
                        &id,
                        now,
                        SettleKind::Errored("job timed out".to_string()),
                    ) {
                        notices.push(notice);
                    }
                    continue;
                }
                let job = inner.jobs.get_mut(&id).expect("running job present");
                if let Some(step) = job.step.take() {
                    let cx = JobCx {
                        now,
                        delta: tick.delta,
                        elapsed: job
                            .started_at
                            .map(|t| now.saturating_duration_since(t))
                            .unwrap_or(Duration::ZERO),
                        progress: job.progress,
                        cancel: job.source.token(),
                    };
                    steps.push(StepItem { id, step, cx });
                }
            }
        }

        // Phase 2: run steps with the lock released, so a step may call back
        // into the queue (add, cancel) without deadlocking.
        let mut results = Vec::with_capacity(steps.len());
        for mut item in steps {
            let poll = (item.step)(&mut item.cx);
            results.push((item.id, item.step, item.cx.progress, poll));
        }

        // Phase 3: apply results, then backfill freed slots.
        {
            let mut inner = self.inner.lock().unwrap();
            for (id, step, progress, poll) in results {
                match poll {
                    JobPoll::Pending => {
                        // Job may have been cancelled while stepping; the
                        // record is gone then and the step fn is dropped.
                        if let Some(job) = inner.jobs.get_mut(&id) {
                            job.progress = progress;
                            job.step = Some(step);
                        }
                    }
                    JobPoll::Complete => {
                        if let Some(notice) = Self::settle(&mut inner, &id, now, SettleKind::Completed)
                        {
                            notices.push(notice);
                        }
                    }
                    JobPoll::Failed(msg) => {
                        if let Some(notice) =
                            Self::settle(&mut inner, &id, now, SettleKind::Errored(msg))
                        {
                            notices.push(notice);
                        }
                    }
                }
            }

            while inner.running < self.config.max_concurrent {
                let next = inner
                    .jobs
                    .iter()
                    .filter(|(_, j)| j.state == JobState::Pending)
                    .min_by_key(|(_, j)| (j.priority, j.queued_at))
                    .map(|(id, _)| id.clone());
                let Some(id) = next else { break };

                let wait_ms;
                {
                    let job = inner.jobs.get_mut(&id).expect("pending job present");
                    job.state = JobState::Running;
                    job.started_at = Some(now);
                    job.deadline = Some(now + job.timeout);
                    wait_ms = now.saturating_duration_since(job.queued_at).as_secs_f64() * 1000.0;
                }
                inner.running += 1;
                push_sample(&mut inner.wait_samples, wait_ms);
                debug!("job '{}' promoted to running", id);
            }
        }

        // Phase 4: lifecycle callbacks outside the lock.
        for notice in notices {
            match notice {
                Notice::Done(cb) => cb(),
                Notice::Error(cb, msg) => cb(&msg),
            }
        }
    }

    /// Remove a settled job, updating counters and collecting its callback.
    fn settle(inner: &mut QueueInner, id: &str, now: Instant, kind: SettleKind) -> Option<Notice> {
        let mut job = inner.jobs.shift_remove(id)?;
        if job.state == JobState::Running {
            inner.running -= 1;
            if let Some(started) = job.started_at {
                let exec_ms = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                push_sample(&mut inner.exec_samples, exec_ms);
            }
        }
        match kind {
            SettleKind::Completed => {
                inner.completed += 1;
                job.on_complete.take().map(Notice::Done)
            }
            SettleKind::Errored(msg) => {
                inner.errored += 1;
                job.source.cancel();
                job.on_error.take().map(|cb| Notice::Error(cb, msg))
            }
        }
    }

    // ========== Cancellation / lifecycle ==========

    /// Cancel a job. Aborts its token and removes the record; `on_cancel`
    /// fires only if the job was RUNNING (a pending job vanishes silently).
    pub fn cancel(&self, id: &JobId) -> bool {
        let notice = {
            let mut inner = self.inner.lock().unwrap();
            let Some(mut job) = inner.jobs.shift_remove(id.as_str()) else {
                return false;
            };
            job.source.cancel();
            inner.cancelled += 1;
            if job.state == JobState::Running {
                inner.running -= 1;
                if let Some(started) = job.started_at {
                    let now = self.clock.now();
                    let exec_ms = now.saturating_duration_since(started).as_secs_f64() * 1000.0;
                    push_sample(&mut inner.exec_samples, exec_ms);
                }
                job.on_cancel.take()
            } else {
                None
            }
        };
        if let Some(cb) = notice {
            cb();
        }
        true
    }

    /// Cancel every job with the given tag. Returns how many.
    pub fn cancel_by_tag(&self, tag: &str) -> usize {
        let ids: Vec<JobId> = {
            let inner = self.inner.lock().unwrap();
            inner
                .jobs
                .iter()
                .filter(|(_, j)| j.tag.as_deref() == Some(tag))
                .map(|(id, _)| JobId(id.clone()))
                .collect()
        };
        let mut count = 0;
        for id in &ids {
            if self.cancel(id) {
                count += 1;
            }
        }
        count
    }

    /// Cancel every live job. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<JobId> = {
            let inner = self.inner.lock().unwrap();
            inner.jobs.keys().map(|id| JobId(id.clone())).collect()
        };
        let mut count = 0;
        for id in &ids {
            if self.cancel(id) {
                count += 1;
            }
        }
        count
    }

    /// Pause a RUNNING job: abort its current token, free the slot, keep the
    /// record. The step fn stays with the job for resume.
    pub fn pause(&self, id: &JobId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(id.as_str())
            .ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
        if job.state != JobState::Running {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                expected: JobState::Running.as_str(),
                actual: job.state.as_str(),
            });
        }
        job.source.cancel();
        job.state = JobState::Paused;
        job.deadline = None;
        inner.running -= 1;
        debug!("job '{}' paused", id);
        Ok(())
    }

    /// Re-queue a PAUSED job as PENDING with a fresh cancellation source.
    /// It competes for a slot again at its original priority.
    pub fn resume(&self, id: &JobId) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .get_mut(id.as_str())
            .ok_or_else(|| QueueError::UnknownJob(id.to_string()))?;
        if job.state != JobState::Paused {
            return Err(QueueError::InvalidState {
                id: id.to_string(),
                expected: JobState::Paused.as_str(),
                actual: job.state.as_str(),
            });
        }
        job.source = CancelSource::new();
        job.state = JobState::Pending;
        job.queued_at = now;
        job.started_at = None;
        debug!("job '{}' resumed", id);
        Ok(())
    }

    // ========== Introspection ==========

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(id.as_str()).map(|job| JobStatus {
            id: id.to_string(),
            state: job.state,
            priority: job.priority,
            progress: job.progress,
            tag: job.tag.clone(),
        })
    }

    /// Cancellation token of a live job.
    pub fn token(&self, id: &JobId) -> Option<CancelToken> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(id.as_str()).map(|job| job.source.token())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().jobs.is_empty()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().unwrap().running
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mut pending = 0;
        let mut paused = 0;
        let mut by_priority = [0usize; 5];
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => pending += 1,
                JobState::Paused => paused += 1,
                _ => {}
            }
            by_priority[job.priority.index()] += 1;
        }
        QueueStats {
            pending,
            running: inner.running,
            paused,
            completed: inner.completed,
            cancelled: inner.cancelled,
            errored: inner.errored,
            by_priority,
            avg_wait_ms: avg(&inner.wait_samples),
            avg_exec_ms: avg(&inner.exec_samples),
        }
    }
}

enum SettleKind {
    Completed,
    Errored(String),
}

fn push_sample(samples: &mut VecDeque<f64>, value: f64) {
    samples.push_back(value);
    if samples.len() > STAT_SAMPLES {
        samples.pop_front();
    }
}

fn avg(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, manual_clock};
    use crate::sched::SchedulerConfig;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn setup(config: QueueConfig) -> (Arc<ManualClock>, Arc<FrameScheduler>, Arc<AnimationQueue>) {
        let (clock, handle) = manual_clock();
        let sched = Arc::new(FrameScheduler::with_clock(
            SchedulerConfig::default(),
            Arc::clone(&handle),
        ));
        let queue = Arc::new(AnimationQueue::with_clock(config, handle));
        queue.attach(&sched);
        (clock, sched, queue)
    }

    fn endless() -> impl FnMut(&mut JobCx) -> JobPoll + Send + 'static {
        |_cx| JobPoll::Pending
    }

    fn frame(clock: &ManualClock, sched: &FrameScheduler) {
        clock.advance_ms(16);
        sched.tick();
    }

    #[test]
    fn test_never_exceeds_max_concurrent() {
        let (clock, sched, queue) = setup(QueueConfig::default());

        for _ in 0..10 {
            queue.add(endless(), JobOptions::default()).unwrap();
        }

        for _ in 0..5 {
            frame(&clock, &sched);
            assert_eq!(queue.running_count(), 4);
        }
        assert_eq!(queue.len(), 10);
    }

    #[test]
    fn test_high_priority_promoted_before_low() {
        let (clock, sched, queue) = setup(QueueConfig::default());

        let mut ids = Vec::new();
        for i in 0..10 {
            let priority = if i % 2 == 0 {
                Priority::High
            } else {
                Priority::Low
            };
            ids.push(
                queue
                    .add(
                        endless(),
                        JobOptions {
                            priority,
                            ..Default::default()
                        },
                    )
                    .unwrap(),
            );
        }

        frame(&clock, &sched);

        // All 4 slots go to High jobs, in submission order.
        for (i, id) in ids.iter().enumerate() {
            let status = queue.status(id).unwrap();
            let expect_running = i % 2 == 0 && i < 8; // jobs 0, 2, 4, 6
            assert_eq!(
                status.state == JobState::Running,
                expect_running,
                "job {} unexpected state {:?}",
                i,
                status.state
            );
        }
    }

    #[test]
    fn test_job_completes_and_reports() {
        let (clock, sched, queue) = setup(QueueConfig::default());
        let steps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let steps2 = Arc::clone(&steps);
        let done2 = Arc::clone(&done);
        let id = queue
            .add(
                move |cx| {
                    let n = steps2.fetch_add(1, Ordering::SeqCst) + 1;
                    cx.progress = n as f32 / 3.0;
                    if n >= 3 {
                        JobPoll::Complete
                    } else {
                        JobPoll::Pending
                    }
                },
                JobOptions {
                    on_complete: Some(Box::new(move || done2.store(true, Ordering::SeqCst))),
                    ..Default::default()
                },
            )
            .unwrap();

        for _ in 0..6 {
            frame(&clock, &sched);
        }

        assert_eq!(steps.load(Ordering::SeqCst), 3);
        assert!(done.load(Ordering::SeqCst));
        assert!(queue.status(&id).is_none());

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 0);
        assert!(stats.avg_exec_ms > 0.0);
    }

    #[test]
    fn test_cancel_pending_is_silent() {
        let (_clock, _sched, queue) = setup(QueueConfig::default());
        let done = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));

        let done2 = Arc::clone(&done);
        let cancelled2 = Arc::clone(&cancelled);
        let id = queue
            .add(
                endless(),
                JobOptions {
                    on_complete: Some(Box::new(move || done2.store(true, Ordering::SeqCst))),
                    on_cancel: Some(Box::new(move || cancelled2.store(true, Ordering::SeqCst))),
                    ..Default::default()
                },
            )
            .unwrap();

        // Never pumped: still pending.
        assert!(queue.cancel(&id));
        assert!(!done.load(Ordering::SeqCst));
        assert!(!cancelled.load(Ordering::SeqCst));
        assert_eq!(queue.stats().cancelled, 1);
    }

    #[test]
    fn test_cancel_running_fires_on_cancel_and_frees_slot() {
        let (clock, sched, queue) = setup(QueueConfig {
            max_concurrent: 1,
            ..Default::default()
        });
        let cancelled = Arc::new(AtomicBool::new(false));

        let cancelled2 = Arc::clone(&cancelled);
        let a = queue
            .add(
                endless(),
                JobOptions {
                    on_cancel: Some(Box::new(move || cancelled2.store(true, Ordering::SeqCst))),
                    ..Default::default()
                },
            )
            .unwrap();
        let b = queue.add(endless(), JobOptions::default()).unwrap();

        frame(&clock, &sched);
        assert_eq!(queue.status(&a).unwrap().state, JobState::Running);

        assert!(queue.cancel(&a));
        assert!(cancelled.load(Ordering::SeqCst));
        assert_eq!(queue.running_count(), 0);

        frame(&clock, &sched);
        assert_eq!(queue.status(&b).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_timeout_errors_the_job() {
        let (clock, sched, queue) = setup(QueueConfig::default());
        let error = Arc::new(Mutex::new(String::new()));

        let error2 = Arc::clone(&error);
        let id = queue
            .add(
                endless(),
                JobOptions {
                    timeout: Some(Duration::from_millis(100)),
                    on_error: Some(Box::new(move |msg| {
                        *error2.lock().unwrap() = msg.to_string();
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        frame(&clock, &sched); // promote
        frame(&clock, &sched); // step
        clock.advance_ms(150);
        sched.tick(); // deadline passed

        assert!(queue.status(&id).is_none());
        assert_eq!(queue.stats().errored, 1);
        assert!(error.lock().unwrap().contains("timed out"));
    }

    #[test]
    fn test_failed_step_reports_error() {
        let (clock, sched, queue) = setup(QueueConfig::default());
        let error = Arc::new(Mutex::new(String::new()));

        let error2 = Arc::clone(&error);
        queue
            .add(
                |_cx| JobPoll::Failed("easing blew up".to_string()),
                JobOptions {
                    on_error: Some(Box::new(move |msg| {
                        *error2.lock().unwrap() = msg.to_string();
                    })),
                    ..Default::default()
                },
            )
            .unwrap();

        frame(&clock, &sched); // promote
        frame(&clock, &sched); // step fails

        assert_eq!(*error.lock().unwrap(), "easing blew up");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_full_rejects() {
        let (_clock, _sched, queue) = setup(QueueConfig {
            max_queue_size: 2,
            ..Default::default()
        });

        queue.add(endless(), JobOptions::default()).unwrap();
        queue.add(endless(), JobOptions::default()).unwrap();
        let err = queue.add(endless(), JobOptions::default()).unwrap_err();
        assert_eq!(err, QueueError::QueueFull(2));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_clock, _sched, queue) = setup(QueueConfig::default());
        queue
            .add(
                endless(),
                JobOptions {
                    id: Some("fade".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let err = queue
            .add(
                endless(),
                JobOptions {
                    id: Some("fade".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, QueueError::DuplicateJob("fade".to_string()));
    }

    #[test]
    fn test_pause_resume_cycle() {
        let (clock, sched, queue) = setup(QueueConfig {
            max_concurrent: 1,
            ..Default::default()
        });

        let a = queue.add(endless(), JobOptions::default()).unwrap();
        let b = queue.add(endless(), JobOptions::default()).unwrap();

        frame(&clock, &sched);
        assert_eq!(queue.status(&a).unwrap().state, JobState::Running);
        let token_a = queue.token(&a).unwrap();

        queue.pause(&a).unwrap();
        assert_eq!(queue.status(&a).unwrap().state, JobState::Paused);
        assert!(token_a.is_cancelled()); // old token aborted

        frame(&clock, &sched);
        assert_eq!(queue.status(&b).unwrap().state, JobState::Running);

        queue.resume(&a).unwrap();
        assert_eq!(queue.status(&a).unwrap().state, JobState::Pending);
        assert!(!queue.token(&a).unwrap().is_cancelled()); // fresh source

        // Resume on a non-paused job is a state error.
        assert!(matches!(
            queue.resume(&b),
            Err(QueueError::InvalidState { .. })
        ));

        queue.cancel(&b);
        frame(&clock, &sched);
        assert_eq!(queue.status(&a).unwrap().state, JobState::Running);
    }

    #[test]
    fn test_cancel_by_tag() {
        let (_clock, _sched, queue) = setup(QueueConfig::default());

        for _ in 0..2 {
            queue
                .add(
                    endless(),
                    JobOptions {
                        tag: Some("panel".to_string()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        queue.add(endless(), JobOptions::default()).unwrap();

        assert_eq!(queue.cancel_by_tag("panel"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.cancel_all(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_add_batch_is_atomic() {
        let (_clock, _sched, queue) = setup(QueueConfig {
            max_queue_size: 3,
            ..Default::default()
        });

        let specs = vec![
            JobSpec::new(endless(), JobOptions::default()),
            JobSpec::new(endless(), JobOptions::default()),
        ];
        let ids = queue.add_batch(specs).unwrap();
        assert_eq!(ids.len(), 2);

        // Two more would exceed the cap: nothing is admitted.
        let specs = vec![
            JobSpec::new(endless(), JobOptions::default()),
            JobSpec::new(endless(), JobOptions::default()),
        ];
        assert!(matches!(
            queue.add_batch(specs),
            Err(QueueError::QueueFull(2))
        ));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_step_observes_cancellation_token() {
        let (clock, sched, queue) = setup(QueueConfig::default());
        let observed = Arc::new(AtomicBool::new(false));

        let observed2 = Arc::clone(&observed);
        let id = queue
            .add(
                move |cx| {
                    if cx.is_cancelled() {
                        observed2.store(true, Ordering::SeqCst);
                        return JobPoll::Complete;
                    }
                    JobPoll::Pending
                },
                JobOptions::default(),
            )
            .unwrap();

        frame(&clock, &sched); // promote
        frame(&clock, &sched); // first step, not cancelled

        assert!(!queue.token(&id).unwrap().is_cancelled());
        queue.cancel(&id);
        assert!(queue.status(&id).is_none());
        assert!(!observed.load(Ordering::SeqCst)); // cancel() removed it before the next step
    }
}

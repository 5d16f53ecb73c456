//! Frame scheduler - one tick loop for all per-frame work
//!
//! **Why**: Independent features each running their own frame callback fight
//! over the frame budget. Registering everything with one scheduler gives a
//! single place for priority ordering, delay handling and frame metrics.
//!
//! **Used by**: driver (ticks it), throttle (trailing edges), queue (pump loop)
//!
//! # Tick Model
//!
//! `tick()` runs once per frame. It selects callbacks whose delay has elapsed,
//! stable-sorts them by priority (FIFO within a tier), and executes up to
//! `max_callbacks_per_frame` of them. One-shot callbacks are removed after
//! execution; persistent callbacks re-register until cancelled. A callback
//! that panics is caught, logged and permanently dropped - no retry.
//!
//! # Metrics
//!
//! Frame/callback counters and dropped-frame detection are always on. The
//! rolling 60-sample frame-time buffer is gated by
//! `SchedulerConfig::collect_metrics` since it costs a little per frame.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::priority::Priority;

/// Frame-time samples kept for the average when metrics are enabled.
const FRAME_TIME_SAMPLES: usize = 60;

/// A frame whose delta exceeds target interval times this factor counts as dropped.
const DROPPED_FRAME_FACTOR: f64 = 1.5;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Target frame rate, used for the frame interval and dropped-frame detection.
    pub target_fps: f64,
    /// Cap on callbacks executed in one tick. Overflow waits for the next frame.
    pub max_callbacks_per_frame: usize,
    /// Keep the rolling frame-time buffer for `avg_frame_time_ms`.
    pub collect_metrics: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_fps: 60.0,
            max_callbacks_per_frame: 100,
            collect_metrics: false,
        }
    }
}

/// Handle for cancelling a scheduled callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackId(String);

impl CallbackId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackId {
    fn from(s: &str) -> Self {
        CallbackId(s.to_string())
    }
}

/// Registration options for [`FrameScheduler::schedule_with`].
#[derive(Default)]
pub struct ScheduleOptions {
    pub priority: Priority,
    /// Re-register every frame until cancelled.
    pub persistent: bool,
    /// Callback becomes eligible only once the delay has elapsed.
    pub delay: Option<Duration>,
    /// Stable id. Scheduling with an id that is already registered replaces
    /// the previous callback. Generated from a UUID when `None`.
    pub id: Option<String>,
}

/// Timing info passed to every callback on execution.
#[derive(Debug, Clone, Copy)]
pub struct TickInfo {
    /// Clock reading for this tick.
    pub now: Instant,
    /// Time since the previous tick (one frame interval on the first tick).
    pub delta: Duration,
    /// Monotonic frame counter, starts at 1.
    pub frame: u64,
}

/// Read-only metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetrics {
    pub frames_executed: u64,
    pub callbacks_executed: u64,
    /// Rolling average over the last 60 frames, 0.0 unless `collect_metrics`.
    pub avg_frame_time_ms: f64,
    /// Frames counted over the last completed 1000ms window.
    pub current_fps: f64,
    pub dropped_frames: u64,
    pub last_frame_time_ms: f64,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    /// Callbacks executed this tick.
    pub executed: usize,
    /// Whether anything is still registered (drives the driver's park/stop).
    pub has_work: bool,
}

type FrameFn = Box<dyn FnMut(&TickInfo) + Send>;

struct Entry {
    cb: FrameFn,
    priority: Priority,
    persistent: bool,
    registered_at: Instant,
    ready_at: Option<Instant>,
}

/// Read-only view of one registered callback, from [`FrameScheduler::callback_info`].
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo {
    pub priority: Priority,
    pub persistent: bool,
    /// When the callback was registered.
    pub registered_at: Instant,
    /// When a delayed callback becomes eligible; `None` for undelayed ones.
    pub ready_at: Option<Instant>,
}

#[derive(Default)]
struct MetricsState {
    frames_executed: u64,
    callbacks_executed: u64,
    dropped_frames: u64,
    last_frame_ms: f64,
    window_start: Option<Instant>,
    frames_in_window: u32,
    current_fps: f64,
    frame_times: VecDeque<f64>,
}

struct Inner {
    /// Insertion-ordered registry: stable sort over it yields FIFO within a tier.
    entries: IndexMap<String, Entry>,
    /// Guards against nested tick() calls from inside a callback.
    ticking: bool,
    /// Callbacks extracted for the current tick, by id.
    in_flight: HashMap<String, Priority>,
    /// In-flight ids cancelled mid-tick; persistent ones must not re-register.
    cancelled_in_flight: HashSet<String>,
    last_tick: Option<Instant>,
    frame_count: u64,
    metrics: MetricsState,
}

/// The frame scheduler. Explicitly constructed, shared by `Arc`, no globals.
pub struct FrameScheduler {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Driver wake channels, notified on the empty -> non-empty transition.
    wakers: Mutex<Vec<Sender<()>>>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                ticking: false,
                in_flight: HashMap::new(),
                cancelled_in_flight: HashSet::new(),
                last_tick: None,
                frame_count: 0,
                metrics: MetricsState::default(),
            }),
            clock,
            config,
            wakers: Mutex::new(Vec::new()),
        }
    }

    /// Clock shared with throttle wrappers and queues built on this scheduler.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// One frame at the target rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.config.target_fps)
    }

    // ========== Registration ==========

    /// Register a one-shot callback for the next tick.
    pub fn schedule<F>(&self, f: F, priority: Priority) -> CallbackId
    where
        F: FnMut(&TickInfo) + Send + 'static,
    {
        self.schedule_with(
            f,
            ScheduleOptions {
                priority,
                ..Default::default()
            },
        )
    }

    /// Register a callback that runs every tick until cancelled.
    pub fn schedule_persistent<F>(&self, f: F, priority: Priority) -> CallbackId
    where
        F: FnMut(&TickInfo) + Send + 'static,
    {
        self.schedule_with(
            f,
            ScheduleOptions {
                priority,
                persistent: true,
                ..Default::default()
            },
        )
    }

    /// Register a one-shot callback that becomes eligible after `delay`.
    /// Until then it is skipped on every tick.
    pub fn schedule_delayed<F>(&self, f: F, delay: Duration, priority: Priority) -> CallbackId
    where
        F: FnMut(&TickInfo) + Send + 'static,
    {
        self.schedule_with(
            f,
            ScheduleOptions {
                priority,
                delay: Some(delay),
                ..Default::default()
            },
        )
    }

    /// Full-control registration.
    pub fn schedule_with<F>(&self, f: F, opts: ScheduleOptions) -> CallbackId
    where
        F: FnMut(&TickInfo) + Send + 'static,
    {
        let id = opts
            .id
            .unwrap_or_else(|| format!("cb-{}", Uuid::new_v4().simple()));
        let now = self.clock.now();
        let entry = Entry {
            cb: Box::new(f),
            priority: opts.priority,
            persistent: opts.persistent,
            registered_at: now,
            ready_at: opts.delay.map(|d| now + d),
        };

        let was_idle = {
            let mut inner = self.inner.lock().unwrap();
            let was_idle = inner.entries.is_empty() && !inner.ticking;
            if inner.entries.insert(id.clone(), entry).is_some() {
                debug!("callback '{}' replaced", id);
            }
            was_idle
        };

        if was_idle {
            self.notify_wakers();
        }
        CallbackId(id)
    }

    // ========== Cancellation ==========

    /// Remove a callback. Returns whether it existed. Also reaches callbacks
    /// currently executing this tick, so a persistent callback can cancel
    /// itself from inside its own body.
    pub fn cancel(&self, id: &CallbackId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.shift_remove(id.as_str()).is_some() {
            return true;
        }
        if inner.in_flight.contains_key(id.as_str()) {
            inner.cancelled_in_flight.insert(id.as_str().to_string());
            return true;
        }
        false
    }

    /// Remove every callback. Returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let mut count = inner.entries.len();
        inner.entries.clear();

        let in_flight: Vec<String> = inner.in_flight.keys().cloned().collect();
        for id in in_flight {
            if inner.cancelled_in_flight.insert(id) {
                count += 1;
            }
        }
        count
    }

    /// Remove every callback at the given priority tier.
    pub fn cancel_by_priority(&self, priority: Priority) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.priority != priority);
        let mut count = before - inner.entries.len();

        let matching: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, p)| **p == priority)
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            if inner.cancelled_in_flight.insert(id) {
                count += 1;
            }
        }
        count
    }

    // ========== Introspection ==========

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }

    /// Look up a registered callback. `None` once it has run (one-shot) or
    /// been cancelled.
    pub fn callback_info(&self, id: &CallbackId) -> Option<CallbackInfo> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(id.as_str()).map(|e| CallbackInfo {
            priority: e.priority,
            persistent: e.persistent,
            registered_at: e.registered_at,
            ready_at: e.ready_at,
        })
    }

    /// Whether anything is registered or a tick is in progress.
    pub fn has_work(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.entries.is_empty() || inner.ticking
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        let inner = self.inner.lock().unwrap();
        let m = &inner.metrics;
        let avg = if m.frame_times.is_empty() {
            0.0
        } else {
            m.frame_times.iter().sum::<f64>() / m.frame_times.len() as f64
        };
        SchedulerMetrics {
            frames_executed: m.frames_executed,
            callbacks_executed: m.callbacks_executed,
            avg_frame_time_ms: avg,
            current_fps: m.current_fps,
            dropped_frames: m.dropped_frames,
            last_frame_time_ms: m.last_frame_ms,
        }
    }

    // ========== Tick ==========

    /// Run one frame. Called by the driver, or directly in tests.
    pub fn tick(&self) -> TickOutcome {
        let now = self.clock.now();
        let interval = self.frame_interval();

        // Phase 1: select ready work under the lock.
        let mut batch: Vec<(String, Entry)> = Vec::new();
        let (delta, frame) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.ticking {
                warn!("tick() re-entered from a callback, ignoring");
                return TickOutcome {
                    executed: 0,
                    has_work: !inner.entries.is_empty(),
                };
            }
            inner.ticking = true;

            let delta = inner
                .last_tick
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(interval);
            inner.last_tick = Some(now);
            inner.frame_count += 1;
            let frame = inner.frame_count;

            self.update_metrics(&mut inner.metrics, now, delta, interval);

            let mut ready: Vec<(String, Priority)> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.ready_at.is_none_or(|t| now >= t))
                .map(|(id, e)| (id.clone(), e.priority))
                .collect();
            // Stable sort: FIFO within a tier, Critical first.
            ready.sort_by_key(|(_, p)| *p);
            ready.truncate(self.config.max_callbacks_per_frame);

            for (id, priority) in ready {
                if let Some(entry) = inner.entries.shift_remove(&id) {
                    inner.in_flight.insert(id.clone(), priority);
                    batch.push((id, entry));
                }
            }
            (delta, frame)
        };

        // Phase 2: execute with the lock released, so callbacks may schedule
        // or cancel freely.
        let info = TickInfo { now, delta, frame };
        let mut executed = 0usize;
        let mut survivors: Vec<(String, Entry)> = Vec::new();
        for (id, mut entry) in batch {
            let result = catch_unwind(AssertUnwindSafe(|| (entry.cb)(&info)));
            executed += 1;
            match result {
                Ok(()) => {
                    if entry.persistent {
                        // Delay applies to the first run only.
                        entry.ready_at = None;
                        survivors.push((id, entry));
                    }
                }
                Err(_) => {
                    warn!("callback '{}' panicked, dropped permanently", id);
                }
            }
        }

        // Phase 3: re-register surviving persistent callbacks.
        let has_work = {
            let mut inner = self.inner.lock().unwrap();
            for (id, entry) in survivors {
                if !inner.cancelled_in_flight.contains(&id) && !inner.entries.contains_key(&id) {
                    inner.entries.insert(id, entry);
                }
            }
            inner.in_flight.clear();
            inner.cancelled_in_flight.clear();
            inner.ticking = false;
            inner.metrics.callbacks_executed += executed as u64;
            !inner.entries.is_empty()
        };

        TickOutcome { executed, has_work }
    }

    fn update_metrics(&self, m: &mut MetricsState, now: Instant, delta: Duration, interval: Duration) {
        let delta_ms = delta.as_secs_f64() * 1000.0;
        m.frames_executed += 1;
        m.last_frame_ms = delta_ms;

        if delta > interval.mul_f64(DROPPED_FRAME_FACTOR) {
            m.dropped_frames += 1;
        }

        match m.window_start {
            None => {
                m.window_start = Some(now);
                m.frames_in_window = 0;
            }
            Some(start) => {
                m.frames_in_window += 1;
                let window = now.saturating_duration_since(start);
                if window >= Duration::from_millis(1000) {
                    m.current_fps = m.frames_in_window as f64 / window.as_secs_f64();
                    m.window_start = Some(now);
                    m.frames_in_window = 0;
                }
            }
        }

        if self.config.collect_metrics {
            m.frame_times.push_back(delta_ms);
            if m.frame_times.len() > FRAME_TIME_SAMPLES {
                m.frame_times.pop_front();
            }
        }
    }

    // ========== Driver plumbing ==========

    pub(crate) fn add_waker(&self, tx: Sender<()>) {
        self.wakers.lock().unwrap().push(tx);
    }

    fn notify_wakers(&self) {
        let mut wakers = self.wakers.lock().unwrap();
        wakers.retain(|tx| tx.send(()).is_ok());
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

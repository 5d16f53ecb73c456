//! Frame-rate throttling and debouncing for hot handlers
//!
//! **Why**: Scroll/resize/pointer streams fire far more often than frames
//! render. `Throttled` collapses a burst to at most one invocation per frame
//! (leading and/or trailing edge); `Debounced` waits for a quiet period.
//! Both deliver only the most recent arguments.
//!
//! **Used by**: callers wrapping event handlers; trailing edges run through
//! the shared [`FrameScheduler`]
//!
//! # Edge policy
//!
//! Rapid calls before the scheduled frame overwrite the stored arguments -
//! the trailing edge always sees the latest call, earlier ones are dropped.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::clock::Clock;
use crate::priority::Priority;
use crate::sched::{CallbackId, FrameScheduler, ScheduleOptions};

type SinkFn<A> = Arc<Mutex<Box<dyn FnMut(A) + Send>>>;

/// Options for [`Throttled`].
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Priority of the trailing-edge frame callback.
    pub priority: Priority,
    /// Invoke immediately when at least one frame interval has passed since
    /// the last invocation.
    pub leading: bool,
    /// Invoke once on the next frame with the latest arguments of a burst.
    pub trailing: bool,
    /// Force an invocation at least this often under continuous calls.
    pub max_wait: Option<Duration>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            leading: true,
            trailing: true,
            max_wait: None,
        }
    }
}

struct ThrottleState<A> {
    pending: Option<A>,
    last_invoke: Option<Instant>,
    first_pending_at: Option<Instant>,
    /// Trailing frame callback currently registered.
    armed: bool,
}

/// A function wrapped to run at most once per frame.
///
/// Clones share state, like a captured closure would.
pub struct Throttled<A: Send + 'static> {
    scheduler: Arc<FrameScheduler>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    config: ThrottleConfig,
    state: Arc<Mutex<ThrottleState<A>>>,
    func: SinkFn<A>,
    id: CallbackId,
}

enum CallAction<A> {
    Invoke(A),
    Arm,
    Stored,
}

impl<A: Send + 'static> Throttled<A> {
    pub fn new<F>(scheduler: Arc<FrameScheduler>, f: F) -> Self
    where
        F: FnMut(A) + Send + 'static,
    {
        Self::with_config(scheduler, f, ThrottleConfig::default())
    }

    pub fn with_config<F>(scheduler: Arc<FrameScheduler>, f: F, config: ThrottleConfig) -> Self
    where
        F: FnMut(A) + Send + 'static,
    {
        let clock = scheduler.clock();
        let interval = scheduler.frame_interval();
        Self {
            scheduler,
            clock,
            interval,
            config,
            state: Arc::new(Mutex::new(ThrottleState {
                pending: None,
                last_invoke: None,
                first_pending_at: None,
                armed: false,
            })),
            func: Arc::new(Mutex::new(Box::new(f))),
            id: CallbackId::from(format!("throttle-{}", Uuid::new_v4().simple()).as_str()),
        }
    }

    /// Feed one call through the throttle.
    pub fn call(&self, args: A) {
        let now = self.clock.now();
        let action = {
            let mut st = self.state.lock().unwrap();

            let leading_ok = self.config.leading
                && st
                    .last_invoke
                    .is_none_or(|t| now.saturating_duration_since(t) >= self.interval);
            let max_wait_hit = match (self.config.max_wait, st.first_pending_at) {
                (Some(mw), Some(first)) => now.saturating_duration_since(first) >= mw,
                _ => false,
            };

            if leading_ok || max_wait_hit {
                st.last_invoke = Some(now);
                st.pending = None;
                st.first_pending_at = None;
                CallAction::Invoke(args)
            } else {
                st.pending = Some(args);
                if st.first_pending_at.is_none() {
                    st.first_pending_at = Some(now);
                }
                if self.config.trailing && !st.armed {
                    st.armed = true;
                    CallAction::Arm
                } else {
                    CallAction::Stored
                }
            }
        };

        match action {
            CallAction::Invoke(args) => (*self.func.lock().unwrap())(args),
            CallAction::Arm => self.arm_trailing(),
            CallAction::Stored => {}
        }
    }

    /// Whether a trailing invocation is outstanding.
    pub fn pending(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }

    /// Drop any outstanding trailing invocation.
    pub fn cancel(&self) {
        let disarm = {
            let mut st = self.state.lock().unwrap();
            st.pending = None;
            st.first_pending_at = None;
            std::mem::take(&mut st.armed)
        };
        if disarm {
            self.scheduler.cancel(&self.id);
        }
    }

    /// Force the outstanding trailing invocation to run now.
    pub fn flush(&self) {
        let now = self.clock.now();
        let (fire, disarm) = {
            let mut st = self.state.lock().unwrap();
            let fire = st.pending.take();
            if fire.is_some() {
                st.last_invoke = Some(now);
                st.first_pending_at = None;
            }
            (fire, std::mem::take(&mut st.armed))
        };
        if disarm {
            self.scheduler.cancel(&self.id);
        }
        if let Some(args) = fire {
            (*self.func.lock().unwrap())(args);
        }
    }

    fn arm_trailing(&self) {
        let state = Arc::clone(&self.state);
        let func = Arc::clone(&self.func);
        self.scheduler.schedule_with(
            move |tick| {
                let fire = {
                    let mut st = state.lock().unwrap();
                    st.armed = false;
                    match st.pending.take() {
                        Some(args) => {
                            st.last_invoke = Some(tick.now);
                            st.first_pending_at = None;
                            Some(args)
                        }
                        None => None,
                    }
                };
                if let Some(args) = fire {
                    (*func.lock().unwrap())(args);
                }
            },
            ScheduleOptions {
                priority: self.config.priority,
                id: Some(self.id.as_str().to_string()),
                ..Default::default()
            },
        );
    }
}

impl<A: Send + 'static> Clone for Throttled<A> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            clock: Arc::clone(&self.clock),
            interval: self.interval,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            func: Arc::clone(&self.func),
            id: self.id.clone(),
        }
    }
}

/// Options for [`Debounced`].
#[derive(Debug, Clone, Default)]
pub struct DebounceConfig {
    /// Priority of the delayed frame callback.
    pub priority: Priority,
    /// Force an invocation this long after the first call of a burst, even
    /// if calls keep arriving.
    pub max_wait: Option<Duration>,
}

struct DebounceState<A> {
    pending: Option<A>,
    first_call_at: Option<Instant>,
    armed: bool,
}

/// A function wrapped to fire only after `wait` of quiet. Every call re-arms
/// the timer; `max_wait` bounds the total delay under continuous calls.
pub struct Debounced<A: Send + 'static> {
    scheduler: Arc<FrameScheduler>,
    clock: Arc<dyn Clock>,
    wait: Duration,
    config: DebounceConfig,
    state: Arc<Mutex<DebounceState<A>>>,
    func: SinkFn<A>,
    id: CallbackId,
}

impl<A: Send + 'static> Debounced<A> {
    pub fn new<F>(scheduler: Arc<FrameScheduler>, f: F, wait: Duration) -> Self
    where
        F: FnMut(A) + Send + 'static,
    {
        Self::with_config(scheduler, f, wait, DebounceConfig::default())
    }

    pub fn with_config<F>(
        scheduler: Arc<FrameScheduler>,
        f: F,
        wait: Duration,
        config: DebounceConfig,
    ) -> Self
    where
        F: FnMut(A) + Send + 'static,
    {
        let clock = scheduler.clock();
        Self {
            scheduler,
            clock,
            wait,
            config,
            state: Arc::new(Mutex::new(DebounceState {
                pending: None,
                first_call_at: None,
                armed: false,
            })),
            func: Arc::new(Mutex::new(Box::new(f))),
            id: CallbackId::from(format!("debounce-{}", Uuid::new_v4().simple()).as_str()),
        }
    }

    /// Feed one call through the debounce, re-arming the quiet timer.
    pub fn call(&self, args: A) {
        let now = self.clock.now();
        let delay = {
            let mut st = self.state.lock().unwrap();
            st.pending = Some(args);
            if st.first_call_at.is_none() {
                st.first_call_at = Some(now);
            }
            st.armed = true;

            let mut fire_at = now + self.wait;
            if let (Some(mw), Some(first)) = (self.config.max_wait, st.first_call_at) {
                fire_at = fire_at.min(first + mw);
            }
            fire_at.saturating_duration_since(now)
        };

        // Same id: this replaces the previously armed registration.
        let state = Arc::clone(&self.state);
        let func = Arc::clone(&self.func);
        self.scheduler.schedule_with(
            move |_tick| {
                let fire = {
                    let mut st = state.lock().unwrap();
                    st.armed = false;
                    st.first_call_at = None;
                    st.pending.take()
                };
                if let Some(args) = fire {
                    (*func.lock().unwrap())(args);
                }
            },
            ScheduleOptions {
                priority: self.config.priority,
                delay: Some(delay),
                id: Some(self.id.as_str().to_string()),
                ..Default::default()
            },
        );
    }

    /// Whether an invocation is outstanding.
    pub fn pending(&self) -> bool {
        self.state.lock().unwrap().pending.is_some()
    }

    /// Drop the outstanding invocation and disarm the timer.
    pub fn cancel(&self) {
        let disarm = {
            let mut st = self.state.lock().unwrap();
            st.pending = None;
            st.first_call_at = None;
            std::mem::take(&mut st.armed)
        };
        if disarm {
            self.scheduler.cancel(&self.id);
        }
    }

    /// Run the outstanding invocation now instead of waiting out the timer.
    pub fn flush(&self) {
        let (fire, disarm) = {
            let mut st = self.state.lock().unwrap();
            let fire = st.pending.take();
            st.first_call_at = None;
            (fire, std::mem::take(&mut st.armed))
        };
        if disarm {
            self.scheduler.cancel(&self.id);
        }
        if let Some(args) = fire {
            (*self.func.lock().unwrap())(args);
        }
    }
}

impl<A: Send + 'static> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
            clock: Arc::clone(&self.clock),
            wait: self.wait,
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            func: Arc::clone(&self.func),
            id: self.id.clone(),
        }
    }
}

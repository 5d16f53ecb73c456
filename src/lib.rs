//! cadenza - cooperative frame scheduling for UI workloads
//!
//! One tick loop for everything that wants to run "next frame":
//!
//! - [`FrameScheduler`]: priority-ordered one-shot, persistent and delayed
//!   callbacks, with frame metrics (FPS, dropped frames)
//! - [`FrameDriver`]: ticks a scheduler at a target rate on its own thread,
//!   parking while there is nothing to do
//! - [`Throttled`] / [`Debounced`]: collapse hot handler bursts to one
//!   invocation per frame, or one invocation after a quiet period
//! - [`AnimationQueue`]: bounded-concurrency, cancellable animation jobs
//!   stepped once per frame
//! - [`MemoCache`] / [`Memoized`]: LRU + TTL caches for derived values
//!
//! Everything is an explicit instance shared by `Arc` - no global state.
//! Cancellation is cooperative throughout: tokens are flipped and observed,
//! in-flight work is never force-terminated.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cadenza::{
//!     AnimationQueue, FrameDriver, FrameScheduler, JobOptions, JobPoll, QueueConfig, Throttled,
//! };
//!
//! let scheduler = Arc::new(FrameScheduler::new());
//! let driver = FrameDriver::spawn(Arc::clone(&scheduler));
//!
//! // Collapse a hot handler to one invocation per frame.
//! let on_scroll = Throttled::new(Arc::clone(&scheduler), |offset: f64| {
//!     let _ = offset; // re-render with the latest offset
//! });
//! on_scroll.call(42.0);
//!
//! // A cancellable animation, stepped once per frame until it settles.
//! let queue = Arc::new(AnimationQueue::new(QueueConfig::default()));
//! queue.attach(&scheduler);
//! queue
//!     .add(
//!         |cx| {
//!             if cx.is_cancelled() {
//!                 return JobPoll::Complete;
//!             }
//!             cx.progress += 0.1;
//!             if cx.progress >= 1.0 {
//!                 JobPoll::Complete
//!             } else {
//!                 JobPoll::Pending
//!             }
//!         },
//!         JobOptions::default(),
//!     )
//!     .unwrap();
//!
//! driver.shutdown();
//! ```

pub mod cancel;
pub mod clock;
pub mod driver;
pub mod error;
pub mod memo;
pub mod priority;
pub mod queue;
pub mod sched;
pub mod throttle;

pub use cancel::{CancelSource, CancelToken};
pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::FrameDriver;
pub use error::QueueError;
pub use memo::{
    CacheStats, MemoCache, MemoConfig, Memoized, memo_key, memo_key_commutative, memoize,
};
pub use priority::Priority;
pub use queue::{
    AnimationQueue, JobCx, JobId, JobOptions, JobPoll, JobSpec, JobState, JobStatus, QueueConfig,
    QueueStats,
};
pub use sched::{
    CallbackId, CallbackInfo, FrameScheduler, ScheduleOptions, SchedulerConfig, SchedulerMetrics,
    TickInfo, TickOutcome,
};
pub use throttle::{DebounceConfig, Debounced, ThrottleConfig, Throttled};

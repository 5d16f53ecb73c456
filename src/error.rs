//! Error types for the animation queue

use thiserror::Error;

/// Errors returned by [`crate::queue::AnimationQueue`] operations.
///
/// Everything else in this crate is best-effort and non-fatal: a scheduler
/// callback that panics is logged and dropped, a failed job reports through
/// its own `on_error` hook. Only admission and lifecycle misuse surface as
/// `Result` errors that callers must handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Queue already holds `max_queue_size` live jobs.
    #[error("animation queue is full ({0} jobs)")]
    QueueFull(usize),

    /// A job with this id is already queued or running.
    #[error("duplicate job id: {0}")]
    DuplicateJob(String),

    /// No live job with this id.
    #[error("unknown job id: {0}")]
    UnknownJob(String),

    /// Operation requires a different job state (e.g. resume on a job that
    /// is not paused).
    #[error("job {id} is {actual}, expected {expected}")]
    InvalidState {
        id: String,
        expected: &'static str,
        actual: &'static str,
    },
}

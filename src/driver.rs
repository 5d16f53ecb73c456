//! Frame driver - ticks a scheduler at a target rate on its own thread
//!
//! **Why**: The scheduler is passive; something has to call `tick()` once per
//! frame. In a windowed app that is the render loop. Standalone, this driver
//! plays the role of `requestAnimationFrame`: it ticks while the scheduler
//! has work, parks when it goes empty, and wakes on the next registration.
//! No idle polling.
//!
//! **Used by**: hosts without their own frame loop; integration tests

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use log::debug;

use crate::sched::FrameScheduler;

/// Driver handle. Shuts the loop down on `shutdown()` or `Drop`.
pub struct FrameDriver {
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameDriver {
    /// Spawn the drive thread for `scheduler`, ticking at the scheduler's
    /// target frame rate.
    pub fn spawn(scheduler: Arc<FrameScheduler>) -> Self {
        let (stop_tx, stop_rx) = unbounded::<()>();
        let (wake_tx, wake_rx) = unbounded::<()>();
        scheduler.add_waker(wake_tx);

        let handle = thread::Builder::new()
            .name("cadenza-driver".to_string())
            .spawn(move || drive_loop(scheduler, stop_rx, wake_rx))
            .expect("failed to spawn driver thread");

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the loop and join the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn drive_loop(scheduler: Arc<FrameScheduler>, stop_rx: Receiver<()>, wake_rx: Receiver<()>) {
    let interval = scheduler.frame_interval();
    debug!("driver started, interval={:?}", interval);

    loop {
        if !scheduler.has_work() {
            // Park until new work arrives or we are told to stop.
            select! {
                recv(stop_rx) -> _ => break,
                recv(wake_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        let started = Instant::now();
        scheduler.tick();

        // Coalesce wake signals that arrived while ticking.
        while wake_rx.try_recv().is_ok() {}

        let elapsed = started.elapsed();
        let remaining = interval.saturating_sub(elapsed);
        if remaining > Duration::ZERO {
            match stop_rx.recv_timeout(remaining) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        } else if stop_rx.try_recv().is_ok() {
            break;
        }
    }

    debug!("driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::priority::Priority;
    use crossbeam_channel::bounded;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_driver_executes_scheduled_callback() {
        init_logs();
        let scheduler = Arc::new(FrameScheduler::new());
        let driver = FrameDriver::spawn(Arc::clone(&scheduler));

        let (done_tx, done_rx) = bounded(1);
        scheduler.schedule(
            move |_| {
                let _ = done_tx.send(());
            },
            Priority::Normal,
        );

        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("callback never ran");
        driver.shutdown();
    }

    #[test]
    fn test_driver_wakes_after_idle() {
        init_logs();
        let scheduler = Arc::new(FrameScheduler::new());
        let driver = FrameDriver::spawn(Arc::clone(&scheduler));

        // Let the driver reach its parked state, then schedule.
        thread::sleep(Duration::from_millis(50));

        let (done_tx, done_rx) = bounded(1);
        scheduler.schedule(
            move |_| {
                let _ = done_tx.send(());
            },
            Priority::High,
        );

        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("driver did not wake");
        driver.shutdown();
    }

    #[test]
    fn test_shutdown_joins() {
        init_logs();
        let scheduler = Arc::new(FrameScheduler::new());
        scheduler.schedule_persistent(|_| {}, Priority::Normal);

        let driver = FrameDriver::spawn(Arc::clone(&scheduler));
        thread::sleep(Duration::from_millis(30));
        driver.shutdown(); // must not hang with a persistent callback live
    }
}

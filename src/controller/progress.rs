//! Background progress monitor for a run.
//!
//! Periodically logs run counters (completed, failed, in flight, batches) so
//! operators can follow long runs without reading per-call log lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

/// Snapshot of run progress counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub failed: usize,
    /// Trials currently executing.
    pub in_flight: usize,
    /// Batches finished this session.
    pub batches: usize,
    pub elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

/// Shared atomic counters updated by the controller loop.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub completed: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub batches: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping it also stops the task
/// at its next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts logging every `interval`.
    ///
    /// `scheduled` is the number of trials this session intends to run and
    /// drives the percentage.
    pub fn start(
        run_id: String,
        counters: ProgressCounters,
        scheduled: usize,
        interval: Duration,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let pct = if scheduled > 0 {
                    (snap.finished() as f64 / scheduled as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let trials_per_min = if elapsed_secs > 0.0 {
                    snap.finished() as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    run_id = %run_id,
                    completed = snap.completed,
                    failed = snap.failed,
                    in_flight = snap.in_flight,
                    batches = snap.batches,
                    scheduled = scheduled,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    trials_per_min = format!("{:.2}", trials_per_min),
                    "Run progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // Abort rather than wait out the current tick.
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let snap = ProgressCounters::new().snapshot(Instant::now());
        assert_eq!(snap.finished(), 0);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.batches, 0);
    }

    #[test]
    fn test_clone_shares_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();
        counters.completed.fetch_add(2, Ordering::Relaxed);
        counters.failed.fetch_add(1, Ordering::Relaxed);
        let snap = clone.snapshot(Instant::now());
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.finished(), 3);
    }

    #[tokio::test]
    async fn test_monitor_start_stop() {
        let counters = ProgressCounters::new();
        counters.completed.fetch_add(3, Ordering::Relaxed);
        let monitor = ProgressMonitor::start(
            "run_test".to_string(),
            counters,
            10,
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;
    }
}

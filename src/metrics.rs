// Ingestion metrics
//
// Lightweight counters for bag throughput, decoder health and admission control

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Pipeline counters
///
/// Uses atomic operations so producers, the dispatcher and worker threads can
/// record without locks. Logged periodically while running and on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Bags whose slot was claimed by a producer
    pub bags_claimed: AtomicUsize,

    /// Bags that reached READYTORENDER
    pub bags_ready: AtomicUsize,

    /// Bags handed back by the renderer
    pub bags_disposed: AtomicUsize,

    /// Bags moved to ERROR
    pub bags_failed: AtomicUsize,

    pub slices_enqueued: AtomicU64,

    /// Slices decoded and written into a volume
    pub slices_decoded: AtomicU64,

    /// Slices the codec rejected
    pub slices_failed: AtomicU64,

    /// Tasks discarded because their slot was re-claimed meanwhile
    pub stale_tasks: AtomicU64,

    /// Tasks handed to a worker
    pub dispatches: AtomicU64,

    /// Admission permits taken by the dispatcher
    pub permits_acquired: AtomicU64,

    /// Admission permits returned by workers
    pub permits_released: AtomicU64,

    /// Cumulative codec time in microseconds
    pub total_decode_time_us: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            bags_claimed: AtomicUsize::new(0),
            bags_ready: AtomicUsize::new(0),
            bags_disposed: AtomicUsize::new(0),
            bags_failed: AtomicUsize::new(0),
            slices_enqueued: AtomicU64::new(0),
            slices_decoded: AtomicU64::new(0),
            slices_failed: AtomicU64::new(0),
            stale_tasks: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            permits_acquired: AtomicU64::new(0),
            permits_released: AtomicU64::new(0),
            total_decode_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_bag_claimed(&self) {
        self.bags_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bag_ready(&self) {
        self.bags_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bag_disposed(&self) {
        self.bags_disposed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bag_failed(&self) {
        self.bags_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slice_enqueued(&self) {
        self.slices_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful decode and the time the codec took
    pub fn record_slice_decoded(&self, duration: Duration) {
        self.slices_decoded.fetch_add(1, Ordering::Relaxed);
        self.total_decode_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_slice_failed(&self) {
        self.slices_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_task(&self) {
        self.stale_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_acquired(&self) {
        self.permits_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permit_released(&self) {
        self.permits_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Permits currently held by dispatched tasks
    pub fn permits_outstanding(&self) -> u64 {
        self.permits_acquired
            .load(Ordering::Relaxed)
            .saturating_sub(self.permits_released.load(Ordering::Relaxed))
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average codec time per decoded slice in milliseconds
    pub fn avg_decode_time_ms(&self) -> f64 {
        let total = self.total_decode_time_us.load(Ordering::Relaxed);
        let count = self.slices_decoded.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64 / 1000.0
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Ingestion Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Bags: {} claimed, {} ready, {} disposed, {} failed",
            self.bags_claimed.load(Ordering::Relaxed),
            self.bags_ready.load(Ordering::Relaxed),
            self.bags_disposed.load(Ordering::Relaxed),
            self.bags_failed.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Slices: {} enqueued, {} decoded, {} failed (avg decode {:.3}ms)",
            self.slices_enqueued.load(Ordering::Relaxed),
            self.slices_decoded.load(Ordering::Relaxed),
            self.slices_failed.load(Ordering::Relaxed),
            self.avg_decode_time_ms()
        );
        tracing::info!(
            "Dispatch: {} tasks, {} stale, permits {}/{} acquired/released",
            self.dispatches.load(Ordering::Relaxed),
            self.stale_tasks.load(Ordering::Relaxed),
            self.permits_acquired.load(Ordering::Relaxed),
            self.permits_released.load(Ordering::Relaxed)
        );
    }

    /// One-line progress report for long-running sessions
    pub fn log_periodic(&self) {
        tracing::info!(
            "Metrics: {} bags ready, {} slices decoded, {} permits outstanding, uptime {:.0}s",
            self.bags_ready.load(Ordering::Relaxed),
            self.slices_decoded.load(Ordering::Relaxed),
            self.permits_outstanding(),
            self.uptime().as_secs_f64()
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.bags_claimed.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.permits_outstanding(), 0);
    }

    #[test]
    fn test_record_bag_lifecycle() {
        let metrics = Metrics::new();

        metrics.record_bag_claimed();
        metrics.record_bag_claimed();
        metrics.record_bag_ready();
        metrics.record_bag_failed();
        metrics.record_bag_disposed();

        assert_eq!(metrics.bags_claimed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.bags_ready.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.bags_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.bags_disposed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_decode_time_average() {
        let metrics = Metrics::new();

        metrics.record_slice_decoded(Duration::from_millis(2));
        metrics.record_slice_decoded(Duration::from_millis(4));

        assert_eq!(metrics.slices_decoded.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.avg_decode_time_ms(), 3.0);
    }

    #[test]
    fn test_avg_decode_time_no_slices() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_decode_time_ms(), 0.0);
    }

    #[test]
    fn test_permit_accounting() {
        let metrics = Metrics::new();

        metrics.record_permit_acquired();
        metrics.record_permit_acquired();
        metrics.record_permit_released();
        assert_eq!(metrics.permits_outstanding(), 1);

        metrics.record_permit_released();
        assert_eq!(metrics.permits_outstanding(), 0);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}

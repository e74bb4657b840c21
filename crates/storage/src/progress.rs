//! Transfer progress tracking, periodic display, and stall detection.
//!
//! A [`TransferProgress`] is shared by every task working on one transfer.
//! Workers report bytes, the display ticker renders snapshots, and the
//! [`StallMonitor`] cancels the transfer when nothing moves for too long.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use artifact_cache_common::ProgressCallback;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::types::OperationType;

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Transfer direction.
    pub operation: OperationType,
    /// What is being transferred, usually an artifact name or key.
    pub label: String,
    /// Bytes moved so far.
    pub transferred: u64,
    /// Expected total, 0 when unknown.
    pub total: u64,
}

impl ProgressSnapshot {
    /// Completion percentage, `None` when the total is unknown.
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.transferred as f64 / self.total as f64 * 100.0)
    }

    /// Human-readable progress line.
    pub fn render(&self) -> String {
        match self.percent() {
            Some(pct) => format!(
                "{} {} of {} ({:.1}%) for {}",
                self.operation.verb(),
                format_bytes(self.transferred),
                format_bytes(self.total),
                pct,
                self.label
            ),
            None => format!(
                "{} {} for {}",
                self.operation.verb(),
                format_bytes(self.transferred),
                self.label
            ),
        }
    }
}

/// Format a byte count with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value: f64 = bytes as f64;
    let mut unit: usize = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Renders progress lines through `log::info!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressCallback<ProgressSnapshot> for LogProgress {
    fn on_progress(&self, progress: &ProgressSnapshot) -> bool {
        log::info!("{}", progress.render());
        true
    }
}

struct DisplayHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct ProgressState {
    operation: OperationType,
    label: String,
    total: AtomicU64,
    transferred: AtomicU64,
    last_progress: Mutex<Instant>,
    stalled_after: Mutex<Option<Duration>>,
    finished: AtomicBool,
    cancel: CancellationToken,
    display: Mutex<Option<DisplayHandle>>,
}

/// Shared, cloneable progress counter for one transfer.
#[derive(Clone)]
pub struct TransferProgress {
    state: Arc<ProgressState>,
}

impl std::fmt::Debug for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProgress")
            .field("label", &self.state.label)
            .field("transferred", &self.transferred())
            .field("total", &self.total())
            .finish()
    }
}

impl TransferProgress {
    /// Create a progress counter with its own cancellation token.
    ///
    /// # Arguments
    /// * `operation` - Transfer direction
    /// * `label` - Name shown in progress lines
    /// * `total` - Expected byte count, 0 if unknown
    pub fn new(operation: OperationType, label: impl Into<String>, total: u64) -> Self {
        Self::with_cancellation(operation, label, total, CancellationToken::new())
    }

    /// Create a progress counter tied to an existing cancellation token.
    pub fn with_cancellation(
        operation: OperationType,
        label: impl Into<String>,
        total: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(ProgressState {
                operation,
                label: label.into(),
                total: AtomicU64::new(total),
                transferred: AtomicU64::new(0),
                last_progress: Mutex::new(Instant::now()),
                stalled_after: Mutex::new(None),
                finished: AtomicBool::new(false),
                cancel,
                display: Mutex::new(None),
            }),
        }
    }

    /// Expected total bytes, 0 if unknown.
    pub fn total(&self) -> u64 {
        self.state.total.load(Ordering::SeqCst)
    }

    /// Set the expected total once it becomes known.
    pub fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::SeqCst);
    }

    /// Bytes moved so far.
    pub fn transferred(&self) -> u64 {
        self.state.transferred.load(Ordering::SeqCst)
    }

    /// Record the cumulative byte count.
    ///
    /// Values lower than the current count are ignored.
    pub fn advance(&self, cumulative: u64) {
        let previous: u64 = self
            .state
            .transferred
            .fetch_max(cumulative, Ordering::SeqCst);
        if cumulative < previous {
            log::debug!(
                "Ignoring progress regression for {}: {} < {}",
                self.state.label,
                cumulative,
                previous
            );
            return;
        }
        self.touch();
    }

    /// Add `delta` bytes to the count. Used when parts finish out of order.
    pub fn add(&self, delta: u64) {
        self.state.transferred.fetch_add(delta, Ordering::SeqCst);
        self.touch();
    }

    /// Refresh the stall clock without changing the count.
    pub fn touch(&self) {
        if let Ok(mut last) = self.state.last_progress.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the last recorded progress.
    pub fn since_last_progress(&self) -> Duration {
        match self.state.last_progress.lock() {
            Ok(last) => last.elapsed(),
            Err(_) => Duration::ZERO,
        }
    }

    /// Whether the transfer is known to be done.
    pub fn is_complete(&self) -> bool {
        if self.state.finished.load(Ordering::SeqCst) {
            return true;
        }
        let total: u64 = self.total();
        total > 0 && self.transferred() == total
    }

    /// Mark the transfer done regardless of byte counts.
    pub fn finish(&self) {
        self.state.finished.store(true, Ordering::SeqCst);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            operation: self.state.operation,
            label: self.state.label.clone(),
            transferred: self.transferred(),
            total: self.total(),
        }
    }

    /// Cancel the transfer.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    /// Whether the transfer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Completes when the transfer is cancelled.
    pub async fn cancelled(&self) {
        self.state.cancel.cancelled().await
    }

    /// Token shared by every task in this transfer.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    /// Record that the stall monitor fired.
    pub fn mark_stalled(&self, timeout: Duration) {
        if let Ok(mut stalled) = self.state.stalled_after.lock() {
            *stalled = Some(timeout);
        }
    }

    /// Stall window that fired, if any.
    pub fn stalled_after(&self) -> Option<Duration> {
        self.state.stalled_after.lock().ok().and_then(|s| *s)
    }

    /// Error describing why the transfer stopped after cancellation.
    pub fn cancellation_error(&self) -> StorageError {
        match self.stalled_after() {
            Some(timeout) => StorageError::Stalled { timeout },
            None => StorageError::Cancelled,
        }
    }

    /// Start re-rendering progress every `interval`.
    ///
    /// Does nothing if the transfer is already complete or a display is
    /// already running. The ticker renders one final line when the transfer
    /// completes, is cancelled, or the display is stopped. A callback that
    /// returns `false` cancels the transfer.
    ///
    /// # Arguments
    /// * `interval` - Time between progress lines
    /// * `callback` - Receives each snapshot
    pub fn start_display(
        &self,
        interval: Duration,
        callback: Arc<dyn ProgressCallback<ProgressSnapshot>>,
    ) {
        if self.is_complete() {
            return;
        }
        let Ok(mut display) = self.state.display.lock() else {
            return;
        };
        if display.is_some() {
            return;
        }

        let stop: CancellationToken = CancellationToken::new();
        let task_stop: CancellationToken = stop.clone();
        let cancel: CancellationToken = self.state.cancel.clone();
        let weak: Weak<ProgressState> = Arc::downgrade(&self.state);

        let task: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker: tokio::time::Interval =
                tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(state) = weak.upgrade() else {
                            return;
                        };
                        let progress: TransferProgress = TransferProgress { state };
                        if progress.is_complete() {
                            break;
                        }
                        if !callback.on_progress(&progress.snapshot()) {
                            progress.cancel();
                            return;
                        }
                    }
                }
            }

            if let Some(state) = weak.upgrade() {
                let progress: TransferProgress = TransferProgress { state };
                callback.on_progress(&progress.snapshot());
            }
        });

        *display = Some(DisplayHandle { stop, task });
    }

    /// Stop the display ticker and wait for its final line.
    pub async fn stop_display(&self) {
        let handle: Option<DisplayHandle> = match self.state.display.lock() {
            Ok(mut display) => display.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            handle.stop.cancel();
            if let Err(e) = handle.task.await {
                log::debug!("Progress display for {} ended abnormally: {}", self.state.label, e);
            }
        }
    }
}

/// Watches a transfer and cancels it when no progress is seen for the
/// stall window.
pub struct StallMonitor;

impl StallMonitor {
    /// Spawn a monitor for `progress`.
    ///
    /// # Arguments
    /// * `progress` - Transfer to watch
    /// * `timeout` - Stall window
    ///
    /// # Returns
    /// A guard that stops the monitor when dropped.
    pub fn spawn(progress: &TransferProgress, timeout: Duration) -> StallGuard {
        let progress: TransferProgress = progress.clone();

        let handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                let idle: Duration = progress.since_last_progress();
                if idle >= timeout {
                    log::warn!(
                        "No progress on {} for {:?}, cancelling",
                        progress.state.label,
                        timeout
                    );
                    progress.mark_stalled(timeout);
                    progress.cancel();
                    return;
                }

                tokio::select! {
                    _ = progress.cancelled() => return,
                    _ = tokio::time::sleep(timeout - idle) => {}
                }
            }
        });

        StallGuard { handle }
    }
}

/// Stops the stall monitor task on drop.
pub struct StallGuard {
    handle: JoinHandle<()>,
}

impl Drop for StallGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every rendered count.
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        keep_going: bool,
    }

    impl Recorder {
        fn new(keep_going: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                keep_going,
            })
        }
    }

    impl ProgressCallback<ProgressSnapshot> for Recorder {
        fn on_progress(&self, progress: &ProgressSnapshot) -> bool {
            self.seen.lock().unwrap().push(progress.transferred);
            self.keep_going
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(20 * 1024 * 1024), "20.0 MiB");
    }

    #[test]
    fn test_snapshot_render() {
        let snapshot: ProgressSnapshot = ProgressSnapshot {
            operation: OperationType::Uploading,
            label: "dist.zip".into(),
            transferred: 5 * 1024 * 1024,
            total: 20 * 1024 * 1024,
        };
        assert_eq!(snapshot.render(), "Uploaded 5.0 MiB of 20.0 MiB (25.0%) for dist.zip");

        let unknown: ProgressSnapshot = ProgressSnapshot { total: 0, ..snapshot };
        assert_eq!(unknown.render(), "Uploaded 5.0 MiB for dist.zip");
    }

    #[tokio::test]
    async fn test_advance_is_monotonic() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Downloading, "a", 100);
        progress.advance(40);
        progress.advance(10);
        assert_eq!(progress.transferred(), 40);
        progress.advance(100);
        assert!(progress.is_complete());
    }

    #[tokio::test]
    async fn test_unknown_total_completes_only_on_finish() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, "a", 0);
        progress.add(50);
        assert!(!progress.is_complete());
        progress.finish();
        assert!(progress.is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_monitor_cancels_after_window() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, "a", 10);
        let _guard: StallGuard = StallMonitor::spawn(&progress, Duration::from_secs(30));

        let start: Instant = Instant::now();
        progress.cancelled().await;

        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(31));
        assert!(matches!(progress.cancellation_error(), StorageError::Stalled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_monitor_reset_by_progress() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, "a", 10);
        let _guard: StallGuard = StallMonitor::spawn(&progress, Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(20)).await;
        progress.add(1);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!progress.is_cancelled());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(progress.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_guard_stops_monitor() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, "a", 10);
        let guard: StallGuard = StallMonitor::spawn(&progress, Duration::from_secs(5));
        drop(guard);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!progress.is_cancelled());
        assert!(matches!(progress.cancellation_error(), StorageError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_renders_final_line_and_stops() {
        let recorder: Arc<Recorder> = Recorder::new(true);
        let progress: TransferProgress = TransferProgress::new(OperationType::Uploading, "a", 100);

        progress.start_display(Duration::from_secs(10), recorder.clone());

        progress.advance(30);
        tokio::time::sleep(Duration::from_secs(11)).await;
        progress.advance(100);
        tokio::time::sleep(Duration::from_secs(10)).await;
        progress.stop_display().await;

        assert_eq!(*recorder.seen.lock().unwrap(), vec![30, 100]);

        // Restarting after completion is a no-op.
        progress.start_display(Duration::from_secs(1), Arc::new(LogProgress));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_callback_can_cancel() {
        let progress: TransferProgress = TransferProgress::new(OperationType::Downloading, "a", 100);
        progress.start_display(Duration::from_secs(1), Recorder::new(false));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(progress.is_cancelled());
        assert!(matches!(progress.cancellation_error(), StorageError::Cancelled));
    }
}

//! Progress reporting and cancellation support.
//!
//! This module provides [`ProgressCallback`] for monitoring a detection run,
//! [`CancellationToken`] for cooperative cancellation, and [`ProgressInfo`]
//! for per-stage progress snapshots.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use episplit::{DetectionConfig, EpisplitError, Pipeline, ProgressCallback, ProgressInfo};
//!
//! struct PrintProgress;
//!
//! impl ProgressCallback for PrintProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         if let Some(pct) = info.percentage {
//!             println!("[{:?}] {pct:.1}% complete", info.stage);
//!         }
//!     }
//! }
//!
//! let config = DetectionConfig::new()
//!     .with_expected_episodes(3)
//!     .with_progress(Arc::new(PrintProgress));
//!
//! let report = Pipeline::new(config).run("Show.S01E01-E03.mkv")?;
//! println!("{} split points", report.split_points.len());
//! # Ok::<(), EpisplitError>(())
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

/// The pipeline stage currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Stage {
    /// Reading duration, streams and chapters.
    Probe,
    /// Phase 1: choosing search windows.
    Windows,
    /// Phase 2: running detectors.
    Detection,
    /// Clustering raw detections per window.
    Clustering,
    /// Merging whole-file boundary lists.
    Merging,
    /// Runtime validation against TMDB.
    Validation,
    /// Writing the episode files.
    Splitting,
}

/// A snapshot of progress within one stage.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// The stage being reported.
    pub stage: Stage,
    /// Units completed so far (detectors, windows, episodes).
    pub current: u64,
    /// Total units expected, if known ahead of time.
    pub total: Option<u64>,
    /// Completion percentage (0.0 - 100.0), if `total` is known.
    pub percentage: Option<f32>,
    /// Wall-clock time elapsed since the stage started.
    pub elapsed: Duration,
    /// Estimated time remaining, based on current throughput.
    pub estimated_remaining: Option<Duration>,
    /// What the last unit was, e.g. a detector name.
    pub detail: Option<String>,
}

/// Trait for receiving progress updates during a run.
///
/// Implementations must be [`Send`] and [`Sync`] because detectors report
/// from worker threads.
///
/// Progress callbacks observe but cannot halt the run. Use
/// [`CancellationToken`] for cooperative cancellation.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, info: &ProgressInfo);
}

/// Discards all progress notifications. The default callback.
pub(crate) struct NoOpProgress;

impl ProgressCallback for NoOpProgress {
    fn on_progress(&self, _info: &ProgressInfo) {}
}

/// Cooperative cancellation token backed by an [`AtomicBool`].
///
/// Clone the token and call [`cancel`](CancellationToken::cancel) from any
/// thread. The pipeline checks it between detectors and between windows.
///
/// ```
/// use episplit::CancellationToken;
///
/// let token = CancellationToken::new();
/// assert!(!token.is_cancelled());
///
/// token.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks timing for one stage and emits callbacks.
pub(crate) struct ProgressTracker {
    callback: Arc<dyn ProgressCallback>,
    stage: Stage,
    total: Option<u64>,
    current: u64,
    start_time: Instant,
}

impl ProgressTracker {
    pub(crate) fn new(callback: Arc<dyn ProgressCallback>, stage: Stage, total: Option<u64>) -> Self {
        Self {
            callback,
            stage,
            total,
            current: 0,
            start_time: Instant::now(),
        }
    }

    /// Record one completed unit and report it.
    pub(crate) fn advance(&mut self, detail: Option<&str>) {
        self.current += 1;
        self.report(detail);
    }

    /// Report the stage as complete.
    pub(crate) fn finish(&mut self) {
        if let Some(total) = self.total {
            self.current = self.current.max(total);
        }
        self.report(None);
    }

    fn report(&self, detail: Option<&str>) {
        let elapsed = self.start_time.elapsed();

        let percentage = self
            .total
            .filter(|&t| t > 0)
            .map(|t| (self.current as f32 / t as f32 * 100.0).min(100.0));

        let estimated_remaining = if self.current > 0 {
            self.total.map(|t| {
                let remaining = t.saturating_sub(self.current);
                let per_item = elapsed / self.current as u32;
                per_item * remaining as u32
            })
        } else {
            None
        };

        self.callback.on_progress(&ProgressInfo {
            stage: self.stage,
            current: self.current,
            total: self.total,
            percentage,
            elapsed,
            estimated_remaining,
            detail: detail.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder(Mutex<Vec<(Stage, u64, Option<f32>)>>);

    impl ProgressCallback for Recorder {
        fn on_progress(&self, info: &ProgressInfo) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push((info.stage, info.current, info.percentage));
            }
        }
    }

    #[test]
    fn tracker_reports_each_unit_and_completion() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut tracker = ProgressTracker::new(recorder.clone(), Stage::Detection, Some(4));
        tracker.advance(Some("silence"));
        tracker.advance(Some("black_frame"));
        tracker.finish();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (Stage::Detection, 1, Some(25.0)));
        assert_eq!(seen[2].1, 4);
        assert_eq!(seen[2].2, Some(100.0));
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}

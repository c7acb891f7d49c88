//! Detector capability traits and the shared detection context.
//!
//! Every detector implements [`Detector`] and one or more capability
//! traits:
//!
//! - [`WholeFileDetector`] scans the whole file and returns complete
//!   episode intervals for the [`BoundaryMerger`](crate::BoundaryMerger).
//! - [`WindowedDetector`] answers once per [`SearchWindow`] with a single
//!   [`WindowHit`], falling back to the window center when it finds nothing.
//! - [`RawWindowedDetector`] returns every candidate it saw inside the
//!   windows as [`RawDetection`]s for the
//!   [`RawDetectionClusterer`](crate::RawDetectionClusterer).
//!
//! The pipeline only invokes capabilities a detector actually has, so there
//! is no "not supported" code path.

use std::path::Path;

use crate::boundary::{EpisodeBoundary, WindowHit};
use crate::cache::ScanCache;
use crate::cluster::RawDetection;
use crate::error::EpisplitError;
use crate::scan::{MediaScanner, TimeRange};
use crate::timeline::MediaTimeline;
use crate::window::SearchWindow;

/// Confidence of a window-center fallback hit.
pub const FALLBACK_CONFIDENCE: f64 = 0.3;

/// Default minimum episode length in seconds (15 minutes).
pub const DEFAULT_MIN_EPISODE_LENGTH: f64 = 900.0;

/// Default maximum episode length in seconds (90 minutes).
pub const DEFAULT_MAX_EPISODE_LENGTH: f64 = 5400.0;

/// Read-only inputs shared by all detectors of one run.
#[derive(Clone, Copy)]
pub struct DetectionContext<'a> {
    pub timeline: &'a MediaTimeline,
    pub scanner: &'a dyn MediaScanner,
    pub cache: &'a ScanCache,
    pub min_episode_length: f64,
    pub max_episode_length: f64,
    /// Episode count from the filename or configuration.
    pub expected_episodes: Option<usize>,
    /// TMDB episode runtimes in minutes.
    pub tmdb_runtimes: Option<&'a [f64]>,
}

impl<'a> DetectionContext<'a> {
    pub fn new(timeline: &'a MediaTimeline, scanner: &'a dyn MediaScanner, cache: &'a ScanCache) -> Self {
        Self {
            timeline,
            scanner,
            cache,
            min_episode_length: DEFAULT_MIN_EPISODE_LENGTH,
            max_episode_length: DEFAULT_MAX_EPISODE_LENGTH,
            expected_episodes: None,
            tmdb_runtimes: None,
        }
    }

    #[must_use]
    pub fn with_episode_length(mut self, min: f64, max: f64) -> Self {
        self.min_episode_length = min;
        self.max_episode_length = max;
        self
    }

    #[must_use]
    pub fn with_expected_episodes(mut self, count: Option<usize>) -> Self {
        self.expected_episodes = count;
        self
    }

    #[must_use]
    pub fn with_tmdb_runtimes(mut self, runtimes_minutes: Option<&'a [f64]>) -> Self {
        self.tmdb_runtimes = runtimes_minutes.filter(|r| !r.is_empty());
        self
    }

    pub fn path(&self) -> &Path {
        &self.timeline.path
    }

    pub fn total_duration(&self) -> f64 {
        self.timeline.duration
    }

    /// The whole file as a scan range.
    pub fn full_range(&self) -> Result<TimeRange, EpisplitError> {
        TimeRange::new(0.0, self.total_duration())
    }
}

/// Common detector surface.
pub trait Detector: Send + Sync {
    /// Stable name used in logs, metadata and source weights.
    fn name(&self) -> &'static str;

    /// Check that every external service the detector needs is reachable.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::DetectorUnavailable`] when it cannot run.
    fn check_available(&self) -> Result<(), EpisplitError> {
        Ok(())
    }
}

/// Detects complete episode intervals over the whole file.
pub trait WholeFileDetector: Detector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError>;
}

/// Finds one boundary per search window.
pub trait WindowedDetector: Detector {
    /// Returns exactly one hit per window, in window order.
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError>;
}

/// Reports every candidate seen inside the windows, unfiltered.
pub trait RawWindowedDetector: Detector {
    fn detect_raw_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<RawDetection>, EpisplitError>;
}

/// Scan range of a window, or `None` for a degenerate window.
pub(crate) fn window_range(window: &SearchWindow) -> Option<TimeRange> {
    TimeRange::new(window.start_time, window.end_time).ok()
}

/// Map each window through `find`, replacing misses and scan errors with a
/// center fallback so the result always has one hit per window.
pub(crate) fn hits_per_window<F>(
    detector: &str,
    windows: &[SearchWindow],
    fallback_source: &str,
    mut find: F,
) -> Vec<WindowHit>
where
    F: FnMut(&SearchWindow) -> Result<Option<WindowHit>, EpisplitError>,
{
    windows
        .iter()
        .enumerate()
        .map(|(i, window)| match find(window) {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                log::debug!("{detector}: window {} has no signal, using center", i + 1);
                WindowHit::fallback(window.center_time, FALLBACK_CONFIDENCE, fallback_source)
            }
            Err(error) => {
                log::warn!("{detector}: window {} failed: {error}", i + 1);
                WindowHit::fallback(window.center_time, FALLBACK_CONFIDENCE, fallback_source)
                    .with_meta("error", error.to_string())
            }
        })
        .collect()
}

/// Proximity of `time` to the window center, 1 at the center and 0 at the
/// window edge.
pub(crate) fn center_proximity(window: &SearchWindow, time: f64) -> f64 {
    let half = (window.width() / 2.0).max(1.0);
    (1.0 - (time - window.center_time).abs() / half).clamp(0.0, 1.0)
}

//! Phase 1: search windows.
//!
//! Before any expensive analysis runs, the [`SearchWindowDeterminer`]
//! narrows each of the N-1 expected episode boundaries down to a window of
//! a few minutes. Phase 2 detectors then only look inside those windows.
//!
//! The determiner tries its sources in a fixed priority order and uses the
//! first that yields exactly N-1 windows:
//!
//! 1. TMDB runtimes plus per-episode commercial time from chapter markers
//! 2. Chapter-derived episode regions
//! 3. TMDB runtimes alone, with commercials estimated from the file length
//! 4. Detected commercial breaks near the nominal boundaries
//! 5. Equal division of the file
//!
//! # Example
//!
//! ```
//! use episplit::{SearchWindowDeterminer, WindowEvidence};
//!
//! let determiner = SearchWindowDeterminer::new(5400.0, 3);
//! let windows = determiner.determine_windows(&WindowEvidence::default());
//! assert_eq!(windows.len(), 2);
//! assert_eq!(windows[0].source, "equal_division");
//! assert_eq!(windows[0].center_time, 1800.0);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::Metadata;

/// A time range in which one episode boundary is expected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchWindow {
    /// Window start in seconds.
    pub start_time: f64,
    /// Window end in seconds.
    pub end_time: f64,
    /// Expected boundary location.
    pub center_time: f64,
    /// How much the window source is trusted, `[0, 1]`.
    pub confidence: f64,
    /// What determined the window (`chapter`, `tmdb`, `equal_division`, ...).
    pub source: String,
    /// 1-based episode number before the boundary.
    pub episode_before: usize,
    /// 1-based episode number after the boundary.
    pub episode_after: usize,
    /// Source-specific provenance.
    pub metadata: Metadata,
}

impl SearchWindow {
    /// Width of the window in seconds.
    pub fn width(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Whether `time` lies inside the window, bounds included.
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start_time && time <= self.end_time
    }

    /// A copy moved by `offset` seconds and clamped to `[0, total_duration]`.
    ///
    /// Used by precision mode to carry the drift of earlier boundaries into
    /// later windows.
    pub fn shifted(&self, offset: f64, total_duration: f64) -> SearchWindow {
        let mut shifted = self.clone();
        shifted.start_time = (self.start_time + offset).clamp(0.0, total_duration);
        shifted.end_time = (self.end_time + offset).clamp(0.0, total_duration);
        shifted.center_time = (self.center_time + offset).clamp(0.0, total_duration);
        shifted
            .metadata
            .insert("drift_offset".to_string(), Value::from(offset));
        shifted
    }

    /// A copy widened to `center ± half_width`, clamped to the file.
    pub fn expanded(&self, half_width: f64, total_duration: f64) -> SearchWindow {
        let mut expanded = self.clone();
        expanded.start_time = (self.center_time - half_width).max(0.0);
        expanded.end_time = (self.center_time + half_width).min(total_duration);
        expanded
    }
}

/// Window sizing. Deserializable as part of
/// [`DetectionConfig`](crate::DetectionConfig).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowOptions {
    /// Seconds on each side of the expected boundary. Clamped to `[120, 600]`.
    pub window_size: f64,
    /// Precision mode: seconds searched before the runtime estimate.
    pub precision_before: f64,
    /// Precision mode: seconds searched after the runtime estimate.
    pub precision_after: f64,
    /// Precision mode: use `±precision_half_width` instead of the
    /// asymmetric span.
    pub symmetric_precision: bool,
    /// Precision mode: half-width of a symmetric window.
    pub precision_half_width: f64,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            window_size: SearchWindowDeterminer::DEFAULT_WINDOW_SIZE,
            precision_before: 180.0,
            precision_after: 60.0,
            symmetric_precision: false,
            precision_half_width: 120.0,
        }
    }
}

impl WindowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_window_size(mut self, seconds: f64) -> Self {
        self.window_size = seconds;
        self
    }

    #[must_use]
    pub fn with_precision_span(mut self, before: f64, after: f64) -> Self {
        self.precision_before = before;
        self.precision_after = after;
        self.symmetric_precision = false;
        self
    }

    #[must_use]
    pub fn with_symmetric_precision(mut self, half_width: f64) -> Self {
        self.symmetric_precision = true;
        self.precision_half_width = half_width;
        self
    }
}

/// Everything Phase 1 may know before any media is scanned.
#[derive(Debug, Clone, Default)]
pub struct WindowEvidence {
    /// `(start, end)` episode regions from chapter markers.
    pub chapter_regions: Vec<(f64, f64)>,
    /// Episode runtimes in minutes from TMDB, content only.
    pub tmdb_runtimes: Vec<f64>,
    /// Commercial seconds per episode from chapter markers.
    pub commercial_times: Vec<f64>,
    /// `(start, end)` of detected commercial breaks.
    pub commercial_breaks: Vec<(f64, f64)>,
}

impl WindowEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_chapter_regions(mut self, regions: Vec<(f64, f64)>) -> Self {
        self.chapter_regions = regions;
        self
    }

    #[must_use]
    pub fn with_tmdb_runtimes(mut self, runtimes_minutes: Vec<f64>) -> Self {
        self.tmdb_runtimes = runtimes_minutes;
        self
    }

    #[must_use]
    pub fn with_commercial_times(mut self, seconds_per_episode: Vec<f64>) -> Self {
        self.commercial_times = seconds_per_episode;
        self
    }

    #[must_use]
    pub fn with_commercial_breaks(mut self, breaks: Vec<(f64, f64)>) -> Self {
        self.commercial_breaks = breaks;
        self
    }
}

/// Computes the N-1 search windows for a file of known length.
#[derive(Debug, Clone)]
pub struct SearchWindowDeterminer {
    total_duration: f64,
    expected_episodes: usize,
    window_size: f64,
    options: WindowOptions,
}

impl SearchWindowDeterminer {
    pub const DEFAULT_WINDOW_SIZE: f64 = 300.0;
    pub const MIN_WINDOW_SIZE: f64 = 120.0;
    pub const MAX_WINDOW_SIZE: f64 = 600.0;

    pub fn new(total_duration: f64, expected_episodes: usize) -> Self {
        Self::with_options(total_duration, expected_episodes, WindowOptions::default())
    }

    pub fn with_options(total_duration: f64, expected_episodes: usize, options: WindowOptions) -> Self {
        let window_size = options
            .window_size
            .clamp(Self::MIN_WINDOW_SIZE, Self::MAX_WINDOW_SIZE);
        Self {
            total_duration,
            expected_episodes,
            window_size,
            options,
        }
    }

    /// Half-width actually used, after clamping.
    pub fn window_size(&self) -> f64 {
        self.window_size
    }

    /// Total duration divided by the expected episode count.
    pub fn nominal_episode_length(&self) -> f64 {
        if self.expected_episodes == 0 {
            self.total_duration
        } else {
            self.total_duration / self.expected_episodes as f64
        }
    }

    /// Determine the search windows from whatever evidence is available.
    ///
    /// Returns an empty list when fewer than two episodes are expected,
    /// otherwise exactly `expected_episodes - 1` windows.
    pub fn determine_windows(&self, evidence: &WindowEvidence) -> Vec<SearchWindow> {
        let n = self.expected_episodes;
        if n < 2 {
            log::warn!("Expected episode count < 2, no boundaries to find");
            return Vec::new();
        }

        if evidence.tmdb_runtimes.len() >= n && evidence.commercial_times.len() >= n {
            if let Some(windows) =
                self.windows_from_tmdb(&evidence.tmdb_runtimes, Some(&evidence.commercial_times))
            {
                log::info!("Using TMDB+chapters search windows ({})", windows.len());
                return windows;
            }
        }

        if evidence.chapter_regions.len() >= n {
            if let Some(windows) = self.windows_from_chapters(&evidence.chapter_regions) {
                log::info!("Using chapter-based search windows ({})", windows.len());
                return windows;
            }
        }

        if evidence.tmdb_runtimes.len() >= n {
            if let Some(windows) = self.windows_from_tmdb(&evidence.tmdb_runtimes, None) {
                log::info!("Using TMDB-based search windows ({})", windows.len());
                return windows;
            }
        }

        if !evidence.commercial_breaks.is_empty() {
            let windows = self.windows_from_commercials(&evidence.commercial_breaks);
            log::info!("Using commercial-adjusted search windows ({})", windows.len());
            return windows;
        }

        let windows = self.windows_from_equal_division();
        log::info!("Using equal-division search windows ({})", windows.len());
        windows
    }

    fn window(&self, index: usize, center: f64, start: f64, end: f64, confidence: f64, source: &str) -> SearchWindow {
        SearchWindow {
            start_time: start.max(0.0),
            end_time: end.min(self.total_duration),
            center_time: center,
            confidence,
            source: source.to_string(),
            episode_before: index + 1,
            episode_after: index + 2,
            metadata: Metadata::new(),
        }
    }

    fn windows_from_chapters(&self, regions: &[(f64, f64)]) -> Option<Vec<SearchWindow>> {
        if regions.len() < 2 {
            return None;
        }

        let windows: Vec<SearchWindow> = regions
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let episode_end = pair[0].1;
                let next_start = pair[1].0;
                let center = (episode_end + next_start) / 2.0;
                let mut window = self.window(
                    i,
                    center,
                    episode_end - self.window_size,
                    next_start + self.window_size,
                    0.9,
                    "chapter",
                );
                window.metadata.insert("chapter_ep_end".into(), episode_end.into());
                window.metadata.insert("chapter_next_start".into(), next_start.into());
                window
            })
            .collect();

        (windows.len() == self.expected_episodes - 1).then_some(windows)
    }

    fn windows_from_tmdb(&self, runtimes_minutes: &[f64], commercial_times: Option<&[f64]>) -> Option<Vec<SearchWindow>> {
        let n = self.expected_episodes;
        if runtimes_minutes.len() < n {
            return None;
        }

        let runtimes_minutes = &runtimes_minutes[..n];
        let runtimes: Vec<f64> = runtimes_minutes.iter().map(|r| r * 60.0).collect();
        let content_total: f64 = runtimes.iter().sum();

        let (commercials, actual) = match commercial_times {
            Some(times) if times.len() >= n => (times[..n].to_vec(), true),
            _ => {
                let estimated = (self.total_duration - content_total).max(0.0);
                (vec![estimated / n as f64; n], false)
            }
        };

        let mut episode_totals: Vec<f64> = runtimes
            .iter()
            .zip(&commercials)
            .map(|(runtime, commercial)| runtime + commercial)
            .collect();
        let calculated: f64 = episode_totals.iter().sum();
        if calculated <= 0.0 {
            return None;
        }

        let discrepancy = self.total_duration - calculated;
        if discrepancy.abs() > 1.0 {
            log::debug!(
                "Duration discrepancy {:.1}s between TMDB estimate and file, prorating",
                discrepancy
            );
            for total in &mut episode_totals {
                *total += discrepancy * (*total / calculated);
            }
        }

        let (confidence, source) = if actual {
            (0.85, "tmdb+chapters")
        } else {
            (0.8, "tmdb")
        };

        let mut cumulative = 0.0;
        let windows = (0..n - 1)
            .map(|i| {
                cumulative += episode_totals[i];
                let mut window = self.window(
                    i,
                    cumulative,
                    cumulative - self.window_size,
                    cumulative + self.window_size,
                    confidence,
                    source,
                );
                window.metadata.insert("tmdb_runtime_min".into(), runtimes_minutes[i].into());
                window.metadata.insert("commercial_sec".into(), commercials[i].into());
                window.metadata.insert("episode_total_sec".into(), episode_totals[i].into());
                window.metadata.insert("actual_commercials".into(), actual.into());
                window
            })
            .collect();

        Some(windows)
    }

    fn windows_from_commercials(&self, breaks: &[(f64, f64)]) -> Vec<SearchWindow> {
        let nominal = self.nominal_episode_length();
        let mut sorted = breaks.to_vec();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        (0..self.expected_episodes - 1)
            .map(|i| {
                let expected = nominal * (i + 1) as f64;
                let mut best: Option<(f64, f64)> = None;
                let mut best_distance = f64::INFINITY;
                for &(start, end) in &sorted {
                    let distance = (end - expected).abs();
                    if distance < best_distance && distance < self.window_size * 2.0 {
                        best_distance = distance;
                        best = Some((start, end));
                    }
                }

                let center = best.map_or(expected, |(_, end)| end);
                let mut window = self.window(
                    i,
                    center,
                    center - self.window_size,
                    center + self.window_size,
                    0.7,
                    "commercial",
                );
                let nearest = best.map_or(Value::Null, |(start, end)| Value::from(vec![start, end]));
                window.metadata.insert("nearest_commercial".into(), nearest);
                window
            })
            .collect()
    }

    fn windows_from_equal_division(&self) -> Vec<SearchWindow> {
        let nominal = self.nominal_episode_length();
        (0..self.expected_episodes - 1)
            .map(|i| {
                let center = nominal * (i + 1) as f64;
                let mut window = self.window(
                    i,
                    center,
                    center - self.window_size,
                    center + self.window_size,
                    0.5,
                    "equal_division",
                );
                window.metadata.insert("nominal_episode_length".into(), nominal.into());
                window
            })
            .collect()
    }

    /// Tighten windows using "Commercial 1" chapter markers.
    ///
    /// A "Commercial 1" marker is the first ad break of the following
    /// episode, so the boundary lies before it. Each window becomes
    /// `[c - 2*ws, c]` centred at `c - ws/2`. Windows are returned unchanged
    /// when there are fewer marker times than windows.
    pub fn refine_windows_with_chapters(
        &self,
        windows: &[SearchWindow],
        commercial_1_times: &[f64],
    ) -> Vec<SearchWindow> {
        if commercial_1_times.is_empty() || commercial_1_times.len() < windows.len() {
            return windows.to_vec();
        }

        windows
            .iter()
            .zip(commercial_1_times)
            .map(|(window, &marker)| {
                let mut refined = window.clone();
                refined.center_time = marker - self.window_size / 2.0;
                refined.start_time = (marker - self.window_size * 2.0).max(0.0);
                refined.end_time = marker;
                refined.confidence = (window.confidence + 0.1).min(0.95);
                refined.source = format!("{}+commercial_refined", window.source);
                refined.metadata.insert("commercial_1_time".into(), marker.into());
                refined
            })
            .collect()
    }

    /// Narrow windows around cumulative TMDB runtimes for precision mode.
    ///
    /// Returns `None` when fewer runtimes than episodes are known.
    pub fn precision_windows(&self, runtimes_minutes: &[f64]) -> Option<Vec<SearchWindow>> {
        let n = self.expected_episodes;
        if n < 2 || runtimes_minutes.len() < n {
            return None;
        }

        let (before, after) = if self.options.symmetric_precision {
            (self.options.precision_half_width, self.options.precision_half_width)
        } else {
            (self.options.precision_before, self.options.precision_after)
        };

        let mut cumulative = 0.0;
        let windows = (0..n - 1)
            .map(|i| {
                cumulative += runtimes_minutes[i] * 60.0;
                let mut window = self.window(
                    i,
                    cumulative,
                    cumulative - before,
                    cumulative + after,
                    0.8,
                    "tmdb_precision",
                );
                window.metadata.insert("tmdb_runtime_min".into(), runtimes_minutes[i].into());
                window.metadata.insert("cumulative_estimate".into(), cumulative.into());
                window
            })
            .collect();
        Some(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_count(windows: &[SearchWindow], n: usize) {
        assert_eq!(windows.len(), n - 1);
        for (i, window) in windows.iter().enumerate() {
            assert_eq!(window.episode_before, i + 1);
            assert_eq!(window.episode_after, i + 2);
            assert!(window.start_time <= window.end_time);
        }
    }

    #[test]
    fn fewer_than_two_episodes_yields_nothing() {
        let determiner = SearchWindowDeterminer::new(3600.0, 1);
        assert!(determiner.determine_windows(&WindowEvidence::default()).is_empty());
    }

    #[test]
    fn window_size_is_clamped() {
        let determiner = SearchWindowDeterminer::with_options(
            3600.0,
            2,
            WindowOptions::new().with_window_size(30.0),
        );
        assert_eq!(determiner.window_size(), 120.0);
    }

    #[test]
    fn chapter_windows_span_gap() {
        let determiner = SearchWindowDeterminer::new(2700.0, 2);
        let evidence = WindowEvidence::new().with_chapter_regions(vec![(0.0, 1340.0), (1360.0, 2700.0)]);
        let windows = determiner.determine_windows(&evidence);
        assert_count(&windows, 2);
        assert_eq!(windows[0].source, "chapter");
        assert_eq!(windows[0].center_time, 1350.0);
        assert_eq!(windows[0].start_time, 1040.0);
        assert_eq!(windows[0].end_time, 1660.0);
        assert_eq!(windows[0].confidence, 0.9);
    }

    #[test]
    fn chapter_windows_rejected_on_count_mismatch() {
        let determiner = SearchWindowDeterminer::new(2700.0, 2);
        let evidence = WindowEvidence::new().with_chapter_regions(vec![
            (0.0, 900.0),
            (900.0, 1800.0),
            (1800.0, 2700.0),
        ]);
        let windows = determiner.determine_windows(&evidence);
        assert_count(&windows, 2);
        assert_eq!(windows[0].source, "equal_division");
    }

    #[test]
    fn tmdb_windows_prorate_commercials() {
        let determiner = SearchWindowDeterminer::new(3600.0, 2);
        let evidence = WindowEvidence::new().with_tmdb_runtimes(vec![22.0, 22.0]);
        let windows = determiner.determine_windows(&evidence);
        assert_count(&windows, 2);
        assert_eq!(windows[0].source, "tmdb");
        assert!((windows[0].center_time - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn tmdb_windows_scale_down_when_runtimes_exceed_file() {
        let determiner = SearchWindowDeterminer::new(2400.0, 2);
        let evidence = WindowEvidence::new().with_tmdb_runtimes(vec![30.0, 20.0]);
        let windows = determiner.determine_windows(&evidence);
        assert!((windows[0].center_time - 1440.0).abs() < 1e-9);
    }

    #[test]
    fn tmdb_with_commercial_times_has_priority() {
        let determiner = SearchWindowDeterminer::new(3600.0, 2);
        let evidence = WindowEvidence::new()
            .with_tmdb_runtimes(vec![22.0, 22.0])
            .with_commercial_times(vec![480.0, 480.0])
            .with_chapter_regions(vec![(0.0, 1700.0), (1700.0, 3600.0)]);
        let windows = determiner.determine_windows(&evidence);
        assert_count(&windows, 2);
        assert_eq!(windows[0].source, "tmdb+chapters");
        assert_eq!(windows[0].confidence, 0.85);
    }

    #[test]
    fn commercial_windows_snap_to_nearby_break() {
        let determiner = SearchWindowDeterminer::new(5400.0, 3);
        let evidence = WindowEvidence::new().with_commercial_breaks(vec![(1700.0, 1820.0), (100.0, 200.0)]);
        let windows = determiner.determine_windows(&evidence);
        assert_count(&windows, 3);
        assert_eq!(windows[0].center_time, 1820.0);
        assert_eq!(windows[1].center_time, 3600.0);
        assert_eq!(windows[0].source, "commercial");
    }

    #[test]
    fn every_method_yields_n_minus_one_windows() {
        for n in 2..=6 {
            let total = 1500.0 * n as f64;
            let determiner = SearchWindowDeterminer::new(total, n);
            let regions: Vec<(f64, f64)> = (0..n)
                .map(|i| (1500.0 * i as f64, 1500.0 * (i + 1) as f64))
                .collect();
            let runtimes = vec![22.0; n];
            let evidences = [
                WindowEvidence::new(),
                WindowEvidence::new().with_chapter_regions(regions),
                WindowEvidence::new().with_tmdb_runtimes(runtimes.clone()),
                WindowEvidence::new()
                    .with_tmdb_runtimes(runtimes)
                    .with_commercial_times(vec![180.0; n]),
                WindowEvidence::new().with_commercial_breaks(vec![(1400.0, 1490.0)]),
            ];
            for evidence in &evidences {
                assert_count(&determiner.determine_windows(evidence), n);
            }
        }
    }

    #[test]
    fn refinement_ends_at_marker() {
        let determiner = SearchWindowDeterminer::new(3600.0, 2);
        let windows = determiner.determine_windows(&WindowEvidence::new().with_tmdb_runtimes(vec![22.0, 22.0]));
        let refined = determiner.refine_windows_with_chapters(&windows, &[1900.0, 2500.0]);
        assert_eq!(refined[0].end_time, 1900.0);
        assert_eq!(refined[0].start_time, 1300.0);
        assert_eq!(refined[0].center_time, 1750.0);
        assert!((refined[0].confidence - 0.9).abs() < 1e-12);
        assert_eq!(refined[0].source, "tmdb+commercial_refined");

        let untouched = determiner.refine_windows_with_chapters(&windows, &[]);
        assert_eq!(untouched, windows);
    }

    #[test]
    fn precision_windows_are_asymmetric_by_default() {
        let determiner = SearchWindowDeterminer::new(3600.0, 3);
        let windows = determiner.precision_windows(&[20.0, 20.0, 20.0]).expect("windows");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].start_time, 1020.0);
        assert_eq!(windows[0].end_time, 1260.0);
        assert_eq!(windows[1].center_time, 2400.0);

        let symmetric = SearchWindowDeterminer::with_options(
            3600.0,
            3,
            WindowOptions::new().with_symmetric_precision(120.0),
        );
        let windows = symmetric.precision_windows(&[20.0, 20.0, 20.0]).expect("windows");
        assert_eq!(windows[0].start_time, 1080.0);
        assert_eq!(windows[0].end_time, 1320.0);
    }

    #[test]
    fn shifted_window_records_drift() {
        let determiner = SearchWindowDeterminer::new(3600.0, 2);
        let window = &determiner.determine_windows(&WindowEvidence::default())[0];
        let shifted = window.shifted(30.0, 3600.0);
        assert_eq!(shifted.center_time, 1830.0);
        assert_eq!(shifted.metadata.get("drift_offset"), Some(&Value::from(30.0)));
    }
}

//! Silence-based episode detection.
//!
//! Episode breaks in broadcast recordings usually sit on a long, isolated
//! silence; commercial breaks produce clusters of shorter ones. Every silence
//! is scored on both properties and the best candidates near the expected
//! break points are kept.
//!
//! Three whole-file strategies exist, chosen by what is known up front:
//!
//! | known | strategy | source |
//! |---|---|---|
//! | TMDB runtimes | [`SilenceDetector::detect_with_runtimes`] | `silence` |
//! | episode count | [`SilenceDetector::detect_with_episode_count`] | `silence_guided` |
//! | nothing | [`SilenceDetector::detect_with_estimation`] | `silence` |

use serde::{Deserialize, Serialize};

use crate::boundary::{EpisodeBoundary, WindowHit};
use crate::cluster::RawDetection;
use crate::detector::{
    DetectionContext, Detector, RawWindowedDetector, WholeFileDetector, WindowedDetector, center_proximity,
    hits_per_window, window_range,
};
use crate::error::EpisplitError;
use crate::scan::{SilenceParams, SilenceRegion};
use crate::window::SearchWindow;

const BASE_CONFIDENCE: f64 = 0.6;
const GUIDED_CONFIDENCE: f64 = 0.75;
const MAX_CONFIDENCE: f64 = 0.85;

/// Silence detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceOptions {
    pub scan: SilenceParams,
    /// Match tolerance around TMDB break points, as a fraction of the
    /// average runtime.
    pub runtime_tolerance: f64,
    /// Silences closer than this (seconds) count against each other's
    /// isolation.
    pub isolation_radius: f64,
    /// Search radius around ideal break points, as a fraction of the ideal
    /// episode length.
    pub search_fraction: f64,
    /// Raw detection score per second of silence.
    pub raw_score_per_second: f64,
    pub raw_score_cap: f64,
}

impl Default for SilenceOptions {
    fn default() -> Self {
        Self {
            scan: SilenceParams::default(),
            runtime_tolerance: 0.20,
            isolation_radius: 300.0,
            search_fraction: 0.35,
            raw_score_per_second: 10.0,
            raw_score_cap: 50.0,
        }
    }
}

impl SilenceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_threshold_db(mut self, threshold_db: f64) -> Self {
        self.scan.threshold_db = threshold_db;
        self
    }

    #[must_use]
    pub fn with_min_duration(mut self, seconds: f64) -> Self {
        self.scan.min_duration = seconds;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakMode {
    Estimated,
    RuntimeGuided,
    CountGuided,
}

impl BreakMode {
    fn source(self) -> &'static str {
        match self {
            BreakMode::CountGuided => "silence_guided",
            _ => "silence",
        }
    }

    fn confidence(self, score: f64) -> f64 {
        match self {
            BreakMode::Estimated => (BASE_CONFIDENCE + score * 0.2).min(MAX_CONFIDENCE),
            _ => (GUIDED_CONFIDENCE + score * 0.1).min(MAX_CONFIDENCE),
        }
    }

    fn final_confidence(self) -> f64 {
        match self {
            BreakMode::Estimated => BASE_CONFIDENCE,
            _ => GUIDED_CONFIDENCE,
        }
    }
}

/// A silence with its break-likelihood score.
type Scored = (SilenceRegion, f64);

/// Score silences by relative duration and isolation, best first.
///
/// `score = 0.6 * duration / max_duration + 0.4 * 0.9^k` where `k` is the
/// number of other silences whose midpoints lie within `isolation_radius`.
pub fn score_silence_regions(regions: &[SilenceRegion], isolation_radius: f64) -> Vec<(SilenceRegion, f64)> {
    let max_duration = regions.iter().map(SilenceRegion::duration).fold(0.0, f64::max);

    let mut scored: Vec<Scored> = regions
        .iter()
        .enumerate()
        .map(|(i, region)| {
            let duration_score = if max_duration > 0.0 {
                region.duration() / max_duration
            } else {
                0.0
            };
            let neighbours = regions
                .iter()
                .enumerate()
                .filter(|&(j, other)| j != i && (region.midpoint() - other.midpoint()).abs() < isolation_radius)
                .count();
            let isolation = 0.9f64.powi(neighbours as i32);
            (*region, duration_score * 0.6 + isolation * 0.4)
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

/// Detects episode breaks from silence.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    options: SilenceOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for SilenceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SilenceDetector {
    pub fn new() -> Self {
        Self::with_options(SilenceOptions::default())
    }

    pub fn with_options(options: SilenceOptions) -> Self {
        Self {
            options,
            min_episode_length: crate::detector::DEFAULT_MIN_EPISODE_LENGTH,
            max_episode_length: crate::detector::DEFAULT_MAX_EPISODE_LENGTH,
        }
    }

    #[must_use]
    pub fn with_episode_length(mut self, min: f64, max: f64) -> Self {
        self.min_episode_length = min;
        self.max_episode_length = max;
        self
    }

    pub fn options(&self) -> &SilenceOptions {
        &self.options
    }

    /// Whole-file silence regions, scanned once per run.
    pub fn silence_regions(&self, ctx: &DetectionContext<'_>) -> Result<Vec<SilenceRegion>, EpisplitError> {
        let range = ctx.full_range()?;
        ctx.cache.silences_or_scan(ctx.path(), || {
            log::info!("Scanning {} for silence", ctx.path().display());
            ctx.scanner.silences(ctx.path(), range, &self.options.scan)
        })
    }

    /// Place one break near each TMDB cumulative runtime.
    pub fn detect_with_runtimes(
        &self,
        silences: &[SilenceRegion],
        total_duration: f64,
        runtimes_minutes: &[f64],
    ) -> Vec<EpisodeBoundary> {
        if runtimes_minutes.len() < 2 {
            return Vec::new();
        }
        let runtimes: Vec<f64> = runtimes_minutes.iter().map(|m| m * 60.0).collect();
        let expected_breaks: Vec<f64> = runtimes[..runtimes.len() - 1]
            .iter()
            .scan(0.0, |acc, r| {
                *acc += r;
                Some(*acc)
            })
            .collect();
        log::debug!(
            "Expected break points: {:?}",
            expected_breaks.iter().map(|b| format!("{:.1}m", b / 60.0)).collect::<Vec<_>>()
        );

        let scored = score_silence_regions(silences, self.options.isolation_radius);
        let average = runtimes.iter().sum::<f64>() / runtimes.len() as f64;
        let tolerance = self.options.runtime_tolerance * average;

        let mut selected = Vec::new();
        for expected in expected_breaks {
            let best = scored
                .iter()
                .filter_map(|&(region, base)| {
                    let distance = (region.midpoint() - expected).abs();
                    (distance <= tolerance && tolerance > 0.0).then(|| (region, base + (1.0 - distance / tolerance) * 0.5))
                })
                .fold(None, |best: Option<Scored>, candidate| match best {
                    Some(b) if b.1 >= candidate.1 => Some(b),
                    _ => Some(candidate),
                });

            match best {
                Some((region, score)) => {
                    log::debug!(
                        "Found break at {:.1}m (expected {:.1}m, score {score:.2})",
                        region.midpoint() / 60.0,
                        expected / 60.0
                    );
                    selected.push((region, score));
                }
                None => log::warn!("No suitable silence near expected break at {:.1}m", expected / 60.0),
            }
        }

        self.breaks_to_boundaries(selected, total_duration, BreakMode::RuntimeGuided)
    }

    /// Place `episode_count - 1` breaks near the ideal equal-length split
    /// points.
    ///
    /// ```
    /// use episplit::{SilenceDetector, scan::SilenceRegion};
    ///
    /// let silences = vec![
    ///     SilenceRegion::new(600.0, 602.0),
    ///     SilenceRegion::new(1346.5, 1349.5),
    ///     SilenceRegion::new(2000.0, 2002.0),
    /// ];
    /// let boundaries = SilenceDetector::new().detect_with_episode_count(&silences, 2700.0, 2);
    /// assert_eq!(boundaries[0].end_time, 1348.0);
    /// assert_eq!(boundaries[0].source, "silence_guided");
    /// ```
    pub fn detect_with_episode_count(
        &self,
        silences: &[SilenceRegion],
        total_duration: f64,
        episode_count: usize,
    ) -> Vec<EpisodeBoundary> {
        if episode_count < 2 || silences.is_empty() {
            return Vec::new();
        }
        let scored = score_silence_regions(silences, self.options.isolation_radius);
        let (breaks, alignment) = self.try_episode_count(&scored, total_duration, episode_count);
        log::debug!("Guided silence for {episode_count} episodes: alignment {alignment:.3}");
        self.breaks_to_boundaries(breaks, total_duration, BreakMode::CountGuided)
    }

    /// Try every plausible episode count and keep the best-aligned one.
    pub fn detect_with_estimation(&self, silences: &[SilenceRegion], total_duration: f64) -> Vec<EpisodeBoundary> {
        if silences.is_empty() {
            return Vec::new();
        }
        let mut min_count = ((total_duration / self.max_episode_length) as usize).max(2);
        let mut max_count = ((total_duration / self.min_episode_length) as usize).min(15);
        if min_count > max_count {
            min_count = ((total_duration / 3600.0).round() as usize).max(2);
            max_count = min_count;
        }
        log::debug!(
            "Trying episode counts {min_count}-{max_count} for {:.1}m file",
            total_duration / 60.0
        );

        let scored = score_silence_regions(silences, self.options.isolation_radius);
        let mut best: Option<(usize, f64, Vec<Scored>)> = None;
        for count in min_count..=max_count {
            let (breaks, alignment) = self.try_episode_count(&scored, total_duration, count);
            log::debug!("Episode count {count}: alignment score {alignment:.3}");
            if best.as_ref().is_none_or(|b| alignment > b.1) {
                best = Some((count, alignment, breaks));
            }
        }

        match best {
            Some((count, alignment, breaks)) => {
                log::info!("Best estimate: {count} episodes (alignment score {alignment:.3})");
                self.breaks_to_boundaries(breaks, total_duration, BreakMode::Estimated)
            }
            None => Vec::new(),
        }
    }

    fn try_episode_count(&self, scored: &[Scored], total_duration: f64, episode_count: usize) -> (Vec<Scored>, f64) {
        let num_breaks = episode_count.saturating_sub(1);
        if num_breaks == 0 {
            return (Vec::new(), 0.0);
        }
        let interval = total_duration / episode_count as f64;
        let radius = interval * self.options.search_fraction;

        let mut used = vec![false; scored.len()];
        let mut selected = Vec::new();
        let mut proximity_total = 0.0;

        for k in 1..=num_breaks {
            let ideal = interval * k as f64;
            let mut best: Option<(usize, f64, f64)> = None;
            for (i, &(region, base)) in scored.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let distance = (region.midpoint() - ideal).abs();
                if distance > radius {
                    continue;
                }
                let proximity = 1.0 - distance / radius;
                let total = base * (0.6 + 0.4 * proximity);
                if best.is_none_or(|(_, score, _)| total > score) {
                    best = Some((i, total, proximity));
                }
            }

            match best {
                Some((i, score, proximity)) => {
                    used[i] = true;
                    selected.push((scored[i].0, score));
                    proximity_total += proximity;
                }
                None => proximity_total -= 0.5,
            }
        }

        let coverage = selected.len() as f64 / num_breaks as f64;
        let mean_proximity = proximity_total / num_breaks as f64;
        (selected, coverage * 0.6 + mean_proximity * 0.4)
    }

    fn breaks_to_boundaries(&self, mut breaks: Vec<Scored>, total_duration: f64, mode: BreakMode) -> Vec<EpisodeBoundary> {
        if breaks.is_empty() {
            return Vec::new();
        }
        breaks.sort_by(|a, b| a.0.midpoint().total_cmp(&b.0.midpoint()));

        let runtime_guided = mode != BreakMode::Estimated;
        let min_length = self.min_episode_length * 0.8;
        let mut boundaries = Vec::new();
        let mut previous_end = 0.0;

        for (region, score) in breaks {
            let split = region.midpoint();
            if split - previous_end < min_length {
                continue;
            }
            boundaries.push(
                EpisodeBoundary::new(previous_end, split, mode.confidence(score), mode.source())
                    .with_meta("silence_start", region.start)
                    .with_meta("silence_end", region.end)
                    .with_meta("silence_duration", region.duration())
                    .with_meta("score", score)
                    .with_meta("runtime_guided", runtime_guided),
            );
            previous_end = split;
        }

        if total_duration - previous_end >= min_length {
            boundaries.push(
                EpisodeBoundary::new(previous_end, total_duration, mode.final_confidence(), mode.source())
                    .with_meta("final_episode", true)
                    .with_meta("runtime_guided", runtime_guided),
            );
        }

        boundaries
    }

    fn best_in_window(&self, window: &SearchWindow, silences: &[SilenceRegion]) -> Option<WindowHit> {
        let scored = score_silence_regions(silences, self.options.isolation_radius);
        let (region, score) = scored
            .into_iter()
            .map(|(region, base)| (region, base * (0.6 + 0.4 * center_proximity(window, region.midpoint()))))
            .fold(None, |best: Option<Scored>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })?;

        Some(
            WindowHit::new(region.midpoint(), BreakMode::Estimated.confidence(score))
                .with_meta("source", "silence")
                .with_meta("silence_start", region.start)
                .with_meta("silence_end", region.end)
                .with_meta("silence_duration", region.duration())
                .with_meta("score", score),
        )
    }
}

impl Detector for SilenceDetector {
    fn name(&self) -> &'static str {
        "silence"
    }
}

impl WholeFileDetector for SilenceDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let detector = self
            .clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length);
        let silences = detector.silence_regions(ctx)?;
        if silences.is_empty() {
            log::debug!("No silence regions detected");
            return Ok(Vec::new());
        }
        log::info!("Found {} silence regions", silences.len());

        let total = ctx.total_duration();
        let boundaries = match (ctx.tmdb_runtimes, ctx.expected_episodes) {
            (Some(runtimes), _) if runtimes.len() > 1 => {
                log::info!("Using runtime-guided detection with {} expected episodes", runtimes.len());
                detector.detect_with_runtimes(&silences, total, runtimes)
            }
            (_, Some(count)) if count > 1 => {
                log::info!("Using count-guided detection with {count} expected episodes");
                detector.detect_with_episode_count(&silences, total, count)
            }
            _ => {
                log::info!("Using estimation-based detection");
                detector.detect_with_estimation(&silences, total)
            }
        };

        log::info!("Detected {} potential episode boundaries from silence", boundaries.len());
        Ok(boundaries)
    }
}

impl WindowedDetector for SilenceDetector {
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError> {
        Ok(hits_per_window(self.name(), windows, "silence_fallback", |window| {
            let Some(range) = window_range(window) else {
                return Ok(None);
            };
            let silences = ctx.scanner.silences(ctx.path(), range, &self.options.scan)?;
            Ok(self.best_in_window(window, &silences))
        }))
    }
}

impl RawWindowedDetector for SilenceDetector {
    fn detect_raw_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<RawDetection>, EpisplitError> {
        let mut detections = Vec::new();
        for (index, window) in windows.iter().enumerate() {
            let Some(range) = window_range(window) else {
                continue;
            };
            let silences = match ctx.scanner.silences(ctx.path(), range, &self.options.scan) {
                Ok(silences) => silences,
                Err(error) => {
                    log::warn!("silence: window {} scan failed: {error}", index + 1);
                    continue;
                }
            };
            log::debug!("silence: {} regions in window {}", silences.len(), index + 1);
            detections.extend(silences.into_iter().map(|region| {
                let score =
                    (region.duration() * self.options.raw_score_per_second).min(self.options.raw_score_cap);
                RawDetection::new(region.midpoint(), score, "silence")
                    .with_meta("window_index", index)
                    .with_meta("silence_start", region.start)
                    .with_meta("silence_end", region.end)
                    .with_meta("duration", region.duration())
            }));
        }
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(spans: &[(f64, f64)]) -> Vec<SilenceRegion> {
        spans.iter().map(|&(s, e)| SilenceRegion::new(s, e)).collect()
    }

    #[test]
    fn guided_mode_prefers_the_isolated_long_silence() {
        let silences = regions(&[
            (1099.0, 1101.0),
            (1119.0, 1121.0),
            (1139.0, 1141.0),
            (1346.5, 1349.5),
            (1999.0, 2001.0),
            (2019.0, 2021.0),
        ]);
        let boundaries = SilenceDetector::new().detect_with_episode_count(&silences, 2700.0, 2);

        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].end_time, 1348.0);
        assert_eq!(boundaries[0].source, "silence_guided");
        assert!(boundaries[0].confidence >= 0.75);
        assert_eq!((boundaries[1].start_time, boundaries[1].end_time), (1348.0, 2700.0));
    }

    #[test]
    fn isolation_penalises_clusters() {
        let scored = score_silence_regions(&regions(&[(100.0, 103.0), (5000.0, 5003.0), (5100.0, 5103.0)]), 300.0);
        assert_eq!(scored[0].0.start, 100.0);
        assert!((scored[0].1 - 1.0).abs() < 1e-9);
        assert!((scored[1].1 - (0.6 + 0.36)).abs() < 1e-9);
    }

    #[test]
    fn runtime_mode_snaps_to_expected_breaks() {
        let silences = regions(&[(1318.0, 1322.0), (2640.0, 2644.0), (900.0, 901.0)]);
        let boundaries = SilenceDetector::new().detect_with_runtimes(&silences, 3960.0, &[22.0, 22.0, 22.0]);
        let ends: Vec<f64> = boundaries.iter().map(|b| b.end_time).collect();
        assert_eq!(ends, vec![1320.0, 2642.0, 3960.0]);
        assert!(boundaries.iter().all(|b| b.source == "silence"));
        assert!(boundaries[0].confidence > 0.75);
    }

    #[test]
    fn estimation_finds_three_episodes() {
        let silences = regions(&[(1198.0, 1202.0), (2398.0, 2402.0)]);
        let boundaries = SilenceDetector::new().detect_with_estimation(&silences, 3600.0);
        let ends: Vec<f64> = boundaries.iter().map(|b| b.end_time).collect();
        assert_eq!(ends, vec![1200.0, 2400.0, 3600.0]);
    }

    #[test]
    fn short_leading_episode_is_skipped() {
        let silences = regions(&[(298.0, 302.0)]);
        let boundaries = SilenceDetector::new().detect_with_runtimes(&silences, 1800.0, &[5.0, 25.0]);
        assert_eq!(boundaries.len(), 1);
        assert_eq!((boundaries[0].start_time, boundaries[0].end_time), (0.0, 1800.0));
        assert_eq!(boundaries[0].metadata["final_episode"], true);
    }
}

//! Black-frame episode detection.
//!
//! Broadcasters fade to black between programmes. On its own this is a
//! weak signal (scene fades are black too), so confidence stays at or
//! below 0.7 unless a coinciding silence confirms it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::{EpisodeBoundary, WindowHit};
use crate::cluster::RawDetection;
use crate::detector::{
    DetectionContext, Detector, RawWindowedDetector, WholeFileDetector, WindowedDetector, center_proximity,
    hits_per_window, window_range,
};
use crate::error::EpisplitError;
use crate::scan::{BlackParams, BlackRegion, SilenceRegion};
use crate::window::SearchWindow;

const BASE_CONFIDENCE: f64 = 0.5;
const MAX_CONFIDENCE: f64 = 0.7;
const SILENCE_BOOST: f64 = 0.1;
const SILENCE_BOOST_CAP: f64 = 0.85;

/// Black-frame detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackFrameOptions {
    pub scan: BlackParams,
    /// How far (seconds) a silence may sit from a black region and still
    /// confirm it.
    pub silence_tolerance: f64,
    /// Raw detection score per second of black.
    pub raw_score_per_second: f64,
    pub raw_score_cap: f64,
}

impl Default for BlackFrameOptions {
    fn default() -> Self {
        Self {
            scan: BlackParams::default(),
            silence_tolerance: 5.0,
            raw_score_per_second: 15.0,
            raw_score_cap: 50.0,
        }
    }
}

impl BlackFrameOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_min_duration(mut self, seconds: f64) -> Self {
        self.scan.min_duration = seconds;
        self
    }
}

/// Confidence of a boundary on a black region of `duration` seconds.
fn black_confidence(duration: f64) -> f64 {
    let mut confidence = BASE_CONFIDENCE;
    if duration >= 2.0 {
        confidence += 0.1;
    }
    if duration >= 5.0 {
        confidence += 0.1;
    }
    confidence.min(MAX_CONFIDENCE)
}

#[derive(Debug, Clone)]
pub struct BlackFrameDetector {
    options: BlackFrameOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for BlackFrameDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackFrameDetector {
    pub fn new() -> Self {
        Self::with_options(BlackFrameOptions::default())
    }

    pub fn with_options(options: BlackFrameOptions) -> Self {
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

    /// Turn black regions into a contiguous run of episode boundaries.
    ///
    /// A region is used as a split point only if the episode it closes is
    /// within the length bounds.
    pub fn black_to_boundaries(&self, regions: &[BlackRegion], total_duration: f64) -> Vec<EpisodeBoundary> {
        let mut significant: Vec<&BlackRegion> = regions
            .iter()
            .filter(|r| r.duration() >= self.options.scan.min_duration)
            .collect();
        if significant.is_empty() {
            return Vec::new();
        }
        significant.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut boundaries = Vec::new();
        let mut previous_end = 0.0;
        for black in significant {
            let split = black.midpoint();
            let length = split - previous_end;
            if length < self.min_episode_length || length > self.max_episode_length {
                continue;
            }
            boundaries.push(
                EpisodeBoundary::new(previous_end, split, black_confidence(black.duration()), "black_frame")
                    .with_meta("black_start", black.start)
                    .with_meta("black_end", black.end)
                    .with_meta("black_duration", black.duration()),
            );
            previous_end = split;
        }

        if total_duration - previous_end >= self.min_episode_length {
            boundaries.push(
                EpisodeBoundary::new(previous_end, total_duration, BASE_CONFIDENCE, "black_frame")
                    .with_meta("final_episode", true),
            );
        }
        boundaries
    }

    /// Boost boundaries whose black region coincides with a silence.
    ///
    /// ```
    /// use episplit::{BlackFrameDetector, EpisodeBoundary, scan::SilenceRegion};
    ///
    /// let boundaries = vec![
    ///     EpisodeBoundary::new(0.0, 1350.0, 0.6, "black_frame").with_meta("black_start", 1349.0),
    /// ];
    /// let silences = vec![SilenceRegion::new(1347.0, 1351.0)];
    /// let enhanced = BlackFrameDetector::new().enhance_with_silence(boundaries, &silences);
    /// assert_eq!(enhanced[0].source, "black_frame+silence");
    /// assert!((enhanced[0].confidence - 0.7).abs() < 1e-9);
    /// ```
    pub fn enhance_with_silence(
        &self,
        boundaries: Vec<EpisodeBoundary>,
        silences: &[SilenceRegion],
    ) -> Vec<EpisodeBoundary> {
        let tolerance = self.options.silence_tolerance;
        boundaries
            .into_iter()
            .map(|mut boundary| {
                let split = boundary
                    .metadata
                    .get("black_start")
                    .and_then(Value::as_f64)
                    .unwrap_or(boundary.end_time);
                let confirmed = silences.iter().any(|s| {
                    (s.start - split).abs() < tolerance
                        || (s.end - split).abs() < tolerance
                        || (s.start <= split && split <= s.end)
                });
                if confirmed {
                    log::debug!("Boosted confidence for boundary at {:.1}s (black+silence)", boundary.end_time);
                    boundary.set_confidence((boundary.confidence + SILENCE_BOOST).min(SILENCE_BOOST_CAP));
                    boundary.source = "black_frame+silence".to_string();
                    boundary.metadata.insert("silence_confirmed".into(), true.into());
                }
                boundary
            })
            .collect()
    }

    fn best_in_window(&self, window: &SearchWindow, regions: &[BlackRegion]) -> Option<WindowHit> {
        regions
            .iter()
            .filter(|r| r.duration() >= self.options.scan.min_duration)
            .map(|r| {
                let confidence = black_confidence(r.duration());
                let rank = confidence + 0.1 * center_proximity(window, r.midpoint());
                (r, confidence, rank)
            })
            .max_by(|a, b| a.2.total_cmp(&b.2))
            .map(|(region, confidence, _)| {
                WindowHit::new(region.midpoint(), confidence)
                    .with_meta("source", "black_frame")
                    .with_meta("black_start", region.start)
                    .with_meta("black_end", region.end)
                    .with_meta("black_duration", region.duration())
            })
    }
}

impl Detector for BlackFrameDetector {
    fn name(&self) -> &'static str {
        "black_frame"
    }
}

impl WholeFileDetector for BlackFrameDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let regions = ctx
            .scanner
            .black_regions(ctx.path(), ctx.full_range()?, &self.options.scan)?;
        log::info!("Found {} black regions", regions.len());
        Ok(self
            .clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length)
            .black_to_boundaries(&regions, ctx.total_duration()))
    }
}

impl WindowedDetector for BlackFrameDetector {
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError> {
        Ok(hits_per_window(self.name(), windows, "black_fallback", |window| {
            let Some(range) = window_range(window) else {
                return Ok(None);
            };
            let regions = ctx.scanner.black_regions(ctx.path(), range, &self.options.scan)?;
            Ok(self.best_in_window(window, &regions))
        }))
    }
}

impl RawWindowedDetector for BlackFrameDetector {
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
            match ctx.scanner.black_regions(ctx.path(), range, &self.options.scan) {
                Ok(regions) => detections.extend(regions.into_iter().map(|region| {
                    let score = (region.duration() * self.options.raw_score_per_second).min(self.options.raw_score_cap);
                    RawDetection::new(region.midpoint(), score, "black_frame")
                        .with_meta("window_index", index)
                        .with_meta("black_start", region.start)
                        .with_meta("black_end", region.end)
                        .with_meta("duration", region.duration())
                })),
                Err(error) => log::warn!("black_frame: window {} scan failed: {error}", index + 1),
            }
        }
        log::info!("Black frame detector: {} raw detections", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_steps_with_duration() {
        assert_eq!(black_confidence(1.0), 0.5);
        assert!((black_confidence(2.5) - 0.6).abs() < 1e-9);
        assert!((black_confidence(6.0) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn boundaries_respect_episode_length() {
        let regions = vec![
            BlackRegion::new(300.0, 301.5),
            BlackRegion::new(1349.0, 1351.0),
            BlackRegion::new(2699.0, 2699.5),
        ];
        let boundaries = BlackFrameDetector::new().black_to_boundaries(&regions, 2700.0);
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].end_time, 1350.0);
        assert!((boundaries[0].confidence - 0.6).abs() < 1e-9);
        assert_eq!(boundaries[1].metadata["final_episode"], true);
    }

    #[test]
    fn silence_far_away_does_not_confirm() {
        let boundaries = vec![EpisodeBoundary::new(0.0, 1350.0, 0.6, "black_frame").with_meta("black_start", 1349.0)];
        let enhanced = BlackFrameDetector::new().enhance_with_silence(boundaries, &[SilenceRegion::new(1400.0, 1403.0)]);
        assert_eq!(enhanced[0].source, "black_frame");
        assert_eq!(enhanced[0].confidence, 0.6);
    }
}

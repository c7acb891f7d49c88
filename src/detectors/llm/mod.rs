//! Vision-model detection of credits, logos and title cards.
//!
//! Frames are handed to a [`FrameClassifier`] (an Ollama server by
//! default) that answers yes/no for each visual cue. Three modes build on
//! the answers:
//!
//! - whole-file: coarse sampling, one boundary per positive frame that
//!   closes a long enough episode;
//! - raw: every positive frame inside the search windows, with the
//!   sampling tightened to 1 s while a logo is on screen;
//! - precision: dense sampling of a narrow window and a single cut chosen
//!   from strong transitions or an ignore-pattern (see [`precision`]).

pub mod client;
pub mod pattern;
pub mod precision;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use client::{FrameAnalysis, FrameClassifier, OllamaClient, OllamaOptions};
pub use pattern::{DetectionPattern, DetectionType, PatternToken};
pub use precision::PrecisionOptions;

use crate::boundary::{EpisodeBoundary, WindowHit};
use crate::cluster::RawDetection;
use crate::detector::{DetectionContext, Detector, RawWindowedDetector, WholeFileDetector};
use crate::error::EpisplitError;
use crate::window::SearchWindow;

const CONFIDENCE: f64 = 0.9;

/// LLM detector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmOptions {
    pub ollama: OllamaOptions,
    /// Seconds between frames in raw mode.
    pub base_interval: f64,
    /// Seconds between frames while a logo is visible in raw mode.
    pub fine_interval: f64,
    /// Width frames are scaled to before classification.
    pub frame_width: u32,
    /// Raw detection scores per cue, scaled by the model's confidence.
    pub logo_score: f64,
    pub credits_score: f64,
    pub outro_score: f64,
    pub precision: PrecisionOptions,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            ollama: OllamaOptions::default(),
            base_interval: 10.0,
            fine_interval: 1.0,
            frame_width: 640,
            logo_score: 30.0,
            credits_score: 25.0,
            outro_score: 20.0,
            precision: PrecisionOptions::default(),
        }
    }
}

impl LlmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.ollama.host = host.into();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.ollama.model = model.into();
        self
    }

    #[must_use]
    pub fn with_post_credits_buffer(mut self, seconds: f64) -> Self {
        self.precision.post_credits_buffer = seconds;
        self
    }
}

pub struct LlmDetector {
    classifier: Arc<dyn FrameClassifier>,
    options: LlmOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl LlmDetector {
    /// A detector talking to the Ollama server in `options`.
    pub fn new(options: LlmOptions) -> Self {
        let client = OllamaClient::new(options.ollama.clone());
        Self::with_classifier(Arc::new(client), options)
    }

    /// A detector using any classifier.
    pub fn with_classifier(classifier: Arc<dyn FrameClassifier>, options: LlmOptions) -> Self {
        Self {
            classifier,
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

    pub fn options(&self) -> &LlmOptions {
        &self.options
    }

    /// Classify the frame at `timestamp`. Failures are logged and yield
    /// `None`.
    pub fn analyze_at(&self, ctx: &DetectionContext<'_>, timestamp: f64) -> Option<FrameAnalysis> {
        let frame = match ctx.scanner.frame_at(ctx.path(), timestamp, self.options.frame_width) {
            Ok(frame) => frame,
            Err(error) => {
                log::debug!("No frame at {timestamp:.1}s: {error}");
                return None;
            }
        };
        match self.classifier.classify(&frame) {
            Ok(response) => Some(FrameAnalysis::parse(timestamp, &response)),
            Err(error) => {
                log::debug!("LLM analysis failed at {timestamp:.1}s: {error}");
                None
            }
        }
    }

    fn sample(&self, ctx: &DetectionContext<'_>, start: f64, end: f64, step: f64) -> Vec<FrameAnalysis> {
        let step = step.max(0.1);
        let count = ((end - start) / step).floor().max(0.0) as usize + 1;
        (0..count)
            .map(|i| start + i as f64 * step)
            .filter(|&t| t <= end)
            .filter_map(|t| self.analyze_at(ctx, t))
            .collect()
    }

    /// Turn positive frames into contiguous episodes of at least the
    /// minimum length.
    pub fn analyses_to_boundaries(&self, analyses: &[FrameAnalysis], total_duration: f64) -> Vec<EpisodeBoundary> {
        let mut positives: Vec<(&FrameAnalysis, f64)> = analyses
            .iter()
            .filter(|a| a.is_boundary())
            .map(|a| {
                let mut confidence = a.confidence;
                if a.is_credits {
                    confidence = confidence.max(0.85);
                }
                if a.is_title_card {
                    confidence = confidence.max(0.9);
                }
                if a.is_previously_on {
                    confidence = confidence.max(0.85);
                }
                (a, confidence)
            })
            .collect();
        if positives.is_empty() {
            return Vec::new();
        }
        positives.sort_by(|a, b| a.0.timestamp.total_cmp(&b.0.timestamp));

        let mut boundaries = Vec::new();
        let mut previous_end = 0.0;
        for (analysis, confidence) in positives {
            if analysis.timestamp - previous_end < self.min_episode_length {
                continue;
            }
            let mut boundary = EpisodeBoundary::new(previous_end, analysis.timestamp, confidence * CONFIDENCE, "llm_vision");
            if let serde_json::Value::Object(flags) = analysis.flags() {
                boundary.metadata.extend(flags);
            }
            boundaries.push(boundary);
            previous_end = analysis.timestamp;
        }

        if total_duration - previous_end >= self.min_episode_length {
            boundaries.push(
                EpisodeBoundary::new(previous_end, total_duration, CONFIDENCE * 0.7, "llm_vision")
                    .with_meta("final_episode", true),
            );
        }
        boundaries
    }

    /// Whole-file detection at explicit timestamps, or every half minimum
    /// episode when `candidates` is empty.
    pub fn detect_with_candidates(
        &self,
        ctx: &DetectionContext<'_>,
        candidates: &[f64],
    ) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let total = ctx.total_duration();
        let timestamps: Vec<f64> = if candidates.is_empty() {
            let step = (self.min_episode_length / 2.0).max(1.0);
            (0..)
                .map(|i| i as f64 * step)
                .take_while(|&t| t < total)
                .collect()
        } else {
            candidates.to_vec()
        };
        log::info!("Analyzing {} timestamps with LLM", timestamps.len());

        let analyses: Vec<FrameAnalysis> = timestamps.iter().filter_map(|&t| self.analyze_at(ctx, t)).collect();
        if analyses.is_empty() {
            log::debug!("No frames could be analyzed");
            return Ok(Vec::new());
        }
        log::info!("Successfully analyzed {} frames", analyses.len());

        let boundaries = self.analyses_to_boundaries(&analyses, total);
        log::info!("Detected {} episode boundaries from LLM analysis", boundaries.len());
        Ok(boundaries)
    }

    /// Scan a window at the base interval, dropping to the fine interval
    /// from a logo sighting until the logo is gone.
    pub fn scan_adaptive(&self, ctx: &DetectionContext<'_>, start: f64, end: f64) -> Vec<FrameAnalysis> {
        let base = self.options.base_interval.max(0.1);
        let fine = self.options.fine_interval.clamp(0.1, base);

        let mut analyses = Vec::new();
        let mut t = start;
        while t <= end {
            let Some(analysis) = self.analyze_at(ctx, t) else {
                t += base;
                continue;
            };
            let on_logo = analysis.is_logo;
            analyses.push(analysis);
            if on_logo {
                // Walk back to find where the logo began, then forward to its end.
                let mut back = t - fine;
                while back > (t - base).max(start) {
                    match self.analyze_at(ctx, back) {
                        Some(a) if a.is_logo => {
                            analyses.push(a);
                            back -= fine;
                        }
                        Some(a) => {
                            analyses.push(a);
                            break;
                        }
                        None => break,
                    }
                }
                let mut forward = t + fine;
                while forward <= end {
                    let Some(a) = self.analyze_at(ctx, forward) else { break };
                    let still_logo = a.is_logo;
                    analyses.push(a);
                    forward += fine;
                    if !still_logo {
                        break;
                    }
                }
                t = forward.max(t + fine);
                continue;
            }
            t += base;
        }
        analyses.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        analyses.dedup_by(|a, b| (a.timestamp - b.timestamp).abs() < 1e-6);
        analyses
    }

    fn analyses_to_raw(&self, analyses: &[FrameAnalysis], index: usize) -> Vec<RawDetection> {
        let mut detections = Vec::new();
        for a in analyses {
            let cues = [
                (a.is_logo, self.options.logo_score, "llm_logo"),
                (a.is_credits, self.options.credits_score, "llm_credits"),
                (a.is_outro, self.options.outro_score, "llm_outro"),
            ];
            for (present, score, source) in cues {
                if present {
                    detections.push(
                        RawDetection::new(a.timestamp, score * a.confidence, source)
                            .with_meta("window_index", index)
                            .with_meta("llm_confidence", a.confidence),
                    );
                }
            }
        }
        detections
    }

    /// Find the cut in one precision window.
    ///
    /// Tries the window, then the window widened on both sides, then a
    /// coarse adaptive scan of the widened window. When all three fail the
    /// hit carries `failed: true`.
    pub fn detect_precision_in_window(
        &self,
        ctx: &DetectionContext<'_>,
        window: &SearchWindow,
        pattern: Option<&DetectionPattern>,
    ) -> WindowHit {
        let options = &self.options.precision;
        let decide = |analyses: &[FrameAnalysis]| match pattern {
            Some(pattern) => precision::decide_with_pattern(analyses, pattern, options),
            None => precision::decide_split(analyses, window.center_time, options),
        };

        let analyses = self.sample(ctx, window.start_time, window.end_time, options.sample_interval);
        if let Some(hit) = decide(&analyses) {
            return hit.with_meta("frames_analyzed", analyses.len());
        }

        let expanded = window.expanded(window.width() / 2.0 + options.expansion, ctx.total_duration());
        log::debug!(
            "Window {:.2}m: no split found, expanding to {:.2}-{:.2}m",
            window.center_time / 60.0,
            expanded.start_time / 60.0,
            expanded.end_time / 60.0
        );
        let mut wide = self.sample(ctx, expanded.start_time, window.start_time, options.sample_interval);
        wide.extend(analyses);
        wide.extend(self.sample(ctx, window.end_time + options.sample_interval, expanded.end_time, options.sample_interval));
        wide.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        wide.dedup_by(|a, b| (a.timestamp - b.timestamp).abs() < 1e-6);
        if let Some(hit) = decide(&wide) {
            return hit.with_meta("from_expansion", true);
        }

        let coarse = self.scan_adaptive(ctx, expanded.start_time, expanded.end_time);
        if let Some(hit) = precision::decide_split(&coarse, window.center_time, options) {
            return hit.with_meta("from_expansion", true).with_meta("coarse_scan", true);
        }

        log::warn!("Window {:.2}m: LLM precision detection failed", window.center_time / 60.0);
        WindowHit::new(window.center_time, 0.0)
            .with_meta("source", "llm_precision_failed")
            .with_meta("failed", true)
            .with_meta("error", "No detections found")
    }

    /// Confirm boundaries whose end frame shows credits, an outro or a
    /// title card (+0.1, capped at 0.95); others lose 10%.
    pub fn validate_boundaries(&self, ctx: &DetectionContext<'_>, boundaries: Vec<EpisodeBoundary>) -> Vec<EpisodeBoundary> {
        boundaries
            .into_iter()
            .map(|mut boundary| {
                let Some(analysis) = self.analyze_at(ctx, boundary.end_time) else {
                    return boundary;
                };
                if analysis.is_credits || analysis.is_outro || analysis.is_title_card {
                    boundary.set_confidence((boundary.confidence + 0.1).min(0.95));
                    boundary.source = format!("{}+llm", boundary.source);
                    boundary.metadata.insert("llm_validated".into(), true.into());
                    boundary.metadata.insert("llm_analysis".into(), analysis.flags());
                } else {
                    boundary.set_confidence(boundary.confidence * 0.9);
                    boundary.metadata.insert("llm_validated".into(), false.into());
                }
                boundary
            })
            .collect()
    }
}

impl Detector for LlmDetector {
    fn name(&self) -> &'static str {
        "llm_vision"
    }

    fn check_available(&self) -> Result<(), EpisplitError> {
        self.classifier.check_available()
    }
}

impl WholeFileDetector for LlmDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let detector = LlmDetector {
            classifier: Arc::clone(&self.classifier),
            options: self.options.clone(),
            min_episode_length: ctx.min_episode_length,
            max_episode_length: ctx.max_episode_length,
        };
        detector.detect_with_candidates(ctx, &[])
    }
}

impl RawWindowedDetector for LlmDetector {
    fn detect_raw_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<RawDetection>, EpisplitError> {
        let mut detections = Vec::new();
        for (index, window) in windows.iter().enumerate() {
            let analyses = self.scan_adaptive(ctx, window.start_time, window.end_time);
            let found = self.analyses_to_raw(&analyses, index);
            log::debug!(
                "Window {}: {} frames analyzed, {} detections",
                index + 1,
                analyses.len(),
                found.len()
            );
            detections.extend(found);
        }
        log::info!("LLM detector: {} raw detections", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unused;

    impl FrameClassifier for Unused {
        fn check_available(&self) -> Result<(), EpisplitError> {
            Err(EpisplitError::unavailable("llm_vision", "test"))
        }

        fn classify(&self, _: &image::DynamicImage) -> Result<String, EpisplitError> {
            Err(EpisplitError::HttpTransport("offline".into()))
        }
    }

    fn detector() -> LlmDetector {
        LlmDetector::with_classifier(Arc::new(Unused), LlmOptions::default())
    }

    fn analysis(t: f64, response: &str) -> FrameAnalysis {
        FrameAnalysis::parse(t, response)
    }

    #[test]
    fn whole_file_boundaries_apply_confidence_floors() {
        let analyses = vec![
            analysis(450.0, "CREDITS: YES\nCONFIDENCE: LOW"),
            analysis(1350.0, "TITLE_CARD: YES\nCONFIDENCE: LOW"),
            analysis(1800.0, "OUTRO: YES"),
            analysis(2250.0, "INTRO: NO"),
        ];
        let boundaries = detector().analyses_to_boundaries(&analyses, 2700.0);
        assert_eq!(boundaries.len(), 2);
        assert_eq!((boundaries[0].start_time, boundaries[0].end_time), (0.0, 1350.0));
        assert!((boundaries[0].confidence - 0.81).abs() < 1e-9);
        assert_eq!(boundaries[0].metadata["is_title_card"], true);
        assert_eq!(boundaries[1].metadata["final_episode"], true);
        assert!((boundaries[1].confidence - 0.63).abs() < 1e-9);
    }

    #[test]
    fn raw_detections_scale_with_model_confidence() {
        let analyses = vec![analysis(10.0, "LOGO: YES\nCREDITS: YES\nCONFIDENCE: HIGH"), analysis(20.0, "")];
        let raw = detector().analyses_to_raw(&analyses, 0);
        let sources: Vec<&str> = raw.iter().map(|d| d.source.as_str()).collect();
        assert_eq!(sources, vec!["llm_logo", "llm_credits"]);
        assert!((raw[0].score - 27.0).abs() < 1e-9);
    }

    #[test]
    fn unavailable_classifier_is_reported() {
        assert!(matches!(
            detector().check_available(),
            Err(EpisplitError::DetectorUnavailable { .. })
        ));
    }
}

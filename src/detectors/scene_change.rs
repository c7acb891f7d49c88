//! Shot-cut detection inside search windows.
//!
//! Scene cuts are everywhere in a programme, so this detector only runs
//! windowed: within each window it picks the cut that is both strong and
//! close to the expected boundary.

use serde::{Deserialize, Serialize};

use crate::boundary::WindowHit;
use crate::cluster::RawDetection;
use crate::detector::{
    DetectionContext, Detector, RawWindowedDetector, WindowedDetector, center_proximity, hits_per_window,
    window_range,
};
use crate::error::EpisplitError;
use crate::scan::SceneCut;
use crate::window::SearchWindow;

/// Scene change detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneChangeOptions {
    /// Minimum cut score on a 0-1 scale.
    pub threshold: f64,
    /// Weight of the cut score against center proximity when ranking.
    pub score_weight: f64,
    /// Raw detection score per unit of cut score.
    pub raw_score_scale: f64,
}

impl Default for SceneChangeOptions {
    fn default() -> Self {
        Self {
            threshold: 0.3,
            score_weight: 0.7,
            raw_score_scale: 100.0,
        }
    }
}

impl SceneChangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SceneChangeDetector {
    options: SceneChangeOptions,
}

impl SceneChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SceneChangeOptions) -> Self {
        Self { options }
    }

    /// Confidence of a boundary on a cut of `score`.
    pub fn cut_confidence(score: f64) -> f64 {
        (0.5 + score * 0.5).min(0.9)
    }

    /// The cut ranked highest by score and center proximity.
    pub fn best_cut(&self, window: &SearchWindow, cuts: &[SceneCut]) -> Option<WindowHit> {
        let weight = self.options.score_weight;
        cuts.iter()
            .filter(|cut| window.contains(cut.time))
            .map(|cut| (cut, cut.score * weight + center_proximity(window, cut.time) * (1.0 - weight)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(cut, _)| {
                log::debug!(
                    "Window {:.1}-{:.1}m: best scene change at {:.1}m (score={:.2})",
                    window.start_time / 60.0,
                    window.end_time / 60.0,
                    cut.time / 60.0,
                    cut.score
                );
                WindowHit::new(cut.time, Self::cut_confidence(cut.score))
                    .with_meta("source", "scene_change")
                    .with_meta("window_source", window.source.as_str())
                    .with_meta("scene_score", cut.score)
            })
    }
}

impl Detector for SceneChangeDetector {
    fn name(&self) -> &'static str {
        "scene_change"
    }
}

impl WindowedDetector for SceneChangeDetector {
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError> {
        Ok(hits_per_window(self.name(), windows, "scene_fallback", |window| {
            let Some(range) = window_range(window) else {
                return Ok(None);
            };
            let cuts = ctx.scanner.scene_cuts(ctx.path(), range, self.options.threshold)?;
            Ok(self.best_cut(window, &cuts))
        }))
    }
}

impl RawWindowedDetector for SceneChangeDetector {
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
            match ctx.scanner.scene_cuts(ctx.path(), range, self.options.threshold) {
                Ok(cuts) => {
                    log::debug!("Window {}: found {} scene changes", index + 1, cuts.len());
                    detections.extend(cuts.into_iter().map(|cut| {
                        RawDetection::new(cut.time, cut.score * self.options.raw_score_scale, "scene_change")
                            .with_meta("scene_score", cut.score)
                            .with_meta("window_center", window.center_time)
                    }));
                }
                Err(error) => log::warn!("scene_change: window {} scan failed: {error}", index + 1),
            }
        }
        log::info!("Scene change detector: {} raw detections", detections.len());
        Ok(detections)
    }
}

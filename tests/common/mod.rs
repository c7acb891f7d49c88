//! Scripted media for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use episplit::EpisplitError;
use episplit::detectors::FrameClassifier;
use episplit::scan::{BlackParams, BlackRegion, LumaSample, MediaScanner, SceneCut, SilenceParams, SilenceRegion, TimeRange};
use image::{DynamicImage, GrayImage, Luma};

/// A file whose silences, black runs, scene cuts and logo shots are known
/// in advance.
#[derive(Debug, Clone, Default)]
pub struct ScriptedMedia {
    pub silences: Vec<SilenceRegion>,
    pub blacks: Vec<BlackRegion>,
    pub cuts: Vec<SceneCut>,
    /// Frames in these ranges render white; every other frame is black.
    pub logos: Vec<(f64, f64)>,
    /// Silence scans covering one of these times fail.
    pub broken: Vec<f64>,
}

impl ScriptedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silence(mut self, start: f64, end: f64) -> Self {
        self.silences.push(SilenceRegion::new(start, end));
        self
    }

    pub fn black(mut self, start: f64, end: f64) -> Self {
        self.blacks.push(BlackRegion::new(start, end));
        self
    }

    pub fn logo(mut self, start: f64, end: f64) -> Self {
        self.logos.push((start, end));
        self
    }

    pub fn broken_at(mut self, time: f64) -> Self {
        self.broken.push(time);
        self
    }
}

fn overlapping<T: Copy>(items: &[T], range: TimeRange, bounds: impl Fn(&T) -> (f64, f64)) -> Vec<T> {
    items
        .iter()
        .filter(|item| {
            let (start, end) = bounds(item);
            end > range.start && start < range.end
        })
        .copied()
        .collect()
}

impl MediaScanner for ScriptedMedia {
    fn pcm(&self, _: &Path, _: TimeRange, _: u32) -> Result<Vec<f32>, EpisplitError> {
        Err(EpisplitError::NoAudioStream)
    }

    fn luma_samples(&self, _: &Path, _: TimeRange, _: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError> {
        Ok(Vec::new())
    }

    fn scene_cuts(&self, _: &Path, range: TimeRange, threshold: f64) -> Result<Vec<SceneCut>, EpisplitError> {
        Ok(self
            .cuts
            .iter()
            .filter(|cut| range.contains(cut.time) && cut.score >= threshold)
            .copied()
            .collect())
    }

    fn frame_at(&self, _: &Path, time: f64, _: u32) -> Result<DynamicImage, EpisplitError> {
        let lit = self.logos.iter().any(|&(start, end)| time >= start && time < end);
        let level = if lit { 255 } else { 0 };
        Ok(DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([level]))))
    }

    fn silences(&self, _: &Path, range: TimeRange, _: &SilenceParams) -> Result<Vec<SilenceRegion>, EpisplitError> {
        if self.broken.iter().any(|&time| range.contains(time)) {
            return Err(EpisplitError::Timeout {
                operation: "silence scan".to_string(),
                after: Duration::from_secs(1),
            });
        }
        Ok(overlapping(&self.silences, range, |s| (s.start, s.end)))
    }

    fn black_regions(&self, _: &Path, range: TimeRange, _: &BlackParams) -> Result<Vec<BlackRegion>, EpisplitError> {
        Ok(overlapping(&self.blacks, range, |b| (b.start, b.end)))
    }
}

/// Answers `LOGO: YES` for white frames, nothing for the rest.
#[derive(Debug, Default)]
pub struct LogoSpotter;

impl FrameClassifier for LogoSpotter {
    fn check_available(&self) -> Result<(), EpisplitError> {
        Ok(())
    }

    fn classify(&self, frame: &DynamicImage) -> Result<String, EpisplitError> {
        let lit = frame.to_luma8().get_pixel(0, 0)[0] > 127;
        let answer = if lit { "YES" } else { "NO" };
        Ok(format!(
            "CREDITS: NO\nTITLE_CARD: NO\nPREVIOUSLY_ON: NO\nINTRO: NO\nOUTRO: NO\nLOGO: {answer}\nCONFIDENCE: HIGH"
        ))
    }
}

/// Assert that `episodes` tile `[0, total]` without gaps or overlaps.
pub fn assert_contiguous(spans: &[(f64, f64)], total: f64) {
    assert!(!spans.is_empty());
    assert!(spans[0].0.abs() < 1e-6, "first episode starts at {}", spans[0].0);
    for pair in spans.windows(2) {
        assert!((pair[0].1 - pair[1].0).abs() < 1e-6, "gap between {:?} and {:?}", pair[0], pair[1]);
    }
    let last = spans[spans.len() - 1].1;
    assert!((last - total).abs() < 1e-6, "last episode ends at {last}");
}

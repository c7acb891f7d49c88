//! Media scans shared by all detectors.
//!
//! Detectors never talk to FFmpeg directly. They ask a [`MediaScanner`] for
//! silence regions, black regions, scene cuts, single frames, or raw PCM over
//! a [`TimeRange`]. The production implementation is
//! [`FfmpegScanner`](crate::FfmpegScanner); tests substitute in-memory fakes.
//!
//! Silence and black-frame detection are pure functions over decoded
//! samples ([`detect_silence`], [`detect_black_regions`]) so the scanner only
//! has to decode. [`TimedScanner`] bounds every call with a timeout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::conversion::db_to_linear;
use crate::error::EpisplitError;

/// A half-open time range in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    /// # Errors
    ///
    /// Returns [`EpisplitError::InvalidRange`] when `start >= end`.
    pub fn new(start: f64, end: f64) -> Result<Self, EpisplitError> {
        if !(start < end) {
            return Err(EpisplitError::InvalidRange { start, end });
        }
        Ok(Self {
            start: start.max(0.0),
            end,
        })
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// A silent stretch of audio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SilenceRegion {
    pub start: f64,
    pub end: f64,
}

impl SilenceRegion {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }
}

/// A run of near-black frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlackRegion {
    pub start: f64,
    pub end: f64,
}

impl BlackRegion {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn midpoint(&self) -> f64 {
        (self.start + self.end) / 2.0
    }
}

/// A shot cut with its magnitude on a 0-1 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SceneCut {
    pub time: f64,
    pub score: f64,
}

/// Dark-pixel ratio of one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LumaSample {
    pub time: f64,
    /// Fraction of pixels darker than the pixel threshold.
    pub dark_ratio: f64,
}

/// Silence scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SilenceParams {
    /// Level below which audio counts as silent, in dBFS.
    pub threshold_db: f64,
    /// Shortest silence reported, in seconds.
    pub min_duration: f64,
    /// Decode rate for the scan.
    pub sample_rate: u32,
    /// RMS window length in seconds.
    pub window: f64,
}

impl Default for SilenceParams {
    fn default() -> Self {
        Self {
            threshold_db: -30.0,
            min_duration: 2.0,
            sample_rate: 8_000,
            window: 0.05,
        }
    }
}

/// Black-frame scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackParams {
    /// Shortest black run reported, in seconds.
    pub min_duration: f64,
    /// Fraction of dark pixels for a frame to count as black.
    pub picture_threshold: f64,
    /// Luma level (0-1) under which a pixel is dark.
    pub pixel_threshold: f64,
    /// Frames sampled per second.
    pub sample_fps: f64,
}

impl Default for BlackParams {
    fn default() -> Self {
        Self {
            min_duration: 1.0,
            picture_threshold: 0.98,
            pixel_threshold: 0.10,
            sample_fps: 5.0,
        }
    }
}

/// Read access to the media a detector analyses.
///
/// All methods take the file path so one scanner can serve every file of a
/// run. Implementations must be safe to call from several worker threads.
pub trait MediaScanner: Send + Sync {
    /// Mono f32 PCM for `range`, resampled to `sample_rate`.
    fn pcm(&self, path: &Path, range: TimeRange, sample_rate: u32) -> Result<Vec<f32>, EpisplitError>;

    /// Dark-pixel ratios of frames sampled at `params.sample_fps`.
    fn luma_samples(&self, path: &Path, range: TimeRange, params: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError>;

    /// Scene cuts with score at least `threshold` (0-1).
    fn scene_cuts(&self, path: &Path, range: TimeRange, threshold: f64) -> Result<Vec<SceneCut>, EpisplitError>;

    /// The first frame at or after `time`, scaled to at most `max_width`.
    fn frame_at(&self, path: &Path, time: f64, max_width: u32) -> Result<DynamicImage, EpisplitError>;

    /// Silence regions in `range`, in absolute file time.
    fn silences(&self, path: &Path, range: TimeRange, params: &SilenceParams) -> Result<Vec<SilenceRegion>, EpisplitError> {
        let samples = self.pcm(path, range, params.sample_rate)?;
        Ok(detect_silence(&samples, params.sample_rate, params)
            .into_iter()
            .map(|r| SilenceRegion::new(r.start + range.start, r.end + range.start))
            .collect())
    }

    /// Black regions in `range`, in absolute file time.
    fn black_regions(&self, path: &Path, range: TimeRange, params: &BlackParams) -> Result<Vec<BlackRegion>, EpisplitError> {
        let samples = self.luma_samples(path, range, params)?;
        Ok(detect_black_regions(&samples, params))
    }
}

/// RMS-window silence detection over mono samples.
///
/// Times are relative to the first sample.
pub fn detect_silence(samples: &[f32], sample_rate: u32, params: &SilenceParams) -> Vec<SilenceRegion> {
    if samples.is_empty() || sample_rate == 0 {
        return Vec::new();
    }

    let threshold = db_to_linear(params.threshold_db);
    let window = ((params.window * sample_rate as f64) as usize).max(1);
    let rate = sample_rate as f64;

    let mut regions = Vec::new();
    let mut silence_start: Option<usize> = None;

    for (index, chunk) in samples.chunks(window).enumerate() {
        let position = index * window;
        let rms = (chunk.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / chunk.len() as f64).sqrt();
        match (rms < threshold, silence_start) {
            (true, None) => silence_start = Some(position),
            (false, Some(start)) => {
                push_region(&mut regions, start, position, rate, params.min_duration);
                silence_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = silence_start {
        push_region(&mut regions, start, samples.len(), rate, params.min_duration);
    }
    regions
}

fn push_region(regions: &mut Vec<SilenceRegion>, start: usize, end: usize, rate: f64, min_duration: f64) {
    let region = SilenceRegion::new(start as f64 / rate, end as f64 / rate);
    if region.duration() >= min_duration {
        regions.push(region);
    }
}

/// Runs of frames whose dark ratio reaches the picture threshold.
///
/// Each frame is assumed to last until the next sample; the last one lasts
/// one sample period.
pub fn detect_black_regions(samples: &[LumaSample], params: &BlackParams) -> Vec<BlackRegion> {
    let period = if params.sample_fps > 0.0 {
        1.0 / params.sample_fps
    } else {
        0.0
    };

    let mut regions = Vec::new();
    let mut run_start: Option<f64> = None;
    let mut last_time = 0.0;

    for sample in samples {
        let black = sample.dark_ratio >= params.picture_threshold;
        match (black, run_start) {
            (true, None) => run_start = Some(sample.time),
            (false, Some(start)) => {
                if sample.time - start >= params.min_duration {
                    regions.push(BlackRegion::new(start, sample.time));
                }
                run_start = None;
            }
            _ => {}
        }
        last_time = sample.time;
    }
    if let Some(start) = run_start {
        let end = last_time + period;
        if end - start >= params.min_duration {
            regions.push(BlackRegion::new(start, end));
        }
    }
    regions
}

/// Decorator that bounds every scanner call with a timeout.
///
/// The wrapped call runs on its own thread. When the limit is exceeded the
/// caller gets [`EpisplitError::Timeout`] immediately; the abandoned thread
/// finishes in the background and its result is discarded.
#[derive(Clone)]
pub struct TimedScanner {
    inner: Arc<dyn MediaScanner>,
    timeout: Duration,
}

impl TimedScanner {
    pub fn new(inner: Arc<dyn MediaScanner>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn run<T, F>(&self, operation: &str, call: F) -> Result<T, EpisplitError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn MediaScanner) -> Result<T, EpisplitError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name(format!("scan-{operation}"))
            .spawn(move || {
                let _ = sender.send(call(inner.as_ref()));
            })?;

        match receiver.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!("{} timed out after {:?}", operation, self.timeout);
                Err(EpisplitError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(EpisplitError::FfmpegError(format!(
                "{operation} worker exited without a result"
            ))),
        }
    }
}

impl MediaScanner for TimedScanner {
    fn pcm(&self, path: &Path, range: TimeRange, sample_rate: u32) -> Result<Vec<f32>, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        self.run("pcm", move |scanner| scanner.pcm(&path, range, sample_rate))
    }

    fn luma_samples(&self, path: &Path, range: TimeRange, params: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        let params = *params;
        self.run("luma scan", move |scanner| scanner.luma_samples(&path, range, &params))
    }

    fn scene_cuts(&self, path: &Path, range: TimeRange, threshold: f64) -> Result<Vec<SceneCut>, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        self.run("scene scan", move |scanner| scanner.scene_cuts(&path, range, threshold))
    }

    fn frame_at(&self, path: &Path, time: f64, max_width: u32) -> Result<DynamicImage, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        self.run("frame grab", move |scanner| scanner.frame_at(&path, time, max_width))
    }

    fn silences(&self, path: &Path, range: TimeRange, params: &SilenceParams) -> Result<Vec<SilenceRegion>, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        let params = *params;
        self.run("silence scan", move |scanner| scanner.silences(&path, range, &params))
    }

    fn black_regions(&self, path: &Path, range: TimeRange, params: &BlackParams) -> Result<Vec<BlackRegion>, EpisplitError> {
        let path: PathBuf = path.to_path_buf();
        let params = *params;
        self.run("black scan", move |scanner| scanner.black_regions(&path, range, &params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(seconds: f64, rate: u32) -> Vec<f32> {
        (0..(seconds * rate as f64) as usize)
            .map(|i| (i as f32 * 0.1).sin() * 0.5)
            .collect()
    }

    #[test]
    fn finds_silence_between_tones() {
        let rate = 8_000;
        let mut samples = tone(5.0, rate);
        samples.extend(std::iter::repeat_n(0.0, 3 * rate as usize));
        samples.extend(tone(5.0, rate));
        samples.extend(std::iter::repeat_n(0.0, rate as usize));
        samples.extend(tone(1.0, rate));

        let regions = detect_silence(&samples, rate, &SilenceParams::default());
        assert_eq!(regions.len(), 1, "one-second gap is below the minimum");
        assert!((regions[0].start - 5.0).abs() < 0.06);
        assert!((regions[0].end - 8.0).abs() < 0.06);
    }

    #[test]
    fn trailing_silence_is_closed() {
        let rate = 8_000;
        let mut samples = tone(1.0, rate);
        samples.extend(std::iter::repeat_n(0.0, 4 * rate as usize));
        let regions = detect_silence(&samples, rate, &SilenceParams::default());
        assert_eq!(regions.len(), 1);
        assert!((regions[0].end - 5.0).abs() < 1e-9);
    }

    #[test]
    fn black_runs_need_min_duration() {
        let params = BlackParams::default();
        let samples: Vec<LumaSample> = (0..50)
            .map(|i| {
                let time = i as f64 * 0.2;
                let dark_ratio = if (2.0..3.5).contains(&time) || (6.0..6.5).contains(&time) {
                    1.0
                } else {
                    0.3
                };
                LumaSample { time, dark_ratio }
            })
            .collect();
        let regions = detect_black_regions(&samples, &params);
        assert_eq!(regions.len(), 1);
        assert!((regions[0].start - 2.0).abs() < 1e-9);
        assert!((regions[0].end - 3.6).abs() < 1e-9);
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(matches!(
            TimeRange::new(10.0, 5.0),
            Err(EpisplitError::InvalidRange { .. })
        ));
    }

    struct SlowScanner;

    impl MediaScanner for SlowScanner {
        fn pcm(&self, _: &Path, _: TimeRange, _: u32) -> Result<Vec<f32>, EpisplitError> {
            thread::sleep(Duration::from_millis(500));
            Ok(Vec::new())
        }
        fn luma_samples(&self, _: &Path, _: TimeRange, _: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError> {
            Ok(vec![LumaSample { time: 0.0, dark_ratio: 1.0 }])
        }
        fn scene_cuts(&self, _: &Path, _: TimeRange, _: f64) -> Result<Vec<SceneCut>, EpisplitError> {
            Ok(Vec::new())
        }
        fn frame_at(&self, _: &Path, _: f64, _: u32) -> Result<DynamicImage, EpisplitError> {
            Err(EpisplitError::NoVideoStream)
        }
    }

    #[test]
    fn timed_scanner_times_out_and_passes_through() {
        let scanner = TimedScanner::new(Arc::new(SlowScanner), Duration::from_millis(50));
        let range = TimeRange::new(0.0, 10.0).expect("range");
        let result = scanner.pcm(Path::new("x.mkv"), range, 8_000);
        assert!(matches!(result, Err(EpisplitError::Timeout { .. })));

        let black = scanner
            .black_regions(Path::new("x.mkv"), range, &BlackParams::default())
            .expect("black");
        assert_eq!(black.len(), 0, "single sample is shorter than the minimum");
        assert!(matches!(
            scanner.frame_at(Path::new("x.mkv"), 1.0, 320),
            Err(EpisplitError::NoVideoStream)
        ));
    }
}

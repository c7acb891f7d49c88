//! Recurring-audio detection from coarse energy profiles.
//!
//! Short mono segments are decoded at likely episode starts and reduced to
//! a normalized energy envelope. Envelopes that line up across segments at
//! least one minimum episode apart point at a repeating theme tune.

use serde::{Deserialize, Serialize};

use crate::boundary::{EpisodeBoundary, WindowHit};
use crate::detector::{DetectionContext, Detector, WholeFileDetector, WindowedDetector, hits_per_window, window_range};
use crate::detectors::image_hash::{dominant_interval, interval_boundaries, minute_bucket};
use crate::error::EpisplitError;
use crate::scan::TimeRange;
use crate::window::SearchWindow;

const CONFIDENCE: f64 = 0.85;

/// Audio fingerprint detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFingerprintOptions {
    /// Length of each compared segment in seconds.
    pub segment_duration: f64,
    pub sample_rate: u32,
    /// Number of bins in an energy profile.
    pub profile_bins: usize,
    /// Similarity a pair must exceed to match.
    pub match_threshold: f64,
    /// Step of the sliding probe in windowed mode, in seconds.
    pub probe_step: f64,
}

impl Default for AudioFingerprintOptions {
    fn default() -> Self {
        Self {
            segment_duration: 30.0,
            sample_rate: 8000,
            profile_bins: 100,
            match_threshold: 0.7,
            probe_step: 10.0,
        }
    }
}

/// A decoded segment's energy envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub timestamp: f64,
    pub profile: Vec<f64>,
}

/// Two similar segments far enough apart to be different episodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioMatch {
    pub first: f64,
    pub second: f64,
    pub similarity: f64,
}

/// Mean absolute amplitude in `bins` equal bins, normalized to the loudest.
///
/// `None` when there are fewer samples than bins.
pub fn energy_profile(samples: &[f32], bins: usize) -> Option<Vec<f64>> {
    if bins == 0 || samples.len() < bins {
        return None;
    }
    let bin_size = samples.len() / bins;
    let mut profile: Vec<f64> = samples
        .chunks_exact(bin_size)
        .take(bins)
        .map(|chunk| chunk.iter().map(|s| f64::from(s.abs())).sum::<f64>() / bin_size as f64)
        .collect();

    let max = profile.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        profile.iter_mut().for_each(|e| *e /= max);
    }
    Some(profile)
}

/// `1 - mean |a - b|`, floored at zero. Profiles of different length score 0.
pub fn compare_profiles(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mean_diff = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f64>() / a.len() as f64;
    (1.0 - mean_diff).max(0.0)
}

#[derive(Debug, Clone)]
pub struct AudioFingerprintDetector {
    options: AudioFingerprintOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for AudioFingerprintDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioFingerprintDetector {
    pub fn new() -> Self {
        Self::with_options(AudioFingerprintOptions::default())
    }

    pub fn with_options(options: AudioFingerprintOptions) -> Self {
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

    /// Where segments are taken: the start, one minimum episode in, then
    /// every half minimum episode while a full segment still fits.
    pub fn segment_times(&self, total_duration: f64) -> Vec<f64> {
        let segment = self.options.segment_duration;
        let step = (self.min_episode_length / 2.0).max(1.0);
        let mut times = vec![0.0];
        let mut current = self.min_episode_length;
        while current + segment < total_duration {
            times.push(current);
            current += step;
        }
        times.retain(|t| t + segment <= total_duration);
        times
    }

    fn segment_at(&self, ctx: &DetectionContext<'_>, timestamp: f64) -> Option<AudioSegment> {
        let range = TimeRange::new(timestamp, timestamp + self.options.segment_duration).ok()?;
        match ctx.scanner.pcm(ctx.path(), range, self.options.sample_rate) {
            Ok(samples) => energy_profile(&samples, self.options.profile_bins)
                .map(|profile| AudioSegment { timestamp, profile }),
            Err(error) => {
                log::debug!("Failed to decode audio at {timestamp:.1}s: {error}");
                None
            }
        }
    }

    pub fn extract_segments(&self, ctx: &DetectionContext<'_>) -> Vec<AudioSegment> {
        self.segment_times(ctx.total_duration())
            .into_iter()
            .filter_map(|t| self.segment_at(ctx, t))
            .collect()
    }

    /// Pairs of similar segments at least one minimum episode apart.
    pub fn find_matches(&self, segments: &[AudioSegment]) -> Vec<AudioMatch> {
        let mut matches = Vec::new();
        for (i, a) in segments.iter().enumerate() {
            for b in &segments[i + 1..] {
                if (b.timestamp - a.timestamp).abs() < self.min_episode_length {
                    continue;
                }
                let similarity = compare_profiles(&a.profile, &b.profile);
                if similarity > self.options.match_threshold {
                    matches.push(AudioMatch {
                        first: a.timestamp.min(b.timestamp),
                        second: a.timestamp.max(b.timestamp),
                        similarity,
                    });
                }
            }
        }
        matches
    }

    /// Episodes at multiples of the dominant match interval.
    pub fn matches_to_boundaries(&self, matches: &[AudioMatch], total_duration: f64) -> Vec<EpisodeBoundary> {
        let intervals: Vec<f64> = matches.iter().map(|m| m.second - m.first).collect();
        let Some((interval, count)) = dominant_interval(&intervals) else {
            return Vec::new();
        };
        if !(self.min_episode_length..=self.max_episode_length).contains(&interval) {
            log::debug!("Audio interval {interval}s outside valid episode range");
            return Vec::new();
        }

        let bucket: Vec<&AudioMatch> = matches
            .iter()
            .filter(|m| minute_bucket(m.second - m.first) as f64 == interval)
            .collect();
        let avg_similarity = bucket.iter().map(|m| m.similarity).sum::<f64>() / bucket.len().max(1) as f64;
        let confidence = CONFIDENCE * avg_similarity;

        interval_boundaries(interval, total_duration, self.min_episode_length)
            .into_iter()
            .map(|(start, end)| {
                EpisodeBoundary::new(start, end, confidence, "audio_fingerprint")
                    .with_meta("detected_interval", interval)
                    .with_meta("match_count", count)
                    .with_meta("avg_similarity", avg_similarity)
            })
            .collect()
    }

    /// Slide a probe through `window` and return the start of the stretch
    /// that best matches `reference`, if any exceeds the threshold.
    fn best_in_window(
        &self,
        ctx: &DetectionContext<'_>,
        window: &SearchWindow,
        reference: &[f64],
    ) -> Result<Option<WindowHit>, EpisplitError> {
        let Some(range) = window_range(window) else {
            return Ok(None);
        };
        let samples = ctx.scanner.pcm(ctx.path(), range, self.options.sample_rate)?;
        let rate = f64::from(self.options.sample_rate);
        let probe_len = (self.options.segment_duration * rate) as usize;
        let step = ((self.options.probe_step * rate) as usize).max(1);
        if probe_len == 0 || samples.len() < probe_len {
            return Ok(None);
        }

        let best = (0..=samples.len() - probe_len)
            .step_by(step)
            .filter_map(|offset| {
                let profile = energy_profile(&samples[offset..offset + probe_len], self.options.profile_bins)?;
                Some((offset, compare_profiles(reference, &profile)))
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        Ok(best
            .filter(|&(_, similarity)| similarity > self.options.match_threshold)
            .map(|(offset, similarity)| {
                let time = window.start_time + offset as f64 / rate;
                log::debug!("Theme match at {time:.1}s (similarity {similarity:.2})");
                WindowHit::new(time, CONFIDENCE * similarity)
                    .with_meta("source", "audio_fingerprint")
                    .with_meta("similarity", similarity)
            }))
    }
}

impl Detector for AudioFingerprintDetector {
    fn name(&self) -> &'static str {
        "audio_fingerprint"
    }
}

impl WholeFileDetector for AudioFingerprintDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let detector = self
            .clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length);
        let segments = detector.extract_segments(ctx);
        if segments.len() < 2 {
            log::debug!("Not enough audio segments for analysis");
            return Ok(Vec::new());
        }
        log::info!("Extracted {} audio segments", segments.len());

        let matches = detector.find_matches(&segments);
        if matches.is_empty() {
            log::debug!("No recurring audio patterns found");
            return Ok(Vec::new());
        }
        log::info!("Found {} potential recurring audio patterns", matches.len());

        let boundaries = detector.matches_to_boundaries(&matches, ctx.total_duration());
        log::info!("Detected {} episode boundaries from audio patterns", boundaries.len());
        Ok(boundaries)
    }
}

impl WindowedDetector for AudioFingerprintDetector {
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError> {
        let reference = self.segment_at(ctx, 0.0);
        if reference.is_none() {
            log::warn!("audio_fingerprint: no opening segment, all windows fall back");
        }
        Ok(hits_per_window(self.name(), windows, "audio_fallback", |window| match &reference {
            Some(reference) => self.best_in_window(ctx, window, &reference.profile),
            None => Ok(None),
        }))
    }
}

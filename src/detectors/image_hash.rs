//! Perceptual-hash detection of recurring visuals.
//!
//! Frames are sampled at a fixed interval and hashed. Pairs of near-identical
//! frames at least one minimum episode apart suggest a repeating intro or
//! outro; the most common spacing between such pairs is taken as the episode
//! length.

use std::collections::BTreeMap;

use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};

use crate::boundary::EpisodeBoundary;
use crate::detector::{DetectionContext, Detector, WholeFileDetector};
use crate::error::EpisplitError;

const CONFIDENCE: f64 = 0.85;
const HASH_BITS: f64 = 64.0;
const MIN_FRAMES: usize = 10;

/// Image hash detector tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageHashOptions {
    /// Seconds between sampled frames.
    pub frame_interval: f64,
    /// Largest Hamming distance (of 64 bits) counted as a match.
    pub hash_threshold: u32,
    /// Width frames are scaled to before hashing.
    pub frame_width: u32,
    /// Offsets after each candidate start compared by intro matching.
    pub intro_offsets: Vec<f64>,
}

impl Default for ImageHashOptions {
    fn default() -> Self {
        Self {
            frame_interval: 30.0,
            hash_threshold: 10,
            frame_width: 320,
            intro_offsets: vec![0.0, 5.0, 10.0, 30.0, 60.0],
        }
    }
}

/// A sampled frame's perceptual hash.
#[derive(Debug, Clone)]
pub struct FrameHash {
    pub timestamp: f64,
    pub hash: ImageHash,
}

/// Two similar frames far enough apart to be different episodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashMatch {
    pub first: f64,
    pub second: f64,
    /// `1 - distance / 64`.
    pub similarity: f64,
}

/// The DCT mean hash used across the crate, 8x8 bits.
pub(crate) fn perceptual_hasher() -> Hasher {
    HasherConfig::new()
        .hash_alg(HashAlg::Mean)
        .preproc_dct()
        .hash_size(8, 8)
        .to_hasher()
}

#[derive(Debug, Clone)]
pub struct ImageHashDetector {
    options: ImageHashOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for ImageHashDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageHashDetector {
    pub fn new() -> Self {
        Self::with_options(ImageHashOptions::default())
    }

    pub fn with_options(options: ImageHashOptions) -> Self {
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

    fn hash_frame(&self, ctx: &DetectionContext<'_>, hasher: &Hasher, time: f64) -> Option<ImageHash> {
        match ctx.scanner.frame_at(ctx.path(), time, self.options.frame_width) {
            Ok(frame) => Some(hash_image(hasher, &frame)),
            Err(error) => {
                log::debug!("Failed to grab frame at {time:.1}s: {error}");
                None
            }
        }
    }

    /// Sample and hash a frame every `frame_interval` seconds.
    pub fn hash_frames(&self, ctx: &DetectionContext<'_>) -> Vec<FrameHash> {
        let hasher = perceptual_hasher();
        let step = self.options.frame_interval.max(1.0);
        let count = (ctx.total_duration() / step).ceil() as usize;
        (0..count)
            .map(|i| i as f64 * step)
            .filter_map(|timestamp| {
                self.hash_frame(ctx, &hasher, timestamp)
                    .map(|hash| FrameHash { timestamp, hash })
            })
            .collect()
    }

    /// All pairs of similar frames at least one minimum episode apart.
    pub fn find_hash_matches(&self, frames: &[FrameHash]) -> Vec<HashMatch> {
        let mut matches = Vec::new();
        for (i, a) in frames.iter().enumerate() {
            for b in &frames[i + 1..] {
                if (b.timestamp - a.timestamp).abs() < self.min_episode_length {
                    continue;
                }
                let distance = a.hash.dist(&b.hash);
                if distance <= self.options.hash_threshold {
                    matches.push(HashMatch {
                        first: a.timestamp,
                        second: b.timestamp,
                        similarity: 1.0 - distance as f64 / HASH_BITS,
                    });
                }
            }
        }
        matches
    }

    /// Episodes at multiples of the dominant match interval.
    pub fn matches_to_boundaries(&self, matches: &[HashMatch], total_duration: f64) -> Vec<EpisodeBoundary> {
        let intervals: Vec<f64> = matches.iter().map(|m| m.second - m.first).collect();
        let Some((interval, count)) = dominant_interval(&intervals) else {
            return Vec::new();
        };
        log::debug!("Most common interval: {interval}s ({count} matches)");

        if !(self.min_episode_length..=self.max_episode_length).contains(&interval) {
            log::debug!("Interval {interval}s outside valid episode range");
            return Vec::new();
        }

        let confidence = CONFIDENCE * count as f64 / matches.len() as f64;
        interval_boundaries(interval, total_duration, self.min_episode_length)
            .into_iter()
            .map(|(start, end)| {
                EpisodeBoundary::new(start, end, confidence, "image_hash")
                    .with_meta("detected_interval", interval)
                    .with_meta("match_count", count)
            })
            .collect()
    }

    /// Confirm candidate episode starts that open with the same visuals.
    ///
    /// Frames at each offset after every candidate are hashed; two
    /// candidates confirm each other when at least two offsets match.
    /// Returns `(time, confidence)` per confirmed candidate.
    pub fn detect_intro_pattern(&self, ctx: &DetectionContext<'_>, candidate_times: &[f64]) -> Vec<(f64, f64)> {
        if candidate_times.len() < 2 {
            return Vec::new();
        }
        let hasher = perceptual_hasher();
        let total = ctx.total_duration();

        let hashes: Vec<Vec<(f64, ImageHash)>> = candidate_times
            .iter()
            .map(|&start| {
                self.options
                    .intro_offsets
                    .iter()
                    .filter(|&&offset| start + offset < total)
                    .filter_map(|&offset| self.hash_frame(ctx, &hasher, start + offset).map(|h| (offset, h)))
                    .collect()
            })
            .collect();

        let mut confirmed: Vec<(f64, f64)> = Vec::new();
        for i in 0..candidate_times.len() {
            for j in i + 1..candidate_times.len() {
                let matches = hashes[i]
                    .iter()
                    .filter(|(offset, hash)| {
                        hashes[j]
                            .iter()
                            .any(|(o, h)| o == offset && hash.dist(h) <= self.options.hash_threshold)
                    })
                    .count();
                if matches < 2 {
                    continue;
                }
                let confidence = (0.7 + matches as f64 * 0.05).min(0.9);
                for time in [candidate_times[i], candidate_times[j]] {
                    if !confirmed.iter().any(|&(t, _)| t == time) {
                        confirmed.push((time, confidence));
                    }
                }
            }
        }
        confirmed
    }
}

pub(crate) fn hash_image(hasher: &Hasher, frame: &DynamicImage) -> ImageHash {
    hasher.hash_image(frame)
}

/// An interval rounded down to whole minutes, in seconds.
pub(crate) fn minute_bucket(interval: f64) -> u64 {
    (interval.max(0.0) as u64 / 60) * 60
}

/// The most common interval in whole-minute buckets, with its count.
///
/// Ties go to the shorter interval.
pub(crate) fn dominant_interval(intervals: &[f64]) -> Option<(f64, usize)> {
    let mut buckets: BTreeMap<u64, usize> = BTreeMap::new();
    for &interval in intervals {
        if interval > 0.0 {
            *buckets.entry(minute_bucket(interval)).or_default() += 1;
        }
    }
    buckets
        .into_iter()
        .fold(None, |best: Option<(u64, usize)>, (bucket, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((bucket, count)),
        })
        .map(|(bucket, count)| (bucket as f64, count))
}

/// `[k * interval, (k + 1) * interval]` episodes for every whole interval
/// that fits, keeping those at least `0.8 * min_length` long.
pub(crate) fn interval_boundaries(interval: f64, total_duration: f64, min_length: f64) -> Vec<(f64, f64)> {
    if interval <= 0.0 {
        return Vec::new();
    }
    let count = (total_duration / interval) as usize;
    (0..count)
        .map(|i| (i as f64 * interval, ((i + 1) as f64 * interval).min(total_duration)))
        .filter(|(start, end)| end - start >= min_length * 0.8)
        .collect()
}

impl Detector for ImageHashDetector {
    fn name(&self) -> &'static str {
        "image_hash"
    }
}

impl WholeFileDetector for ImageHashDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let detector = self
            .clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length);
        let frames = detector.hash_frames(ctx);
        if frames.len() < MIN_FRAMES {
            log::debug!("Not enough frames hashed for analysis ({})", frames.len());
            return Ok(Vec::new());
        }
        log::info!("Hashed {} frames", frames.len());

        let matches = detector.find_hash_matches(&frames);
        if matches.is_empty() {
            log::debug!("No recurring visual patterns found");
            return Ok(Vec::new());
        }
        log::info!("Found {} recurring frame pairs", matches.len());

        let boundaries = detector.matches_to_boundaries(&matches, ctx.total_duration());
        log::info!("Detected {} episode boundaries from image patterns", boundaries.len());
        Ok(boundaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_interval_buckets_by_minute() {
        let intervals = [1320.0, 1335.0, 1359.0, 2640.0, 900.0];
        assert_eq!(dominant_interval(&intervals), Some((1320.0, 3)));
        assert_eq!(dominant_interval(&[]), None);
    }

    #[test]
    fn boundaries_follow_the_interval() {
        let matches = vec![
            HashMatch { first: 30.0, second: 1350.0, similarity: 0.95 },
            HashMatch { first: 60.0, second: 1380.0, similarity: 0.9 },
            HashMatch { first: 1350.0, second: 2670.0, similarity: 0.92 },
            HashMatch { first: 90.0, second: 2700.0, similarity: 0.85 },
        ];
        let boundaries = ImageHashDetector::new().matches_to_boundaries(&matches, 3960.0);
        let ends: Vec<f64> = boundaries.iter().map(|b| b.end_time).collect();
        assert_eq!(ends, vec![1320.0, 2640.0, 3960.0]);
        assert!((boundaries[0].confidence - 0.85 * 0.75).abs() < 1e-9);
    }

    #[test]
    fn interval_outside_episode_range_is_rejected() {
        let matches = vec![HashMatch { first: 0.0, second: 600.0, similarity: 1.0 }];
        assert!(ImageHashDetector::new().matches_to_boundaries(&matches, 3600.0).is_empty());
    }

    #[test]
    fn identical_frames_hash_identically() {
        let hasher = perceptual_hasher();
        let frame = DynamicImage::ImageRgb8(image::RgbImage::from_fn(64, 48, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 5) as u8, 128])
        }));
        let a = hash_image(&hasher, &frame);
        let b = hash_image(&hasher, &frame);
        assert_eq!(a.dist(&b), 0);
    }
}

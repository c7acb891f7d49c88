//! Recurring intro sequence detection.
//!
//! The first minutes after each likely episode start are sampled every few
//! seconds and every frame gets three hashes (perceptual, gradient and
//! block). Frames that reappear at the same offset in at least half of the
//! regions form an intro sequence, and the regions where that sequence
//! occurs are the episode starts.
//!
//! With the `chromaprint` feature each region also gets a Chromaprint
//! fingerprint of its opening audio. Audio agreement boosts a video
//! sequence and can stand in for one when the video finds nothing.

use std::collections::BTreeSet;

use image_hasher::{HashAlg, Hasher, HasherConfig, ImageHash};
use serde::{Deserialize, Serialize};

use crate::boundary::EpisodeBoundary;
use crate::detector::{DetectionContext, Detector, WholeFileDetector};
use crate::detectors::image_hash::{dominant_interval, minute_bucket, perceptual_hasher};
use crate::error::EpisplitError;

const HASH_BITS: f64 = 64.0;

/// Intro detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntroOptions {
    /// Seconds searched after each candidate start.
    pub search_duration: f64,
    /// Seconds between sampled frames.
    pub frame_interval: f64,
    /// Frames a sequence needs.
    pub min_sequence_matches: usize,
    /// How far apart (seconds) matching frames may sit relative to their
    /// region starts.
    pub offset_tolerance: f64,
    /// Minimum combined frame similarity.
    pub frame_similarity: f64,
    /// Fraction of regions a frame must recur in.
    pub region_ratio: f64,
    /// Block hash distance that earns the similarity bonus.
    pub block_bonus_distance: u32,
    pub frame_width: u32,
    /// Seconds of audio fingerprinted per region.
    pub audio_segment_duration: f64,
    /// Minimum Chromaprint bit similarity.
    pub audio_similarity_threshold: f64,
    /// Seconds checked after each boundary by [`IntroDetector::validate_with_intro`].
    pub validation_duration: f64,
}

impl Default for IntroOptions {
    fn default() -> Self {
        Self {
            search_duration: 180.0,
            frame_interval: 2.0,
            min_sequence_matches: 3,
            offset_tolerance: 5.0,
            frame_similarity: 0.7,
            region_ratio: 0.5,
            block_bonus_distance: 5,
            frame_width: 320,
            audio_segment_duration: 60.0,
            audio_similarity_threshold: 0.4,
            validation_duration: 60.0,
        }
    }
}

/// The three hashes of one sampled frame.
#[derive(Debug, Clone)]
pub struct FrameSignature {
    pub timestamp: f64,
    pub perceptual: ImageHash,
    pub gradient: ImageHash,
    pub block: ImageHash,
}

/// Chromaprint fingerprint of a region's opening audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSignature {
    pub timestamp: f64,
    pub duration: f64,
    pub fingerprint: Vec<u32>,
}

/// Everything sampled from one candidate start.
#[derive(Debug, Clone)]
pub struct RegionSignature {
    pub start: f64,
    pub frames: Vec<FrameSignature>,
    pub audio: Option<AudioSignature>,
}

/// A detected recurring sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntroSequence {
    /// Offset of the first matching frame from the region start.
    pub start_offset: f64,
    pub duration: f64,
    /// Region starts where the sequence appears, ascending.
    pub occurrences: Vec<f64>,
    pub matching_frames: usize,
    pub confidence: f64,
    pub audio_match: bool,
    pub video_match: bool,
}

/// One frame of the first region that recurs in other regions.
#[derive(Debug, Clone)]
struct RecurringFrame {
    offset: f64,
    regions: Vec<f64>,
    ratio: f64,
}

struct FrameHashers {
    perceptual: Hasher,
    gradient: Hasher,
    block: Hasher,
}

impl FrameHashers {
    fn new() -> Self {
        Self {
            perceptual: perceptual_hasher(),
            gradient: HasherConfig::new().hash_alg(HashAlg::Gradient).hash_size(8, 8).to_hasher(),
            block: HasherConfig::new().hash_alg(HashAlg::Blockhash).hash_size(8, 8).to_hasher(),
        }
    }

    fn signature(&self, timestamp: f64, frame: &image::DynamicImage) -> FrameSignature {
        FrameSignature {
            timestamp,
            perceptual: self.perceptual.hash_image(frame),
            gradient: self.gradient.hash_image(frame),
            block: self.block.hash_image(frame),
        }
    }
}

/// Fraction of equal bits over the overlapping part of two fingerprints.
pub fn compare_audio_fingerprints(a: &[u32], b: &[u32]) -> f64 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let differing: u32 = a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum();
    1.0 - f64::from(differing) / (len as f64 * 32.0)
}

#[derive(Debug, Clone)]
pub struct IntroDetector {
    options: IntroOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for IntroDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl IntroDetector {
    pub fn new() -> Self {
        Self::with_options(IntroOptions::default())
    }

    pub fn with_options(options: IntroOptions) -> Self {
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

    /// Whether audio signatures are compiled in.
    pub fn audio_available(&self) -> bool {
        cfg!(feature = "chromaprint")
    }

    /// The file start plus a region after every positive candidate, keeping
    /// regions of at least 30 s.
    pub fn regions_from_candidates(&self, candidates: &[f64], total_duration: f64) -> Vec<(f64, f64)> {
        let mut sorted: Vec<f64> = candidates.iter().copied().filter(|&c| c > 0.0).collect();
        sorted.sort_by(f64::total_cmp);

        let mut regions = vec![(0.0, self.options.search_duration.min(total_duration))];
        regions.extend(
            sorted
                .into_iter()
                .map(|start| (start, (start + self.options.search_duration).min(total_duration)))
                .filter(|(start, end)| end - start >= 30.0),
        );
        regions
    }

    /// Regions at equal divisions of the file. Without a count, assumes
    /// episodes halfway between the length bounds.
    pub fn estimate_regions(&self, total_duration: f64, expected_episodes: Option<usize>) -> Vec<(f64, f64)> {
        let count = expected_episodes.filter(|&n| n > 0).unwrap_or_else(|| {
            let average = (self.min_episode_length + self.max_episode_length) / 2.0;
            ((total_duration / average).round() as usize).max(2)
        });
        let length = total_duration / count as f64;
        (0..count)
            .map(|i| {
                let start = i as f64 * length;
                (start, (start + self.options.search_duration).min(total_duration))
            })
            .collect()
    }

    fn frame_signatures(&self, ctx: &DetectionContext<'_>, hashers: &FrameHashers, start: f64, end: f64) -> Vec<FrameSignature> {
        let step = self.options.frame_interval.max(0.5);
        let count = ((end - start) / step).ceil().max(0.0) as usize;
        (0..count)
            .map(|i| start + i as f64 * step)
            .filter_map(|ts| match ctx.scanner.frame_at(ctx.path(), ts, self.options.frame_width) {
                Ok(frame) => Some(hashers.signature(ts, &frame)),
                Err(error) => {
                    log::debug!("Frame extraction failed at {ts:.1}s: {error}");
                    None
                }
            })
            .collect()
    }

    #[cfg(feature = "chromaprint")]
    fn audio_signature(&self, ctx: &DetectionContext<'_>, start: f64, duration: f64) -> Option<AudioSignature> {
        use chromaprint_rust::Context;

        const RATE: u32 = 11025;
        let range = crate::scan::TimeRange::new(start, start + duration).ok()?;
        let samples = match ctx.scanner.pcm(ctx.path(), range, RATE) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return None,
            Err(error) => {
                log::debug!("Audio decode failed for region at {start:.1}s: {error}");
                return None;
            }
        };
        let pcm: Vec<i16> = samples.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16).collect();

        let mut context = Context::default();
        let fingerprint = context
            .start(RATE, 1)
            .and_then(|()| context.feed(&pcm))
            .and_then(|()| context.finish())
            .and_then(|()| context.get_fingerprint_raw());
        match fingerprint {
            Ok(raw) => Some(AudioSignature {
                timestamp: start,
                duration,
                fingerprint: raw.get().to_vec(),
            }),
            Err(error) => {
                log::debug!("Chromaprint failed for region at {start:.1}s: {error}");
                None
            }
        }
    }

    #[cfg(not(feature = "chromaprint"))]
    fn audio_signature(&self, _ctx: &DetectionContext<'_>, _start: f64, _duration: f64) -> Option<AudioSignature> {
        None
    }

    /// Sample every region, dropping those that yielded nothing.
    pub fn region_signatures(&self, ctx: &DetectionContext<'_>, regions: &[(f64, f64)]) -> Vec<RegionSignature> {
        let hashers = FrameHashers::new();
        regions
            .iter()
            .enumerate()
            .filter_map(|(i, &(start, end))| {
                log::debug!("Processing region {}: {start:.1}s - {end:.1}s", i + 1);
                let frames = self.frame_signatures(ctx, &hashers, start, end);
                let audio = self.audio_signature(ctx, start, self.options.audio_segment_duration.min(end - start));
                (!frames.is_empty() || audio.is_some()).then_some(RegionSignature { start, frames, audio })
            })
            .collect()
    }

    /// Combined similarity of two frames in `[0, 1]`.
    pub fn frame_similarity(&self, a: &FrameSignature, b: &FrameSignature) -> f64 {
        let perceptual = 1.0 - f64::from(a.perceptual.dist(&b.perceptual)) / HASH_BITS;
        let gradient = 1.0 - f64::from(a.gradient.dist(&b.gradient)) / HASH_BITS;
        let mut similarity = perceptual * 0.6 + gradient * 0.4;
        if a.block.dist(&b.block) <= self.options.block_bonus_distance {
            similarity = (similarity + 0.1).min(1.0);
        }
        similarity.max(0.0)
    }

    /// Video-only sequence search across regions.
    pub fn find_recurring_sequences(&self, regions: &[RegionSignature]) -> Vec<IntroSequence> {
        let mut with_frames: Vec<&RegionSignature> = regions.iter().filter(|r| !r.frames.is_empty()).collect();
        if with_frames.len() < 2 {
            return Vec::new();
        }
        with_frames.sort_by(|a, b| a.start.total_cmp(&b.start));
        let first = with_frames[0];
        let region_count = with_frames.len() as f64;

        let mut recurring = Vec::new();
        for reference in &first.frames {
            let offset = reference.timestamp - first.start;
            let mut matched = vec![first.start];
            for other in &with_frames[1..] {
                let best = other
                    .frames
                    .iter()
                    .filter(|f| ((f.timestamp - other.start) - offset).abs() <= self.options.offset_tolerance)
                    .map(|f| self.frame_similarity(reference, f))
                    .fold(0.0_f64, f64::max);
                if best >= self.options.frame_similarity {
                    matched.push(other.start);
                }
            }
            let ratio = matched.len() as f64 / region_count;
            if ratio >= self.options.region_ratio && matched.len() >= 2 {
                recurring.push(RecurringFrame { offset, regions: matched, ratio });
            }
        }
        self.merge_to_sequences(recurring)
    }

    fn merge_to_sequences(&self, mut frames: Vec<RecurringFrame>) -> Vec<IntroSequence> {
        frames.sort_by(|a, b| a.offset.total_cmp(&b.offset));
        let gap = self.options.frame_interval * 1.5;

        let mut groups: Vec<Vec<RecurringFrame>> = Vec::new();
        for frame in frames {
            match groups.last_mut() {
                Some(group) if group.last().is_some_and(|last| frame.offset - last.offset <= gap) => group.push(frame),
                _ => groups.push(vec![frame]),
            }
        }

        groups
            .into_iter()
            .filter(|group| group.len() >= self.options.min_sequence_matches)
            .filter_map(|group| self.sequence_from(&group))
            .collect()
    }

    fn sequence_from(&self, group: &[RecurringFrame]) -> Option<IntroSequence> {
        let first = group.first()?;
        let last = group.last()?;
        let occurrences: BTreeSet<u64> = group
            .iter()
            .flat_map(|f| f.regions.iter().map(|r| r.to_bits()))
            .collect();
        let mut occurrences: Vec<f64> = occurrences.into_iter().map(f64::from_bits).collect();
        occurrences.sort_by(f64::total_cmp);

        let avg_ratio = group.iter().map(|f| f.ratio).sum::<f64>() / group.len() as f64;
        Some(IntroSequence {
            start_offset: first.offset,
            duration: last.offset + self.options.frame_interval - first.offset,
            occurrences,
            matching_frames: group.len(),
            confidence: (avg_ratio * (1.0 + group.len() as f64 / 20.0)).min(0.95),
            audio_match: false,
            video_match: true,
        })
    }

    /// Video sequences, boosted or replaced by audio agreement.
    pub fn find_sequences_combined(&self, regions: &[RegionSignature]) -> Vec<IntroSequence> {
        let mut audio_matches: Vec<(f64, f64, f64)> = Vec::new();
        for (i, a) in regions.iter().enumerate() {
            let Some(audio_a) = &a.audio else { continue };
            for b in &regions[i + 1..] {
                let Some(audio_b) = &b.audio else { continue };
                let similarity = compare_audio_fingerprints(&audio_a.fingerprint, &audio_b.fingerprint);
                if similarity >= self.options.audio_similarity_threshold {
                    log::debug!("Audio match between regions {:.1}s and {:.1}s: {similarity:.2}", a.start, b.start);
                    audio_matches.push((a.start.min(b.start), a.start.max(b.start), similarity));
                }
            }
        }
        let audio_regions: Vec<f64> = {
            let set: BTreeSet<u64> = audio_matches
                .iter()
                .flat_map(|&(a, b, _)| [a.to_bits(), b.to_bits()])
                .collect();
            set.into_iter().map(f64::from_bits).collect()
        };
        if !audio_regions.is_empty() {
            log::info!("Audio fingerprints matched in {} regions", audio_regions.len());
        }

        let mut sequences = self.find_recurring_sequences(regions);
        if sequences.is_empty() {
            if audio_regions.len() >= 2 {
                log::info!("Creating intro sequences from audio matches alone");
                return self.sequence_from_audio(&audio_matches).into_iter().collect();
            }
            return sequences;
        }

        for sequence in &mut sequences {
            let overlap = sequence.occurrences.iter().filter(|o| audio_regions.contains(o)).count();
            if overlap >= 2 {
                sequence.confidence = (sequence.confidence + 0.15).min(0.98);
                sequence.audio_match = true;
                log::info!("Intro sequence confirmed by video and audio ({:.2})", sequence.confidence);
            }
        }
        sequences
    }

    fn sequence_from_audio(&self, matches: &[(f64, f64, f64)]) -> Option<IntroSequence> {
        let intervals: Vec<f64> = matches.iter().map(|&(a, b, _)| b - a).collect();
        let (interval, _) = dominant_interval(&intervals)?;
        let best: Vec<&(f64, f64, f64)> = matches
            .iter()
            .filter(|&&(a, b, _)| minute_bucket(b - a) as f64 == interval)
            .collect();
        let avg_similarity = best.iter().map(|m| m.2).sum::<f64>() / best.len().max(1) as f64;
        let set: BTreeSet<u64> = best.iter().flat_map(|&&(a, b, _)| [a.to_bits(), b.to_bits()]).collect();

        Some(IntroSequence {
            start_offset: 0.0,
            duration: self.options.audio_segment_duration,
            occurrences: set.into_iter().map(f64::from_bits).collect(),
            matching_frames: 0,
            confidence: (0.7 + avg_similarity * 0.2).min(0.9),
            audio_match: true,
            video_match: false,
        })
    }

    /// Episodes between consecutive occurrences of the strongest sequence.
    pub fn sequences_to_boundaries(&self, sequences: &[IntroSequence], total_duration: f64) -> Vec<EpisodeBoundary> {
        let Some(best) = sequences
            .iter()
            .max_by(|a, b| (a.confidence * a.occurrences.len() as f64).total_cmp(&(b.confidence * b.occurrences.len() as f64)))
        else {
            return Vec::new();
        };
        log::info!(
            "Using intro sequence: offset={:.1}s, duration={:.1}s, found in {} regions",
            best.start_offset,
            best.duration,
            best.occurrences.len()
        );

        let ends = best.occurrences.iter().skip(1).copied().chain(std::iter::once(total_duration));
        best.occurrences
            .iter()
            .zip(ends)
            .filter(|&(start, end)| {
                let keep = end - start >= self.min_episode_length * 0.8;
                if !keep {
                    log::debug!("Skipping short episode: {:.1}s", end - start);
                }
                keep
            })
            .map(|(&start, end)| {
                EpisodeBoundary::new(start, end, best.confidence, "intro_sequence")
                    .with_meta("intro_offset", best.start_offset)
                    .with_meta("intro_duration", best.duration)
                    .with_meta("matching_frames", best.matching_frames)
                    .with_meta("audio_match", best.audio_match)
            })
            .collect()
    }

    /// Detect from explicit candidate starts, or estimated ones when empty.
    pub fn detect_with_candidates(
        &self,
        ctx: &DetectionContext<'_>,
        candidates: &[f64],
    ) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        let total = ctx.total_duration();
        let regions = if candidates.is_empty() {
            self.estimate_regions(total, ctx.expected_episodes)
        } else {
            self.regions_from_candidates(candidates, total)
        };
        log::info!(
            "Searching {} potential episode start regions (audio: {})",
            regions.len(),
            self.audio_available()
        );

        let signatures = self.region_signatures(ctx, &regions);
        if signatures.len() < 2 {
            log::debug!("Not enough regions with signatures for comparison");
            return Ok(Vec::new());
        }
        let sequences = self.find_sequences_combined(&signatures);
        if sequences.is_empty() {
            log::debug!("No recurring intro sequences found");
            return Ok(Vec::new());
        }
        log::info!("Found {} recurring intro sequence(s)", sequences.len());

        let boundaries = self.sequences_to_boundaries(&sequences, total);
        log::info!("Detected {} episode boundaries from intro sequences", boundaries.len());
        Ok(boundaries)
    }

    /// Raise the confidence of boundaries whose starts open with a shared
    /// intro.
    ///
    /// Confirmed boundaries gain 0.1 (capped at 0.95) and a `+intro` source
    /// tag; the rest are returned unchanged.
    pub fn validate_with_intro(&self, ctx: &DetectionContext<'_>, boundaries: Vec<EpisodeBoundary>) -> Vec<EpisodeBoundary> {
        let Some(total) = boundaries.last().map(|b| b.end_time) else {
            return boundaries;
        };
        if boundaries.len() < 2 {
            return boundaries;
        }
        let regions: Vec<(f64, f64)> = boundaries
            .iter()
            .map(|b| (b.start_time, (b.start_time + self.options.validation_duration).min(total)))
            .collect();
        let hashers = FrameHashers::new();
        let signatures: Vec<RegionSignature> = regions
            .iter()
            .map(|&(start, end)| RegionSignature {
                start,
                frames: self.frame_signatures(ctx, &hashers, start, end),
                audio: None,
            })
            .filter(|r| !r.frames.is_empty())
            .collect();

        let sequences = self.find_recurring_sequences(&signatures);
        let Some(best) = sequences.iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence)) else {
            return boundaries;
        };
        boundaries
            .into_iter()
            .map(|boundary| {
                if best.occurrences.contains(&boundary.start_time) {
                    let confidence = (boundary.confidence + 0.1).min(0.95);
                    let source = format!("{}+intro", boundary.source);
                    EpisodeBoundary {
                        confidence,
                        source,
                        ..boundary
                    }
                    .with_meta("intro_validated", true)
                } else {
                    boundary
                }
            })
            .collect()
    }
}

impl Detector for IntroDetector {
    fn name(&self) -> &'static str {
        "intro_sequence"
    }
}

impl WholeFileDetector for IntroDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        self.clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length)
            .detect_with_candidates(ctx, &[])
    }
}

//! Phase 3: fusing detector outputs into one episode partition.
//!
//! [`BoundaryMerger`] takes one boundary list per detector and produces the
//! final ordered list of [`MergedBoundary`] values. Two strategies apply:
//!
//! * **Primary merge.** If any detector marked *standalone* (by default
//!   `chapter` and `silence_guided`) produced boundaries, the best such list
//!   becomes the skeleton. Other detectors can only confirm it, never add
//!   or move boundaries.
//! * **Group merge.** Otherwise boundaries are grouped by end time and each
//!   group is fused by reliability-weighted averaging. Single-source groups
//!   are dropped unless the source is standalone.
//!
//! Either way the result is validated against the confidence threshold and
//! the episode length range, made contiguous, and extended with an inferred
//! trailing episode when enough of the file remains.
//!
//! The per-window clustered strategy skips all of this and uses
//! [`BoundaryMerger::assemble_from_windows`] instead.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::{EpisodeBoundary, Metadata, clamp_confidence};

/// One final episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedBoundary {
    pub start_time: f64,
    pub end_time: f64,
    pub confidence: f64,
    /// Distinct contributing sources.
    pub sources: Vec<String>,
    /// The raw boundaries that were fused into this one.
    pub source_boundaries: Vec<EpisodeBoundary>,
    pub metadata: Metadata,
}

impl MergedBoundary {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// A numbered, display-ready episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeRecord {
    pub episode_number: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub confidence: f64,
    pub sources: Vec<String>,
}

/// A split point chosen for one search window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSplit {
    pub time: f64,
    pub confidence: f64,
    pub sources: Vec<String>,
    pub metadata: Metadata,
}

/// Reliability weight per detector source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceWeights(BTreeMap<String, f64>);

impl SourceWeights {
    /// Weight used for sources missing from the table.
    pub const UNKNOWN_WEIGHT: f64 = 0.5;

    pub fn weight(&self, source: &str) -> f64 {
        self.weight_or(source, Self::UNKNOWN_WEIGHT)
    }

    /// Weight of `source`, or `fallback` when the table has no entry.
    pub fn weight_or(&self, source: &str, fallback: f64) -> f64 {
        self.0.get(source).copied().unwrap_or(fallback)
    }

    #[must_use]
    pub fn with(mut self, source: &str, weight: f64) -> Self {
        self.0.insert(source.to_string(), weight);
        self
    }
}

impl Default for SourceWeights {
    fn default() -> Self {
        let table = [
            ("chapter", 1.0),
            ("chapter_commercial", 0.7),
            ("silence", 0.7),
            ("silence_guided", 0.9),
            ("black_frame", 0.6),
            ("black_frame+silence", 0.85),
            ("image_hash", 0.8),
            ("audio_fingerprint", 0.8),
            ("llm_vision", 0.9),
        ];
        Self(table.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }
}

/// Merger tuning. Deserializable as part of
/// [`DetectionConfig`](crate::DetectionConfig).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Max end-time difference in seconds for two boundaries to agree.
    pub merge_threshold: f64,
    /// Boundaries below this confidence are dropped.
    pub confidence_threshold: f64,
    /// Drop single-source groups unless the source is standalone.
    pub require_multiple_sources: bool,
    pub min_episode_length: f64,
    pub max_episode_length: f64,
    pub weights: SourceWeights,
    /// Sources trusted to establish a boundary alone. Matched
    /// case-insensitively, exactly or with `+tag` suffixes.
    pub standalone_sources: Vec<String>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            merge_threshold: 30.0,
            confidence_threshold: 0.7,
            require_multiple_sources: true,
            min_episode_length: 900.0,
            max_episode_length: 5400.0,
            weights: SourceWeights::default(),
            standalone_sources: vec!["chapter".to_string(), "silence_guided".to_string()],
        }
    }
}

impl MergeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_merge_threshold(mut self, seconds: f64) -> Self {
        self.merge_threshold = seconds;
        self
    }

    #[must_use]
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_require_multiple_sources(mut self, require: bool) -> Self {
        self.require_multiple_sources = require;
        self
    }

    #[must_use]
    pub fn with_episode_length(mut self, min: f64, max: f64) -> Self {
        self.min_episode_length = min;
        self.max_episode_length = max;
        self
    }

    #[must_use]
    pub fn with_weights(mut self, weights: SourceWeights) -> Self {
        self.weights = weights;
        self
    }

    #[must_use]
    pub fn with_standalone_sources(mut self, sources: Vec<String>) -> Self {
        self.standalone_sources = sources;
        self
    }
}

/// Fuses per-detector boundary lists into a contiguous episode list.
#[derive(Debug, Clone, Default)]
pub struct BoundaryMerger {
    options: MergeOptions,
}

impl BoundaryMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MergeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Whether `source` may establish a boundary without corroboration.
    pub fn is_standalone_source(&self, source: &str) -> bool {
        let source = source.to_lowercase();
        self.options
            .standalone_sources
            .iter()
            .any(|standalone| {
                source == *standalone
                    || source
                        .strip_prefix(standalone.as_str())
                        .is_some_and(|rest| rest.starts_with('+'))
            })
    }

    /// Merge one boundary list per detector.
    pub fn merge(&self, all_boundaries: &[Vec<EpisodeBoundary>], total_duration: f64) -> Vec<MergedBoundary> {
        let flat_count: usize = all_boundaries.iter().map(Vec::len).sum();
        if flat_count == 0 {
            log::debug!("No boundaries to merge");
            return Vec::new();
        }

        log::info!(
            "Merging {} boundaries from {} sources",
            flat_count,
            all_boundaries.len()
        );

        let mut merged = match self.primary_source_index(all_boundaries) {
            Some(primary) => self.merge_with_primary(primary, all_boundaries),
            None => {
                let flat: Vec<EpisodeBoundary> = all_boundaries.iter().flatten().cloned().collect();
                self.group_by_endpoint(flat)
                    .into_iter()
                    .filter_map(|group| self.merge_group(group))
                    .collect()
            }
        };

        merged.sort_by(|a, b| a.start_time.total_cmp(&b.start_time));
        let validated = self.validate_boundaries(merged, total_duration);
        log::info!("Merged to {} final boundaries", validated.len());
        validated
    }

    /// Index of the standalone list with the best weight x mean confidence.
    fn primary_source_index(&self, all_boundaries: &[Vec<EpisodeBoundary>]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, boundaries) in all_boundaries.iter().enumerate() {
            let Some(first) = boundaries.first() else {
                continue;
            };
            if !self.is_standalone_source(&first.source) {
                continue;
            }
            let mean = boundaries.iter().map(|b| b.confidence).sum::<f64>() / boundaries.len() as f64;
            let score = self.options.weights.weight(&first.source) * mean;
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((index, score));
            }
        }
        if let Some((index, score)) = best {
            log::debug!(
                "Using '{}' as primary source (standalone, score {:.2})",
                all_boundaries[index][0].source,
                score
            );
        }
        best.map(|(index, _)| index)
    }

    fn merge_with_primary(&self, primary_index: usize, all_boundaries: &[Vec<EpisodeBoundary>]) -> Vec<MergedBoundary> {
        let others: Vec<&EpisodeBoundary> = all_boundaries
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != primary_index)
            .flat_map(|(_, list)| list.iter())
            .collect();

        all_boundaries[primary_index]
            .iter()
            .map(|primary| {
                let aligned: Vec<&EpisodeBoundary> = others
                    .iter()
                    .copied()
                    .filter(|other| (other.end_time - primary.end_time).abs() <= self.options.merge_threshold)
                    .collect();

                let mut sources = vec![primary.source.clone()];
                // An unlisted primary counts fully.
                let primary_weight = self.options.weights.weight_or(&primary.source, 1.0);
                let mut weighted = primary.confidence * primary_weight;
                let mut total_weight = primary_weight;
                for other in &aligned {
                    let weight = self.options.weights.weight(&other.source);
                    weighted += other.confidence * weight;
                    total_weight += weight;
                    if !sources.contains(&other.source) {
                        sources.push(other.source.clone());
                    }
                }

                let average = if total_weight > 0.0 {
                    weighted / total_weight
                } else {
                    primary.confidence
                };
                // Corroboration can raise the primary's confidence, never lower it.
                let confidence = diversity_bonus(average.max(primary.confidence), sources.len())
                    .max(primary.confidence);

                let mut metadata = Metadata::new();
                metadata.insert(primary.source.clone(), Value::Object(primary.metadata.clone()));
                if !aligned.is_empty() {
                    metadata.insert("confirmed".into(), true.into());
                }

                let mut source_boundaries = vec![primary.clone()];
                source_boundaries.extend(aligned.into_iter().cloned());

                MergedBoundary {
                    start_time: primary.start_time,
                    end_time: primary.end_time,
                    confidence: clamp_confidence(confidence),
                    sources,
                    source_boundaries,
                    metadata,
                }
            })
            .collect()
    }

    /// Group by end time, extending a group while within threshold of its
    /// running mean end.
    fn group_by_endpoint(&self, mut boundaries: Vec<EpisodeBoundary>) -> Vec<Vec<EpisodeBoundary>> {
        boundaries.sort_by(|a, b| a.end_time.total_cmp(&b.end_time));
        let mut groups: Vec<Vec<EpisodeBoundary>> = Vec::new();
        let mut current: Vec<EpisodeBoundary> = Vec::new();

        for boundary in boundaries {
            if current.is_empty() {
                current.push(boundary);
                continue;
            }
            let mean_end = current.iter().map(|b| b.end_time).sum::<f64>() / current.len() as f64;
            if (boundary.end_time - mean_end).abs() <= self.options.merge_threshold {
                current.push(boundary);
            } else {
                groups.push(std::mem::take(&mut current));
                current.push(boundary);
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn merge_group(&self, group: Vec<EpisodeBoundary>) -> Option<MergedBoundary> {
        let sources: BTreeSet<&str> = group.iter().map(|b| b.source.as_str()).collect();

        if self.options.require_multiple_sources
            && sources.len() < 2
            && !sources.iter().any(|s| self.is_standalone_source(s))
        {
            log::debug!(
                "Skipping boundary at {:.1}s: only one detector",
                group.first().map_or(0.0, |b| b.end_time)
            );
            return None;
        }

        let mut total_weight = 0.0;
        let mut weighted_start = 0.0;
        let mut weighted_end = 0.0;
        let mut weighted_confidence = 0.0;
        for boundary in &group {
            let weight = self.options.weights.weight(&boundary.source) * boundary.confidence;
            total_weight += weight;
            weighted_start += boundary.start_time * weight;
            weighted_end += boundary.end_time * weight;
            weighted_confidence += boundary.confidence * weight;
        }
        if total_weight <= 0.0 {
            return None;
        }

        let confidence = diversity_bonus(weighted_confidence / total_weight, sources.len());

        let mut metadata = Metadata::new();
        for boundary in &group {
            metadata.insert(boundary.source.clone(), Value::Object(boundary.metadata.clone()));
        }

        Some(MergedBoundary {
            start_time: weighted_start / total_weight,
            end_time: weighted_end / total_weight,
            confidence,
            sources: sources.into_iter().map(str::to_string).collect(),
            source_boundaries: group,
            metadata,
        })
    }

    fn validate_boundaries(&self, merged: Vec<MergedBoundary>, total_duration: f64) -> Vec<MergedBoundary> {
        let mut validated: Vec<MergedBoundary> = Vec::new();
        let mut previous_end = 0.0;

        for mut boundary in merged {
            if boundary.confidence < self.options.confidence_threshold {
                log::debug!(
                    "Skipping boundary at {:.1}s: confidence {:.2} below threshold",
                    boundary.end_time,
                    boundary.confidence
                );
                continue;
            }

            let duration = boundary.end_time - boundary.start_time;
            if duration < self.options.min_episode_length || boundary.end_time <= previous_end {
                log::debug!(
                    "Skipping boundary at {:.1}s: episode too short ({:.1}s)",
                    boundary.end_time,
                    duration
                );
                continue;
            }
            if duration > self.options.max_episode_length {
                log::warn!(
                    "Episode at {:.1}s is longer than max ({:.1}s > {:.1}s)",
                    boundary.start_time,
                    duration,
                    self.options.max_episode_length
                );
            }

            boundary.start_time = previous_end;
            previous_end = boundary.end_time;
            validated.push(boundary);
        }

        let remainder = total_duration - previous_end;
        match validated.last_mut() {
            Some(last) if remainder >= self.options.min_episode_length => {
                let mut metadata = Metadata::new();
                metadata.insert("final_episode".into(), true.into());
                metadata.insert("inferred".into(), true.into());
                let confidence = last.confidence * 0.9;
                validated.push(MergedBoundary {
                    start_time: previous_end,
                    end_time: total_duration,
                    confidence,
                    sources: vec!["inferred".to_string()],
                    source_boundaries: Vec::new(),
                    metadata,
                });
            }
            // A short tail belongs to the last episode.
            Some(last) if remainder > 0.0 => last.end_time = total_duration,
            _ => {}
        }

        validated
    }

    /// Build a contiguous episode list from one resolved split per window.
    ///
    /// Splits are sorted and any split not strictly after the previous one
    /// is dropped. The trailing episode is kept when it is at least half the
    /// minimum episode length; otherwise the last episode absorbs it.
    pub fn assemble_from_windows(&self, splits: &[ResolvedSplit], total_duration: f64) -> Vec<MergedBoundary> {
        let mut ordered: Vec<&ResolvedSplit> = splits
            .iter()
            .filter(|s| s.time > 0.0 && s.time < total_duration)
            .collect();
        ordered.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut episodes: Vec<MergedBoundary> = Vec::new();
        let mut previous_end = 0.0;
        for split in ordered {
            if split.time <= previous_end {
                log::warn!("Dropping out-of-order split at {:.1}s", split.time);
                continue;
            }
            let duration = split.time - previous_end;
            if duration < self.options.min_episode_length {
                log::warn!(
                    "Episode ending at {:.1}s is shorter than min ({:.1}s)",
                    split.time,
                    duration
                );
            }
            episodes.push(MergedBoundary {
                start_time: previous_end,
                end_time: split.time,
                confidence: clamp_confidence(split.confidence),
                sources: split.sources.clone(),
                source_boundaries: Vec::new(),
                metadata: split.metadata.clone(),
            });
            previous_end = split.time;
        }

        let remainder = total_duration - previous_end;
        match episodes.last_mut() {
            Some(last) if remainder < 0.5 * self.options.min_episode_length => {
                log::debug!("Folding {:.1}s remainder into the last episode", remainder);
                last.end_time = total_duration;
            }
            Some(last) => {
                let confidence = last.confidence;
                let mut metadata = Metadata::new();
                metadata.insert("final_episode".into(), true.into());
                episodes.push(MergedBoundary {
                    start_time: previous_end,
                    end_time: total_duration,
                    confidence,
                    sources: vec!["inferred".to_string()],
                    source_boundaries: Vec::new(),
                    metadata,
                });
            }
            None => {}
        }

        episodes
    }

    /// Numbered episode records for display and JSON output.
    pub fn to_episode_list(&self, merged: &[MergedBoundary]) -> Vec<EpisodeRecord> {
        merged
            .iter()
            .enumerate()
            .map(|(i, boundary)| EpisodeRecord {
                episode_number: i + 1,
                start_time: boundary.start_time,
                end_time: boundary.end_time,
                duration: boundary.duration(),
                confidence: boundary.confidence,
                sources: boundary.sources.clone(),
            })
            .collect()
    }

    /// `(start_time, duration)` per episode, as consumed by the splitter.
    pub fn get_split_points(&self, merged: &[MergedBoundary]) -> Vec<(f64, f64)> {
        merged.iter().map(|b| (b.start_time, b.duration())).collect()
    }
}

/// Apply an additive confidence adjustment to every episode, clamped.
pub fn apply_confidence_adjustment(merged: &mut [MergedBoundary], adjustment: f64) {
    if adjustment == 0.0 {
        return;
    }
    for boundary in merged {
        boundary.confidence = clamp_confidence(boundary.confidence + adjustment);
    }
}

/// x1.1 for two or more sources (cap 0.95), again for three or more (cap 0.98).
fn diversity_bonus(confidence: f64, sources: usize) -> f64 {
    let mut confidence = confidence;
    if sources >= 2 {
        confidence = (confidence * 1.1).min(0.95);
    }
    if sources >= 3 {
        confidence = (confidence * 1.1).min(0.98);
    }
    confidence
}

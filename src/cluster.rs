//! Clustering of raw detections.
//!
//! Raw windowed detectors emit many weak, individually unreliable
//! [`RawDetection`]s: every silence, every black run, every scene cut, every
//! LLM frame that looked like credits. [`RawDetectionClusterer`] groups them
//! by time proximity across all sources and scores each group so that
//! agreement between *different* detectors outweighs many observations from
//! a single one, and tight groups outweigh spread-out ones.
//!
//! # Example
//!
//! ```
//! use episplit::{RawDetection, RawDetectionClusterer};
//!
//! let detections = vec![
//!     RawDetection::new(1348.0, 30.0, "silence"),
//!     RawDetection::new(1352.0, 30.0, "llm_logo"),
//!     RawDetection::new(1900.0, 20.0, "silence"),
//! ];
//! let clusterer = RawDetectionClusterer::new();
//! let (time, confidence, _meta) = clusterer
//!     .get_best_boundary(&detections, Some(1200.0), Some(1500.0))
//!     .expect("a cluster");
//! assert!((time - 1350.0).abs() < 1e-9);
//! assert!(confidence > 0.5);
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::boundary::Metadata;

/// One weak observation from one detector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawDetection {
    /// Detection time in seconds.
    pub timestamp: f64,
    /// Non-negative weight of this observation.
    pub score: f64,
    /// Detector type (`silence`, `black_frame`, `llm_logo`, ...).
    pub source: String,
    pub metadata: Metadata,
}

impl RawDetection {
    pub fn new(timestamp: f64, score: f64, source: impl Into<String>) -> Self {
        Self {
            timestamp,
            score: score.max(0.0),
            source: source.into(),
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A group of raw detections judged to describe the same boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionCluster {
    /// Member detections, in the order they were absorbed.
    pub detections: Vec<RawDetection>,
    /// Score-weighted mean timestamp (plain mean when all scores are zero).
    pub center_time: f64,
    /// Sum of member scores.
    pub total_score: f64,
    /// Distinct member sources.
    pub sources: BTreeSet<String>,
}

impl DetectionCluster {
    /// A cluster seeded with one detection.
    pub fn new(seed: RawDetection) -> Self {
        let mut cluster = Self {
            detections: vec![seed],
            center_time: 0.0,
            total_score: 0.0,
            sources: BTreeSet::new(),
        };
        cluster.recalculate();
        cluster
    }

    /// Absorb a detection and recompute the center.
    pub fn add_detection(&mut self, detection: RawDetection) {
        self.detections.push(detection);
        self.recalculate();
    }

    fn recalculate(&mut self) {
        self.total_score = self.detections.iter().map(|d| d.score).sum();
        self.center_time = if self.total_score > 0.0 {
            self.detections
                .iter()
                .map(|d| d.timestamp * d.score)
                .sum::<f64>()
                / self.total_score
        } else {
            self.detections.iter().map(|d| d.timestamp).sum::<f64>() / self.detections.len() as f64
        };
        self.sources = self.detections.iter().map(|d| d.source.clone()).collect();
    }

    /// Number of distinct detector sources.
    pub fn num_detectors(&self) -> usize {
        self.sources.len()
    }

    /// Max minus min member timestamp.
    pub fn spread(&self) -> f64 {
        if self.detections.len() < 2 {
            return 0.0;
        }
        let (min, max) = self
            .detections
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| {
                (lo.min(d.timestamp), hi.max(d.timestamp))
            });
        max - min
    }

    /// `total * dw^(sources - 1)`, then `/ (1 + pw * spread)` when spread > 0.
    pub fn final_score(&self, diversity_weight: f64, proximity_weight: f64) -> f64 {
        let mut score = self.total_score;
        let detectors = self.num_detectors();
        if detectors > 1 {
            score *= diversity_weight.powi(detectors as i32 - 1);
        }
        let spread = self.spread();
        if spread > 0.0 {
            score *= 1.0 / (1.0 + proximity_weight * spread);
        }
        score
    }
}

/// Clusterer tuning. Deserializable as part of
/// [`DetectionConfig`](crate::DetectionConfig).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterOptions {
    /// Max distance in seconds from the running center to join a cluster.
    pub cluster_tolerance: f64,
    /// Multiplier per additional distinct source.
    pub diversity_weight: f64,
    /// Spread penalty factor.
    pub proximity_weight: f64,
    /// `k` in the saturating confidence `s / (s + k)`.
    pub confidence_half_score: f64,
    /// Upper bound of the mapped confidence.
    pub max_confidence: f64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            cluster_tolerance: 60.0,
            diversity_weight: 1.5,
            proximity_weight: 0.1,
            confidence_half_score: 50.0,
            max_confidence: 0.95,
        }
    }
}

impl ClusterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tolerance(mut self, seconds: f64) -> Self {
        self.cluster_tolerance = seconds;
        self
    }

    #[must_use]
    pub fn with_diversity_weight(mut self, weight: f64) -> Self {
        self.diversity_weight = weight;
        self
    }

    #[must_use]
    pub fn with_proximity_weight(mut self, weight: f64) -> Self {
        self.proximity_weight = weight;
        self
    }
}

/// Greedy single-pass clusterer over raw detections.
#[derive(Debug, Clone, Default)]
pub struct RawDetectionClusterer {
    options: ClusterOptions,
}

impl RawDetectionClusterer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ClusterOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Cluster the detections that fall inside `[window_start, window_end]`.
    ///
    /// Detections are sorted by timestamp (stable, so equal timestamps keep
    /// input order). Each unused detection seeds a cluster that absorbs every
    /// other unused detection within tolerance of the running weighted
    /// center. The result is sorted by final score, best first; ties keep
    /// time order.
    pub fn cluster_detections(
        &self,
        detections: &[RawDetection],
        window_start: Option<f64>,
        window_end: Option<f64>,
    ) -> Vec<DetectionCluster> {
        let mut filtered: Vec<&RawDetection> = detections
            .iter()
            .filter(|d| window_start.is_none_or(|start| d.timestamp >= start))
            .filter(|d| window_end.is_none_or(|end| d.timestamp <= end))
            .collect();

        log::debug!(
            "Clustering {} of {} detections in window {:?}..{:?}",
            filtered.len(),
            detections.len(),
            window_start,
            window_end
        );

        if filtered.is_empty() {
            return Vec::new();
        }

        filtered.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let mut used = vec![false; filtered.len()];
        let mut clusters = Vec::new();

        for i in 0..filtered.len() {
            if used[i] {
                continue;
            }
            used[i] = true;
            let mut cluster = DetectionCluster::new(filtered[i].clone());

            for j in 0..filtered.len() {
                if used[j] {
                    continue;
                }
                if (filtered[j].timestamp - cluster.center_time).abs() <= self.options.cluster_tolerance {
                    cluster.add_detection(filtered[j].clone());
                    used[j] = true;
                }
            }

            clusters.push(cluster);
        }

        let (dw, pw) = (self.options.diversity_weight, self.options.proximity_weight);
        clusters.sort_by(|a, b| b.final_score(dw, pw).total_cmp(&a.final_score(dw, pw)));
        clusters
    }

    /// Map a final cluster score to a confidence.
    pub fn score_to_confidence(&self, score: f64) -> f64 {
        if score <= 0.0 {
            return 0.0;
        }
        (score / (score + self.options.confidence_half_score)).min(self.options.max_confidence)
    }

    /// The best cluster in the window as `(time, confidence, metadata)`.
    pub fn get_best_boundary(
        &self,
        detections: &[RawDetection],
        window_start: Option<f64>,
        window_end: Option<f64>,
    ) -> Option<(f64, f64, Metadata)> {
        let clusters = self.cluster_detections(detections, window_start, window_end);
        let best = clusters.first()?;

        let score = best.final_score(self.options.diversity_weight, self.options.proximity_weight);
        let confidence = self.score_to_confidence(score);

        let mut metadata = Metadata::new();
        metadata.insert("cluster_score".into(), score.into());
        metadata.insert("num_detections".into(), best.detections.len().into());
        metadata.insert("num_detectors".into(), best.num_detectors().into());
        metadata.insert(
            "sources".into(),
            Value::from(best.sources.iter().cloned().collect::<Vec<_>>()),
        );
        metadata.insert("spread".into(), best.spread().into());

        log::debug!(
            "Best cluster at {:.1}s: score {:.1}, {} detectors, confidence {:.2}",
            best.center_time,
            score,
            best.num_detectors(),
            confidence
        );

        Some((best.center_time, confidence, metadata))
    }
}

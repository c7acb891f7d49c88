//! Episode boundaries and per-window detector hits.
//!
//! [`EpisodeBoundary`] is the common currency of whole-file detectors and of
//! the merger: one episode interval with a confidence, the name of the
//! detector that produced it, and free-form provenance metadata.
//! [`WindowHit`] is the coarse single-timestamp answer a windowed detector
//! gives for one search window.

use serde::Serialize;
use serde_json::Value;

/// Free-form provenance attached to boundaries, windows and detections.
pub type Metadata = serde_json::Map<String, Value>;

/// One detected episode interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeBoundary {
    /// Episode start in seconds.
    pub start_time: f64,
    /// Episode end in seconds.
    pub end_time: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Name of the producing detector, possibly with `+suffix` tags.
    pub source: String,
    /// Detector-specific provenance.
    pub metadata: Metadata,
}

impl EpisodeBoundary {
    /// Create a boundary. The confidence is clamped to `[0, 1]`.
    pub fn new(start_time: f64, end_time: f64, confidence: f64, source: impl Into<String>) -> Self {
        Self {
            start_time,
            end_time,
            confidence: clamp_confidence(confidence),
            source: source.into(),
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Episode length in seconds.
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Set the confidence, clamped to `[0, 1]`.
    pub fn set_confidence(&mut self, confidence: f64) {
        self.confidence = clamp_confidence(confidence);
    }
}

/// A windowed detector's answer for one search window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowHit {
    /// Boundary timestamp in seconds.
    pub time: f64,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Detector-specific provenance. Fallback hits carry `fallback: true`.
    pub metadata: Metadata,
}

impl WindowHit {
    pub fn new(time: f64, confidence: f64) -> Self {
        Self {
            time,
            confidence: clamp_confidence(confidence),
            metadata: Metadata::new(),
        }
    }

    /// A low-confidence hit at `center` used when a window yields no signal.
    pub fn fallback(center: f64, confidence: f64, source: &str) -> Self {
        Self::new(center, confidence)
            .with_meta("source", source)
            .with_meta("fallback", true)
    }

    #[must_use]
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Whether this hit is a window-center fallback.
    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get("fallback")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether this hit marks a window that could not be resolved at all.
    pub fn is_failed(&self) -> bool {
        self.metadata
            .get("failed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Clamp to `[0, 1]`, mapping NaN to zero.
pub fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

/// Source name with any `+suffix` tags removed.
pub fn base_source(source: &str) -> &str {
    source.split('+').next().unwrap_or(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(EpisodeBoundary::new(0.0, 10.0, 1.7, "chapter").confidence, 1.0);
        assert_eq!(EpisodeBoundary::new(0.0, 10.0, -0.2, "chapter").confidence, 0.0);
        assert_eq!(WindowHit::new(5.0, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn fallback_hits_are_flagged() {
        let hit = WindowHit::fallback(1350.0, 0.3, "scene_fallback");
        assert!(hit.is_fallback());
        assert!(!hit.is_failed());
        assert!(!WindowHit::new(1350.0, 0.9).is_fallback());
    }

    #[test]
    fn base_source_strips_tags() {
        assert_eq!(base_source("black_frame+silence"), "black_frame");
        assert_eq!(base_source("chapter"), "chapter");
    }
}

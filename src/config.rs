//! Detection configuration.
//!
//! [`DetectionConfig`] gathers the options of every component of a run:
//! search windows, clustering, merging, each detector, TMDB and naming.
//! It also carries progress callbacks and cancellation tokens without
//! polluting every function signature.
//!
//! Everything except the callback and the token deserializes from JSON, and
//! any field left out keeps its default:
//!
//! ```
//! use episplit::{DetectionConfig, Strategy};
//!
//! let config = DetectionConfig::from_json_str(
//!     r#"{ "expected_episodes": 2, "strategy": "boundaries", "detectors": { "llm": true } }"#,
//! )?;
//! assert_eq!(config.expected_episodes, Some(2));
//! assert_eq!(config.strategy, Strategy::Boundaries);
//! assert!(config.detectors.llm && config.detectors.silence);
//! # Ok::<(), episplit::EpisplitError>(())
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use episplit::{CancellationToken, DetectionConfig, ProgressCallback, ProgressInfo};
//!
//! struct LogProgress;
//! impl ProgressCallback for LogProgress {
//!     fn on_progress(&self, info: &ProgressInfo) {
//!         println!("{:?}: {} done", info.stage, info.current);
//!     }
//! }
//!
//! let token = CancellationToken::new();
//! let config = DetectionConfig::new()
//!     .with_progress(Arc::new(LogProgress))
//!     .with_cancellation(token.clone())
//!     .with_workers(4);
//! ```

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterOptions;
use crate::detector::{DEFAULT_MAX_EPISODE_LENGTH, DEFAULT_MIN_EPISODE_LENGTH};
use crate::detectors::{
    AudioFingerprintOptions, BlackFrameOptions, ChapterOptions, DetectionPattern, ImageHashOptions, IntroOptions,
    LlmOptions, SceneChangeOptions, SilenceOptions, SpeechOptions,
};
use crate::error::EpisplitError;
use crate::merger::MergeOptions;
use crate::naming::DEFAULT_PATTERN;
use crate::progress::{CancellationToken, NoOpProgress, ProgressCallback};
use crate::tmdb::TmdbOptions;
use crate::window::WindowOptions;

/// How detector evidence becomes episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Raw detections inside the search windows, clustered per window.
    #[default]
    Clustered,
    /// Whole-file boundary lists fused by the boundary merger.
    Boundaries,
}

/// Which detectors and services take part in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorToggles {
    pub chapter: bool,
    pub silence: bool,
    pub black_frame: bool,
    pub scene_change: bool,
    pub image_hash: bool,
    pub audio_fingerprint: bool,
    pub intro: bool,
    pub llm: bool,
    pub speech: bool,
    /// Runtime lookup and validation. Needs credentials in
    /// [`TmdbOptions`].
    pub tmdb: bool,
}

impl Default for DetectorToggles {
    fn default() -> Self {
        Self {
            chapter: true,
            silence: true,
            black_frame: true,
            scene_change: false,
            image_hash: false,
            audio_fingerprint: false,
            intro: false,
            llm: false,
            speech: false,
            tmdb: false,
        }
    }
}

/// LLM precision mode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionMode {
    /// Use narrow TMDB windows and a dense LLM scan per window. Needs the
    /// LLM detector and TMDB runtimes.
    pub enabled: bool,
    /// Ignore-pattern such as `credits-logo-SPLIT-logo`.
    pub pattern: Option<String>,
    /// Snap LLM cuts to a nearby black frame. Ignored with a pattern.
    pub black_frame_refinement: bool,
    /// Shortest black region considered for the snap, in seconds.
    pub black_min_duration: f64,
    /// Seconds searched on each side of the LLM cut.
    pub black_search_radius: f64,
}

impl Default for PrecisionMode {
    fn default() -> Self {
        Self {
            enabled: false,
            pattern: None,
            black_frame_refinement: true,
            black_min_duration: 0.5,
            black_search_radius: 4.0,
        }
    }
}

/// Overrides for what the filename would otherwise tell us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingOptions {
    /// Output filename pattern.
    pub pattern: String,
    /// Keep quality, codec and source tags in the basename.
    pub preserve_quality_info: bool,
    /// Series title used for TMDB lookups.
    pub title: Option<String>,
    pub season: Option<u32>,
    pub start_episode: Option<u32>,
}

impl Default for NamingOptions {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            preserve_quality_info: true,
            title: None,
            season: None,
            start_episode: None,
        }
    }
}

/// Configuration for a detection run.
///
/// Fields are public so a config can be built literally, loaded from
/// JSON, or assembled with the `with_*` builders. Progress and
/// cancellation are only reachable through the builders.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Episode count. `None` reads it from the filename.
    pub expected_episodes: Option<usize>,
    /// Shortest plausible episode, in seconds.
    pub min_episode_length: f64,
    /// Longest plausible episode, in seconds.
    pub max_episode_length: f64,
    /// Files shorter than this are never split, in seconds.
    pub min_file_duration: f64,
    pub strategy: Strategy,
    /// Detector threads in phase 2.
    pub workers: usize,
    /// Upper bound on any single media scan, in seconds.
    pub scan_timeout_secs: u64,
    /// Episode runtimes in minutes, used instead of a TMDB lookup.
    pub runtimes: Option<Vec<f64>>,
    pub detectors: DetectorToggles,
    pub precision: PrecisionMode,
    pub windows: WindowOptions,
    pub cluster: ClusterOptions,
    pub merge: MergeOptions,
    pub chapter: ChapterOptions,
    pub silence: SilenceOptions,
    pub black_frame: BlackFrameOptions,
    pub scene_change: SceneChangeOptions,
    pub image_hash: ImageHashOptions,
    pub audio_fingerprint: AudioFingerprintOptions,
    pub intro: IntroOptions,
    pub llm: LlmOptions,
    pub speech: SpeechOptions,
    pub tmdb: TmdbOptions,
    pub naming: NamingOptions,
    /// Progress callback. Defaults to a no-op.
    #[serde(skip, default = "no_progress")]
    pub(crate) progress: Arc<dyn ProgressCallback>,
    /// Cancellation token. `None` means never cancelled.
    #[serde(skip)]
    pub(crate) cancellation: Option<CancellationToken>,
}

fn no_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NoOpProgress)
}

impl Debug for DetectionConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DetectionConfig")
            .field("expected_episodes", &self.expected_episodes)
            .field("min_episode_length", &self.min_episode_length)
            .field("max_episode_length", &self.max_episode_length)
            .field("strategy", &self.strategy)
            .field("workers", &self.workers)
            .field("detectors", &self.detectors)
            .field("precision", &self.precision.enabled)
            .field("has_progress", &true)
            .field("has_cancellation", &self.cancellation.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionConfig {
    /// Defaults: 15-90 minute episodes, chapters, silence and black frames
    /// enabled, clustered strategy, two workers.
    pub fn new() -> Self {
        Self {
            expected_episodes: None,
            min_episode_length: DEFAULT_MIN_EPISODE_LENGTH,
            max_episode_length: DEFAULT_MAX_EPISODE_LENGTH,
            min_file_duration: 1800.0,
            strategy: Strategy::default(),
            workers: 2,
            scan_timeout_secs: 600,
            runtimes: None,
            detectors: DetectorToggles::default(),
            precision: PrecisionMode::default(),
            windows: WindowOptions::default(),
            cluster: ClusterOptions::default(),
            merge: MergeOptions::default(),
            chapter: ChapterOptions::default(),
            silence: SilenceOptions::default(),
            black_frame: BlackFrameOptions::default(),
            scene_change: SceneChangeOptions::default(),
            image_hash: ImageHashOptions::default(),
            audio_fingerprint: AudioFingerprintOptions::default(),
            intro: IntroOptions::default(),
            llm: LlmOptions::default(),
            speech: SpeechOptions::default(),
            tmdb: TmdbOptions::default(),
            naming: NamingOptions::default(),
            progress: no_progress(),
            cancellation: None,
        }
    }

    /// Parse a JSON configuration.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::JsonError`] for malformed JSON and
    /// [`EpisplitError::InvalidConfiguration`] for inconsistent values.
    pub fn from_json_str(json: &str) -> Result<Self, EpisplitError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    ///
    /// # Errors
    ///
    /// As [`from_json_str`](Self::from_json_str), plus
    /// [`EpisplitError::IoError`] when the file cannot be read.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EpisplitError> {
        let json = fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded configuration from {}", path.as_ref().display());
        Self::from_json_str(&json)
    }

    /// Check the values that would make a run meaningless.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::InvalidConfiguration`] naming the first bad value,
    /// or [`EpisplitError::InvalidPattern`] for a bad precision pattern.
    pub fn validate(&self) -> Result<(), EpisplitError> {
        let invalid = |message: String| Err(EpisplitError::InvalidConfiguration(message));
        if !(self.min_episode_length > 0.0) {
            return invalid(format!("min_episode_length must be positive (got {})", self.min_episode_length));
        }
        if self.max_episode_length <= self.min_episode_length {
            return invalid(format!(
                "max_episode_length ({}) must exceed min_episode_length ({})",
                self.max_episode_length, self.min_episode_length
            ));
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".to_string());
        }
        if self.scan_timeout_secs == 0 {
            return invalid("scan_timeout_secs must be at least 1".to_string());
        }
        if let Some(count) = self.expected_episodes {
            if count < 2 {
                return Err(EpisplitError::InvalidEpisodeCount(count));
            }
        }
        if let Some(runtimes) = &self.runtimes {
            if runtimes.iter().any(|r| !(*r > 0.0)) {
                return invalid("runtimes must be positive minutes".to_string());
            }
        }
        if let Some(pattern) = self.precision.pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            DetectionPattern::parse(pattern)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn with_expected_episodes(mut self, count: usize) -> Self {
        self.expected_episodes = Some(count);
        self
    }

    /// Set the plausible episode length range in seconds.
    #[must_use]
    pub fn with_episode_length(mut self, min: f64, max: f64) -> Self {
        self.min_episode_length = min;
        self.max_episode_length = max;
        self
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the phase-2 worker count. Clamped to a minimum of 1.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_detectors(mut self, detectors: DetectorToggles) -> Self {
        self.detectors = detectors;
        self
    }

    /// Use known runtimes (minutes) instead of asking TMDB.
    #[must_use]
    pub fn with_runtimes(mut self, runtimes_minutes: Vec<f64>) -> Self {
        self.runtimes = Some(runtimes_minutes);
        self
    }

    /// Enable LLM precision mode with an optional ignore-pattern.
    #[must_use]
    pub fn with_precision(mut self, pattern: Option<String>) -> Self {
        self.precision.enabled = true;
        self.detectors.llm = true;
        self.precision.pattern = pattern;
        self
    }

    #[must_use]
    pub fn with_tmdb(mut self, options: TmdbOptions) -> Self {
        self.tmdb = options;
        self.detectors.tmdb = true;
        self
    }

    #[must_use]
    pub fn with_naming(mut self, naming: NamingOptions) -> Self {
        self.naming = naming;
        self
    }

    /// Attach a progress callback, invoked once per completed unit of each
    /// stage.
    #[must_use]
    pub fn with_progress(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.progress = callback;
        self
    }

    /// Attach a cancellation token.
    ///
    /// When the token is cancelled, the run stops at the next detector or
    /// window and returns [`EpisplitError::Cancelled`].
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs.max(1))
    }

    /// Returns `true` if cancellation has been requested.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), EpisplitError> {
        if self.is_cancelled() {
            return Err(EpisplitError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DetectionConfig::new();
        assert_eq!(config.min_episode_length, 900.0);
        assert_eq!(config.max_episode_length, 5400.0);
        assert_eq!(config.workers, 2);
        assert_eq!(config.strategy, Strategy::Clustered);
        assert!(config.detectors.chapter && config.detectors.silence && config.detectors.black_frame);
        assert!(!config.detectors.llm && !config.detectors.speech && !config.detectors.tmdb);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = DetectionConfig::from_json_str(
            r#"{
                "min_episode_length": 600,
                "workers": 4,
                "cluster": { "cluster_tolerance": 30 },
                "llm": { "base_interval": 5 },
                "precision": { "enabled": true, "pattern": "credits-logo-SPLIT-logo" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.min_episode_length, 600.0);
        assert_eq!(config.max_episode_length, 5400.0);
        assert_eq!(config.workers, 4);
        assert_eq!(config.cluster.cluster_tolerance, 30.0);
        assert_eq!(config.cluster.diversity_weight, ClusterOptions::default().diversity_weight);
        assert_eq!(config.llm.base_interval, 5.0);
        assert_eq!(config.llm.fine_interval, 1.0);
        assert!(config.precision.enabled);
        assert!(config.precision.black_frame_refinement);
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "expected_episodes": 3, "runtimes": [22, 22, 23] }}"#).unwrap();
        let config = DetectionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.expected_episodes, Some(3));
        assert_eq!(config.runtimes, Some(vec![22.0, 22.0, 23.0]));
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert!(matches!(
            DetectionConfig::from_json_str(r#"{ "min_episode_length": 3000, "max_episode_length": 1200 }"#),
            Err(EpisplitError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            DetectionConfig::from_json_str(r#"{ "expected_episodes": 1 }"#),
            Err(EpisplitError::InvalidEpisodeCount(1))
        ));
        assert!(matches!(
            DetectionConfig::from_json_str(r#"{ "precision": { "pattern": "credits-logo" } }"#),
            Err(EpisplitError::InvalidPattern { .. })
        ));
        assert!(matches!(
            DetectionConfig::from_json_str("{ not json"),
            Err(EpisplitError::JsonError(_))
        ));
    }

    #[test]
    fn cancellation_is_observed() {
        let token = CancellationToken::new();
        let config = DetectionConfig::new().with_cancellation(token.clone());
        assert!(config.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(config.check_cancelled(), Err(EpisplitError::Cancelled)));
    }

    #[test]
    fn debug_hides_callbacks() {
        let rendered = format!("{:?}", DetectionConfig::new());
        assert!(rendered.contains("has_progress: true"));
        assert!(rendered.contains("has_cancellation: false"));
    }
}

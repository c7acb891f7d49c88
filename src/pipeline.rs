//! End-to-end detection for one file.
//!
//! [`Pipeline::run`] probes the file, plans the search windows (phase 1),
//! runs the enabled detectors on a worker pool (phase 2), turns their
//! evidence into a contiguous episode list (phase 3), and applies the TMDB
//! runtime check. Nothing is written to disk; hand
//! [`DetectionReport::split_points`] to the
//! [`EpisodeSplitter`](crate::EpisodeSplitter) to cut the file.
//!
//! Detector failures never abort a run. A detector that is unavailable or
//! errors is logged and left out. Only a probe failure and cancellation
//! are returned as errors; every other way a file can end up unsplit is
//! reported through [`Outcome`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::boundary::{EpisodeBoundary, Metadata, WindowHit};
use crate::cache::ScanCache;
use crate::cluster::{RawDetection, RawDetectionClusterer};
use crate::config::{DetectionConfig, Strategy};
use crate::detector::{
    DetectionContext, Detector, FALLBACK_CONFIDENCE, RawWindowedDetector, WholeFileDetector, WindowedDetector,
};
use crate::detectors::{
    AudioFingerprintDetector, BlackFrameDetector, ChapterDetector, DetectionPattern, FrameClassifier,
    ImageHashDetector, IntroDetector, LlmDetector, SceneChangeDetector, SilenceDetector, SpeechDetector, Transcriber,
};
use crate::error::EpisplitError;
use crate::ffmpeg_scanner::FfmpegScanner;
use crate::merger::{BoundaryMerger, MergedBoundary, ResolvedSplit, apply_confidence_adjustment};
use crate::naming::EpisodeNamer;
use crate::probe::MediaProbe;
use crate::progress::{ProgressTracker, Stage};
use crate::scan::{BlackParams, MediaScanner, TimeRange, TimedScanner};
use crate::timeline::MediaTimeline;
use crate::tmdb::{TmdbValidator, ValidationResult, compare_runtimes, episode_minutes};
use crate::window::{SearchWindow, SearchWindowDeterminer, WindowEvidence};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Two or more episodes were found.
    Split,
    /// The file should be left alone.
    Unsplit { reason: String },
    /// Detection could not resolve every boundary and refused to guess.
    Aborted { reason: String },
}

/// The phase-1 result: where to look, and the evidence that decided it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WindowPlan {
    pub windows: Vec<SearchWindow>,
    /// Episode runtimes in minutes, from the configuration or TMDB.
    pub runtimes: Vec<f64>,
    /// How the runtimes were obtained, or why there are none.
    pub runtime_message: Option<String>,
    /// Start times of "Commercial 1" chapters that close an episode.
    pub commercial_1_times: Vec<f64>,
    /// Commercial seconds per episode from chapter markers.
    pub commercial_times: Option<Vec<f64>>,
    /// The windows are narrow precision windows.
    pub precision: bool,
}

/// Everything a run learned about one file.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub path: PathBuf,
    pub total_duration: f64,
    pub expected_episodes: Option<usize>,
    pub strategy: Strategy,
    pub precision: bool,
    pub windows: Vec<SearchWindow>,
    /// Detectors that produced evidence.
    pub detectors_run: Vec<String>,
    /// Detectors that were enabled but unavailable or failed.
    pub detectors_skipped: Vec<String>,
    pub raw_detection_count: usize,
    /// Boundaries from the informational pattern detectors in clustered
    /// mode, keyed by detector.
    pub supporting_boundaries: BTreeMap<String, Vec<EpisodeBoundary>>,
    /// One hit per window from the windowed pattern detectors in clustered
    /// mode, keyed by detector.
    pub supporting_hits: BTreeMap<String, Vec<WindowHit>>,
    pub episodes: Vec<MergedBoundary>,
    /// `(start, duration)` per episode.
    pub split_points: Vec<(f64, f64)>,
    pub tmdb: Option<ValidationResult>,
    pub outcome: Outcome,
}

impl DetectionReport {
    fn new(timeline: &MediaTimeline, config: &DetectionConfig) -> Self {
        Self {
            path: timeline.path.clone(),
            total_duration: timeline.duration,
            expected_episodes: None,
            strategy: config.strategy,
            precision: false,
            windows: Vec::new(),
            detectors_run: Vec::new(),
            detectors_skipped: Vec::new(),
            raw_detection_count: 0,
            supporting_boundaries: BTreeMap::new(),
            supporting_hits: BTreeMap::new(),
            episodes: Vec::new(),
            split_points: Vec::new(),
            tmdb: None,
            outcome: Outcome::Unsplit {
                reason: "not analysed".to_string(),
            },
        }
    }

    fn unsplit(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::info!("{}: leaving unsplit ({reason})", self.path.display());
        self.episodes.clear();
        self.split_points.clear();
        self.outcome = Outcome::Unsplit { reason };
        self
    }

    pub fn is_split(&self) -> bool {
        self.outcome == Outcome::Split
    }
}

/// Series identity used for TMDB lookups.
struct Identity {
    title: String,
    season: u32,
    start_episode: u32,
}

/// Per-detector output of phase 2.
struct DetectorRun<T> {
    name: &'static str,
    result: Result<Vec<T>, EpisplitError>,
}

/// Runs detection for one file at a time.
///
/// ```no_run
/// use episplit::{DetectionConfig, Pipeline};
///
/// let report = Pipeline::new(DetectionConfig::new()).run("Show.S01E01-E02.mkv")?;
/// for (start, duration) in &report.split_points {
///     println!("{start:.1}s for {duration:.1}s");
/// }
/// # Ok::<(), episplit::EpisplitError>(())
/// ```
pub struct Pipeline {
    config: DetectionConfig,
    scanner: Arc<dyn MediaScanner>,
    classifier: Option<Arc<dyn FrameClassifier>>,
    transcriber: Option<Arc<dyn Transcriber>>,
}

impl Pipeline {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            config,
            scanner: Arc::new(FfmpegScanner::new()),
            classifier: None,
            transcriber: None,
        }
    }

    /// Read media through `scanner` instead of FFmpeg.
    #[must_use]
    pub fn with_scanner(mut self, scanner: Arc<dyn MediaScanner>) -> Self {
        self.scanner = scanner;
        self
    }

    /// Classify frames with `classifier` instead of the configured Ollama
    /// server.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FrameClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Transcribe with `transcriber` instead of the configured server.
    #[must_use]
    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Probe `path` and run detection on it.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::FileOpen`] when the file cannot be probed and
    /// [`EpisplitError::Cancelled`] when the run was cancelled.
    pub fn run<P: AsRef<Path>>(&self, path: P) -> Result<DetectionReport, EpisplitError> {
        let mut progress = ProgressTracker::new(self.config.progress.clone(), Stage::Probe, Some(1));
        let timeline = MediaProbe::probe(path.as_ref())?;
        progress.advance(Some("probe"));
        progress.finish();
        self.run_timeline(&timeline)
    }

    /// Run detection on an already probed file.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::Cancelled`] when the run was cancelled.
    pub fn run_timeline(&self, timeline: &MediaTimeline) -> Result<DetectionReport, EpisplitError> {
        let config = &self.config;
        let mut report = DetectionReport::new(timeline, config);
        log::info!(
            "Analysing {} ({:.1} min, {} chapters)",
            timeline.path.display(),
            timeline.duration / 60.0,
            timeline.chapters.len()
        );

        if timeline.duration < config.min_file_duration {
            return Ok(report.unsplit(format!(
                "file is {:.1} min, shorter than the {:.1} min minimum",
                timeline.duration / 60.0,
                config.min_file_duration / 60.0
            )));
        }

        let Some(expected) = self.expected_episodes(&timeline.path) else {
            return Ok(report.unsplit("episode count unknown (no episode range in filename)"));
        };
        report.expected_episodes = Some(expected);
        if expected < 2 {
            return Ok(report.unsplit(format!("only {expected} episode expected")));
        }
        config.check_cancelled()?;

        let identity = self.identity(&timeline.path);
        let plan = self.plan_windows(timeline, expected);
        report.windows = plan.windows.clone();
        report.precision = plan.precision;
        if plan.windows.is_empty() {
            return Ok(report.unsplit("no search windows"));
        }
        config.check_cancelled()?;

        let cache = ScanCache::new();
        let timed = TimedScanner::new(Arc::clone(&self.scanner), config.scan_timeout());
        let runtimes = (!plan.runtimes.is_empty()).then_some(plan.runtimes.as_slice());
        let ctx = DetectionContext::new(timeline, &timed, &cache)
            .with_episode_length(config.min_episode_length, config.max_episode_length)
            .with_expected_episodes(Some(expected))
            .with_tmdb_runtimes(runtimes);

        let merger = BoundaryMerger::with_options(
            config
                .merge
                .clone()
                .with_episode_length(config.min_episode_length, config.max_episode_length),
        );

        let episodes = if plan.precision {
            let llm = self.llm_detector();
            match llm.check_available() {
                Ok(()) => match self.detect_precision(&ctx, &plan.windows, &llm)? {
                    Ok(splits) => {
                        report.detectors_run.push(llm.name().to_string());
                        merger.assemble_from_windows(&splits, timeline.duration)
                    }
                    Err(reason) => {
                        report.outcome = Outcome::Aborted { reason };
                        log::warn!("{}: precision detection aborted", timeline.path.display());
                        return Ok(report);
                    }
                },
                Err(error) => {
                    log::warn!("Precision mode needs the LLM detector, using clustered detection: {error}");
                    report.detectors_skipped.push(llm.name().to_string());
                    let splits = self.detect_clustered(&ctx, &plan.windows, &mut report)?;
                    merger.assemble_from_windows(&splits, timeline.duration)
                }
            }
        } else {
            match config.strategy {
                Strategy::Clustered => {
                    let splits = self.detect_clustered(&ctx, &plan.windows, &mut report)?;
                    merger.assemble_from_windows(&splits, timeline.duration)
                }
                Strategy::Boundaries => {
                    let lists = self.detect_boundaries(&ctx, &mut report)?;
                    let mut progress = ProgressTracker::new(config.progress.clone(), Stage::Merging, Some(1));
                    let merged = merger.merge(&lists, timeline.duration);
                    progress.advance(Some("merge"));
                    progress.finish();
                    merged
                }
            }
        };
        config.check_cancelled()?;

        if episodes.len() < 2 {
            return Ok(report.unsplit(format!("only {} episode(s) detected", episodes.len())));
        }
        report.episodes = episodes;

        let mut progress = ProgressTracker::new(config.progress.clone(), Stage::Validation, Some(1));
        if let Some(validation) = self.validate_runtimes(&report.episodes, &identity, plan.commercial_times.as_deref()) {
            log::info!("Runtime validation: {}", validation.message);
            apply_confidence_adjustment(&mut report.episodes, validation.confidence_adjustment);
            report.tmdb = Some(validation);
        }
        progress.advance(Some("tmdb"));
        progress.finish();

        report.split_points = merger.get_split_points(&report.episodes);
        report.outcome = Outcome::Split;
        log::info!(
            "{}: {} episodes at {:?}",
            timeline.path.display(),
            report.episodes.len(),
            report
                .episodes
                .iter()
                .skip(1)
                .map(|e| format!("{:.1}s", e.start_time))
                .collect::<Vec<_>>()
        );
        Ok(report)
    }

    /// The episode count from the configuration or the filename.
    pub fn expected_episodes(&self, path: &Path) -> Option<usize> {
        self.config
            .expected_episodes
            .or_else(|| self.namer().expected_episode_count(path))
    }

    /// Phase 1: chapters, runtimes, and the search windows they imply.
    pub fn plan_windows(&self, timeline: &MediaTimeline, expected: usize) -> WindowPlan {
        let config = &self.config;
        let mut progress = ProgressTracker::new(config.progress.clone(), Stage::Windows, Some(3));
        let mut plan = WindowPlan::default();
        let mut evidence = WindowEvidence::new();

        if config.detectors.chapter {
            let chapters = ChapterDetector::with_options(config.chapter)
                .with_episode_length(config.min_episode_length, config.max_episode_length);
            let boundaries = chapters.detect_chapters(timeline);
            if boundaries.first().is_some_and(|b| b.source == "chapter_commercial") {
                plan.commercial_1_times = boundaries[..boundaries.len() - 1].iter().map(|b| b.end_time).collect();
                plan.commercial_times = chapters.commercial_times_per_episode(timeline);
                if let Some(times) = &plan.commercial_times {
                    evidence = evidence.with_commercial_times(times.clone());
                }
            } else if !boundaries.is_empty() {
                evidence = evidence.with_chapter_regions(boundaries.iter().map(|b| (b.start_time, b.end_time)).collect());
            }
        }
        progress.advance(Some("chapters"));

        let (runtimes, message) = self.runtimes(&timeline.path, expected);
        plan.runtimes = runtimes;
        plan.runtime_message = message;
        if !plan.runtimes.is_empty() {
            evidence = evidence.with_tmdb_runtimes(plan.runtimes.clone());
        }
        progress.advance(Some("runtimes"));

        let determiner = SearchWindowDeterminer::with_options(timeline.duration, expected, config.windows);
        plan.windows = determiner.determine_windows(&evidence);

        let already_combined = plan.windows.iter().any(|w| w.source.contains("tmdb+chapters"));
        if !plan.commercial_1_times.is_empty() && !plan.runtimes.is_empty() && !already_combined {
            log::info!("Refining windows with {} 'Commercial 1' markers", plan.commercial_1_times.len());
            plan.windows = determiner.refine_windows_with_chapters(&plan.windows, &plan.commercial_1_times);
        }

        if config.precision.enabled && config.detectors.llm && !plan.runtimes.is_empty() {
            match determiner.precision_windows(&plan.runtimes) {
                Some(windows) => {
                    log::info!("Using {} precision windows", windows.len());
                    plan.windows = windows;
                    plan.precision = true;
                }
                None => log::warn!(
                    "Precision mode needs {expected} runtimes, have {}; using regular windows",
                    plan.runtimes.len()
                ),
            }
        }
        progress.advance(Some("windows"));
        progress.finish();

        for (i, window) in plan.windows.iter().enumerate() {
            log::debug!(
                "Window {}: {:.1}-{:.1} min ({})",
                i + 1,
                window.start_time / 60.0,
                window.end_time / 60.0,
                window.source
            );
        }
        plan
    }

    fn namer(&self) -> EpisodeNamer {
        EpisodeNamer::new()
            .with_pattern(self.config.naming.pattern.clone())
            .with_quality_info(self.config.naming.preserve_quality_info)
    }

    fn identity(&self, path: &Path) -> Identity {
        let naming = &self.config.naming;
        let parsed = self.namer().parse_filename(path);
        Identity {
            title: naming.title.clone().unwrap_or(parsed.title),
            season: naming.season.or(parsed.season).unwrap_or(1),
            start_episode: naming.start_episode.or(parsed.episode).unwrap_or(1),
        }
    }

    fn tmdb(&self) -> Option<TmdbValidator> {
        let validator = TmdbValidator::new(self.config.tmdb.clone());
        (self.config.detectors.tmdb && validator.is_available()).then_some(validator)
    }

    fn runtimes(&self, path: &Path, expected: usize) -> (Vec<f64>, Option<String>) {
        if let Some(runtimes) = &self.config.runtimes {
            return (runtimes.clone(), Some("runtimes from configuration".to_string()));
        }
        let Some(validator) = self.tmdb() else {
            return (Vec::new(), None);
        };
        let identity = self.identity(path);
        if identity.title.trim().is_empty() {
            return (Vec::new(), Some("no series title for TMDB lookup".to_string()));
        }
        let (runtimes, message) =
            validator.get_series_episode_runtimes(&identity.title, identity.season, identity.start_episode, expected);
        log::info!("TMDB: {message}");
        (runtimes, Some(message))
    }

    fn validate_runtimes(
        &self,
        episodes: &[MergedBoundary],
        identity: &Identity,
        commercial_times: Option<&[f64]>,
    ) -> Option<ValidationResult> {
        let durations: Vec<f64> = episodes.iter().map(MergedBoundary::duration).collect();
        if let Some(runtimes) = &self.config.runtimes {
            let detected = episode_minutes(&durations, commercial_times);
            return Some(compare_runtimes(runtimes, &detected, self.config.tmdb.runtime_tolerance));
        }
        let validator = self.tmdb()?;
        Some(validator.validate(
            &durations,
            &identity.title,
            identity.season,
            identity.start_episode,
            commercial_times,
        ))
    }

    fn llm_detector(&self) -> LlmDetector {
        let options = self.config.llm.clone();
        let detector = match &self.classifier {
            Some(classifier) => LlmDetector::with_classifier(Arc::clone(classifier), options),
            None => LlmDetector::new(options),
        };
        detector.with_episode_length(self.config.min_episode_length, self.config.max_episode_length)
    }

    fn speech_detector(&self) -> SpeechDetector {
        let options = self.config.speech.clone();
        match &self.transcriber {
            Some(transcriber) => SpeechDetector::with_transcriber(Arc::clone(transcriber), options),
            None => SpeechDetector::new(options),
        }
    }

    fn raw_detectors(&self) -> Vec<Box<dyn RawWindowedDetector>> {
        let config = &self.config;
        let mut detectors: Vec<Box<dyn RawWindowedDetector>> = Vec::new();
        if config.detectors.silence {
            detectors.push(Box::new(SilenceDetector::with_options(config.silence)));
        }
        if config.detectors.black_frame {
            detectors.push(Box::new(BlackFrameDetector::with_options(config.black_frame)));
        }
        if config.detectors.scene_change {
            detectors.push(Box::new(SceneChangeDetector::with_options(config.scene_change)));
        }
        if config.detectors.llm {
            detectors.push(Box::new(self.llm_detector()));
        }
        if config.detectors.speech {
            detectors.push(Box::new(self.speech_detector()));
        }
        detectors
    }

    /// Whole-file pattern detectors that only support the clustered result.
    fn supporting_detectors(&self) -> Vec<Box<dyn WholeFileDetector>> {
        let config = &self.config;
        let mut detectors: Vec<Box<dyn WholeFileDetector>> = Vec::new();
        if config.detectors.image_hash {
            detectors.push(Box::new(ImageHashDetector::with_options(config.image_hash.clone())));
        }
        if config.detectors.intro {
            detectors.push(Box::new(IntroDetector::with_options(config.intro)));
        }
        detectors
    }

    /// Pattern detectors asked for one hit per search window.
    fn windowed_supporting_detectors(&self) -> Vec<Box<dyn WindowedDetector>> {
        let config = &self.config;
        let mut detectors: Vec<Box<dyn WindowedDetector>> = Vec::new();
        if config.detectors.audio_fingerprint {
            detectors.push(Box::new(AudioFingerprintDetector::with_options(config.audio_fingerprint)));
        }
        detectors
    }

    fn whole_file_detectors(&self) -> Vec<Box<dyn WholeFileDetector>> {
        let config = &self.config;
        let mut detectors: Vec<Box<dyn WholeFileDetector>> = Vec::new();
        if config.detectors.chapter {
            detectors.push(Box::new(ChapterDetector::with_options(config.chapter)));
        }
        if config.detectors.silence {
            detectors.push(Box::new(SilenceDetector::with_options(config.silence)));
        }
        if config.detectors.black_frame {
            detectors.push(Box::new(BlackFrameDetector::with_options(config.black_frame)));
        }
        if config.detectors.image_hash {
            detectors.push(Box::new(ImageHashDetector::with_options(config.image_hash.clone())));
        }
        if config.detectors.audio_fingerprint {
            detectors.push(Box::new(AudioFingerprintDetector::with_options(config.audio_fingerprint)));
        }
        if config.detectors.intro {
            detectors.push(Box::new(IntroDetector::with_options(config.intro)));
        }
        if config.detectors.llm {
            detectors.push(Box::new(self.llm_detector()));
        }
        detectors
    }

    /// Phase 2, clustered: raw detections in every window, clustered per
    /// window, center fallback where nothing clusters.
    fn detect_clustered(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
        report: &mut DetectionReport,
    ) -> Result<Vec<ResolvedSplit>, EpisplitError> {
        let detectors = available(self.raw_detectors(), &mut report.detectors_skipped);
        let supporting = available(self.supporting_detectors(), &mut report.detectors_skipped);
        let windowed = available(self.windowed_supporting_detectors(), &mut report.detectors_skipped);

        let runs = self.run_detectors(&detectors, |detector| detector.detect_raw_in_windows(ctx, windows))?;
        let mut detections: Vec<RawDetection> = Vec::new();
        for run in runs {
            match run.result {
                Ok(found) => {
                    log::info!("{}: {} raw detections", run.name, found.len());
                    report.detectors_run.push(run.name.to_string());
                    detections.extend(found);
                }
                Err(error) => {
                    log::warn!("{} failed, continuing without it: {error}", run.name);
                    report.detectors_skipped.push(run.name.to_string());
                }
            }
        }
        report.raw_detection_count = detections.len();

        for run in self.run_detectors(&supporting, |detector| detector.detect(ctx))? {
            match run.result {
                Ok(boundaries) => {
                    log::info!("{}: {} supporting boundaries", run.name, boundaries.len());
                    report.detectors_run.push(run.name.to_string());
                    report.supporting_boundaries.insert(run.name.to_string(), boundaries);
                }
                Err(error) => {
                    log::warn!("{} failed: {error}", run.name);
                    report.detectors_skipped.push(run.name.to_string());
                }
            }
        }

        for run in self.run_detectors(&windowed, |detector| detector.detect_in_windows(ctx, windows))? {
            match run.result {
                Ok(hits) => {
                    let matched = hits.iter().filter(|hit| !hit.is_fallback()).count();
                    log::info!("{}: {matched} of {} windows matched", run.name, hits.len());
                    report.detectors_run.push(run.name.to_string());
                    report.supporting_hits.insert(run.name.to_string(), hits);
                }
                Err(error) => {
                    log::warn!("{} failed: {error}", run.name);
                    report.detectors_skipped.push(run.name.to_string());
                }
            }
        }

        let clusterer = RawDetectionClusterer::with_options(self.config.cluster);
        let mut progress = ProgressTracker::new(
            self.config.progress.clone(),
            Stage::Clustering,
            Some(windows.len() as u64),
        );
        let mut splits = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            self.config.check_cancelled()?;
            let split = match clusterer.get_best_boundary(&detections, Some(window.start_time), Some(window.end_time)) {
                Some((time, confidence, mut metadata)) => {
                    let sources = metadata
                        .get("sources")
                        .and_then(Value::as_array)
                        .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
                        .unwrap_or_else(|| vec!["cluster".to_string()]);
                    metadata.insert("window_source".into(), window.source.clone().into());
                    log::info!("Window {}: boundary at {:.1}s (confidence {:.2})", i + 1, time, confidence);
                    ResolvedSplit {
                        time,
                        confidence,
                        sources,
                        metadata,
                    }
                }
                None => {
                    log::warn!("Window {}: no detections, using window center {:.1}s", i + 1, window.center_time);
                    let mut metadata = Metadata::new();
                    metadata.insert("fallback".into(), true.into());
                    metadata.insert("window_source".into(), window.source.clone().into());
                    ResolvedSplit {
                        time: window.center_time,
                        confidence: FALLBACK_CONFIDENCE,
                        sources: vec!["fallback".to_string()],
                        metadata,
                    }
                }
            };
            splits.push(split);
            progress.advance(Some(&window.source));
        }
        progress.finish();
        Ok(splits)
    }

    /// Phase 2, boundary strategy: one boundary list per whole-file detector.
    fn detect_boundaries(
        &self,
        ctx: &DetectionContext<'_>,
        report: &mut DetectionReport,
    ) -> Result<Vec<Vec<EpisodeBoundary>>, EpisplitError> {
        let detectors = available(self.whole_file_detectors(), &mut report.detectors_skipped);
        let runs = self.run_detectors(&detectors, |detector| detector.detect(ctx))?;

        let mut lists: Vec<(&'static str, Vec<EpisodeBoundary>)> = Vec::new();
        for run in runs {
            match run.result {
                Ok(boundaries) => {
                    log::info!("{}: {} boundaries", run.name, boundaries.len());
                    report.detectors_run.push(run.name.to_string());
                    lists.push((run.name, boundaries));
                }
                Err(error) => {
                    log::warn!("{} failed, continuing without it: {error}", run.name);
                    report.detectors_skipped.push(run.name.to_string());
                }
            }
        }

        let black_frame = BlackFrameDetector::with_options(self.config.black_frame);
        if let Some((_, boundaries)) = lists.iter_mut().find(|(name, _)| *name == black_frame.name()) {
            let silences = SilenceDetector::with_options(self.config.silence)
                .silence_regions(ctx)
                .unwrap_or_else(|error| {
                    log::debug!("No silence map for black-frame confirmation: {error}");
                    Vec::new()
                });
            *boundaries = black_frame.enhance_with_silence(std::mem::take(boundaries), &silences);
        }

        let ran = |name: &str| report.detectors_run.iter().any(|r| r == name);
        let intro = IntroDetector::with_options(self.config.intro)
            .with_episode_length(self.config.min_episode_length, self.config.max_episode_length);
        let llm = self.llm_detector();
        let (validate_intro, validate_llm) = (ran(intro.name()), ran(llm.name()));
        for (name, boundaries) in &mut lists {
            if *name == "chapter" || *name == intro.name() || *name == llm.name() {
                continue;
            }
            if validate_intro {
                *boundaries = intro.validate_with_intro(ctx, std::mem::take(boundaries));
            }
            if validate_llm {
                *boundaries = llm.validate_boundaries(ctx, std::mem::take(boundaries));
            }
        }

        Ok(lists.into_iter().map(|(_, boundaries)| boundaries).collect())
    }

    /// Phase 2, precision mode: windows one at a time, each shifted by the
    /// drift of the boundaries found so far. The inner `Err` names the
    /// windows that could not be resolved.
    fn detect_precision(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
        llm: &LlmDetector,
    ) -> Result<Result<Vec<ResolvedSplit>, String>, EpisplitError> {
        let precision = &self.config.precision;
        let pattern = match precision.pattern.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => match DetectionPattern::parse(raw) {
                Ok(pattern) => Some(pattern),
                Err(error) => {
                    log::warn!("Ignoring precision pattern: {error}");
                    None
                }
            },
            None => None,
        };
        let refine = pattern.is_none() && precision.black_frame_refinement && self.config.detectors.black_frame;

        let total = ctx.total_duration();
        let mut progress = ProgressTracker::new(
            self.config.progress.clone(),
            Stage::Detection,
            Some(windows.len() as u64),
        );
        let mut drift = 0.0;
        let mut failed = Vec::new();
        let mut splits = Vec::with_capacity(windows.len());
        for (i, window) in windows.iter().enumerate() {
            self.config.check_cancelled()?;
            let adjusted = if drift.abs() > f64::EPSILON {
                log::debug!("Window {}: shifted by {drift:.1}s drift", i + 1);
                window.shifted(drift, total)
            } else {
                window.clone()
            };

            let hit = llm.detect_precision_in_window(ctx, &adjusted, pattern.as_ref());
            progress.advance(Some(&adjusted.source));
            if hit.is_failed() {
                log::warn!("Window {}: precision detection failed", i + 1);
                failed.push(i + 1);
                continue;
            }
            let hit = if refine { self.snap_to_black(ctx, hit) } else { hit };

            let window_drift = hit.time - adjusted.center_time;
            drift += window_drift;
            log::info!(
                "Window {}: boundary at {:.2} min (confidence {:.2}, drift {window_drift:+.1}s)",
                i + 1,
                hit.time / 60.0,
                hit.confidence
            );

            let source = hit
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .unwrap_or("llm_precision")
                .to_string();
            let mut metadata = hit.metadata;
            metadata.insert("drift_applied".into(), (drift - window_drift).into());
            metadata.insert("window_source".into(), window.source.clone().into());
            splits.push(ResolvedSplit {
                time: hit.time,
                confidence: hit.confidence,
                sources: vec![source],
                metadata,
            });
        }
        progress.finish();

        if !failed.is_empty() {
            let list = failed.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
            return Ok(Err(format!("LLM precision detection failed for window(s) {list}")));
        }
        if drift.abs() > 1.0 {
            log::info!("Total cumulative drift: {drift:.1}s");
        }
        Ok(Ok(splits))
    }

    /// Move a precision cut onto the midpoint of the nearest black region
    /// when it lies within the snap distance.
    fn snap_to_black(&self, ctx: &DetectionContext<'_>, hit: WindowHit) -> WindowHit {
        let precision = &self.config.precision;
        let radius = precision.black_search_radius;
        let Ok(range) = TimeRange::new((hit.time - radius).max(0.0), (hit.time + radius).min(ctx.total_duration()))
        else {
            return hit;
        };
        let params = BlackParams {
            min_duration: precision.black_min_duration,
            ..self.config.black_frame.scan
        };
        let regions = match ctx.scanner.black_regions(ctx.path(), range, &params) {
            Ok(regions) => regions,
            Err(error) => {
                log::debug!("Black-frame refinement skipped: {error}");
                return hit;
            }
        };
        let Some(nearest) = regions
            .iter()
            .min_by(|a, b| (a.midpoint() - hit.time).abs().total_cmp(&(b.midpoint() - hit.time).abs()))
        else {
            return hit;
        };

        let distance = (nearest.midpoint() - hit.time).abs();
        if distance > self.config.llm.precision.black_snap_distance {
            return hit;
        }
        log::debug!(
            "Black frame refined: {:.2}m -> {:.2}m (distance {distance:.2}s)",
            hit.time / 60.0,
            nearest.midpoint() / 60.0
        );
        let original = hit.time;
        let mut refined = hit;
        refined.time = nearest.midpoint();
        refined.confidence = (refined.confidence + 0.05).min(0.95);
        refined.metadata.insert("black_frame_refined".into(), true.into());
        refined
            .metadata
            .insert("black_frame_distance".into(), ((distance * 100.0).round() / 100.0).into());
        refined.metadata.insert("original_llm_boundary".into(), original.into());
        refined
    }

    /// Run `detect` for every detector on the worker pool, isolating
    /// failures. Results keep detector order.
    fn run_detectors<D, T, F>(&self, detectors: &[Box<D>], detect: F) -> Result<Vec<DetectorRun<T>>, EpisplitError>
    where
        D: Detector + ?Sized,
        T: Send,
        F: Fn(&D) -> Result<Vec<T>, EpisplitError> + Sync + Send,
    {
        if detectors.is_empty() {
            return Ok(Vec::new());
        }
        let progress = Mutex::new(ProgressTracker::new(
            self.config.progress.clone(),
            Stage::Detection,
            Some(detectors.len() as u64),
        ));

        let runs = self.map_workers(detectors, |detector| {
            let name = detector.name();
            if self.config.is_cancelled() {
                return DetectorRun {
                    name,
                    result: Err(EpisplitError::Cancelled),
                };
            }
            log::debug!("Running {name}");
            let result = detect(detector);
            if let Ok(mut progress) = progress.lock() {
                progress.advance(Some(name));
            }
            DetectorRun { name, result }
        });

        if let Ok(mut progress) = progress.lock() {
            progress.finish();
        }
        if runs.iter().any(|run| matches!(run.result, Err(EpisplitError::Cancelled))) {
            return Err(EpisplitError::Cancelled);
        }
        Ok(runs)
    }

    #[cfg(feature = "rayon")]
    fn map_workers<I, R, F>(&self, items: &[I], f: F) -> Vec<R>
    where
        I: Sync,
        R: Send,
        F: Fn(&I) -> R + Sync + Send,
    {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .thread_name(|i| format!("detector-{i}"))
            .build()
        {
            Ok(pool) => pool.install(|| items.par_iter().map(&f).collect()),
            Err(error) => {
                log::warn!("Worker pool unavailable, running detectors sequentially: {error}");
                items.iter().map(f).collect()
            }
        }
    }

    #[cfg(not(feature = "rayon"))]
    fn map_workers<I, R, F>(&self, items: &[I], f: F) -> Vec<R>
    where
        F: Fn(&I) -> R,
    {
        items.iter().map(f).collect()
    }
}

/// Keep the detectors whose services are reachable.
fn available<D: Detector + ?Sized>(detectors: Vec<Box<D>>, skipped: &mut Vec<String>) -> Vec<Box<D>> {
    detectors
        .into_iter()
        .filter(|detector| match detector.check_available() {
            Ok(()) => true,
            Err(error) => {
                log::warn!("Skipping {}: {error}", detector.name());
                skipped.push(detector.name().to_string());
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;
    use crate::scan::{BlackRegion, LumaSample, SceneCut, SilenceParams, SilenceRegion};
    use crate::timeline::Chapter;

    /// Silence gaps at fixed times, nothing else.
    struct SilentGaps(Vec<SilenceRegion>);

    impl MediaScanner for SilentGaps {
        fn pcm(&self, _: &Path, _: TimeRange, _: u32) -> Result<Vec<f32>, EpisplitError> {
            Err(EpisplitError::NoAudioStream)
        }

        fn luma_samples(&self, _: &Path, _: TimeRange, _: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError> {
            Ok(Vec::new())
        }

        fn scene_cuts(&self, _: &Path, _: TimeRange, _: f64) -> Result<Vec<SceneCut>, EpisplitError> {
            Ok(Vec::new())
        }

        fn frame_at(&self, _: &Path, _: f64, _: u32) -> Result<DynamicImage, EpisplitError> {
            Err(EpisplitError::NoVideoStream)
        }

        fn silences(&self, _: &Path, range: TimeRange, _: &SilenceParams) -> Result<Vec<SilenceRegion>, EpisplitError> {
            Ok(self
                .0
                .iter()
                .filter(|s| s.end > range.start && s.start < range.end)
                .copied()
                .collect())
        }

        fn black_regions(&self, _: &Path, _: TimeRange, _: &BlackParams) -> Result<Vec<BlackRegion>, EpisplitError> {
            Ok(Vec::new())
        }
    }

    fn pipeline(config: DetectionConfig, silences: Vec<SilenceRegion>) -> Pipeline {
        Pipeline::new(config.with_workers(1)).with_scanner(Arc::new(SilentGaps(silences)))
    }

    #[test]
    fn unknown_episode_count_is_unsplit() {
        let timeline = MediaTimeline::new("Some.Movie.2019.mkv", 5400.0);
        let report = pipeline(DetectionConfig::new(), Vec::new()).run_timeline(&timeline).unwrap();
        assert!(matches!(report.outcome, Outcome::Unsplit { .. }));
        assert!(report.split_points.is_empty());
    }

    #[test]
    fn short_files_are_unsplit() {
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 1200.0);
        let report = pipeline(DetectionConfig::new(), Vec::new()).run_timeline(&timeline).unwrap();
        assert!(matches!(report.outcome, Outcome::Unsplit { ref reason } if reason.contains("shorter")));
    }

    #[test]
    fn filename_range_sets_the_episode_count() {
        let timeline = MediaTimeline::new("Show.S01E01-E03.mkv", 4050.0);
        let report = pipeline(DetectionConfig::new(), Vec::new()).run_timeline(&timeline).unwrap();
        assert_eq!(report.expected_episodes, Some(3));
        assert_eq!(report.windows.len(), 2);
    }

    #[test]
    fn guided_silence_splits_near_the_gap() {
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
        let report = pipeline(DetectionConfig::new(), vec![SilenceRegion::new(1346.0, 1350.0)])
            .run_timeline(&timeline)
            .unwrap();
        assert!(report.is_split());
        assert_eq!(report.split_points.len(), 2);
        let cut = report.split_points[1].0;
        assert!((cut - 1348.0).abs() < 5.0, "cut at {cut}");
        assert!(report.raw_detection_count > 0);
    }

    #[test]
    fn windows_without_evidence_fall_back_to_centers() {
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
        let report = pipeline(DetectionConfig::new(), Vec::new()).run_timeline(&timeline).unwrap();
        assert!(report.is_split());
        assert_eq!(report.episodes[0].sources, vec!["fallback".to_string()]);
        assert!((report.episodes[0].end_time - 1350.0).abs() < 1e-6);
    }

    #[test]
    fn chapter_episodes_drive_the_boundary_strategy() {
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0).with_chapters(vec![
            Chapter::new(0, Some("Episode 1"), 0.0, 1350.0),
            Chapter::new(1, Some("Episode 2"), 1350.0, 2700.0),
        ]);
        let config = DetectionConfig::new().with_strategy(Strategy::Boundaries);
        let report = pipeline(config, Vec::new()).run_timeline(&timeline).unwrap();
        assert!(report.is_split());
        assert_eq!(report.split_points, vec![(0.0, 1350.0), (1350.0, 1350.0)]);
        assert!(report.detectors_run.iter().any(|d| d == "chapter"));
    }

    #[test]
    fn configured_runtimes_validate_the_result() {
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
        let config = DetectionConfig::new().with_runtimes(vec![22.5, 22.5]);
        let report = pipeline(config, vec![SilenceRegion::new(1346.0, 1350.0)])
            .run_timeline(&timeline)
            .unwrap();
        let validation = report.tmdb.expect("runtimes were configured");
        assert!(validation.is_valid);
        assert!(validation.confidence_adjustment > 0.0);
    }

    #[test]
    fn cancellation_stops_the_run() {
        let token = crate::CancellationToken::new();
        token.cancel();
        let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
        let config = DetectionConfig::new().with_cancellation(token);
        let result = pipeline(config, Vec::new()).run_timeline(&timeline);
        assert!(matches!(result, Err(EpisplitError::Cancelled)));
    }
}

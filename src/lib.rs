//! # episplit
//!
//! Find where one episode ends and the next begins inside a multi-episode
//! video file, and split it losslessly.
//!
//! `episplit` fuses many weak signals into boundary decisions: chapter
//! markers, silence, black frames, scene cuts, perceptual frame hashes,
//! recurring audio, intro sequences, a vision LLM and speech transcription.
//! Media is read in-process through FFmpeg via the
//! [`ffmpeg-next`](https://crates.io/crates/ffmpeg-next) crate.
//!
//! ## How it works
//!
//! 1. **Search windows.** With N expected episodes there are N-1
//!    boundaries. [`SearchWindowDeterminer`] places one window per boundary
//!    from TMDB runtimes, chapters, commercial breaks, or equal division.
//! 2. **Detection.** Each enabled detector reports candidates inside the
//!    windows. Detectors run on a small worker pool and a failing detector
//!    is simply left out.
//! 3. **Fusion.** [`RawDetectionClusterer`] picks the best-supported time
//!    in each window, or [`BoundaryMerger`] fuses whole-file boundary lists.
//!    The result is a contiguous episode list covering the whole file.
//! 4. **Validation.** Episode durations are compared against TMDB
//!    runtimes and confidences adjusted.
//!
//! ## Quick Start
//!
//! ### Detect boundaries
//!
//! ```no_run
//! use episplit::{DetectionConfig, Pipeline};
//!
//! let report = Pipeline::new(DetectionConfig::new()).run("Show.S01E01-E03.mkv")?;
//! for episode in &report.episodes {
//!     println!(
//!         "{:.1}s - {:.1}s ({:.0}% via {})",
//!         episode.start_time,
//!         episode.end_time,
//!         episode.confidence * 100.0,
//!         episode.sources.join(", ")
//!     );
//! }
//! # Ok::<(), episplit::EpisplitError>(())
//! ```
//!
//! ### Split the file
//!
//! ```no_run
//! use episplit::{DetectionConfig, EpisodeNamer, EpisodeSplitter, Pipeline};
//!
//! let input = "Show.S01E01-E03.mkv";
//! let report = Pipeline::new(DetectionConfig::new()).run(input)?;
//! if report.is_split() {
//!     let namer = EpisodeNamer::new();
//!     let parsed = namer.parse_filename(input);
//!     EpisodeSplitter::new().split_all(
//!         input,
//!         "episodes",
//!         &report.split_points,
//!         |n| namer.generate_episode_name(&parsed, n as u32, None, None),
//!         None,
//!     )?;
//! }
//! # Ok::<(), episplit::EpisplitError>(())
//! ```
//!
//! ### Plan windows only
//!
//! ```
//! use episplit::{SearchWindowDeterminer, WindowEvidence};
//!
//! let evidence = WindowEvidence::new().with_tmdb_runtimes(vec![22.0, 22.0, 22.0]);
//! let windows = SearchWindowDeterminer::new(3960.0, 3).determine_windows(&evidence);
//! assert_eq!(windows.len(), 2);
//! ```
//!
//! ## Detectors
//!
//! | Detector | Signal | Needs |
//! |----------|--------|-------|
//! | [`ChapterDetector`] | episode chapters, "Commercial 1" markers | chapters |
//! | [`SilenceDetector`] | gaps in the audio | audio |
//! | [`BlackFrameDetector`] | runs of black frames | video |
//! | [`SceneChangeDetector`] | hard cuts | video |
//! | [`ImageHashDetector`] | recurring title cards | video |
//! | [`AudioFingerprintDetector`] | recurring theme music | audio |
//! | [`IntroDetector`] | recurring intro sequences | video, audio |
//! | [`LlmDetector`] | credits, logos, outros | Ollama |
//! | [`SpeechDetector`] | "previously on", "to be continued" | Whisper server |
//!
//! ### Optional Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `rayon` | Runs detectors on a worker pool (default) |
//! | `chromaprint` | Chromaprint audio signatures for intro matching |
//! | `full` | Enables all of the above |
//!
//! ## Requirements
//!
//! FFmpeg development libraries must be installed on your system. See the
//! [README](https://github.com/skanderjeddi/episplit#installation) for
//! platform-specific instructions.

pub mod boundary;
pub mod cache;
pub mod candidates;
pub mod cluster;
pub mod config;
mod conversion;
pub mod detector;
pub mod detectors;
pub mod error;
pub mod ffmpeg;
pub mod ffmpeg_scanner;
pub mod merger;
pub mod naming;
pub mod pipeline;
pub mod probe;
pub mod progress;
pub mod retry;
pub mod scan;
pub mod splitter;
pub mod timeline;
pub mod tmdb;
pub mod window;

pub use boundary::{EpisodeBoundary, Metadata, WindowHit};
pub use cache::ScanCache;
pub use candidates::CandidateLadder;
pub use cluster::{ClusterOptions, DetectionCluster, RawDetection, RawDetectionClusterer};
pub use config::{DetectionConfig, DetectorToggles, NamingOptions, PrecisionMode, Strategy};
pub use detector::{DetectionContext, Detector, RawWindowedDetector, WholeFileDetector, WindowedDetector};
pub use detectors::{
    AudioFingerprintDetector, BlackFrameDetector, ChapterDetector, ImageHashDetector, IntroDetector, LlmDetector,
    SceneChangeDetector, SilenceDetector, SpeechDetector,
};
pub use error::EpisplitError;
pub use ffmpeg::{FfmpegLogLevel, set_ffmpeg_log_level};
pub use ffmpeg_scanner::FfmpegScanner;
pub use merger::{BoundaryMerger, EpisodeRecord, MergeOptions, MergedBoundary, SourceWeights};
pub use naming::{EpisodeNamer, ParsedFilename};
pub use pipeline::{DetectionReport, Outcome, Pipeline, WindowPlan};
pub use probe::MediaProbe;
pub use progress::{CancellationToken, ProgressCallback, ProgressInfo, Stage};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use scan::{MediaScanner, SilenceParams, TimeRange, TimedScanner};
pub use splitter::{EpisodeSplitter, SplitJob, SplitResult};
pub use timeline::MediaTimeline;
pub use tmdb::{TmdbOptions, TmdbValidator, ValidationResult};
pub use window::{SearchWindow, SearchWindowDeterminer, WindowEvidence, WindowOptions};

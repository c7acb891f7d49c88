//! Error types for the `episplit` crate.
//!
//! This module defines [`EpisplitError`], the unified error type returned by
//! all fallible operations in the crate. Errors carry enough context to tell
//! a fatal probe failure apart from a detector that is merely unavailable or
//! a network call that timed out and may be retried.

use std::{io::Error as IoError, path::PathBuf, time::Duration};

use ffmpeg_next::Error as FfmpegError;
use image::ImageError;
use thiserror::Error;

/// The unified error type for all `episplit` operations.
///
/// Only a handful of variants abort a detection run: [`FileOpen`] when the
/// input cannot be probed, [`Cancelled`], and [`NoEpisodes`] when the
/// splitter is handed nothing to split. Everything else is caught by the
/// pipeline, logged, and turned into a fallback or a skipped detector.
///
/// [`FileOpen`]: EpisplitError::FileOpen
/// [`Cancelled`]: EpisplitError::Cancelled
/// [`NoEpisodes`]: EpisplitError::NoEpisodes
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EpisplitError {
    /// The media file could not be opened or probed.
    #[error("Failed to open media file at {path}: {reason}")]
    FileOpen {
        /// Path that was passed to the probe.
        path: PathBuf,
        /// Underlying reason the open failed.
        reason: String,
    },

    /// The file does not contain a video stream.
    #[error("No video stream found in file")]
    NoVideoStream,

    /// The file does not contain an audio stream.
    #[error("No audio stream found in file")]
    NoAudioStream,

    /// A video frame could not be decoded.
    #[error("Failed to decode video frame: {0}")]
    VideoDecodeError(String),

    /// Audio data could not be decoded.
    #[error("Failed to decode audio: {0}")]
    AudioDecodeError(String),

    /// A time range was empty or reversed.
    #[error("Invalid range: start ({start:.3}s) must be less than end ({end:.3}s)")]
    InvalidRange {
        /// Start of the range in seconds.
        start: f64,
        /// End of the range in seconds.
        end: f64,
    },

    /// Fewer than two episodes were requested where a split needs at least two.
    #[error("Expected episode count must be at least 2 (got {0})")]
    InvalidEpisodeCount(usize),

    /// An optional detector cannot run in this environment.
    ///
    /// Raised by [`Detector::check_available`](crate::Detector::check_available)
    /// when a service is unreachable, a model is not installed, or
    /// credentials are missing. The pipeline skips the detector.
    #[error("Detector '{detector}' is unavailable: {reason}")]
    DetectorUnavailable {
        /// Detector name.
        detector: String,
        /// Why it cannot run.
        reason: String,
    },

    /// A media scan or remote call did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was running.
        operation: String,
        /// The limit that was exceeded.
        after: Duration,
    },

    /// A remote service answered with an error status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Request URL.
        url: String,
        /// Response status code.
        status: u16,
    },

    /// A remote service could not be reached.
    #[error("HTTP transport error: {0}")]
    HttpTransport(String),

    /// A remote service answered with something we could not interpret.
    #[error("Unexpected response from {service}: {reason}")]
    InvalidResponse {
        /// Service name.
        service: String,
        /// What was wrong with it.
        reason: String,
    },

    /// An ignore-pattern string could not be parsed.
    #[error("Invalid detection pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Parse failure.
        reason: String,
    },

    /// A configuration value was out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The splitter was asked to split an empty episode list.
    #[error("No episodes to split")]
    NoEpisodes,

    /// An error originating from the FFmpeg libraries.
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// FFmpeg filter graph setup or processing failed.
    #[error("Filter graph error: {0}")]
    FilterGraphError(String),

    /// Packet copy into an episode file failed.
    #[error("Stream copy error: {0}")]
    StreamCopyError(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    IoError(#[from] IoError),

    /// An error from the `image` crate during frame conversion.
    #[error("Image processing error: {0}")]
    ImageError(#[from] ImageError),

    /// Configuration or response JSON could not be parsed.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The operation was cancelled via a [`CancellationToken`](crate::CancellationToken).
    #[error("Operation cancelled")]
    Cancelled,
}

impl EpisplitError {
    /// Whether retrying the same call may succeed.
    ///
    /// Timeouts, transport failures, rate limiting and server-side errors
    /// are transient. Everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            EpisplitError::Timeout { .. } | EpisplitError::HttpTransport(_) => true,
            EpisplitError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Shorthand for [`EpisplitError::DetectorUnavailable`].
    pub fn unavailable(detector: &str, reason: impl Into<String>) -> Self {
        EpisplitError::DetectorUnavailable {
            detector: detector.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<FfmpegError> for EpisplitError {
    fn from(error: FfmpegError) -> Self {
        EpisplitError::FfmpegError(error.to_string())
    }
}

impl From<ureq::Error> for EpisplitError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::Status(status, response) => EpisplitError::HttpStatus {
                url: response.get_url().to_string(),
                status,
            },
            ureq::Error::Transport(transport) => EpisplitError::HttpTransport(transport.to_string()),
        }
    }
}

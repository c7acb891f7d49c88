//! The probed shape of a media file.
//!
//! A [`MediaTimeline`] is produced once per file by
//! [`MediaProbe::probe`](crate::MediaProbe::probe) and is read-only from then
//! on. Every detector sees the same timeline.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// Kind of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Other,
}

/// One elementary stream in the container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Stream index in the container.
    pub index: usize,
    /// Stream kind.
    pub kind: StreamKind,
    /// Codec name as reported by FFmpeg.
    pub codec: String,
    /// `language` tag, if present.
    pub language: Option<String>,
}

/// A chapter marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chapter {
    /// Zero-based position in the chapter list.
    pub index: usize,
    /// Container chapter id.
    pub id: i64,
    /// `title` tag, if present.
    pub title: Option<String>,
    /// Start in seconds.
    pub start: f64,
    /// End in seconds.
    pub end: f64,
}

impl Chapter {
    /// Convenience constructor, mostly for tests and tools.
    pub fn new(index: usize, title: Option<&str>, start: f64, end: f64) -> Self {
        Self {
            index,
            id: index as i64,
            title: title.map(str::to_string),
            start,
            end,
        }
    }

    /// Chapter length in seconds.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// The title, or an empty string.
    pub fn title_or_empty(&self) -> &str {
        self.title.as_deref().unwrap_or("")
    }
}

/// Duration, streams and chapters of one media file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaTimeline {
    /// Source path.
    pub path: PathBuf,
    /// Container duration in seconds.
    pub duration: f64,
    /// All elementary streams.
    pub streams: Vec<StreamInfo>,
    /// Chapters, ordered by start time.
    pub chapters: Vec<Chapter>,
}

impl MediaTimeline {
    /// A timeline with no streams or chapters.
    pub fn new<P: AsRef<Path>>(path: P, duration: f64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            duration,
            streams: Vec::new(),
            chapters: Vec::new(),
        }
    }

    /// Replace the chapter list.
    #[must_use]
    pub fn with_chapters(mut self, mut chapters: Vec<Chapter>) -> Self {
        chapters.sort_by(|a, b| a.start.total_cmp(&b.start));
        self.chapters = chapters;
        self
    }

    /// Replace the stream list.
    #[must_use]
    pub fn with_streams(mut self, streams: Vec<StreamInfo>) -> Self {
        self.streams = streams;
        self
    }

    pub fn has_video(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.streams.iter().any(|s| s.kind == StreamKind::Audio)
    }

    /// Clamp a time to `[0, duration]`.
    pub fn clamp(&self, time: f64) -> f64 {
        time.clamp(0.0, self.duration.max(0.0))
    }
}

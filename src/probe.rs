//! Media file probing.
//!
//! [`MediaProbe`] opens a file, reads its duration, stream list and chapter
//! markers, and closes the demuxer again. The result is a
//! [`MediaTimeline`] that is independent of any file handle.

use std::path::Path;

use ffmpeg_next::media::Type;

use crate::error::EpisplitError;
use crate::timeline::{Chapter, MediaTimeline, StreamInfo, StreamKind};

/// Lightweight media file probe.
///
/// # Example
///
/// ```no_run
/// use episplit::MediaProbe;
///
/// let timeline = MediaProbe::probe("S01E01-E02.mkv")?;
/// println!("{:.1}s, {} chapters", timeline.duration, timeline.chapters.len());
/// # Ok::<(), episplit::EpisplitError>(())
/// ```
pub struct MediaProbe;

impl MediaProbe {
    /// Probe a media file.
    ///
    /// # Errors
    ///
    /// Returns [`EpisplitError::FileOpen`] if the file cannot be opened,
    /// is not recognised as media, or reports no duration. A probe failure
    /// aborts detection for the file.
    pub fn probe<P: AsRef<Path>>(path: P) -> Result<MediaTimeline, EpisplitError> {
        let path = path.as_ref();
        log::debug!("Probing media file: {}", path.display());

        ffmpeg_next::init().map_err(|error| EpisplitError::FileOpen {
            path: path.to_path_buf(),
            reason: format!("FFmpeg initialisation failed: {error}"),
        })?;

        let input_context =
            ffmpeg_next::format::input(&path).map_err(|error| EpisplitError::FileOpen {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;

        let duration_microseconds = input_context.duration();
        if duration_microseconds <= 0 {
            return Err(EpisplitError::FileOpen {
                path: path.to_path_buf(),
                reason: "container reports no duration".to_string(),
            });
        }
        let duration = duration_microseconds as f64 / 1_000_000.0;

        let streams = input_context
            .streams()
            .map(|stream| {
                let parameters = stream.parameters();
                let kind = match parameters.medium() {
                    Type::Video => StreamKind::Video,
                    Type::Audio => StreamKind::Audio,
                    Type::Subtitle => StreamKind::Subtitle,
                    Type::Data => StreamKind::Data,
                    _ => StreamKind::Other,
                };
                StreamInfo {
                    index: stream.index(),
                    kind,
                    codec: format!("{:?}", parameters.id()).to_lowercase(),
                    language: stream.metadata().get("language").map(str::to_string),
                }
            })
            .collect();

        let mut chapters = Vec::with_capacity(input_context.nb_chapters() as usize);
        for (index, chapter) in input_context.chapters().enumerate() {
            let time_base = chapter.time_base();
            chapters.push(Chapter {
                index,
                id: chapter.id(),
                title: chapter.metadata().get("title").map(str::to_string),
                start: crate::conversion::pts_to_seconds(chapter.start(), time_base),
                end: crate::conversion::pts_to_seconds(chapter.end(), time_base),
            });
        }

        log::debug!(
            "Probed {}: {:.1}s, {} chapters",
            path.display(),
            duration,
            chapters.len()
        );

        Ok(MediaTimeline::new(path, duration)
            .with_streams(streams)
            .with_chapters(chapters))
    }
}

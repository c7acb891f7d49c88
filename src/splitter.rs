//! Lossless episode extraction.
//!
//! [`EpisodeSplitter`] copies a time range of every audio, video and
//! subtitle stream into a new container without re-encoding, shifting
//! timestamps so each episode starts at zero. This is the in-process
//! equivalent of
//! `ffmpeg -ss START -i input -t DURATION -map 0 -c copy -avoid_negative_ts make_zero`.
//!
//! Cuts land on the video keyframe at or before the requested start.
//!
//! # Example
//!
//! ```no_run
//! use episplit::{EpisodeNamer, EpisodeSplitter};
//!
//! let namer = EpisodeNamer::new();
//! let parsed = namer.parse_filename("Show.S01E01-E02.mkv");
//! let results = EpisodeSplitter::new().split_all(
//!     "Show.S01E01-E02.mkv",
//!     "episodes",
//!     &[(0.0, 1320.0), (1320.0, 1290.0)],
//!     |n| namer.generate_episode_name(&parsed, n as u32, None, None),
//!     None,
//! )?;
//! assert_eq!(results.len(), 2);
//! # Ok::<(), episplit::EpisplitError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use ffmpeg_next::{Rational, codec::Id, media::Type};
use serde::Serialize;

use crate::conversion::{pts_to_seconds, seconds_to_seek_timestamp, seconds_to_stream_timestamp};
use crate::error::EpisplitError;
use crate::probe::MediaProbe;

/// Outputs below this size are suspicious.
const MIN_OUTPUT_BYTES: u64 = 1024 * 1024;

/// One episode to extract.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitJob {
    /// 1-based.
    pub episode_number: usize,
    pub start_time: f64,
    pub duration: f64,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
}

/// A written episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitResult {
    pub episode_number: usize,
    pub output_path: PathBuf,
    pub start_time: f64,
    pub duration: f64,
    /// Bytes written.
    pub file_size: u64,
}

/// Progress of [`EpisodeSplitter::split_all`]: `(done, total)`.
pub type SplitProgress<'a> = &'a dyn Fn(usize, usize);

#[derive(Debug, Clone)]
pub struct EpisodeSplitter {
    copy_subtitles: bool,
}

impl Default for EpisodeSplitter {
    fn default() -> Self {
        Self { copy_subtitles: true }
    }
}

struct StreamSlot {
    output_index: usize,
    input_time_base: Rational,
    is_video: bool,
    finished: bool,
}

impl EpisodeSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave subtitle streams out of the episodes.
    #[must_use]
    pub fn exclude_subtitles(mut self) -> Self {
        self.copy_subtitles = false;
        self
    }

    /// Extract one episode.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::InvalidRange`] for a non-positive duration,
    /// [`EpisplitError::FileOpen`] when either file cannot be opened, and
    /// [`EpisplitError::StreamCopyError`] when nothing could be copied.
    pub fn split_episode(&self, job: &SplitJob) -> Result<SplitResult, EpisplitError> {
        if job.duration <= 0.0 || job.start_time < 0.0 {
            return Err(EpisplitError::InvalidRange {
                start: job.start_time,
                end: job.start_time + job.duration,
            });
        }
        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        log::info!(
            "Extracting episode {}: {:.1}s + {:.1}s -> {}",
            job.episode_number,
            job.start_time,
            job.duration,
            job.output_path.display()
        );

        ffmpeg_next::init().map_err(|e| EpisplitError::FileOpen {
            path: job.input_path.clone(),
            reason: format!("FFmpeg initialisation failed: {e}"),
        })?;
        let mut input = ffmpeg_next::format::input(&job.input_path).map_err(|e| EpisplitError::FileOpen {
            path: job.input_path.clone(),
            reason: e.to_string(),
        })?;
        let mut output = ffmpeg_next::format::output(&job.output_path).map_err(|e| EpisplitError::FileOpen {
            path: job.output_path.clone(),
            reason: format!("Failed to create output: {e}"),
        })?;

        let mut slots: Vec<Option<StreamSlot>> = Vec::new();
        let mut output_count = 0;
        for stream in input.streams() {
            let medium = stream.parameters().medium();
            let include = match medium {
                Type::Video | Type::Audio => true,
                Type::Subtitle => self.copy_subtitles,
                _ => false,
            };
            if !include {
                slots.push(None);
                continue;
            }
            let mut out_stream = output.add_stream(ffmpeg_next::encoder::find(Id::None))?;
            out_stream.set_parameters(stream.parameters());
            // Let the muxer pick the codec tag.
            unsafe {
                (*out_stream.parameters().as_mut_ptr()).codec_tag = 0;
            }
            slots.push(Some(StreamSlot {
                output_index: output_count,
                input_time_base: stream.time_base(),
                is_video: medium == Type::Video,
                finished: false,
            }));
            output_count += 1;
        }
        if output_count == 0 {
            return Err(EpisplitError::StreamCopyError("no copyable streams in input".into()));
        }
        let has_video = slots.iter().flatten().any(|slot| slot.is_video);

        output.write_header()?;
        let output_time_bases: Vec<Rational> = output.streams().map(|s| s.time_base()).collect();

        let timestamp = seconds_to_seek_timestamp(job.start_time);
        if timestamp > 0 {
            input.seek(timestamp, ..timestamp)?;
        }

        let end = job.start_time + job.duration;
        // Zero point of the episode: the first video keyframe, or the first packet.
        let mut origin: Option<f64> = None;
        let mut written = 0usize;

        for (stream, mut packet) in input.packets() {
            let Some(slot) = slots.get_mut(stream.index()).and_then(Option::as_mut) else {
                continue;
            };
            if slot.finished {
                if slots.iter().flatten().all(|s| s.finished) {
                    break;
                }
                continue;
            }
            let Some(ts) = packet.pts().or(packet.dts()) else {
                continue;
            };
            let time = pts_to_seconds(ts, slot.input_time_base);
            if time >= end {
                slot.finished = true;
                continue;
            }

            let zero = match origin {
                Some(zero) => zero,
                None if !has_video || (slot.is_video && packet.is_key()) => {
                    origin = Some(time);
                    time
                }
                None => continue,
            };
            if time < zero {
                continue;
            }

            let shift = seconds_to_stream_timestamp(zero, slot.input_time_base);
            packet.set_pts(packet.pts().map(|p| p - shift));
            packet.set_dts(packet.dts().map(|d| d - shift));
            let output_time_base = output_time_bases
                .get(slot.output_index)
                .copied()
                .unwrap_or(slot.input_time_base);
            packet.set_stream(slot.output_index);
            packet.rescale_ts(slot.input_time_base, output_time_base);
            packet.set_position(-1);
            packet.write_interleaved(&mut output)?;
            written += 1;
        }

        output.write_trailer()?;
        if written == 0 {
            return Err(EpisplitError::StreamCopyError(format!(
                "no packets between {:.1}s and {end:.1}s",
                job.start_time
            )));
        }

        let file_size = fs::metadata(&job.output_path)?.len();
        log::info!(
            "Episode {} written: {} packets, {:.1} MB",
            job.episode_number,
            written,
            file_size as f64 / 1024.0 / 1024.0
        );
        Ok(SplitResult {
            episode_number: job.episode_number,
            output_path: job.output_path.clone(),
            start_time: job.start_time,
            duration: job.duration,
            file_size,
        })
    }

    /// Extract every `(start, duration)` split point, naming episode `n`
    /// (1-based) with `name`. Stops at the first failure.
    ///
    /// # Errors
    ///
    /// [`EpisplitError::NoEpisodes`] for an empty list, otherwise the
    /// first episode's error.
    pub fn split_all<P, Q, F>(
        &self,
        input: P,
        output_dir: Q,
        split_points: &[(f64, f64)],
        name: F,
        progress: Option<SplitProgress<'_>>,
    ) -> Result<Vec<SplitResult>, EpisplitError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        F: Fn(usize) -> String,
    {
        if split_points.is_empty() {
            return Err(EpisplitError::NoEpisodes);
        }
        let total = split_points.len();
        let mut results = Vec::with_capacity(total);
        for (i, &(start_time, duration)) in split_points.iter().enumerate() {
            let episode_number = i + 1;
            let job = SplitJob {
                episode_number,
                start_time,
                duration,
                input_path: input.as_ref().to_path_buf(),
                output_path: output_dir.as_ref().join(name(episode_number)),
            };
            match self.split_episode(&job) {
                Ok(result) => results.push(result),
                Err(error) => {
                    log::error!("Stopping split due to error on episode {episode_number}: {error}");
                    return Err(error);
                }
            }
            if let Some(progress) = progress {
                progress(episode_number, total);
            }
        }
        Ok(results)
    }

    /// Whether an extracted episode looks right: the file exists, is at
    /// least 1 MiB, and probes within `tolerance` of the expected duration.
    /// A file that cannot be probed passes.
    pub fn verify_split(&self, result: &SplitResult, tolerance: f64) -> bool {
        let size = match fs::metadata(&result.output_path) {
            Ok(metadata) => metadata.len(),
            Err(_) => {
                log::error!("Output file does not exist: {}", result.output_path.display());
                return false;
            }
        };
        if size < MIN_OUTPUT_BYTES {
            log::warn!("Output file suspiciously small: {size} bytes");
            return false;
        }
        match MediaProbe::probe(&result.output_path) {
            Ok(timeline) if result.duration > 0.0 => {
                let deviation = (timeline.duration - result.duration).abs() / result.duration;
                if deviation > tolerance {
                    log::warn!(
                        "Duration mismatch: expected {:.1}s, got {:.1}s",
                        result.duration,
                        timeline.duration
                    );
                    return false;
                }
                true
            }
            Ok(_) => true,
            Err(error) => {
                log::debug!("Could not verify output duration: {error}");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_split_list_is_an_error() {
        let result = EpisodeSplitter::new().split_all("in.mkv", "out", &[], |n| format!("{n}.mkv"), None);
        assert!(matches!(result, Err(EpisplitError::NoEpisodes)));
    }

    #[test]
    fn rejects_empty_ranges() {
        let job = SplitJob {
            episode_number: 1,
            start_time: 10.0,
            duration: 0.0,
            input_path: "in.mkv".into(),
            output_path: "out.mkv".into(),
        };
        assert!(matches!(
            EpisodeSplitter::new().split_episode(&job),
            Err(EpisplitError::InvalidRange { .. })
        ));
    }

    #[test]
    fn verify_rejects_missing_and_small_files() {
        let dir = tempfile::tempdir().unwrap();
        let splitter = EpisodeSplitter::new();
        let mut result = SplitResult {
            episode_number: 1,
            output_path: dir.path().join("missing.mkv"),
            start_time: 0.0,
            duration: 60.0,
            file_size: 0,
        };
        assert!(!splitter.verify_split(&result, 0.1));

        let small = dir.path().join("small.mkv");
        fs::write(&small, b"not a video").unwrap();
        result.output_path = small;
        assert!(!splitter.verify_split(&result, 0.1));
    }
}

//! FFmpeg-backed [`MediaScanner`].
//!
//! Every call opens its own demuxer, seeks to the start of the requested
//! range, and decodes forward until the end of the range, so scanning a
//! search window costs time proportional to the window rather than to the
//! file. Decoders and converters are created from the first decoded frame
//! because some decoders report a different pixel or sample format before
//! decoding starts.

use std::ffi::CStr;
use std::path::Path;

use ffmpeg_next::{
    ChannelLayout, Rational,
    codec::context::Context as CodecContext,
    filter::Graph as FilterGraph,
    format::{Pixel, Sample, context::Input, sample::Type as SampleType},
    frame::{Audio as AudioFrame, Video as VideoFrame},
    media::Type,
    software::{
        resampling::Context as ResamplingContext,
        scaling::{Context as ScalingContext, Flags as ScalingFlags},
    },
};
use ffmpeg_sys_next::AVPixelFormat;
use image::{DynamicImage, RgbImage};

use crate::conversion::{frame_to_buffer, pts_to_seconds, seconds_to_seek_timestamp};
use crate::error::EpisplitError;
use crate::scan::{BlackParams, LumaSample, MediaScanner, SceneCut, TimeRange};

/// Width of the grayscale frames used for black detection.
const LUMA_WIDTH: u32 = 160;

/// Scanner that decodes media in-process with `ffmpeg-next`.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
///
/// use episplit::{FfmpegScanner, MediaScanner, SilenceParams, TimeRange};
///
/// let scanner = FfmpegScanner::new();
/// let range = TimeRange::new(1200.0, 1500.0)?;
/// let silences = scanner.silences(Path::new("show.mkv"), range, &SilenceParams::default())?;
/// for silence in &silences {
///     println!("{:.1}s - {:.1}s", silence.start, silence.end);
/// }
/// # Ok::<(), episplit::EpisplitError>(())
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegScanner;

impl FfmpegScanner {
    pub fn new() -> Self {
        Self
    }
}

fn open_input(path: &Path) -> Result<Input, EpisplitError> {
    ffmpeg_next::init().map_err(|error| EpisplitError::FileOpen {
        path: path.to_path_buf(),
        reason: format!("FFmpeg initialisation failed: {error}"),
    })?;
    ffmpeg_next::format::input(&path).map_err(|error| EpisplitError::FileOpen {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

/// Seek to the keyframe at or before `seconds`.
fn seek_to(input: &mut Input, seconds: f64) -> Result<(), EpisplitError> {
    let timestamp = seconds_to_seek_timestamp(seconds);
    if timestamp > 0 {
        input.seek(timestamp, ..timestamp)?;
    }
    Ok(())
}

fn frame_seconds(pts: Option<i64>, time_base: Rational, fallback: f64) -> f64 {
    pts.map_or(fallback, |pts| pts_to_seconds(pts, time_base))
}

/// Scale `(width, height)` down to at most `max_width`, keeping the aspect
/// ratio and even dimensions.
fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width || width == 0 {
        return (width.max(2), height.max(2));
    }
    let scaled_height = (height as f64 * max_width as f64 / width as f64).round() as u32;
    (max_width & !1, (scaled_height & !1).max(2))
}

fn scaler_for(frame: &VideoFrame, format: Pixel, max_width: u32) -> Result<(ScalingContext, u32, u32), EpisplitError> {
    let (width, height) = scaled_dimensions(frame.width(), frame.height(), max_width);
    let scaler = ScalingContext::get(
        frame.format(),
        frame.width(),
        frame.height(),
        format,
        width,
        height,
        ScalingFlags::BILINEAR,
    )?;
    Ok((scaler, width, height))
}

impl MediaScanner for FfmpegScanner {
    fn pcm(&self, path: &Path, range: TimeRange, sample_rate: u32) -> Result<Vec<f32>, EpisplitError> {
        let mut input = open_input(path)?;
        let stream = input.streams().best(Type::Audio).ok_or(EpisplitError::NoAudioStream)?;
        let audio_index = stream.index();
        let time_base = stream.time_base();
        let mut decoder = CodecContext::from_parameters(stream.parameters())?
            .decoder()
            .audio()
            .map_err(|e| EpisplitError::AudioDecodeError(format!("Failed to create audio decoder: {e}")))?;

        log::debug!(
            "Decoding PCM {:.1}s-{:.1}s at {} Hz from {}",
            range.start,
            range.end,
            sample_rate,
            path.display()
        );

        seek_to(&mut input, range.start)?;

        let rate = sample_rate as f64;
        let mut samples = Vec::with_capacity((range.duration() * rate) as usize);
        let mut resampler: Option<ResamplingContext> = None;
        let mut decoded = AudioFrame::empty();
        let mut resampled = AudioFrame::empty();

        'packets: for (stream, packet) in input.packets() {
            if stream.index() != audio_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| EpisplitError::AudioDecodeError(e.to_string()))?;

            while decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = frame_seconds(decoded.timestamp().or(decoded.pts()), time_base, range.start);
                if frame_time >= range.end {
                    break 'packets;
                }

                if resampler.is_none() {
                    resampler = Some(
                        ResamplingContext::get(
                            decoded.format(),
                            decoder.channel_layout(),
                            decoded.rate(),
                            Sample::F32(SampleType::Packed),
                            ChannelLayout::MONO,
                            sample_rate,
                        )
                        .map_err(|e| EpisplitError::AudioDecodeError(format!("Failed to create resampler: {e}")))?,
                    );
                }
                let Some(resampler) = resampler.as_mut() else {
                    continue;
                };
                resampler
                    .run(&decoded, &mut resampled)
                    .map_err(|e| EpisplitError::AudioDecodeError(format!("Resample error: {e}")))?;

                let count = resampled.samples();
                if count == 0 {
                    continue;
                }
                // SAFETY: packed mono f32 output holds `count` contiguous f32 values in plane 0.
                let mono: &[f32] =
                    unsafe { std::slice::from_raw_parts(resampled.data(0).as_ptr() as *const f32, count) };
                for (k, &sample) in mono.iter().enumerate() {
                    let time = frame_time + k as f64 / rate;
                    if time >= range.start && time < range.end {
                        samples.push(sample);
                    }
                }
            }
        }

        Ok(samples)
    }

    fn luma_samples(&self, path: &Path, range: TimeRange, params: &BlackParams) -> Result<Vec<LumaSample>, EpisplitError> {
        let mut input = open_input(path)?;
        let stream = input.streams().best(Type::Video).ok_or(EpisplitError::NoVideoStream)?;
        let video_index = stream.index();
        let time_base = stream.time_base();
        let mut decoder = CodecContext::from_parameters(stream.parameters())?.decoder().video()?;

        seek_to(&mut input, range.start)?;

        let period = if params.sample_fps > 0.0 {
            1.0 / params.sample_fps
        } else {
            0.0
        };
        let dark_level = (params.pixel_threshold.clamp(0.0, 1.0) * 255.0) as u8;
        let mut next_sample = range.start;
        let mut scaler: Option<(ScalingContext, u32, u32)> = None;
        let mut samples = Vec::new();
        let mut decoded = VideoFrame::empty();
        let mut gray = VideoFrame::empty();

        'packets: for (stream, packet) in input.packets() {
            if stream.index() != video_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| EpisplitError::VideoDecodeError(e.to_string()))?;

            while decoder.receive_frame(&mut decoded).is_ok() {
                let time = frame_seconds(decoded.timestamp().or(decoded.pts()), time_base, next_sample);
                if time >= range.end {
                    break 'packets;
                }
                if time < next_sample {
                    continue;
                }

                if scaler.is_none() {
                    scaler = Some(scaler_for(&decoded, Pixel::GRAY8, LUMA_WIDTH)?);
                }
                let Some((context, width, height)) = scaler.as_mut() else {
                    continue;
                };
                context.run(&decoded, &mut gray)?;
                let pixels = frame_to_buffer(&gray, *width, *height, 1);
                let dark = pixels.iter().filter(|&&p| p <= dark_level).count();
                samples.push(LumaSample {
                    time,
                    dark_ratio: dark as f64 / pixels.len().max(1) as f64,
                });
                next_sample = time + period;
            }
        }

        Ok(samples)
    }

    fn scene_cuts(&self, path: &Path, range: TimeRange, threshold: f64) -> Result<Vec<SceneCut>, EpisplitError> {
        let mut input = open_input(path)?;
        let stream = input.streams().best(Type::Video).ok_or(EpisplitError::NoVideoStream)?;
        let video_index = stream.index();
        let time_base = stream.time_base();
        let mut decoder = CodecContext::from_parameters(stream.parameters())?.decoder().video()?;

        log::debug!(
            "Scene scan {:.1}s-{:.1}s (threshold={:.2})",
            range.start,
            range.end,
            threshold
        );

        seek_to(&mut input, range.start)?;

        let mut graph: Option<FilterGraph> = None;
        let mut cuts = Vec::new();
        let mut decoded = VideoFrame::empty();
        let mut filtered = VideoFrame::empty();

        'packets: for (stream, packet) in input.packets() {
            if stream.index() != video_index {
                continue;
            }
            decoder
                .send_packet(&packet)
                .map_err(|e| EpisplitError::VideoDecodeError(e.to_string()))?;

            while decoder.receive_frame(&mut decoded).is_ok() {
                let time = frame_seconds(decoded.timestamp().or(decoded.pts()), time_base, range.start);
                if time >= range.end {
                    break 'packets;
                }
                if time < range.start {
                    continue;
                }
                if graph.is_none() {
                    graph = Some(build_scdet_graph(&decoded, time_base, threshold)?);
                }
                let Some(graph) = graph.as_mut() else {
                    continue;
                };
                feed_frame(graph, &decoded)?;
                drain_cuts(graph, &mut filtered, time_base, threshold, &mut cuts)?;
            }
        }

        Ok(cuts)
    }

    fn frame_at(&self, path: &Path, time: f64, max_width: u32) -> Result<DynamicImage, EpisplitError> {
        let mut input = open_input(path)?;
        let stream = input.streams().best(Type::Video).ok_or(EpisplitError::NoVideoStream)?;
        let video_index = stream.index();
        let time_base = stream.time_base();
        let mut decoder = CodecContext::from_parameters(stream.parameters())?.decoder().video()?;

        seek_to(&mut input, time)?;

        let mut decoded = VideoFrame::empty();
        let mut rgb = VideoFrame::empty();

        for (stream, packet) in input.packets() {
            if stream.index() != video_index {
                continue;
            }
            decoder.send_packet(&packet)?;
            while decoder.receive_frame(&mut decoded).is_ok() {
                let frame_time = frame_seconds(decoded.timestamp().or(decoded.pts()), time_base, time);
                if frame_time + 1e-3 < time {
                    continue;
                }
                let (mut scaler, width, height) = scaler_for(&decoded, Pixel::RGB24, max_width)?;
                scaler.run(&decoded, &mut rgb)?;
                let buffer = frame_to_buffer(&rgb, width, height, 3);
                let image = RgbImage::from_raw(width, height, buffer).ok_or_else(|| {
                    EpisplitError::VideoDecodeError("Frame buffer size mismatch".to_string())
                })?;
                return Ok(DynamicImage::ImageRgb8(image));
            }
        }

        Err(EpisplitError::VideoDecodeError(format!(
            "No frame at {time:.2}s in {}",
            path.display()
        )))
    }
}

/// buffer -> scale -> format -> scdet -> buffersink
fn build_scdet_graph(frame: &VideoFrame, time_base: Rational, threshold: f64) -> Result<FilterGraph, EpisplitError> {
    let pix_fmt = AVPixelFormat::from(frame.format()) as i32;
    let mut graph = FilterGraph::new();

    let buffer_args = format!(
        "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
        frame.width(),
        frame.height(),
        pix_fmt,
        time_base.numerator(),
        time_base.denominator(),
    );

    let buffer = ffmpeg_next::filter::find("buffer")
        .ok_or_else(|| EpisplitError::FilterGraphError("FFmpeg 'buffer' filter not found".to_string()))?;
    let sink = ffmpeg_next::filter::find("buffersink")
        .ok_or_else(|| EpisplitError::FilterGraphError("FFmpeg 'buffersink' filter not found".to_string()))?;

    graph
        .add(&buffer, "in", &buffer_args)
        .map_err(|e| EpisplitError::FilterGraphError(format!("Failed to add buffer filter: {e}")))?;
    graph
        .add(&sink, "out", "")
        .map_err(|e| EpisplitError::FilterGraphError(format!("Failed to add buffersink filter: {e}")))?;

    // scdet reports scores on a 0-100 scale.
    let spec = format!(
        "scale=320:-2,format=pix_fmts=yuv420p,scdet=threshold={}",
        (threshold * 100.0).clamp(0.0, 100.0)
    );
    graph
        .output("in", 0)
        .and_then(|parser| parser.input("out", 0))
        .and_then(|parser| parser.parse(&spec))
        .map_err(|e| EpisplitError::FilterGraphError(format!("Filter graph parse error: {e}")))?;
    graph
        .validate()
        .map_err(|e| EpisplitError::FilterGraphError(format!("Filter graph validation: {e}")))?;

    Ok(graph)
}

fn feed_frame(graph: &mut FilterGraph, frame: &VideoFrame) -> Result<(), EpisplitError> {
    graph
        .get("in")
        .ok_or_else(|| EpisplitError::FilterGraphError("Filter 'in' not found".to_string()))?
        .source()
        .add(frame)
        .map_err(|e| EpisplitError::FilterGraphError(format!("Failed to feed filter: {e}")))
}

fn drain_cuts(
    graph: &mut FilterGraph,
    filtered: &mut VideoFrame,
    time_base: Rational,
    threshold: f64,
    cuts: &mut Vec<SceneCut>,
) -> Result<(), EpisplitError> {
    let mut sink = graph
        .get("out")
        .ok_or_else(|| EpisplitError::FilterGraphError("Filter 'out' not found".to_string()))?;
    while sink.sink().frame(filtered).is_ok() {
        if let Some(score) = read_scdet_score(filtered).map(|s| s / 100.0).filter(|&s| s >= threshold) {
            cuts.push(SceneCut {
                time: pts_to_seconds(filtered.pts().unwrap_or(0), time_base),
                score,
            });
        }
    }
    Ok(())
}

/// Read the `lavfi.scd.score` metadata value from a filtered frame.
fn read_scdet_score(frame: &VideoFrame) -> Option<f64> {
    // SAFETY: ffmpeg-next does not expose per-frame metadata; the dictionary
    // pointer is owned by the frame and only read here.
    unsafe {
        let frame_ptr = frame.as_ptr();
        if frame_ptr.is_null() {
            return None;
        }
        let metadata = (*frame_ptr).metadata;
        if metadata.is_null() {
            return None;
        }
        let entry = ffmpeg_sys_next::av_dict_get(metadata, c"lavfi.scd.score".as_ptr(), std::ptr::null(), 0);
        if entry.is_null() || (*entry).value.is_null() {
            return None;
        }
        CStr::from_ptr((*entry).value).to_str().ok()?.parse::<f64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaled_dimensions_keep_aspect_and_parity() {
        assert_eq!(scaled_dimensions(1920, 1080, 160), (160, 90));
        assert_eq!(scaled_dimensions(1920, 1080, 320), (320, 180));
        assert_eq!(scaled_dimensions(120, 90, 160), (120, 90));
        assert_eq!(scaled_dimensions(1440, 1080, 321), (320, 240));
    }
}

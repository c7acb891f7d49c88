//! Episode-end phrases found by speech transcription.
//!
//! Each window's audio is sent to a Whisper server. A transcript segment
//! containing a closing phrase such as "stay tuned" or "next time on"
//! marks the end of the episode proper; the hit is placed at the end of
//! that segment.

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::boundary::WindowHit;
use crate::candidates::CandidateLadder;
use crate::cluster::RawDetection;
use crate::detector::{
    DetectionContext, Detector, FALLBACK_CONFIDENCE, RawWindowedDetector, WindowedDetector, window_range,
};
use crate::error::EpisplitError;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::window::SearchWindow;

/// Phrases that close an episode, matched case-insensitively.
pub const EPISODE_END_PHRASES: &[&str] = &[
    "stay tuned",
    "next time on",
    "next on",
    "coming up next",
    "coming up on",
    "on the next episode",
    "on the next",
    "scenes from our next",
    "scenes from the next",
    "next week on",
    "previously on",
];

/// Whisper wants 16 kHz mono.
const SPEECH_SAMPLE_RATE: u32 = 16_000;

/// One transcribed segment, in absolute file time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, rename = "avg_logprob")]
    pub confidence: f64,
}

impl SpeechSegment {
    /// The first closing phrase contained in this segment.
    pub fn episode_end_phrase(&self) -> Option<&'static str> {
        let text = self.text.to_lowercase();
        EPISODE_END_PHRASES.iter().copied().find(|phrase| text.contains(phrase))
    }
}

/// A model and the device it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeechModel {
    pub model: String,
    pub device: String,
}

impl SpeechModel {
    pub fn new(model: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            device: device.into(),
        }
    }
}

/// Turns 16 kHz mono WAV audio into timed segments.
pub trait Transcriber: Send + Sync {
    fn check_available(&self) -> Result<(), EpisplitError>;

    /// Segments with times relative to the start of `wav`.
    fn transcribe(&self, wav: &[u8], model: &SpeechModel) -> Result<Vec<SpeechSegment>, EpisplitError>;
}

/// Speech detector and Whisper server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechOptions {
    /// Base URL of an OpenAI-compatible transcription server.
    pub host: String,
    /// Models from most to least preferred.
    pub models: Vec<String>,
    /// Preferred device (`auto`, `cuda`, `cpu`).
    pub device: String,
    pub language: Option<String>,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub hit_confidence: f64,
    /// Raw detection score of an episode-end phrase.
    pub raw_score: f64,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            host: "http://localhost:8000".to_string(),
            models: vec!["base".to_string(), "tiny".to_string()],
            device: "auto".to_string(),
            language: Some("en".to_string()),
            request_timeout_secs: 300,
            probe_timeout_secs: 5,
            retry: RetryPolicy::default(),
            hit_confidence: 0.85,
            raw_score: 40.0,
        }
    }
}

impl SpeechOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    /// The downgrade order: every model on the preferred device, then the
    /// smallest model on CPU.
    pub fn model_ladder(&self) -> Vec<SpeechModel> {
        let mut ladder: Vec<SpeechModel> = self
            .models
            .iter()
            .map(|model| SpeechModel::new(model.as_str(), self.device.as_str()))
            .collect();
        if self.device != "cpu" {
            if let Some(smallest) = self.models.last() {
                ladder.push(SpeechModel::new(smallest.as_str(), "cpu"));
            }
        }
        ladder
    }
}

/// Whether an error means the model did not fit on the device.
pub fn is_resource_error(error: &EpisplitError) -> bool {
    mentions_resource(&error.to_string())
}

fn mentions_resource(text: &str) -> bool {
    let text = text.to_lowercase();
    ["out of memory", "cuda", "cublas", "cudnn"]
        .iter()
        .any(|needle| text.contains(needle))
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    segments: Vec<SpeechSegment>,
}

/// [`Transcriber`] for `/v1/audio/transcriptions` servers.
#[derive(Debug, Clone)]
pub struct WhisperHttpTranscriber {
    options: SpeechOptions,
}

impl WhisperHttpTranscriber {
    pub fn new(options: SpeechOptions) -> Self {
        Self { options }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/v1/{endpoint}", self.options.host.trim_end_matches('/'))
    }

    fn multipart_body(&self, boundary: &str, wav: &[u8], model: &SpeechModel) -> Vec<u8> {
        let mut fields = vec![
            ("model", model.model.clone()),
            ("response_format", "verbose_json".to_string()),
        ];
        if model.device != "auto" {
            fields.push(("device", model.device.clone()));
        }
        if let Some(language) = &self.options.language {
            fields.push(("language", language.clone()));
        }

        let mut body = Vec::with_capacity(wav.len() + 1024);
        for (name, value) in fields {
            body.extend_from_slice(
                format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"window.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(wav);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        body
    }

    fn post(&self, wav: &[u8], model: &SpeechModel) -> Result<Vec<SpeechSegment>, EpisplitError> {
        let boundary = "episplit-audio-boundary";
        let body = self.multipart_body(boundary, wav, model);
        let response = ureq::post(&self.url("audio/transcriptions"))
            .set("Content-Type", &format!("multipart/form-data; boundary={boundary}"))
            .timeout(Duration::from_secs(self.options.request_timeout_secs))
            .send_bytes(&body);
        match response {
            Ok(response) => {
                let transcription: VerboseTranscription = response.into_json()?;
                Ok(transcription.segments)
            }
            // Server-side model errors carry the reason in the body.
            Err(ureq::Error::Status(status, response)) if status >= 500 => {
                let reason = response.into_string().unwrap_or_default();
                if mentions_resource(&reason) {
                    Err(EpisplitError::InvalidResponse {
                        service: "whisper".into(),
                        reason: format!("HTTP {status}: {reason}"),
                    })
                } else {
                    Err(EpisplitError::HttpStatus {
                        url: self.url("audio/transcriptions"),
                        status,
                    })
                }
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl Transcriber for WhisperHttpTranscriber {
    fn check_available(&self) -> Result<(), EpisplitError> {
        ureq::get(&self.url("models"))
            .timeout(Duration::from_secs(self.options.probe_timeout_secs))
            .call()
            .map(|_| ())
            .map_err(|e| EpisplitError::unavailable("speech", format!("transcription server not reachable: {e}")))
    }

    fn transcribe(&self, wav: &[u8], model: &SpeechModel) -> Result<Vec<SpeechSegment>, EpisplitError> {
        retry_with_backoff(&self.options.retry, EpisplitError::is_transient, || self.post(wav, model))
    }
}

/// Encode mono samples as 16-bit PCM WAV.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, EpisplitError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_error = |e: hound::Error| EpisplitError::AudioDecodeError(format!("WAV encoding failed: {e}"));

    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        writer.write_sample(value).map_err(wav_error)?;
    }
    writer.finalize().map_err(wav_error)?;
    Ok(cursor.into_inner())
}

pub struct SpeechDetector {
    transcriber: Arc<dyn Transcriber>,
    options: SpeechOptions,
    ladder: Mutex<CandidateLadder<SpeechModel>>,
}

impl SpeechDetector {
    pub fn new(options: SpeechOptions) -> Self {
        let transcriber = WhisperHttpTranscriber::new(options.clone());
        Self::with_transcriber(Arc::new(transcriber), options)
    }

    pub fn with_transcriber(transcriber: Arc<dyn Transcriber>, options: SpeechOptions) -> Self {
        let ladder = Mutex::new(CandidateLadder::new(options.model_ladder()));
        Self {
            transcriber,
            options,
            ladder,
        }
    }

    /// The model currently in use, or `None` once every candidate failed.
    pub fn current_model(&self) -> Option<SpeechModel> {
        self.ladder.lock().ok().and_then(|ladder| ladder.current().cloned())
    }

    /// Transcribe with the current model, stepping down the ladder on
    /// resource errors.
    fn transcribe_with_downgrade(&self, wav: &[u8]) -> Result<Vec<SpeechSegment>, EpisplitError> {
        loop {
            let Some(model) = self.current_model() else {
                return Err(EpisplitError::unavailable("speech", "every model candidate failed"));
            };
            match self.transcriber.transcribe(wav, &model) {
                Err(error) if is_resource_error(&error) => {
                    let advanced = self
                        .ladder
                        .lock()
                        .map(|mut ladder| ladder.advance())
                        .unwrap_or(false);
                    match self.current_model() {
                        Some(next) if advanced => log::warn!(
                            "Whisper {} on {} failed ({error}), falling back to {} on {}",
                            model.model,
                            model.device,
                            next.model,
                            next.device
                        ),
                        _ => return Err(error),
                    }
                }
                other => return other,
            }
        }
    }

    /// Transcript segments of one window in absolute time.
    pub fn transcribe_window(
        &self,
        ctx: &DetectionContext<'_>,
        window: &SearchWindow,
    ) -> Result<Vec<SpeechSegment>, EpisplitError> {
        let Some(range) = window_range(window) else {
            return Ok(Vec::new());
        };
        let samples = ctx.scanner.pcm(ctx.path(), range, SPEECH_SAMPLE_RATE)?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        let wav = encode_wav(&samples, SPEECH_SAMPLE_RATE)?;
        let mut segments = self.transcribe_with_downgrade(&wav)?;
        for segment in &mut segments {
            segment.start += window.start_time;
            segment.end += window.start_time;
            segment.text = segment.text.trim().to_lowercase();
        }
        Ok(segments)
    }

    /// Segments containing a closing phrase, in time order.
    pub fn episode_end_markers(segments: &[SpeechSegment]) -> Vec<&SpeechSegment> {
        let mut markers: Vec<&SpeechSegment> = segments.iter().filter(|s| s.episode_end_phrase().is_some()).collect();
        markers.sort_by(|a, b| a.start.total_cmp(&b.start));
        markers
    }

    fn marker_hit(&self, window: &SearchWindow, marker: &SpeechSegment) -> WindowHit {
        log::info!(
            "Window {:.1}-{:.1}m: found '{}' at {:.1}m (ends at {:.1}m)",
            window.start_time / 60.0,
            window.end_time / 60.0,
            marker.text,
            marker.start / 60.0,
            marker.end / 60.0
        );
        WindowHit::new(marker.end, self.options.hit_confidence)
            .with_meta("source", "speech_episode_end")
            .with_meta("window_source", window.source.as_str())
            .with_meta("episode_end_phrase", marker.text.as_str())
            .with_meta("phrase_start_time", marker.start)
            .with_meta("phrase_end_time", marker.end)
    }
}

fn speech_fallback(window: &SearchWindow) -> WindowHit {
    WindowHit::fallback(window.center_time, FALLBACK_CONFIDENCE, "speech_fallback")
        .with_meta("window_source", window.source.as_str())
}

impl Detector for SpeechDetector {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn check_available(&self) -> Result<(), EpisplitError> {
        self.transcriber.check_available()
    }
}

impl WindowedDetector for SpeechDetector {
    fn detect_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<WindowHit>, EpisplitError> {
        Ok(windows
            .iter()
            .map(|window| match self.transcribe_window(ctx, window) {
                Ok(segments) => match Self::episode_end_markers(&segments).first() {
                    Some(marker) => self.marker_hit(window, marker),
                    None => {
                        log::debug!(
                            "Window {:.1}-{:.1}m: no episode-end phrases detected",
                            window.start_time / 60.0,
                            window.end_time / 60.0
                        );
                        speech_fallback(window)
                    }
                },
                Err(error) => {
                    log::warn!("speech: window {:.1}m failed: {error}", window.center_time / 60.0);
                    speech_fallback(window).with_meta("error", error.to_string())
                }
            })
            .collect())
    }
}

impl RawWindowedDetector for SpeechDetector {
    fn detect_raw_in_windows(
        &self,
        ctx: &DetectionContext<'_>,
        windows: &[SearchWindow],
    ) -> Result<Vec<RawDetection>, EpisplitError> {
        let mut detections = Vec::new();
        for (index, window) in windows.iter().enumerate() {
            let segments = match self.transcribe_window(ctx, window) {
                Ok(segments) => segments,
                Err(error) => {
                    log::warn!("speech: window {} failed: {error}", index + 1);
                    continue;
                }
            };
            for marker in Self::episode_end_markers(&segments) {
                detections.push(
                    RawDetection::new(marker.end, self.options.raw_score, "speech")
                        .with_meta("episode_end_phrase", marker.text.as_str())
                        .with_meta("phrase_start_time", marker.start),
                );
            }
        }
        log::info!("Speech detector: {} episode-end phrases", detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn segment(start: f64, end: f64, text: &str) -> SpeechSegment {
        SpeechSegment {
            start,
            end,
            text: text.to_string(),
            confidence: 0.0,
        }
    }

    #[test]
    fn closing_phrases_are_found_in_time_order() {
        let segments = vec![
            segment(50.0, 54.0, "Next time on Doctor Who"),
            segment(10.0, 12.0, "Stay tuned for scenes from our next episode"),
            segment(20.0, 22.0, "I'll be right back"),
        ];
        let markers = SpeechDetector::episode_end_markers(&segments);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].start, 10.0);
        assert_eq!(segments[0].episode_end_phrase(), Some("next time on"));
        assert_eq!(segments[2].episode_end_phrase(), None);
    }

    #[test]
    fn ladder_ends_on_cpu() {
        let ladder = SpeechOptions::new()
            .with_models(vec!["medium".into(), "small".into()])
            .with_device("cuda")
            .model_ladder();
        assert_eq!(
            ladder,
            vec![
                SpeechModel::new("medium", "cuda"),
                SpeechModel::new("small", "cuda"),
                SpeechModel::new("small", "cpu"),
            ]
        );
        assert_eq!(SpeechOptions::new().with_device("cpu").model_ladder().len(), 2);
    }

    #[test]
    fn resource_errors_are_recognized() {
        let oom = EpisplitError::InvalidResponse {
            service: "whisper".into(),
            reason: "CUDA out of memory".into(),
        };
        assert!(is_resource_error(&oom));
        assert!(!is_resource_error(&EpisplitError::HttpTransport("refused".into())));
    }

    struct OomUntilCpu {
        calls: AtomicUsize,
    }

    impl Transcriber for OomUntilCpu {
        fn check_available(&self) -> Result<(), EpisplitError> {
            Ok(())
        }

        fn transcribe(&self, _: &[u8], model: &SpeechModel) -> Result<Vec<SpeechSegment>, EpisplitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if model.device == "cpu" {
                Ok(vec![segment(1.0, 2.0, "stay tuned")])
            } else {
                Err(EpisplitError::InvalidResponse {
                    service: "whisper".into(),
                    reason: "CUDA error: out of memory".into(),
                })
            }
        }
    }

    #[test]
    fn downgrade_walks_the_ladder() {
        let options = SpeechOptions::new().with_device("cuda");
        let detector = SpeechDetector::with_transcriber(
            Arc::new(OomUntilCpu {
                calls: AtomicUsize::new(0),
            }),
            options,
        );
        let segments = detector.transcribe_with_downgrade(b"RIFF").unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(detector.current_model(), Some(SpeechModel::new("tiny", "cpu")));
    }

    #[test]
    fn wav_has_riff_header() {
        let wav = encode_wav(&[0.0, 0.5, -0.5], SPEECH_SAMPLE_RATE).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 6);
    }

    #[test]
    fn multipart_body_carries_model_and_file() {
        let transcriber = WhisperHttpTranscriber::new(SpeechOptions::default());
        let body = transcriber.multipart_body("b", b"DATA", &SpeechModel::new("base", "cpu"));
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("name=\"model\"\r\n\r\nbase"));
        assert!(text.contains("name=\"device\"\r\n\r\ncpu"));
        assert!(text.contains("DATA\r\n--b--"));
    }
}

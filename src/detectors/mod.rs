//! Boundary detectors.
//!
//! Each detector implements [`Detector`](crate::Detector) plus whichever of
//! the capability traits it supports:
//!
//! | detector | whole-file | windowed | raw |
//! |---|---|---|---|
//! | [`ChapterDetector`] | yes | | |
//! | [`SilenceDetector`] | yes | yes | yes |
//! | [`BlackFrameDetector`] | yes | yes | yes |
//! | [`SceneChangeDetector`] | | yes | yes |
//! | [`ImageHashDetector`] | yes | | |
//! | [`AudioFingerprintDetector`] | yes | yes | |
//! | [`IntroDetector`] | yes | | |
//! | [`LlmDetector`] | yes | | yes |
//! | [`SpeechDetector`] | | yes | yes |

pub mod audio_fingerprint;
pub mod black_frame;
pub mod chapter;
pub mod image_hash;
pub mod intro;
pub mod llm;
pub mod scene_change;
pub mod silence;
pub mod speech;

pub use audio_fingerprint::{AudioFingerprintDetector, AudioFingerprintOptions};
pub use black_frame::{BlackFrameDetector, BlackFrameOptions};
pub use chapter::{ChapterAnalysis, ChapterDetector, ChapterOptions};
pub use image_hash::{ImageHashDetector, ImageHashOptions};
pub use intro::{IntroDetector, IntroOptions};
pub use llm::{DetectionPattern, FrameClassifier, LlmDetector, LlmOptions, OllamaClient, PrecisionOptions};
pub use scene_change::{SceneChangeDetector, SceneChangeOptions};
pub use silence::{SilenceDetector, SilenceOptions};
pub use speech::{SpeechDetector, SpeechOptions, Transcriber, WhisperHttpTranscriber};

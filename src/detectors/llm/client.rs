//! Vision-model frame classification.

use std::io::Cursor;
use std::sync::LazyLock;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, ImageFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::detectors::llm::pattern::DetectionType;
use crate::error::EpisplitError;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// Prompt sent with every frame.
pub const FRAME_PROMPT: &str = "Analyze this frame from a video file. Answer the following questions with YES or NO:

1. Does this frame show credits (cast names, production crew, etc.)?
2. Does this frame show a title card or episode title?
3. Does this frame show a \"Previously on...\" recap sequence?
4. Does this frame appear to be part of an intro sequence?
5. Does this frame appear to be part of an outro/ending sequence?
6. Does this frame show a network or production company logo on its own?

Respond in this exact format:
CREDITS: YES/NO
TITLE_CARD: YES/NO
PREVIOUSLY_ON: YES/NO
INTRO: YES/NO
OUTRO: YES/NO
LOGO: YES/NO
CONFIDENCE: HIGH/MEDIUM/LOW";

static ANSWER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(CREDITS|TITLE_CARD|PREVIOUSLY_ON|INTRO|OUTRO|LOGO):\s*(YES|NO)").expect("answer regex should compile")
});

static CONFIDENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CONFIDENCE:\s*(HIGH|MEDIUM|LOW)").expect("confidence regex should compile"));

/// Confidence when the model does not state one.
pub const DEFAULT_CONFIDENCE: f64 = 0.6;

/// A vision model that answers [`FRAME_PROMPT`] for a frame.
pub trait FrameClassifier: Send + Sync {
    /// Check the model can be queried.
    fn check_available(&self) -> Result<(), EpisplitError>;

    /// Raw model response for one frame.
    fn classify(&self, frame: &DynamicImage) -> Result<String, EpisplitError>;
}

/// Parsed answer for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameAnalysis {
    pub timestamp: f64,
    pub is_credits: bool,
    pub is_title_card: bool,
    pub is_previously_on: bool,
    pub is_intro: bool,
    pub is_outro: bool,
    pub is_logo: bool,
    pub confidence: f64,
    #[serde(skip)]
    pub raw_response: String,
}

impl FrameAnalysis {
    /// Parse a `KEY: YES/NO` response. Missing keys read as `NO`.
    ///
    /// ```
    /// use episplit::detectors::llm::FrameAnalysis;
    ///
    /// let analysis = FrameAnalysis::parse(12.0, "Credits: yes\nLOGO: NO\nCONFIDENCE: HIGH");
    /// assert!(analysis.is_credits && !analysis.is_logo);
    /// assert_eq!(analysis.confidence, 0.9);
    /// ```
    pub fn parse(timestamp: f64, response: &str) -> Self {
        let upper = response.to_uppercase();
        let mut analysis = Self {
            timestamp,
            is_credits: false,
            is_title_card: false,
            is_previously_on: false,
            is_intro: false,
            is_outro: false,
            is_logo: false,
            confidence: DEFAULT_CONFIDENCE,
            raw_response: response.to_string(),
        };

        let mut seen = Vec::new();
        for caps in ANSWER.captures_iter(&upper) {
            let key = &caps[1];
            // First answer per key wins.
            if seen.contains(&key.to_string()) {
                continue;
            }
            seen.push(key.to_string());
            let yes = &caps[2] == "YES";
            match key {
                "CREDITS" => analysis.is_credits = yes,
                "TITLE_CARD" => analysis.is_title_card = yes,
                "PREVIOUSLY_ON" => analysis.is_previously_on = yes,
                "INTRO" => analysis.is_intro = yes,
                "OUTRO" => analysis.is_outro = yes,
                "LOGO" => analysis.is_logo = yes,
                _ => {}
            }
        }
        if let Some(caps) = CONFIDENCE.captures(&upper) {
            analysis.confidence = match &caps[1] {
                "HIGH" => 0.9,
                "MEDIUM" => 0.7,
                _ => 0.5,
            };
        }
        analysis
    }

    /// Whether any boundary-indicating flag is set.
    pub fn is_boundary(&self) -> bool {
        self.is_credits || self.is_title_card || self.is_previously_on || self.is_intro || self.is_outro || self.is_logo
    }

    pub fn has(&self, kind: DetectionType) -> bool {
        match kind {
            DetectionType::Credits => self.is_credits,
            DetectionType::Logo => self.is_logo,
            DetectionType::Outro => self.is_outro,
            DetectionType::Intro => self.is_intro,
            DetectionType::TitleCard => self.is_title_card,
            DetectionType::PreviouslyOn => self.is_previously_on,
        }
    }

    /// Flags as metadata-ready JSON.
    pub fn flags(&self) -> serde_json::Value {
        json!({
            "is_credits": self.is_credits,
            "is_title_card": self.is_title_card,
            "is_previously_on": self.is_previously_on,
            "is_intro": self.is_intro,
            "is_outro": self.is_outro,
            "is_logo": self.is_logo,
        })
    }
}

/// Connection settings for an Ollama server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaOptions {
    pub host: String,
    pub model: String,
    pub request_timeout_secs: u64,
    /// Timeout of the availability check.
    pub probe_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for OllamaOptions {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "llava:7b-v1.6-mistral-q4_K_M".to_string(),
            request_timeout_secs: 60,
            probe_timeout_secs: 5,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// [`FrameClassifier`] backed by Ollama's REST API.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    options: OllamaOptions,
}

impl OllamaClient {
    pub fn new(options: OllamaOptions) -> Self {
        Self { options }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/{endpoint}", self.options.host.trim_end_matches('/'))
    }

    /// Installed model names.
    pub fn list_models(&self) -> Result<Vec<String>, EpisplitError> {
        let tags: TagsResponse = ureq::get(&self.url("tags"))
            .timeout(Duration::from_secs(self.options.probe_timeout_secs))
            .call()?
            .into_json()?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    fn generate(&self, image_b64: &str) -> Result<String, EpisplitError> {
        let body = json!({
            "model": self.options.model,
            "prompt": FRAME_PROMPT,
            "images": [image_b64],
            "stream": false,
        });
        let response: GenerateResponse = ureq::post(&self.url("generate"))
            .timeout(Duration::from_secs(self.options.request_timeout_secs))
            .send_json(body)?
            .into_json()?;
        Ok(response.response)
    }
}

/// JPEG-encode a frame as base64.
pub(crate) fn encode_jpeg_base64(frame: &DynamicImage) -> Result<String, EpisplitError> {
    let mut bytes = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(frame.to_rgb8()).write_to(&mut bytes, ImageFormat::Jpeg)?;
    Ok(STANDARD.encode(bytes.into_inner()))
}

/// Whether an installed model name satisfies the configured one.
fn model_matches(installed: &str, wanted: &str) -> bool {
    !installed.is_empty() && (installed.contains(wanted) || wanted.contains(installed))
}

impl FrameClassifier for OllamaClient {
    fn check_available(&self) -> Result<(), EpisplitError> {
        let models = self
            .list_models()
            .map_err(|e| EpisplitError::unavailable("llm_vision", format!("Ollama not reachable: {e}")))?;
        if models.iter().any(|name| model_matches(name, &self.options.model)) {
            Ok(())
        } else {
            Err(EpisplitError::unavailable(
                "llm_vision",
                format!("model {} not found in Ollama (available: {})", self.options.model, models.join(", ")),
            ))
        }
    }

    fn classify(&self, frame: &DynamicImage) -> Result<String, EpisplitError> {
        let image = encode_jpeg_base64(frame)?;
        retry_with_backoff(&self.options.retry, EpisplitError::is_transient, || self.generate(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_patterns_compile() {
        assert!(ANSWER.is_match("LOGO: YES"));
        assert!(CONFIDENCE.is_match("CONFIDENCE: LOW"));
    }

    #[test]
    fn parses_every_flag() {
        let response = "CREDITS: NO\nTITLE_CARD: YES\nPREVIOUSLY_ON: NO\nINTRO: YES\nOUTRO: NO\nLOGO: YES\nCONFIDENCE: MEDIUM";
        let analysis = FrameAnalysis::parse(30.0, response);
        assert!(!analysis.is_credits);
        assert!(analysis.is_title_card);
        assert!(analysis.is_intro);
        assert!(analysis.is_logo);
        assert_eq!(analysis.confidence, 0.7);
        assert!(analysis.is_boundary());
    }

    #[test]
    fn unparseable_response_is_negative_with_default_confidence() {
        let analysis = FrameAnalysis::parse(0.0, "I see a man walking a dog.");
        assert!(!analysis.is_boundary());
        assert_eq!(analysis.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn low_confidence_and_loose_spacing() {
        let analysis = FrameAnalysis::parse(0.0, "outro:yes\nconfidence:   low");
        assert!(analysis.is_outro);
        assert_eq!(analysis.confidence, 0.5);
    }

    #[test]
    fn model_names_match_partially() {
        assert!(model_matches("llava:7b-v1.6-mistral-q4_K_M", "llava:7b-v1.6-mistral-q4_K_M"));
        assert!(model_matches("llava:latest", "llava"));
        assert!(!model_matches("", "llava"));
        assert!(!model_matches("moondream:latest", "llava"));
    }

    #[test]
    fn frames_encode_as_jpeg() {
        let frame = DynamicImage::ImageRgb8(image::RgbImage::new(16, 16));
        let encoded = encode_jpeg_base64(&frame).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }
}

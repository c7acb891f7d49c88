//! Chapter-based episode detection.
//!
//! Chapters are trusted only when their titles or durations clearly mark
//! episodes. Files whose chapters mark commercials, scenes or extras yield
//! nothing. "Commercial 1" markers are a special case: broadcast recordings
//! put one at the first ad break of every episode, which gives episode
//! regions even though the chapters themselves are not episodes.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::boundary::EpisodeBoundary;
use crate::detector::{DetectionContext, Detector, WholeFileDetector};
use crate::error::EpisplitError;
use crate::timeline::{Chapter, MediaTimeline};

const EPISODE_TITLE_PATTERNS: &[&str] = &[
    r"\bepisode\s*\d+",
    r"\bep\.?\s*\d+",
    r"\be\d+\b",
    r"\bpart\s*\d+",
    r"\bpart\s+(one|two|three|four|five|six|seven|eight|nine|ten)\b",
    r"^\d+\s*[-:.]\s*\d+$",
    r"\bs\d+\s*e\d+",
];

const NON_EPISODE_PATTERNS: &[&str] = &[
    r"^menu$",
    r"^scene\s+selection",
    r"^scene\s*\d*$",
    r"^chapter\s*\d*$",
    r"^bonus",
    r"^extras?$",
    r"^special\s+features?",
    r"^deleted\s+scenes?",
    r"^commentary",
    r"^trailer",
    r"^preview",
    r"^commercial\s+\d+",
    r"^advertisement",
    r"^ad\s*break",
    r"^break\s*\d*$",
    r"^intermission",
    r"^recap",
    r"^opening\s*(credits?)?$",
    r"^closing\s*(credits?)?$",
    r"^end\s*credits?$",
    r"^credits?$",
    r"^intro$",
    r"^outro$",
];

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){p}")).expect("chapter title regex should compile"))
        .collect()
}

static EPISODE_TITLES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(EPISODE_TITLE_PATTERNS));
static NON_EPISODE_TITLES: LazyLock<Vec<Regex>> = LazyLock::new(|| compile_all(NON_EPISODE_PATTERNS));
static COMMERCIAL_ONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^commercial\s*1$").expect("commercial marker regex should compile"));
static ANY_COMMERCIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^commercial\s*\d+$").expect("commercial regex should compile"));

/// Chapter detector tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterOptions {
    /// Confidence of boundaries taken from episode chapters.
    pub confidence: f64,
    /// Confidence of boundaries derived from "Commercial 1" markers.
    pub commercial_confidence: f64,
    /// Shortest chapter considered commercial-length, in seconds.
    pub commercial_min_duration: f64,
    /// Longest chapter considered commercial-length, in seconds.
    pub commercial_max_duration: f64,
}

impl Default for ChapterOptions {
    fn default() -> Self {
        Self {
            confidence: 0.9,
            commercial_confidence: 0.85,
            commercial_min_duration: 15.0,
            commercial_max_duration: 300.0,
        }
    }
}

/// Outcome of the chapter structure analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterAnalysis {
    pub is_episode_structure: bool,
    pub reason: String,
    /// Chapters judged to be whole episodes, in file order.
    pub episode_chapters: Vec<Chapter>,
}

impl ChapterAnalysis {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_episode_structure: false,
            reason: reason.into(),
            episode_chapters: Vec::new(),
        }
    }

    fn accepted(reason: impl Into<String>, chapters: Vec<Chapter>) -> Self {
        Self {
            is_episode_structure: true,
            reason: reason.into(),
            episode_chapters: chapters,
        }
    }
}

struct ChapterTraits<'a> {
    chapter: &'a Chapter,
    episode_title: bool,
    non_episode: bool,
    episode_length: bool,
    commercial_length: bool,
}

/// Detects episodes from chapter markers.
///
/// ```
/// use episplit::{ChapterDetector, MediaTimeline, timeline::Chapter};
///
/// let timeline = MediaTimeline::new("show.mkv", 2700.0).with_chapters(vec![
///     Chapter::new(0, Some("Episode 1"), 0.0, 1350.0),
///     Chapter::new(1, Some("Episode 2"), 1350.0, 2700.0),
/// ]);
/// let boundaries = ChapterDetector::new().detect_chapters(&timeline);
/// assert_eq!(boundaries.len(), 2);
/// assert_eq!(boundaries[0].end_time, 1350.0);
/// ```
#[derive(Debug, Clone)]
pub struct ChapterDetector {
    options: ChapterOptions,
    min_episode_length: f64,
    max_episode_length: f64,
}

impl Default for ChapterDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChapterDetector {
    pub fn new() -> Self {
        Self::with_options(ChapterOptions::default())
    }

    pub fn with_options(options: ChapterOptions) -> Self {
        Self {
            options,
            min_episode_length: crate::detector::DEFAULT_MIN_EPISODE_LENGTH,
            max_episode_length: crate::detector::DEFAULT_MAX_EPISODE_LENGTH,
        }
    }

    #[must_use]
    pub fn with_episode_length(mut self, min: f64, max: f64) -> Self {
        self.min_episode_length = min;
        self.max_episode_length = max;
        self
    }

    /// Episode boundaries from the timeline's chapters, or nothing when the
    /// chapters do not describe episodes.
    pub fn detect_chapters(&self, timeline: &MediaTimeline) -> Vec<EpisodeBoundary> {
        if timeline.chapters.is_empty() {
            log::debug!("No chapters found in file");
            return Vec::new();
        }
        log::info!("Found {} chapters in file", timeline.chapters.len());

        let commercial = self.detect_from_commercial_markers(timeline);
        if !commercial.is_empty() {
            log::info!("Detected {} episodes from 'Commercial 1' markers", commercial.len());
            return commercial;
        }

        let analysis = self.analyze(&timeline.chapters);
        if !analysis.is_episode_structure {
            log::info!("Chapters do not appear to indicate episodes: {}", analysis.reason);
            return Vec::new();
        }
        if analysis.episode_chapters.len() < 2 {
            return Vec::new();
        }

        let boundaries = self.chapters_to_boundaries(&analysis.episode_chapters);
        log::info!("Detected {} episode boundaries from chapters", boundaries.len());
        boundaries
    }

    fn detect_from_commercial_markers(&self, timeline: &MediaTimeline) -> Vec<EpisodeBoundary> {
        let markers = commercial_one_times(&timeline.chapters);
        if markers.is_empty() {
            return Vec::new();
        }
        log::debug!("Found {} 'Commercial 1' markers at {:?}", markers.len(), markers);

        let boundaries: Vec<EpisodeBoundary> = marker_regions(&markers, timeline.duration)
            .into_iter()
            .enumerate()
            .filter_map(|(i, (start, end))| {
                let duration = end - start;
                if duration < self.min_episode_length {
                    log::debug!("Episode {} too short ({:.1} min), skipping", i + 1, duration / 60.0);
                    return None;
                }
                if duration > self.max_episode_length {
                    log::debug!("Episode {} longer than max ({:.1} min), keeping", i + 1, duration / 60.0);
                }
                Some(
                    EpisodeBoundary::new(start, end, self.options.commercial_confidence, "chapter_commercial")
                        .with_meta("episode_index", i + 1)
                        .with_meta("detection_method", "commercial_1_marker"),
                )
            })
            .collect();

        if boundaries.len() < 2 {
            return Vec::new();
        }
        boundaries
    }

    fn classify<'c>(&self, chapter: &'c Chapter) -> ChapterTraits<'c> {
        let title = chapter.title_or_empty();
        let duration = chapter.duration();
        ChapterTraits {
            chapter,
            episode_title: EPISODE_TITLES.iter().any(|p| p.is_match(title)),
            non_episode: NON_EPISODE_TITLES.iter().any(|p| p.is_match(title)),
            episode_length: (self.min_episode_length..=self.max_episode_length).contains(&duration),
            commercial_length: (self.options.commercial_min_duration..=self.options.commercial_max_duration)
                .contains(&duration),
        }
    }

    /// Decide whether the chapters describe whole episodes.
    pub fn analyze(&self, chapters: &[Chapter]) -> ChapterAnalysis {
        if chapters.is_empty() {
            return ChapterAnalysis::rejected("No chapters found");
        }

        let traits: Vec<ChapterTraits<'_>> = chapters.iter().map(|c| self.classify(c)).collect();
        let total = traits.len() as f64;
        let count = |f: fn(&ChapterTraits<'_>) -> bool| traits.iter().filter(|t| f(t)).count();

        let episode_titles = count(|t| t.episode_title);
        let non_episode = count(|t| t.non_episode);
        let episode_length = count(|t| t.episode_length);
        let commercial_length = count(|t| t.commercial_length);

        log::debug!(
            "Chapter analysis: {} total, {} episode titles, {} non-episode, {} episode-length, {} commercial-length",
            traits.len(),
            episode_titles,
            non_episode,
            episode_length,
            commercial_length
        );

        let pick = |f: &dyn Fn(&ChapterTraits<'_>) -> bool| -> Vec<Chapter> {
            traits.iter().filter(|t| f(t)).map(|t| t.chapter.clone()).collect()
        };

        if episode_titles >= 2 {
            let chosen = pick(&|t| t.episode_title && !t.non_episode);
            if chosen.len() >= 2 {
                return ChapterAnalysis::accepted(
                    format!("Found {} chapters with episode titles", chosen.len()),
                    chosen,
                );
            }
        }

        if commercial_length as f64 > total * 0.5 {
            return ChapterAnalysis::rejected(format!(
                "{commercial_length}/{} chapters have commercial-like duration",
                traits.len()
            ));
        }

        if non_episode as f64 > total * 0.3 {
            return ChapterAnalysis::rejected(format!(
                "{non_episode}/{} chapters match non-episode patterns",
                traits.len()
            ));
        }

        if episode_length >= 2 && episode_length == traits.len() {
            let chosen = pick(&|t| t.episode_length && !t.non_episode);
            if chosen.len() >= 2 {
                return ChapterAnalysis::accepted(
                    format!("All {} chapters have episode-appropriate duration", chosen.len()),
                    chosen,
                );
            }
        }

        let chosen = pick(&|t| t.episode_title && !t.non_episode && t.episode_length);
        if chosen.len() >= 2 {
            return ChapterAnalysis::accepted(
                format!("Found {} chapters with episode titles and duration", chosen.len()),
                chosen,
            );
        }

        ChapterAnalysis::rejected("Chapter structure does not clearly indicate episodes")
    }

    fn chapters_to_boundaries(&self, chapters: &[Chapter]) -> Vec<EpisodeBoundary> {
        chapters
            .iter()
            .enumerate()
            .filter_map(|(i, chapter)| {
                let title = chapter
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Episode {}", i + 1));
                let duration = chapter.duration();
                if duration < self.min_episode_length {
                    log::debug!("Skipping chapter '{title}': too short ({duration:.1}s)");
                    return None;
                }
                if duration > self.max_episode_length {
                    log::warn!("Chapter '{title}' exceeds max episode length ({duration:.1}s)");
                }
                Some(
                    EpisodeBoundary::new(chapter.start, chapter.end, self.options.confidence, "chapter")
                        .with_meta("title", title)
                        .with_meta("chapter_index", i)
                        .with_meta("chapter_id", chapter.id),
                )
            })
            .collect()
    }

    /// Quick check used to decide whether a file is worth queueing.
    pub fn has_multi_episode_chapters(&self, timeline: &MediaTimeline) -> bool {
        if timeline.chapters.len() < 2 {
            return false;
        }
        let analysis = self.analyze(&timeline.chapters);
        analysis.is_episode_structure && analysis.episode_chapters.len() >= 2
    }

    /// Estimated episode regions for narrowing other detectors.
    ///
    /// Uses "Commercial 1" markers when present, else equal division when
    /// the episode count is known.
    pub fn estimated_episode_regions(
        &self,
        timeline: &MediaTimeline,
        expected_episodes: Option<usize>,
    ) -> Vec<(f64, f64)> {
        let markers = commercial_one_times(&timeline.chapters);
        if !markers.is_empty() {
            return marker_regions(&markers, timeline.duration);
        }
        match expected_episodes {
            Some(n) if n > 1 => {
                let length = timeline.duration / n as f64;
                (0..n).map(|i| (i as f64 * length, (i + 1) as f64 * length)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Plain `(start, end)` episode regions from true episode chapters, for
    /// search window planning. Empty when the chapters are commercial
    /// markers or not episodes at all.
    pub fn episode_regions(&self, timeline: &MediaTimeline) -> Vec<(f64, f64)> {
        let boundaries = self.detect_chapters(timeline);
        if boundaries.first().is_some_and(|b| b.source == "chapter_commercial") {
            return Vec::new();
        }
        boundaries.iter().map(|b| (b.start_time, b.end_time)).collect()
    }

    /// Total length of "Commercial N" chapters in each episode region
    /// delimited by "Commercial 1" markers. `None` without markers.
    pub fn commercial_times_per_episode(&self, timeline: &MediaTimeline) -> Option<Vec<f64>> {
        let markers = commercial_one_times(&timeline.chapters);
        if markers.is_empty() {
            return None;
        }
        let regions = marker_regions(&markers, timeline.duration);
        let commercials: Vec<&Chapter> = timeline
            .chapters
            .iter()
            .filter(|c| ANY_COMMERCIAL.is_match(c.title_or_empty().trim()))
            .collect();

        Some(
            regions
                .iter()
                .enumerate()
                .map(|(i, &(start, end))| {
                    let last = i + 1 == regions.len();
                    commercials
                        .iter()
                        .filter(|c| c.start >= start && (c.start < end || (last && c.start <= end)))
                        .map(|c| c.duration())
                        .sum()
                })
                .collect(),
        )
    }

    /// Human-readable summary of the chapter analysis.
    pub fn chapter_summary(&self, timeline: &MediaTimeline) -> String {
        if timeline.chapters.is_empty() {
            return "No chapters found".to_string();
        }
        let analysis = self.analyze(&timeline.chapters);
        let mut lines = vec![format!("Total chapters: {}", timeline.chapters.len())];
        for chapter in &timeline.chapters {
            lines.push(format!(
                "  - {}: {:.1} min",
                chapter.title.as_deref().unwrap_or("(untitled)"),
                chapter.duration() / 60.0
            ));
        }
        lines.push(format!("Episode structure: {}", analysis.is_episode_structure));
        lines.push(format!("Reason: {}", analysis.reason));
        lines.join("\n")
    }
}

/// Start times of "Commercial 1" chapters.
pub fn commercial_one_times(chapters: &[Chapter]) -> Vec<f64> {
    chapters
        .iter()
        .filter(|c| COMMERCIAL_ONE.is_match(c.title_or_empty().trim()))
        .map(|c| c.start)
        .collect()
}

fn marker_regions(markers: &[f64], total_duration: f64) -> Vec<(f64, f64)> {
    let starts = std::iter::once(0.0).chain(markers.iter().copied());
    let ends = markers.iter().copied().chain(std::iter::once(total_duration));
    starts.zip(ends).collect()
}

impl Detector for ChapterDetector {
    fn name(&self) -> &'static str {
        "chapter"
    }
}

impl WholeFileDetector for ChapterDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Result<Vec<EpisodeBoundary>, EpisplitError> {
        Ok(self
            .clone()
            .with_episode_length(ctx.min_episode_length, ctx.max_episode_length)
            .detect_chapters(ctx.timeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_patterns_compile() {
        assert_eq!(EPISODE_TITLES.len(), EPISODE_TITLE_PATTERNS.len());
        assert_eq!(NON_EPISODE_TITLES.len(), NON_EPISODE_PATTERNS.len());
        assert!(COMMERCIAL_ONE.is_match("Commercial 1"));
        assert!(ANY_COMMERCIAL.is_match("commercial 12"));
    }

    fn timeline(total: f64, chapters: &[(&str, f64, f64)]) -> MediaTimeline {
        MediaTimeline::new("show.mkv", total).with_chapters(
            chapters
                .iter()
                .enumerate()
                .map(|(i, &(title, start, end))| Chapter::new(i, Some(title), start, end))
                .collect(),
        )
    }

    #[test]
    fn titled_episode_chapters_become_boundaries() {
        let t = timeline(2700.0, &[("Episode 1", 0.0, 1350.0), ("Episode 2", 1350.0, 2700.0)]);
        let boundaries = ChapterDetector::new().detect_chapters(&t);
        assert_eq!(boundaries.len(), 2);
        assert_eq!((boundaries[0].start_time, boundaries[0].end_time), (0.0, 1350.0));
        assert_eq!((boundaries[1].start_time, boundaries[1].end_time), (1350.0, 2700.0));
        assert!(boundaries.iter().all(|b| b.source == "chapter" && b.confidence == 0.9));
        assert_eq!(boundaries[1].metadata["title"], "Episode 2");
    }

    #[test]
    fn commercial_chapters_are_not_episodes() {
        let t = timeline(
            900.0,
            &[
                ("Scene 1", 0.0, 200.0),
                ("Commercial 2", 200.0, 320.0),
                ("Scene 2", 320.0, 500.0),
                ("Commercial 3", 500.0, 620.0),
                ("Scene 3", 620.0, 900.0),
            ],
        );
        assert!(ChapterDetector::new().detect_chapters(&t).is_empty());
    }

    #[test]
    fn commercial_one_markers_give_regions() {
        let t = timeline(
            3600.0,
            &[
                ("Intro", 0.0, 300.0),
                ("Commercial 1", 1800.0, 1950.0),
                ("Commercial 2", 2400.0, 2520.0),
            ],
        );
        let detector = ChapterDetector::new();
        let boundaries = detector.detect_chapters(&t);
        assert_eq!(boundaries.len(), 2);
        assert_eq!(boundaries[0].source, "chapter_commercial");
        assert_eq!(boundaries[0].end_time, 1800.0);
        assert!(detector.episode_regions(&t).is_empty());

        let commercials = detector.commercial_times_per_episode(&t).unwrap();
        assert_eq!(commercials, vec![0.0, 270.0]);
        assert_eq!(detector.estimated_episode_regions(&t, None), vec![(0.0, 1800.0), (1800.0, 3600.0)]);
    }

    #[test]
    fn equal_length_untitled_chapters_are_episodes() {
        let t = timeline(
            3600.0,
            &[("Pilot", 0.0, 1200.0), ("The Return", 1200.0, 2400.0), ("Finale", 2400.0, 3600.0)],
        );
        let detector = ChapterDetector::new();
        assert!(detector.has_multi_episode_chapters(&t));
        assert_eq!(detector.episode_regions(&t).len(), 3);
        assert!(detector.chapter_summary(&t).contains("Episode structure: true"));
    }

    #[test]
    fn estimated_regions_fall_back_to_equal_division() {
        let t = MediaTimeline::new("show.mkv", 3000.0);
        let regions = ChapterDetector::new().estimated_episode_regions(&t, Some(2));
        assert_eq!(regions, vec![(0.0, 1500.0), (1500.0, 3000.0)]);
    }
}

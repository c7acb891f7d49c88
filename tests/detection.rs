//! End-to-end detection runs over scripted media.
//!
//! No media files are read: every scan is answered by `common::ScriptedMedia`.

mod common;

use std::sync::{Arc, Mutex};

use common::{LogoSpotter, ScriptedMedia, assert_contiguous};
use episplit::detector::FALLBACK_CONFIDENCE;
use episplit::timeline::Chapter;
use episplit::{
    DetectionConfig, DetectionContext, MediaTimeline, Outcome, Pipeline, ProgressCallback, ProgressInfo, ScanCache,
    SearchWindowDeterminer, SilenceDetector, Stage, Strategy, WindowEvidence, WindowedDetector,
};

fn run(config: DetectionConfig, media: ScriptedMedia, timeline: &MediaTimeline) -> episplit::DetectionReport {
    Pipeline::new(config.with_workers(1))
        .with_scanner(Arc::new(media))
        .with_classifier(Arc::new(LogoSpotter))
        .run_timeline(timeline)
        .expect("scripted runs never fail")
}

// ── Clustered windows ──────────────────────────────────────────────

#[test]
fn three_episodes_split_at_silence_and_black() {
    let timeline = MediaTimeline::new("Show.S02E04-E06.mkv", 4050.0);
    let media = ScriptedMedia::new()
        .silence(1346.0, 1350.0)
        .black(1347.0, 1349.0)
        .silence(2698.0, 2702.0)
        .black(2699.0, 2701.0);
    let report = run(DetectionConfig::new(), media, &timeline);

    assert!(report.is_split());
    assert_eq!(report.episodes.len(), 3);
    let spans: Vec<(f64, f64)> = report.episodes.iter().map(|e| (e.start_time, e.end_time)).collect();
    assert_contiguous(&spans, 4050.0);

    assert!((report.episodes[0].end_time - 1348.0).abs() < 2.0);
    assert!((report.episodes[1].end_time - 2700.0).abs() < 2.0);
    for episode in &report.episodes[..2] {
        assert!(episode.sources.iter().any(|s| s == "silence"), "{:?}", episode.sources);
        assert!(episode.sources.iter().any(|s| s == "black_frame"), "{:?}", episode.sources);
    }
}

#[test]
fn accepted_episodes_respect_the_minimum_length() {
    let timeline = MediaTimeline::new("Show.S01E01-E03.mkv", 4050.0);
    let media = ScriptedMedia::new().silence(1340.0, 1344.0).silence(2705.0, 2709.0);
    let config = DetectionConfig::new();
    let min = config.min_episode_length;
    let report = run(config, media, &timeline);

    assert!(report.is_split());
    for episode in &report.episodes {
        assert!(episode.duration() >= 0.5 * min, "{:.1}s episode", episode.duration());
    }
    let total: f64 = report.split_points.iter().map(|(_, duration)| duration).sum();
    assert!((total - 4050.0).abs() < 1e-6);
}

#[test]
fn detection_is_deterministic() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let media = ScriptedMedia::new()
        .silence(1290.0, 1293.0)
        .silence(1346.0, 1350.0)
        .black(1401.0, 1403.0);
    let first = run(DetectionConfig::new(), media.clone(), &timeline);
    let second = run(DetectionConfig::new(), media, &timeline);
    assert_eq!(first.split_points, second.split_points);
    assert_eq!(first.episodes, second.episodes);
}

// ── One hit per window ─────────────────────────────────────────────

#[test]
fn windowed_silence_answers_every_window_in_order() {
    let timeline = MediaTimeline::new("Show.S01E01-E04.mkv", 5400.0);
    let windows = SearchWindowDeterminer::new(5400.0, 4).determine_windows(&WindowEvidence::new());
    assert_eq!(windows.len(), 3);

    // A silence in the first window, nothing in the second, a failing scan in the third.
    let media = ScriptedMedia::new().silence(1346.0, 1350.0).broken_at(windows[2].center_time);
    let cache = ScanCache::new();
    let ctx = DetectionContext::new(&timeline, &media, &cache);
    let hits = SilenceDetector::new().detect_in_windows(&ctx, &windows).unwrap();

    assert_eq!(hits.len(), windows.len());
    assert!(!hits[0].is_fallback());
    assert!((hits[0].time - 1348.0).abs() < 1e-6);
    assert_eq!(hits[0].metadata["source"], "silence");

    for (hit, window) in hits[1..].iter().zip(&windows[1..]) {
        assert!(hit.is_fallback());
        assert_eq!(hit.time, window.center_time);
        assert_eq!(hit.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(hit.metadata["source"], "silence_fallback");
    }
    assert!(!hits[1].metadata.contains_key("error"));
    let error = hits[2].metadata["error"].as_str().unwrap();
    assert!(error.contains("timed out"), "{error}");
}

#[test]
fn audio_fingerprint_reports_one_hit_per_window() {
    let timeline = MediaTimeline::new("Show.S01E01-E03.mkv", 4050.0);
    let mut config = DetectionConfig::new();
    config.detectors.audio_fingerprint = true;
    let report = run(config, ScriptedMedia::new().silence(1346.0, 1350.0).silence(2698.0, 2702.0), &timeline);

    assert!(report.is_split());
    assert!(report.detectors_run.iter().any(|name| name == "audio_fingerprint"));
    assert!(!report.supporting_boundaries.contains_key("audio_fingerprint"));
    // Scripted media has no audio, so every window falls back to its center.
    let hits = &report.supporting_hits["audio_fingerprint"];
    assert_eq!(hits.len(), report.windows.len());
    for (hit, window) in hits.iter().zip(&report.windows) {
        assert!(hit.is_fallback());
        assert_eq!(hit.time, window.center_time);
    }
}

// ── Precision mode ─────────────────────────────────────────────────

fn precision_config() -> DetectionConfig {
    DetectionConfig::new()
        .with_runtimes(vec![22.5, 22.5])
        .with_precision(None)
}

#[test]
fn precision_cuts_after_the_logo_run() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let media = ScriptedMedia::new().logo(1340.0, 1349.0);
    let report = run(precision_config(), media, &timeline);

    assert!(report.precision);
    assert!(report.is_split(), "{:?}", report.outcome);
    assert!(report.detectors_run.iter().any(|d| d == "llm_vision"));
    let cut = report.split_points[1].0;
    assert!((cut - 1349.0).abs() < 1e-6, "cut at {cut}");
    assert_eq!(report.episodes[0].sources, vec!["llm_logo".to_string()]);
}

#[test]
fn precision_cut_snaps_to_a_nearby_black_run() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let media = ScriptedMedia::new().logo(1340.0, 1349.0).black(1349.5, 1350.5);
    let report = run(precision_config(), media, &timeline);

    assert!(report.is_split());
    let cut = report.split_points[1].0;
    assert!((cut - 1350.0).abs() < 1e-6, "cut at {cut}");
    assert_eq!(report.episodes[0].metadata.get("black_frame_refined"), Some(&serde_json::Value::Bool(true)));
}

#[test]
fn precision_without_evidence_aborts() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let report = run(precision_config(), ScriptedMedia::new(), &timeline);

    assert!(matches!(report.outcome, Outcome::Aborted { ref reason } if reason.contains("window(s) 1")));
    assert!(report.split_points.is_empty());
}

// ── Boundary strategy ──────────────────────────────────────────────

#[test]
fn chapter_boundaries_split_even_halves() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0).with_chapters(vec![
        Chapter::new(0, Some("Episode 1"), 0.0, 1350.0),
        Chapter::new(1, Some("Episode 2"), 1350.0, 2700.0),
    ]);
    let config = DetectionConfig::new().with_strategy(Strategy::Boundaries);
    let report = run(config, ScriptedMedia::new(), &timeline);

    assert_eq!(report.split_points, vec![(0.0, 1350.0), (1350.0, 1350.0)]);
    assert!(report.episodes.iter().all(|e| e.sources.iter().any(|s| s.starts_with("chapter"))));
}

// ── Report and progress ────────────────────────────────────────────

#[test]
fn report_serializes_its_outcome() {
    let timeline = MediaTimeline::new("Some.Movie.2019.mkv", 5400.0);
    let report = run(DetectionConfig::new(), ScriptedMedia::new(), &timeline);
    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["outcome"]["status"], "unsplit");
    assert!(value["outcome"]["reason"].is_string());
    assert_eq!(value["episodes"].as_array().map(Vec::len), Some(0));
}

#[derive(Default)]
struct StageRecorder {
    stages: Mutex<Vec<Stage>>,
}

impl ProgressCallback for StageRecorder {
    fn on_progress(&self, info: &ProgressInfo) {
        let mut stages = self.stages.lock().unwrap();
        if stages.last() != Some(&info.stage) {
            stages.push(info.stage);
        }
    }
}

#[test]
fn progress_walks_through_the_stages() {
    let recorder = Arc::new(StageRecorder::default());
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let config = DetectionConfig::new().with_progress(recorder.clone());
    let report = run(config, ScriptedMedia::new().silence(1346.0, 1350.0), &timeline);
    assert!(report.is_split());

    let stages = recorder.stages.lock().unwrap();
    let detection = stages.iter().position(|s| *s == Stage::Detection).expect("detection reported");
    let clustering = stages.iter().position(|s| *s == Stage::Clustering).expect("clustering reported");
    assert!(detection < clustering);
}

//! DetectionConfig loading and its effect on a run.

mod common;

use std::io::Write;
use std::sync::Arc;

use common::ScriptedMedia;
use episplit::timeline::Chapter;
use episplit::{DetectionConfig, EpisplitError, MediaTimeline, Pipeline, Strategy};

// ── Loading ───────────────────────────────────────────────────────

#[test]
fn nested_sections_override_defaults() {
    let json = r#"{
        "expected_episodes": 2,
        "strategy": "boundaries",
        "detectors": { "scene_change": true, "black_frame": false },
        "cluster": { "cluster_tolerance": 20.0 },
        "merge": { "merge_threshold": 45.0 },
        "precision": { "pattern": "credits-logo-SPLIT-logo" }
    }"#;
    let config = DetectionConfig::from_json_str(json).unwrap();
    assert_eq!(config.expected_episodes, Some(2));
    assert_eq!(config.strategy, Strategy::Boundaries);
    assert!(config.detectors.scene_change);
    assert!(!config.detectors.black_frame);
    assert!(config.detectors.silence);
    assert_eq!(config.cluster.cluster_tolerance, 20.0);
    assert_eq!(config.merge.merge_threshold, 45.0);
    assert_eq!(config.precision.pattern.as_deref(), Some("credits-logo-SPLIT-logo"));
    assert!(!config.precision.enabled);
}

#[test]
fn config_file_round_trips_through_serde() {
    let config = DetectionConfig::new()
        .with_expected_episodes(3)
        .with_runtimes(vec![21.0, 22.0, 23.0]);
    let json = serde_json::to_string_pretty(&config).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    let loaded = DetectionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(loaded.expected_episodes, Some(3));
    assert_eq!(loaded.runtimes, Some(vec![21.0, 22.0, 23.0]));
    assert_eq!(loaded.min_episode_length, config.min_episode_length);
}

#[test]
fn malformed_and_inconsistent_files_are_rejected() {
    assert!(matches!(
        DetectionConfig::from_json_str("{ \"workers\": "),
        Err(EpisplitError::JsonError(_))
    ));
    assert!(matches!(
        DetectionConfig::from_json_str(r#"{ "expected_episodes": 1 }"#),
        Err(EpisplitError::InvalidEpisodeCount(1))
    ));
    assert!(matches!(
        DetectionConfig::from_json_str(r#"{ "precision": { "pattern": "logo-logo" } }"#),
        Err(EpisplitError::InvalidPattern { .. })
    ));
    assert!(matches!(
        DetectionConfig::from_json_file("does/not/exist.json"),
        Err(EpisplitError::IoError(_))
    ));
}

// ── Effect on a run ───────────────────────────────────────────────

#[test]
fn configured_episode_count_beats_the_filename() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 4050.0);
    let config = DetectionConfig::from_json_str(r#"{ "expected_episodes": 3, "workers": 1 }"#).unwrap();
    let report = Pipeline::new(config)
        .with_scanner(Arc::new(ScriptedMedia::new()))
        .run_timeline(&timeline)
        .unwrap();
    assert_eq!(report.expected_episodes, Some(3));
    assert_eq!(report.windows.len(), 2);
}

#[test]
fn disabled_detectors_are_not_run() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0).with_chapters(vec![
        Chapter::new(0, Some("Episode 1"), 0.0, 1350.0),
        Chapter::new(1, Some("Episode 2"), 1350.0, 2700.0),
    ]);
    let json = r#"{
        "strategy": "boundaries",
        "workers": 1,
        "detectors": { "silence": false, "black_frame": false }
    }"#;
    let report = Pipeline::new(DetectionConfig::from_json_str(json).unwrap())
        .with_scanner(Arc::new(ScriptedMedia::new()))
        .run_timeline(&timeline)
        .unwrap();
    assert_eq!(report.detectors_run, vec!["chapter".to_string()]);
    assert!(report.is_split());
}

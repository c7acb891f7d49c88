//! Probe, detect and split a real file.
//!
//! Tests require fixture files from `tests/fixtures/generate_fixtures.sh`
//! and are skipped when they are missing.

use std::path::Path;

use episplit::{DetectionConfig, EpisodeNamer, EpisodeSplitter, MediaProbe, Pipeline};

const TWO_EPISODES: &str = "tests/fixtures/two_episodes.mkv";

fn fixture() -> Option<&'static str> {
    Path::new(TWO_EPISODES).exists().then_some(TWO_EPISODES)
}

#[test]
fn probe_reports_duration_and_streams() {
    let Some(path) = fixture() else {
        return;
    };
    let timeline = MediaProbe::probe(path).expect("Failed to probe fixture");
    assert!((timeline.duration - 1903.0).abs() < 2.0, "duration {}", timeline.duration);
    assert!(timeline.has_video());
    assert!(timeline.has_audio());
}

#[test]
fn detection_finds_the_black_silent_gap() {
    let Some(path) = fixture() else {
        return;
    };
    let config = DetectionConfig::new().with_expected_episodes(2).with_workers(2);
    let report = Pipeline::new(config).run(path).expect("Failed to run detection");
    assert!(report.is_split(), "{:?}", report.outcome);
    assert_eq!(report.split_points.len(), 2);
    let cut = report.split_points[1].0;
    assert!((cut - 951.5).abs() < 3.0, "cut at {cut}");
}

#[test]
fn split_writes_one_file_per_episode() {
    let Some(path) = fixture() else {
        return;
    };
    let out = tempfile::tempdir().expect("Failed to create temp dir");
    let namer = EpisodeNamer::new();
    let parsed = namer.parse_filename("Fixture.S01E01-E02.mkv");
    let results = EpisodeSplitter::new()
        .split_all(
            path,
            out.path(),
            &[(0.0, 951.5), (951.5, 951.5)],
            |n| namer.generate_episode_name(&parsed, n as u32, None, None),
            None,
        )
        .expect("Failed to split");

    assert_eq!(results.len(), 2);
    assert_eq!(
        results[1].output_path.file_name().and_then(|n| n.to_str()),
        Some("S01E02 - Fixture.mkv")
    );
    for result in &results {
        let timeline = MediaProbe::probe(&result.output_path).expect("Failed to probe episode");
        // Cuts land on the keyframe at or before the start: at most one GOP (5s) longer.
        assert!(
            (timeline.duration - result.duration).abs() < 6.0,
            "episode {} lasts {:.1}s",
            result.episode_number,
            timeline.duration
        );
    }
}

//! Error handling integration tests.
//!
//! These tests verify that meaningful errors are returned for various
//! failure conditions.

use std::path::Path;

use episplit::{DetectionConfig, EpisodeSplitter, EpisplitError, MediaProbe, Pipeline, SplitJob};

#[test]
fn probe_nonexistent_file() {
    let result = MediaProbe::probe("this_file_does_not_exist.mkv");
    let error = result.unwrap_err();
    assert!(matches!(error, EpisplitError::FileOpen { .. }));
    assert!(
        error.to_string().contains("Failed to open media file"),
        "Error message should mention file open failure: {error}",
    );
}

#[test]
fn probe_invalid_file() {
    let temporary_directory = tempfile::tempdir().expect("Failed to create temp dir");
    let invalid_file_path = temporary_directory.path().join("invalid.mkv");
    std::fs::write(&invalid_file_path, b"this is not a media file").expect("Failed to write invalid file");

    assert!(MediaProbe::probe(&invalid_file_path).is_err());
}

#[test]
fn run_propagates_probe_failures() {
    let result = Pipeline::new(DetectionConfig::new()).run("missing.S01E01-E02.mkv");
    assert!(matches!(result, Err(EpisplitError::FileOpen { .. })));
}

#[test]
fn split_of_missing_input_fails_on_first_episode() {
    let temporary_directory = tempfile::tempdir().expect("Failed to create temp dir");
    let result = EpisodeSplitter::new().split_all(
        "missing.mkv",
        temporary_directory.path(),
        &[(0.0, 1350.0), (1350.0, 1350.0)],
        |n| format!("episode_{n}.mkv"),
        None,
    );
    assert!(matches!(result, Err(EpisplitError::FileOpen { .. })));
}

#[test]
fn split_rejects_negative_start() {
    let job = SplitJob {
        episode_number: 1,
        start_time: -5.0,
        duration: 60.0,
        input_path: "input.mkv".into(),
        output_path: "out.mkv".into(),
    };
    let error = EpisodeSplitter::new().split_episode(&job).unwrap_err();
    assert!(matches!(error, EpisplitError::InvalidRange { .. }));
}

#[test]
fn split_range_past_end_of_fixture() {
    let path = "tests/fixtures/two_episodes.mkv";
    if !Path::new(path).exists() {
        return;
    }
    let temporary_directory = tempfile::tempdir().expect("Failed to create temp dir");
    let job = SplitJob {
        episode_number: 1,
        start_time: 100_000.0,
        duration: 60.0,
        input_path: path.into(),
        output_path: temporary_directory.path().join("late.mkv"),
    };
    assert!(EpisodeSplitter::new().split_episode(&job).is_err());
}

//! Search window planning through the pipeline.

use episplit::timeline::Chapter;
use episplit::{DetectionConfig, MediaTimeline, Pipeline, SearchWindow};

fn plan(config: DetectionConfig, timeline: &MediaTimeline, expected: usize) -> Vec<SearchWindow> {
    Pipeline::new(config).plan_windows(timeline, expected).windows
}

fn assert_ordered(windows: &[SearchWindow], expected: usize) {
    assert_eq!(windows.len(), expected - 1);
    for (i, window) in windows.iter().enumerate() {
        assert_eq!(window.episode_before, i + 1);
        assert_eq!(window.episode_after, i + 2);
        assert!(window.start_time <= window.center_time && window.center_time <= window.end_time);
    }
    for pair in windows.windows(2) {
        assert!(pair[0].center_time < pair[1].center_time);
    }
}

#[test]
fn equal_division_without_evidence() {
    let timeline = MediaTimeline::new("Show.S01E01-E04.mkv", 5400.0);
    let windows = plan(DetectionConfig::new(), &timeline, 4);
    assert_ordered(&windows, 4);
    for (k, window) in windows.iter().enumerate() {
        assert_eq!(window.source, "equal_division");
        assert!((window.center_time - 1350.0 * (k + 1) as f64).abs() < 1e-6);
        assert!((window.confidence - 0.5).abs() < 1e-9);
    }
}

#[test]
fn configured_runtimes_place_windows() {
    let timeline = MediaTimeline::new("Show.S01E01-E03.mkv", 4500.0);
    let config = DetectionConfig::new().with_runtimes(vec![22.0, 22.0, 22.0]);
    let plan = Pipeline::new(config).plan_windows(&timeline, 3);
    assert_ordered(&plan.windows, 3);
    assert_eq!(plan.runtimes, vec![22.0, 22.0, 22.0]);
    assert!(!plan.precision);
    assert!(plan.windows.iter().all(|w| w.source.starts_with("tmdb")));
    // 4500s minus 66 minutes of content leaves 180s of commercials per episode.
    assert!((plan.windows[0].center_time - 1500.0).abs() < 1e-6);
}

#[test]
fn titled_episode_chapters_place_windows() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0).with_chapters(vec![
        Chapter::new(0, Some("Episode 1"), 0.0, 1350.0),
        Chapter::new(1, Some("Episode 2"), 1350.0, 2700.0),
    ]);
    let windows = plan(DetectionConfig::new(), &timeline, 2);
    assert_ordered(&windows, 2);
    assert_eq!(windows[0].source, "chapter");
    assert!(windows[0].contains(1350.0));
}

#[test]
fn precision_mode_uses_narrow_runtime_windows() {
    let timeline = MediaTimeline::new("Show.S01E01-E03.mkv", 4050.0);
    let config = DetectionConfig::new()
        .with_runtimes(vec![22.5, 22.5, 22.5])
        .with_precision(None);
    let plan = Pipeline::new(config).plan_windows(&timeline, 3);
    assert!(plan.precision);
    assert_ordered(&plan.windows, 3);
    let first = &plan.windows[0];
    assert_eq!(first.source, "tmdb_precision");
    assert!((first.center_time - 1350.0).abs() < 1e-6);
    assert!((first.start_time - 1170.0).abs() < 1e-6);
    assert!((first.end_time - 1410.0).abs() < 1e-6);
}

#[test]
fn precision_needs_runtimes() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let plan = Pipeline::new(DetectionConfig::new().with_precision(None)).plan_windows(&timeline, 2);
    assert!(!plan.precision);
    assert_eq!(plan.windows[0].source, "equal_division");
}

#[test]
fn shifted_windows_stay_inside_the_file() {
    let timeline = MediaTimeline::new("Show.S01E01-E02.mkv", 2700.0);
    let window = plan(DetectionConfig::new(), &timeline, 2).remove(0);
    let shifted = window.shifted(5000.0, 2700.0);
    assert!(shifted.end_time <= 2700.0);
    assert!(shifted.start_time >= 0.0);
}

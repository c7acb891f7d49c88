//! Clustering and merging properties over generated evidence.

mod common;

use common::assert_contiguous;
use episplit::{BoundaryMerger, DetectionCluster, EpisodeBoundary, MergeOptions, RawDetection, RawDetectionClusterer};

/// Small deterministic generator so the sweeps are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn range(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }
}

const SOURCES: [&str; 4] = ["silence", "black_frame", "scene_change", "llm_vision"];

fn noisy_lists(rng: &mut Lcg, total: f64, episodes: usize) -> Vec<Vec<EpisodeBoundary>> {
    let length = total / episodes as f64;
    SOURCES
        .iter()
        .map(|&source| {
            let mut start = 0.0;
            let mut list = Vec::new();
            for i in 1..=episodes {
                let end = if i == episodes {
                    total
                } else {
                    i as f64 * length + rng.range(-45.0, 45.0)
                };
                list.push(EpisodeBoundary::new(start, end, rng.range(0.4, 0.95), source));
                start = end;
            }
            list
        })
        .collect()
}

// ── BoundaryMerger ─────────────────────────────────────────────────

#[test]
fn merged_episodes_always_tile_the_file() {
    let merger = BoundaryMerger::with_options(MergeOptions::new().with_episode_length(900.0, 5400.0));
    let mut rng = Lcg(7);
    for round in 0..50 {
        let episodes = 2 + round % 4;
        let total = episodes as f64 * rng.range(1300.0, 2700.0);
        let lists = noisy_lists(&mut rng, total, episodes);
        let merged = merger.merge(&lists, total);
        if merged.is_empty() {
            continue;
        }
        let spans: Vec<(f64, f64)> = merged.iter().map(|m| (m.start_time, m.end_time)).collect();
        assert_contiguous(&spans, total);
        for episode in &merged {
            assert!((0.0..=1.0).contains(&episode.confidence));
        }
    }
}

#[test]
fn chapter_is_confirmed_by_nearby_black_only_within_threshold() {
    let merger = BoundaryMerger::with_options(MergeOptions::new().with_merge_threshold(60.0));
    let chapters = vec![
        EpisodeBoundary::new(0.0, 1350.0, 0.95, "chapter"),
        EpisodeBoundary::new(1350.0, 2700.0, 0.95, "chapter"),
    ];

    let near = vec![EpisodeBoundary::new(0.0, 1395.0, 0.6, "black_frame")];
    let merged = merger.merge(&[chapters.clone(), near], 2700.0);
    assert_eq!(merged[0].end_time, 1350.0);
    assert!(merged[0].sources.iter().any(|s| s == "black_frame"));

    let far = vec![EpisodeBoundary::new(0.0, 1430.0, 0.6, "black_frame")];
    let merged = merger.merge(&[chapters, far], 2700.0);
    assert_eq!(merged[0].end_time, 1350.0);
    assert!(!merged[0].sources.iter().any(|s| s == "black_frame"));
}

#[test]
fn split_points_cover_every_episode() {
    let merger = BoundaryMerger::new();
    let silence = vec![EpisodeBoundary::new(0.0, 1340.0, 0.8, "silence")];
    let black = vec![EpisodeBoundary::new(0.0, 1360.0, 0.8, "black_frame")];
    let merged = merger.merge(&[silence, black], 2700.0);
    let points = merger.get_split_points(&merged);
    assert_eq!(points.len(), merged.len());
    let covered: f64 = points.iter().map(|(_, duration)| duration).sum();
    assert!((covered - 2700.0).abs() < 1e-6);

    let records = merger.to_episode_list(&merged);
    assert_eq!(records[0].episode_number, 1);
    assert_eq!(records[1].episode_number, 2);
}

// ── RawDetectionClusterer ──────────────────────────────────────────

#[test]
fn five_silences_and_a_logo_make_one_two_detector_cluster() {
    let clusterer = RawDetectionClusterer::new();
    let mut detections: Vec<RawDetection> = [1344.0, 1346.0, 1348.0, 1350.0, 1352.0]
        .iter()
        .map(|&t| RawDetection::new(t, 20.0, "silence"))
        .collect();
    detections.push(RawDetection::new(1349.0, 30.0, "llm_logo"));

    let clusters = clusterer.cluster_detections(&detections, Some(1200.0), Some(1500.0));
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].num_detectors(), 2);
    assert_eq!(clusters[0].detections.len(), 6);

    let (time, confidence, metadata) = clusterer
        .get_best_boundary(&detections, Some(1200.0), Some(1500.0))
        .expect("one cluster");
    assert!((1344.0..=1352.0).contains(&time));
    assert!(confidence > 0.0 && confidence <= 1.0);
    assert_eq!(metadata["num_detectors"], 2);
}

#[test]
fn adding_a_new_source_never_lowers_the_score() {
    let mut rng = Lcg(42);
    for _ in 0..40 {
        let base = rng.range(600.0, 3000.0);
        let mut cluster = DetectionCluster::new(RawDetection::new(base, rng.range(5.0, 40.0), "silence"));
        let mut previous = cluster.final_score(1.5, 0.1);
        for source in &SOURCES[1..] {
            cluster.add_detection(RawDetection::new(base + rng.range(-1.0, 1.0), rng.range(5.0, 40.0), *source));
            let score = cluster.final_score(1.5, 0.1);
            assert!(score > previous, "{source}: {score} <= {previous}");
            previous = score;
        }
    }
}

#[test]
fn clustering_ignores_input_order() {
    let clusterer = RawDetectionClusterer::new();
    let mut rng = Lcg(3);
    let detections: Vec<RawDetection> = (0..30)
        .map(|i| RawDetection::new(rng.range(1200.0, 1500.0), rng.range(1.0, 40.0), SOURCES[i % SOURCES.len()]))
        .collect();
    let forward = clusterer.get_best_boundary(&detections, None, None).expect("cluster");
    let mut reversed = detections.clone();
    reversed.reverse();
    let backward = clusterer.get_best_boundary(&reversed, None, None).expect("cluster");
    assert!((forward.0 - backward.0).abs() < 1e-9);
    assert!((forward.1 - backward.1).abs() < 1e-9);
}

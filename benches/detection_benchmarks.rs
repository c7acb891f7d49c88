//! Benchmarks for window planning, clustering and merging.
//!
//! Run with: cargo bench
//!
//! The probe benchmark requires fixture files from
//! `tests/fixtures/generate_fixtures.sh`; everything else runs on
//! synthetic detections.

use std::hint::black_box;
use std::path::Path;

use criterion::Criterion;
use episplit::{
    BoundaryMerger, EpisodeBoundary, MediaProbe, MergeOptions, RawDetection, RawDetectionClusterer,
    SearchWindowDeterminer, WindowEvidence,
};

const TWO_EPISODES: &str = "tests/fixtures/two_episodes.mkv";

const SOURCES: [&str; 5] = ["silence", "black_frame", "scene_change", "llm_logo", "speech"];

/// `per_boundary` detections scattered around each of `episodes - 1`
/// boundaries, plus background noise.
fn synthetic_detections(episodes: usize, per_boundary: usize) -> Vec<RawDetection> {
    let mut detections = Vec::new();
    for boundary in 1..episodes {
        let center = boundary as f64 * 1350.0;
        for i in 0..per_boundary {
            let offset = ((i * 7919) % 61) as f64 - 30.0;
            let score = 5.0 + ((i * 104_729) % 40) as f64;
            detections.push(RawDetection::new(center + offset, score, SOURCES[i % SOURCES.len()]));
        }
    }
    for i in 0..per_boundary * episodes {
        let time = ((i * 15_485_863) % (episodes * 1350)) as f64;
        detections.push(RawDetection::new(time, 2.0, "scene_change"));
    }
    detections
}

fn synthetic_lists(episodes: usize) -> Vec<Vec<EpisodeBoundary>> {
    let total = episodes as f64 * 1350.0;
    SOURCES
        .iter()
        .enumerate()
        .map(|(s, &source)| {
            (0..episodes)
                .map(|i| {
                    let jitter = ((s * 13 + i * 7) % 41) as f64 - 20.0;
                    let start = if i == 0 { 0.0 } else { i as f64 * 1350.0 + jitter };
                    let end = if i + 1 == episodes {
                        total
                    } else {
                        (i + 1) as f64 * 1350.0 + jitter
                    };
                    EpisodeBoundary::new(start, end, 0.6 + 0.05 * s as f64, source)
                })
                .collect()
        })
        .collect()
}

fn benchmark_window_planning(criterion: &mut Criterion) {
    let runtimes = vec![22.0; 6];
    let evidence = WindowEvidence::new()
        .with_tmdb_runtimes(runtimes.clone())
        .with_commercial_times(vec![180.0; 6]);
    criterion.bench_function("determine windows (6 episodes, tmdb+chapters)", |bencher| {
        bencher.iter(|| {
            let determiner = SearchWindowDeterminer::new(black_box(8100.0), 6);
            black_box(determiner.determine_windows(&evidence))
        });
    });

    criterion.bench_function("precision windows (6 episodes)", |bencher| {
        bencher.iter(|| {
            let determiner = SearchWindowDeterminer::new(black_box(8100.0), 6);
            black_box(determiner.precision_windows(&runtimes))
        });
    });
}

fn benchmark_clustering(criterion: &mut Criterion) {
    let clusterer = RawDetectionClusterer::new();

    for per_boundary in [10, 100, 500] {
        let detections = synthetic_detections(4, per_boundary);
        criterion.bench_function(&format!("cluster {} detections, one window", detections.len()), |bencher| {
            bencher.iter(|| black_box(clusterer.get_best_boundary(&detections, Some(1200.0), Some(1500.0))));
        });
    }

    let detections = synthetic_detections(8, 100);
    criterion.bench_function("cluster every window (8 episodes)", |bencher| {
        bencher.iter(|| {
            (1..8)
                .map(|k| {
                    let center = k as f64 * 1350.0;
                    clusterer.get_best_boundary(&detections, Some(center - 300.0), Some(center + 300.0))
                })
                .collect::<Vec<_>>()
        });
    });
}

fn benchmark_merging(criterion: &mut Criterion) {
    let merger = BoundaryMerger::with_options(MergeOptions::new().with_episode_length(900.0, 5400.0));

    for episodes in [2, 6, 12] {
        let lists = synthetic_lists(episodes);
        let total = episodes as f64 * 1350.0;
        criterion.bench_function(&format!("merge 5 sources, {episodes} episodes"), |bencher| {
            bencher.iter(|| black_box(merger.merge(&lists, total)));
        });
    }

    let mut with_chapters = synthetic_lists(6);
    with_chapters.push(
        (0..6)
            .map(|i| EpisodeBoundary::new(i as f64 * 1350.0, (i + 1) as f64 * 1350.0, 0.95, "chapter"))
            .collect(),
    );
    criterion.bench_function("merge with a standalone chapter list", |bencher| {
        bencher.iter(|| black_box(merger.merge(&with_chapters, 8100.0)));
    });
}

fn benchmark_probe(criterion: &mut Criterion) {
    if !Path::new(TWO_EPISODES).exists() {
        eprintln!("Skipping benchmark: fixture not found");
        return;
    }
    episplit::set_ffmpeg_log_level(episplit::FfmpegLogLevel::Error);

    criterion.bench_function("probe two-episode file", |bencher| {
        bencher.iter(|| MediaProbe::probe(TWO_EPISODES).unwrap());
    });
}

criterion::criterion_group!(
    benches,
    benchmark_window_planning,
    benchmark_clustering,
    benchmark_merging,
    benchmark_probe,
);

criterion::criterion_main!(benches);

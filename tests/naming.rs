//! Output filename generation.

use episplit::{DetectionConfig, EpisodeNamer, naming::DEFAULT_PATTERN};

#[test]
fn default_pattern_keeps_quality_tags() {
    let namer = EpisodeNamer::new();
    let parsed = namer.parse_filename("Doctor.Who.S05E01-E02.720p.BluRay.x264.mkv");
    assert_eq!(
        namer.generate_episode_name(&parsed, 1, None, None),
        "S05E01 - Doctor Who 720p x264 BluRay.mkv"
    );
    assert_eq!(
        namer.generate_episode_name(&parsed, 2, None, None),
        "S05E02 - Doctor Who 720p x264 BluRay.mkv"
    );
}

#[test]
fn overrides_replace_parsed_identity() {
    let namer = EpisodeNamer::new().with_quality_info(false);
    let parsed = namer.parse_filename("Show.S01E01-E03.mkv");
    assert_eq!(namer.generate_episode_name(&parsed, 3, Some(2), Some(10)), "S02E12 - Show.mkv");
}

#[test]
fn unnumbered_files_start_at_s01e01() {
    let namer = EpisodeNamer::new().with_quality_info(false);
    let parsed = namer.parse_filename("Cartoon Block.mp4");
    assert_eq!(parsed.season, None);
    assert_eq!(namer.generate_episode_name(&parsed, 2, None, None), "S01E02 - Cartoon Block.mp4");
}

#[test]
fn episode_count_from_filename_ranges() {
    let namer = EpisodeNamer::new();
    assert_eq!(namer.expected_episode_count("Show.S01E01-E03.mkv"), Some(3));
    assert_eq!(namer.expected_episode_count("Show.S01E01.mkv"), None);
    assert_eq!(namer.expected_episode_count("Documentary.2020.mkv"), None);
}

#[test]
fn configured_pattern_is_the_default() {
    assert_eq!(DetectionConfig::new().naming.pattern, DEFAULT_PATTERN);
}

#[test]
fn custom_patterns_zero_pad_and_sanitize() {
    let namer = EpisodeNamer::new().with_pattern("{title}: {season}x{episode:03}?");
    let parsed = namer.parse_filename("Lost.S02E07-E08.mkv");
    assert_eq!(namer.generate_episode_name(&parsed, 2, None, None), "Lost 2x008.mkv");
}

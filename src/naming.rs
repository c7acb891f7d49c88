//! Output filenames for split episodes.
//!
//! ```
//! use episplit::EpisodeNamer;
//!
//! let namer = EpisodeNamer::new();
//! let parsed = namer.parse_filename("Doctor.Who.S02E01-E03.720p.HDTV.x264.mkv");
//! assert_eq!(namer.detect_episode_range("Doctor.Who.S02E01-E03.mkv"), Some((1, 3)));
//! assert_eq!(
//!     namer.generate_episode_name(&parsed, 2, None, None),
//!     "S02E02 - Doctor Who 720p x264 HDTV.mkv"
//! );
//! ```

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;

static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)s(\d+)e(\d+)\s*[-–]\s*e?(\d+)").expect("episode range regex should compile")
});
static SEASON_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)s(\d+)e(\d+)").expect("season/episode regex should compile"));
static CROSS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)[xX](\d+)").expect("NxNN regex should compile"));
static YEAR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("year regex should compile"));
static QUALITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(2160p|1080p|720p|480p|4K)\b").expect("quality regex should compile"));
static CODEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(x264|x265|HEVC|H\.?264|H\.?265|AV1)\b").expect("codec regex should compile")
});
static SOURCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(BluRay|BDRip|WEB-DL|WEBRip|HDTV|DVDRip)\b").expect("source regex should compile")
});
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)(?::0?(\d+)d?)?\}").expect("placeholder regex should compile"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should compile"));

/// Default output pattern.
pub const DEFAULT_PATTERN: &str = "S{season:02}E{episode:02} - {basename}";

/// What a release-style filename says about its content.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ParsedFilename {
    pub title: String,
    pub season: Option<u32>,
    /// First episode of the file.
    pub episode: Option<u32>,
    pub year: Option<u32>,
    pub quality: Option<String>,
    pub codec: Option<String>,
    pub source: Option<String>,
    /// Extension including the dot, or empty.
    pub extension: String,
    pub original_filename: String,
}

#[derive(Debug, Clone)]
pub struct EpisodeNamer {
    pattern: String,
    preserve_quality_info: bool,
}

impl Default for EpisodeNamer {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_PATTERN.to_string(),
            preserve_quality_info: true,
        }
    }
}

fn number(caps: &Captures<'_>, group: usize) -> Option<u32> {
    caps.get(group).and_then(|m| m.as_str().parse().ok())
}

fn first_match(regex: &Regex, text: &str) -> Option<String> {
    regex.captures(text).map(|caps| caps[1].to_string())
}

impl EpisodeNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `pattern` for output names. Variables: `title`, `season`,
    /// `episode`, `year`, `quality`, `codec`, `source`, `basename`, `ext`;
    /// numbers accept a zero-pad width as in `{season:02}`.
    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        if !pattern.trim().is_empty() {
            self.pattern = pattern;
        }
        self
    }

    #[must_use]
    pub fn with_quality_info(mut self, preserve: bool) -> Self {
        self.preserve_quality_info = preserve;
        self
    }

    pub fn parse_filename<P: AsRef<Path>>(&self, path: P) -> ParsedFilename {
        let path = path.as_ref();
        let original_filename = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let name = path.file_stem().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let marker = RANGE
            .captures(&name)
            .or_else(|| SEASON_EPISODE.captures(&name))
            .or_else(|| CROSS.captures(&name));

        let (title, season, episode) = match marker {
            Some(caps) => {
                let whole = caps.get(0).map_or(0..0, |m| m.range());
                let trim = |s: &str| s.trim_matches(|c: char| " ._-".contains(c)).to_string();
                let before = trim(&name[..whole.start]);
                let after = trim(&name[whole.end..]);
                let title = if before.chars().count() >= 3 {
                    before
                } else if !after.is_empty() {
                    after
                } else if !before.is_empty() {
                    before
                } else {
                    name.clone()
                };
                (title, number(&caps, 1), number(&caps, 2))
            }
            None => (name.clone(), None, None),
        };

        let title = WHITESPACE
            .replace_all(&title.replace(['.', '_'], " "), " ")
            .trim()
            .to_string();

        ParsedFilename {
            title: if title.is_empty() { name.clone() } else { title },
            season,
            episode,
            year: first_match(&YEAR, &name).and_then(|y| y.parse().ok()),
            quality: first_match(&QUALITY, &name),
            codec: first_match(&CODEC, &name),
            source: first_match(&SOURCE, &name),
            extension,
            original_filename,
        }
    }

    /// First and last episode of an `SxxEyy-Ezz` filename.
    pub fn detect_episode_range<P: AsRef<Path>>(&self, path: P) -> Option<(u32, u32)> {
        let name = path.as_ref().file_name()?.to_string_lossy().into_owned();
        let caps = RANGE.captures(&name)?;
        Some((number(&caps, 2)?, number(&caps, 3)?))
    }

    /// Episodes in the file according to its name, when it names a range.
    pub fn expected_episode_count<P: AsRef<Path>>(&self, path: P) -> Option<usize> {
        let (start, end) = self.detect_episode_range(path)?;
        (end >= start).then(|| (end - start + 1) as usize)
    }

    /// Filename of the `episode_number`-th (1-based) episode of the split.
    pub fn generate_episode_name(
        &self,
        parsed: &ParsedFilename,
        episode_number: u32,
        season_override: Option<u32>,
        start_episode_override: Option<u32>,
    ) -> String {
        let season = season_override.or(parsed.season).unwrap_or(1);
        let start = start_episode_override.or(parsed.episode).unwrap_or(1);
        let episode = start + episode_number.saturating_sub(1);

        let mut basename = vec![parsed.title.as_str()];
        if self.preserve_quality_info {
            basename.extend(
                [&parsed.quality, &parsed.codec, &parsed.source]
                    .into_iter()
                    .filter_map(|v| v.as_deref()),
            );
        }
        let basename = basename.join(" ");

        let lookup = |key: &str| -> Option<Value> {
            Some(match key {
                "title" => Value::Text(parsed.title.clone()),
                "season" => Value::Number(season),
                "episode" => Value::Number(episode),
                "year" => parsed.year.map_or(Value::Text(String::new()), Value::Number),
                "quality" => Value::Text(parsed.quality.clone().unwrap_or_default()),
                "codec" => Value::Text(parsed.codec.clone().unwrap_or_default()),
                "source" => Value::Text(parsed.source.clone().unwrap_or_default()),
                "basename" => Value::Text(basename.clone()),
                "ext" => Value::Text(parsed.extension.trim_start_matches('.').to_string()),
                _ => return None,
            })
        };

        let mut filename = render(&self.pattern, &lookup).unwrap_or_else(|key| {
            log::warn!("Invalid naming pattern key: {key}");
            format!("S{season:02}E{episode:02} - {basename}")
        });
        if !filename.ends_with(&parsed.extension) {
            filename.push_str(&parsed.extension);
        }
        sanitize_filename(&filename)
    }

    /// Names for every episode of a split.
    pub fn generate_all_names<P: AsRef<Path>>(
        &self,
        source: P,
        count: usize,
        season_override: Option<u32>,
        start_episode_override: Option<u32>,
    ) -> Vec<String> {
        let parsed = self.parse_filename(source);
        (1..=count as u32)
            .map(|n| self.generate_episode_name(&parsed, n, season_override, start_episode_override))
            .collect()
    }
}

enum Value {
    Text(String),
    Number(u32),
}

/// Substitute placeholders; `Err` names the first unknown key.
fn render<F>(pattern: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<Value>,
{
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(pattern) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        out.push_str(&pattern[last..whole.start]);
        let key = &caps[1];
        let width: usize = caps.get(2).and_then(|w| w.as_str().parse().ok()).unwrap_or(0);
        match lookup(key).ok_or_else(|| key.to_string())? {
            Value::Number(n) => out.push_str(&format!("{n:0width$}")),
            Value::Text(text) => out.push_str(&text),
        }
        last = whole.end;
    }
    out.push_str(&pattern[last..]);
    Ok(out)
}

/// Remove characters invalid in filenames and collapse whitespace.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename.chars().filter(|c| !"<>:\"/\\|?*".contains(*c)).collect();
    WHITESPACE
        .replace_all(&cleaned, " ")
        .trim_matches(|c: char| c == ' ' || c == '.')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_patterns_compile() {
        for pattern in [
            &RANGE,
            &SEASON_EPISODE,
            &CROSS,
            &YEAR,
            &QUALITY,
            &CODEC,
            &SOURCE,
            &PLACEHOLDER,
            &WHITESPACE,
        ] {
            LazyLock::force(pattern);
        }
    }

    #[test]
    fn parses_release_names() {
        let namer = EpisodeNamer::new();
        let parsed = namer.parse_filename("/tv/The.Office.S03E05-E07.2006.1080p.WEB-DL.H264.mkv");
        assert_eq!(parsed.title, "The Office");
        assert_eq!((parsed.season, parsed.episode), (Some(3), Some(5)));
        assert_eq!(parsed.year, Some(2006));
        assert_eq!(parsed.quality.as_deref(), Some("1080p"));
        assert_eq!(parsed.codec.as_deref(), Some("H264"));
        assert_eq!(parsed.source.as_deref(), Some("WEB-DL"));
        assert_eq!(parsed.extension, ".mkv");
    }

    #[test]
    fn title_after_marker_when_prefix_is_short() {
        let parsed = EpisodeNamer::new().parse_filename("S1E1-3 Cambridge Spies.mp4");
        assert_eq!(parsed.title, "Cambridge Spies");
        let parsed = EpisodeNamer::new().parse_filename("Firefly 1x04.avi");
        assert_eq!((parsed.title.as_str(), parsed.season, parsed.episode), ("Firefly", Some(1), Some(4)));
    }

    #[test]
    fn episode_ranges() {
        let namer = EpisodeNamer::new();
        assert_eq!(namer.detect_episode_range("Show S2E5-8.mkv"), Some((5, 8)));
        assert_eq!(namer.expected_episode_count("Show S2E5-8.mkv"), Some(4));
        assert_eq!(namer.detect_episode_range("Show S2E5.mkv"), None);
    }

    #[test]
    fn custom_patterns_and_fallback() {
        let parsed = EpisodeNamer::new().parse_filename("Lost.S01E01-E02.720p.mkv");
        let namer = EpisodeNamer::new().with_pattern("{title} - {season}x{episode:02}.{ext}");
        assert_eq!(namer.generate_episode_name(&parsed, 2, None, None), "Lost - 1x02.mkv");

        let namer = EpisodeNamer::new().with_pattern("{title} {bogus}");
        assert_eq!(namer.generate_episode_name(&parsed, 1, Some(4), Some(10)), "S04E10 - Lost 720p.mkv");
    }

    #[test]
    fn sanitizes() {
        assert_eq!(sanitize_filename(" What?  Now: <Part 1>. "), "What Now Part 1");
    }

    #[test]
    fn names_every_episode() {
        let names = EpisodeNamer::new()
            .with_quality_info(false)
            .generate_all_names("Show.S01E01-E03.1080p.mkv", 3, None, None);
        assert_eq!(names, vec!["S01E01 - Show.mkv", "S01E02 - Show.mkv", "S01E03 - Show.mkv"]);
    }
}

//! Episode runtimes from The Movie Database.
//!
//! TMDB runtimes serve two purposes: positioning search windows before
//! detection, and an advisory cross-check of the detected durations
//! afterwards. Neither is a source of truth. Runtimes exclude commercials
//! and a title can match the wrong series, so a failed lookup is never an
//! error: the validator reports an adjustment of zero and says why.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::EpisplitError;
use crate::retry::{RetryPolicy, retry_with_backoff};

/// TMDB access and validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmdbOptions {
    /// v3 API key.
    pub api_key: Option<String>,
    /// v4 read access token, preferred over the key when both are set.
    pub read_access_token: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
    /// Accepted relative runtime deviation.
    pub runtime_tolerance: f64,
    pub retry: RetryPolicy,
}

impl Default for TmdbOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            read_access_token: None,
            base_url: "https://api.themoviedb.org/3".to_string(),
            timeout_secs: 10,
            runtime_tolerance: 0.15,
            retry: RetryPolicy::default(),
        }
    }
}

impl TmdbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_read_access_token(mut self, token: impl Into<String>) -> Self {
        self.read_access_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_runtime_tolerance(mut self, tolerance: f64) -> Self {
        self.runtime_tolerance = tolerance;
        self
    }

    /// Whether any credential is configured.
    pub fn has_credentials(&self) -> bool {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        set(&self.api_key) || set(&self.read_access_token)
    }
}

/// A `/search/tv` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmdbSeries {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub original_name: String,
    #[serde(default)]
    pub first_air_date: Option<String>,
}

/// One episode of a season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TmdbEpisode {
    #[serde(default)]
    pub season_number: u32,
    #[serde(default)]
    pub episode_number: u32,
    #[serde(default)]
    pub name: String,
    /// Runtime in minutes, when TMDB knows it.
    #[serde(default)]
    pub runtime: Option<u32>,
    #[serde(default)]
    pub air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<TmdbSeries>,
}

#[derive(Debug, Deserialize)]
struct AlternativeTitle {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct AlternativeTitlesResponse {
    #[serde(default)]
    results: Vec<AlternativeTitle>,
}

#[derive(Debug, Deserialize)]
struct SeasonResponse {
    #[serde(default)]
    episodes: Vec<TmdbEpisode>,
}

/// Lowercase, alphanumerics only, single spaces.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pick the series a title refers to.
///
/// Exact normalized `name`, then exact `original_name`, then an
/// alternative title among the first five results, then the first result.
pub fn pick_series<F>(results: &[TmdbSeries], title: &str, mut alternative_titles: F) -> Option<&TmdbSeries>
where
    F: FnMut(u64) -> Vec<String>,
{
    let wanted = normalize_title(title);
    if let Some(series) = results.iter().find(|s| normalize_title(&s.name) == wanted) {
        return Some(series);
    }
    if let Some(series) = results.iter().find(|s| normalize_title(&s.original_name) == wanted) {
        return Some(series);
    }
    if results.len() > 1 {
        for series in results.iter().take(5) {
            if alternative_titles(series.id).iter().any(|alt| normalize_title(alt) == wanted) {
                log::debug!("TMDB: '{title}' matched alternative title of '{}'", series.name);
                return Some(series);
            }
        }
    }
    results.first()
}

/// Blocking TMDB REST client.
#[derive(Debug, Clone)]
pub struct TmdbClient {
    options: TmdbOptions,
}

impl TmdbClient {
    pub fn new(options: TmdbOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &TmdbOptions {
        &self.options
    }

    fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, EpisplitError> {
        let url = format!("{}{path}", self.options.base_url.trim_end_matches('/'));
        retry_with_backoff(&self.options.retry, EpisplitError::is_transient, || {
            let mut request = ureq::get(&url)
                .set("accept", "application/json")
                .timeout(Duration::from_secs(self.options.timeout_secs));
            match (&self.options.read_access_token, &self.options.api_key) {
                (Some(token), _) if !token.is_empty() => {
                    request = request.set("Authorization", &format!("Bearer {token}"));
                }
                (_, Some(key)) => request = request.query("api_key", key),
                _ => {}
            }
            for (key, value) in query {
                request = request.query(key, value);
            }
            Ok(request.call()?.into_json()?)
        })
    }

    /// `/search/tv`, optionally narrowed to a first-air year.
    pub fn search_tv(&self, title: &str, year: Option<u32>) -> Result<Vec<TmdbSeries>, EpisplitError> {
        let mut query = vec![("query", title.to_string())];
        if let Some(year) = year {
            query.push(("first_air_date_year", year.to_string()));
        }
        let response: SearchResponse = self.get("/search/tv", &query)?;
        Ok(response.results)
    }

    pub fn alternative_titles(&self, series_id: u64) -> Result<Vec<String>, EpisplitError> {
        let response: AlternativeTitlesResponse = self.get(&format!("/tv/{series_id}/alternative_titles"), &[])?;
        Ok(response.results.into_iter().map(|t| t.title).collect())
    }

    pub fn season_episodes(&self, series_id: u64, season: u32) -> Result<Vec<TmdbEpisode>, EpisplitError> {
        let response: SeasonResponse = self.get(&format!("/tv/{series_id}/season/{season}"), &[])?;
        Ok(response.episodes)
    }

    /// Search and disambiguate.
    pub fn find_series(&self, title: &str, year: Option<u32>) -> Result<Option<TmdbSeries>, EpisplitError> {
        let results = self.search_tv(title, year)?;
        let picked = pick_series(&results, title, |id| {
            self.alternative_titles(id).unwrap_or_else(|error| {
                log::debug!("TMDB alternative titles for {id} failed: {error}");
                Vec::new()
            })
        });
        Ok(picked.cloned())
    }
}

/// Outcome of comparing detected durations with TMDB runtimes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Added to every episode confidence.
    pub confidence_adjustment: f64,
    /// Minutes.
    pub expected_runtimes: Vec<f64>,
    /// Minutes, commercials removed when known.
    pub detected_durations: Vec<f64>,
    pub message: String,
}

impl ValidationResult {
    fn neutral(detected_durations: Vec<f64>, message: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            confidence_adjustment: 0.0,
            expected_runtimes: Vec::new(),
            detected_durations,
            message: message.into(),
        }
    }
}

/// Episode durations in minutes with each episode's commercial time
/// (seconds) removed.
pub fn episode_minutes(durations: &[f64], commercial_times: Option<&[f64]>) -> Vec<f64> {
    durations
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            let commercial = commercial_times.and_then(|c| c.get(i)).copied().unwrap_or(0.0);
            (d - commercial).max(0.0) / 60.0
        })
        .collect()
}

/// Compare per-episode durations (minutes) against runtimes (minutes).
///
/// ```
/// use episplit::tmdb::compare_runtimes;
///
/// let result = compare_runtimes(&[44.0, 44.0], &[43.0, 46.0], 0.15);
/// assert_eq!(result.confidence_adjustment, 0.1);
/// ```
pub fn compare_runtimes(expected: &[f64], detected: &[f64], tolerance: f64) -> ValidationResult {
    if expected.is_empty() || detected.is_empty() {
        let mut result = ValidationResult::neutral(detected.to_vec(), "Insufficient data for comparison");
        result.expected_runtimes = expected.to_vec();
        return result;
    }
    if expected.len() != detected.len() {
        log::info!(
            "Episode count mismatch: expected {}, detected {}",
            expected.len(),
            detected.len()
        );
    }

    let compared = expected.len().min(detected.len());
    let mut matches = 0;
    for (i, (&want, &got)) in expected.iter().zip(detected).enumerate() {
        if want <= 0.0 {
            continue;
        }
        let deviation = (got - want).abs() / want;
        if deviation <= tolerance {
            matches += 1;
            log::debug!("Episode {}: runtime match (expected {want}m, detected {got:.1}m)", i + 1);
        } else {
            log::debug!(
                "Episode {}: runtime mismatch (expected {want}m, detected {got:.1}m, deviation {:.1}%)",
                i + 1,
                deviation * 100.0
            );
        }
    }

    let ratio = matches as f64 / compared as f64;
    let (is_valid, adjustment, quality) = if ratio >= 0.8 {
        (true, 0.1, "Good")
    } else if ratio >= 0.5 {
        (true, 0.05, "Partial")
    } else {
        (false, -0.1, "Poor")
    };
    ValidationResult {
        is_valid,
        confidence_adjustment: adjustment,
        expected_runtimes: expected.to_vec(),
        detected_durations: detected.to_vec(),
        message: format!("{quality} runtime match ({matches}/{compared} episodes)"),
    }
}

/// Runtime lookups and duration validation.
#[derive(Debug, Clone)]
pub struct TmdbValidator {
    client: TmdbClient,
}

impl TmdbValidator {
    pub fn new(options: TmdbOptions) -> Self {
        Self {
            client: TmdbClient::new(options),
        }
    }

    pub fn is_available(&self) -> bool {
        self.client.options().has_credentials()
    }

    fn episodes(&self, title: &str, season: u32) -> Result<Vec<TmdbEpisode>, String> {
        let series = match self.client.find_series(title, None) {
            Ok(Some(series)) => series,
            Ok(None) => return Err(format!("Series '{title}' not found on TMDB")),
            Err(error) => return Err(format!("TMDB search failed: {error}")),
        };
        log::info!("TMDB: '{title}' resolved to '{}' (id {})", series.name, series.id);
        match self.client.season_episodes(series.id, season) {
            Ok(episodes) if !episodes.is_empty() => Ok(episodes),
            Ok(_) => Err(format!("No episodes found for season {season}")),
            Err(error) => Err(format!("TMDB season fetch failed: {error}")),
        }
    }

    /// Runtimes (minutes) of `count` episodes from `start_episode`, and a
    /// message describing the lookup. Empty on any failure.
    pub fn get_series_episode_runtimes(
        &self,
        title: &str,
        season: u32,
        start_episode: u32,
        count: usize,
    ) -> (Vec<f64>, String) {
        if !self.is_available() {
            return (Vec::new(), "TMDB validation not available (no credentials)".to_string());
        }
        let episodes = match self.episodes(title, season) {
            Ok(episodes) => episodes,
            Err(message) => return (Vec::new(), message),
        };
        let skip = start_episode.saturating_sub(1) as usize;
        let selected: Vec<&TmdbEpisode> = episodes.iter().skip(skip).take(count).collect();
        let runtimes: Vec<f64> = selected
            .iter()
            .filter_map(|ep| ep.runtime.filter(|&r| r > 0).map(f64::from))
            .collect();
        if runtimes.is_empty() {
            let numbers: Vec<String> = selected.iter().map(|ep| format!("E{}", ep.episode_number)).collect();
            return (
                Vec::new(),
                format!(
                    "Found {} episodes ({}) but no runtime data in TMDB",
                    selected.len(),
                    numbers.join(", ")
                ),
            );
        }
        let message = format!("{} runtimes for S{season:02} from E{start_episode:02}", runtimes.len());
        (runtimes, message)
    }

    /// Validate detected episode durations (seconds).
    ///
    /// `commercial_times` (seconds per episode) is subtracted first when
    /// known, since TMDB runtimes exclude commercials.
    pub fn validate(
        &self,
        durations: &[f64],
        title: &str,
        season: u32,
        start_episode: u32,
        commercial_times: Option<&[f64]>,
    ) -> ValidationResult {
        let detected = episode_minutes(durations, commercial_times);
        if !self.is_available() {
            return ValidationResult::neutral(detected, "TMDB validation not available");
        }
        let (expected, message) = self.get_series_episode_runtimes(title, season, start_episode, durations.len());
        if expected.is_empty() {
            return ValidationResult::neutral(detected, message);
        }
        compare_runtimes(&expected, &detected, self.client.options().runtime_tolerance)
    }
}

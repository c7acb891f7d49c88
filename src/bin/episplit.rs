use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use episplit::{
    DetectionConfig, DetectionReport, EpisodeNamer, EpisodeSplitter, FfmpegLogLevel, MediaProbe, Outcome,
    Pipeline, ProgressCallback, ProgressInfo, Strategy,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;

const CLI_AFTER_HELP: &str = "Examples:\n  episplit probe Show.S01E01-E03.mkv\n  episplit detect Show.S01E01-E03.mkv --json\n  episplit split Show.S01E01-E03.mkv --out episodes --progress\n  episplit detect Show.mkv --episodes 2 --precision --pattern credits-logo-SPLIT-logo\n  episplit completions zsh > _episplit";

#[derive(Debug, Parser)]
#[command(
    name = "episplit",
    version,
    about = "Find episode boundaries in multi-episode video files and split them losslessly",
    after_help = CLI_AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Parser, Clone, Default)]
struct GlobalOptions {
    /// Show debug logging output.
    #[arg(long, global = true)]
    verbose: bool,

    /// Show a progress bar where supported.
    #[arg(long, global = true)]
    progress: bool,

    /// FFmpeg log level (quiet, fatal, error, warning, info, debug).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// JSON detection configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Number of detectors run concurrently.
    #[arg(long, global = true)]
    workers: Option<usize>,
}

/// Detection flags shared by `windows`, `detect` and `split`.
#[derive(Debug, Parser, Clone, Default)]
struct DetectOptions {
    /// Number of episodes in the file (default: from the filename).
    #[arg(long)]
    episodes: Option<usize>,

    /// Fusion strategy: clustered | boundaries.
    #[arg(long)]
    strategy: Option<String>,

    /// Comma-separated episode runtimes in minutes, bypassing TMDB.
    #[arg(long)]
    runtimes: Option<String>,

    /// Enable the TMDB runtime lookup (key from TMDB_API_KEY or TMDB_READ_ACCESS_TOKEN).
    #[arg(long)]
    tmdb: bool,

    /// Enable LLM precision mode.
    #[arg(long)]
    precision: bool,

    /// Expected boundary pattern for precision mode, e.g. credits-logo-SPLIT-logo.
    #[arg(long, requires = "precision")]
    pattern: Option<String>,

    /// Enable every detector, including the slow ones.
    #[arg(long)]
    all_detectors: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print duration, streams and chapters of a media file.
    #[command(
        about = "Print media duration, streams and chapters",
        visible_alias = "info",
        after_help = "Examples:\n  episplit probe input.mkv\n  episplit probe input.mkv --json"
    )]
    Probe {
        /// Input media path.
        input: PathBuf,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the search windows detection would use.
    #[command(
        about = "Plan boundary search windows",
        after_help = "Examples:\n  episplit windows Show.S01E01-E03.mkv\n  episplit windows Show.mkv --episodes 3 --runtimes 22,22,23 --json"
    )]
    Windows {
        /// Input media path.
        input: PathBuf,

        #[command(flatten)]
        detect: DetectOptions,

        /// Output as machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Detect episode boundaries without writing anything.
    #[command(
        about = "Detect episode boundaries",
        after_help = "Examples:\n  episplit detect Show.S01E01-E03.mkv\n  episplit detect Show.mkv --episodes 4 --strategy boundaries --json"
    )]
    Detect {
        /// Input media path.
        input: PathBuf,

        #[command(flatten)]
        detect: DetectOptions,

        /// Output the full detection report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Detect boundaries and write one file per episode.
    #[command(
        about = "Split a multi-episode file",
        after_help = "Examples:\n  episplit split Show.S01E01-E03.mkv --out episodes\n  episplit split Show.mkv --episodes 2 --out . --name-pattern \"{title} - {season}x{episode:02}\""
    )]
    Split {
        /// Input media path.
        input: PathBuf,

        /// Output directory for the episodes.
        #[arg(long)]
        out: PathBuf,

        #[command(flatten)]
        detect: DetectOptions,

        /// Output filename pattern.
        #[arg(long)]
        name_pattern: Option<String>,

        /// Season number for the output names.
        #[arg(long)]
        season: Option<u32>,

        /// Episode number of the first episode.
        #[arg(long)]
        start_episode: Option<u32>,

        /// Allow overwriting existing episode files.
        #[arg(long)]
        overwrite: bool,

        /// Print what would be written without splitting.
        #[arg(long)]
        dry_run: bool,

        /// Check each written episode's size and duration.
        #[arg(long)]
        verify: bool,
    },

    /// Preview output filenames for a file.
    #[command(
        about = "Preview episode filenames",
        after_help = "Examples:\n  episplit names Show.S01E01-E03.1080p.WEB-DL.x264.mkv\n  episplit names Show.mkv --count 2 --season 3 --start-episode 5"
    )]
    Names {
        /// Source filename.
        input: PathBuf,

        /// Number of episodes (default: from the filename).
        #[arg(long)]
        count: Option<usize>,

        /// Output filename pattern.
        #[arg(long)]
        pattern: Option<String>,

        #[arg(long)]
        season: Option<u32>,

        #[arg(long)]
        start_episode: Option<u32>,
    },

    /// Generate shell completions.
    #[command(about = "Generate shell completions")]
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn parse_log_level(value: &str) -> Option<FfmpegLogLevel> {
    value.parse().ok()
}

fn parse_strategy(value: &str) -> Option<Strategy> {
    match value.to_ascii_lowercase().as_str() {
        "clustered" | "cluster" | "windows" => Some(Strategy::Clustered),
        "boundaries" | "merge" | "merged" => Some(Strategy::Boundaries),
        _ => None,
    }
}

fn parse_runtimes(value: &str) -> Result<Vec<f64>, Box<dyn std::error::Error>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<f64>()
                .map_err(|_| format!("invalid runtime: {part}").into())
        })
        .collect()
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0);
    let hours = (total / 3600.0) as u64;
    let minutes = ((total % 3600.0) / 60.0) as u64;
    let secs = total % 60.0;
    format!("{hours:02}:{minutes:02}:{secs:05.2}")
}

fn ensure_writable_path(path: &Path, overwrite: bool) -> Result<(), Box<dyn std::error::Error>> {
    if path.exists() {
        if overwrite {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                format!("overwriting {}", path.display()).yellow()
            );
        } else {
            return Err(format!(
                "output already exists: {} (use --overwrite to replace)",
                path.display()
            )
            .into());
        }
    }
    Ok(())
}

fn apply_global_options(global: &GlobalOptions) -> Result<(), Box<dyn std::error::Error>> {
    let default_filter = if global.verbose { "episplit=debug" } else { "episplit=warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();

    let level = match &global.log_level {
        Some(level) => parse_log_level(level).ok_or(format!("unsupported --log-level: {level}"))?,
        None => FfmpegLogLevel::Error,
    };
    episplit::set_ffmpeg_log_level(level);
    Ok(())
}

fn build_config(global: &GlobalOptions, options: &DetectOptions) -> Result<DetectionConfig, Box<dyn std::error::Error>> {
    let mut config = match &global.config {
        Some(path) => DetectionConfig::from_json_file(path)?,
        None => DetectionConfig::new(),
    };

    if let Some(workers) = global.workers {
        config = config.with_workers(workers);
    }
    if let Some(count) = options.episodes {
        config = config.with_expected_episodes(count);
    }
    if let Some(strategy) = &options.strategy {
        let parsed = parse_strategy(strategy).ok_or(format!("unsupported --strategy: {strategy}"))?;
        config = config.with_strategy(parsed);
    }
    if let Some(runtimes) = &options.runtimes {
        config = config.with_runtimes(parse_runtimes(runtimes)?);
    }
    if options.tmdb {
        let mut tmdb = config.tmdb.clone();
        if let Ok(key) = std::env::var("TMDB_API_KEY") {
            tmdb = tmdb.with_api_key(key);
        }
        if let Ok(token) = std::env::var("TMDB_READ_ACCESS_TOKEN") {
            tmdb = tmdb.with_read_access_token(token);
        }
        if !tmdb.has_credentials() {
            eprintln!(
                "{} {}",
                "warning:".yellow().bold(),
                "--tmdb set but neither TMDB_API_KEY nor TMDB_READ_ACCESS_TOKEN is defined".yellow()
            );
        }
        config = config.with_tmdb(tmdb);
    }
    if options.all_detectors {
        let detectors = &mut config.detectors;
        detectors.scene_change = true;
        detectors.image_hash = true;
        detectors.audio_fingerprint = true;
        detectors.intro = true;
        detectors.llm = true;
        detectors.speech = true;
    }
    if options.precision {
        config = config.with_precision(options.pattern.clone());
    }
    if global.progress {
        config = config.with_progress(Arc::new(TerminalProgress::new()));
    }

    config.validate()?;
    Ok(config)
}

struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template("{spinner:.green} {prefix:>10.bold} {bar:40.cyan/blue} {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        self.bar.set_prefix(format!("{:?}", info.stage).to_lowercase());
        if let Some(total) = info.total {
            self.bar.set_length(total);
        }
        self.bar.set_position(info.current);
        if let Some(detail) = &info.detail {
            self.bar.set_message(detail.clone());
        }
        if info.total.is_some_and(|total| info.current >= total) {
            self.bar.finish_and_clear();
        }
    }
}

fn print_report(report: &DetectionReport) {
    println!(
        "{} {} ({})",
        "file".bold(),
        report.path.display(),
        format_timestamp(report.total_duration)
    );
    if !report.detectors_run.is_empty() {
        println!("{} {}", "detectors".bold(), report.detectors_run.join(", "));
    }
    if !report.detectors_skipped.is_empty() {
        println!(
            "{} {}",
            "skipped".bold(),
            report.detectors_skipped.join(", ").dimmed()
        );
    }

    match &report.outcome {
        Outcome::Split => {
            for (i, episode) in report.episodes.iter().enumerate() {
                let confidence = format!("{:.0}%", episode.confidence * 100.0);
                let confidence = if episode.confidence >= 0.7 {
                    confidence.green()
                } else if episode.confidence >= 0.4 {
                    confidence.yellow()
                } else {
                    confidence.red()
                };
                println!(
                    "  {:>2}  {} - {}  {:>6.1} min  {}  {}",
                    i + 1,
                    format_timestamp(episode.start_time),
                    format_timestamp(episode.end_time),
                    episode.duration() / 60.0,
                    confidence,
                    episode.sources.join(", ").dimmed()
                );
            }
            if let Some(tmdb) = &report.tmdb {
                let verdict = if tmdb.is_valid { "match".green() } else { "mismatch".yellow() };
                println!(
                    "{} {} ({:+.2}) {}",
                    "runtimes".bold(),
                    verdict,
                    tmdb.confidence_adjustment,
                    tmdb.message.dimmed()
                );
            }
        }
        Outcome::Unsplit { reason } => {
            println!("{} {reason}", "unsplit:".yellow().bold());
        }
        Outcome::Aborted { reason } => {
            println!("{} {reason}", "aborted:".red().bold());
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    apply_global_options(&cli.global)?;

    match cli.command {
        Commands::Probe { input, json } => {
            let timeline = MediaProbe::probe(&input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&timeline)?);
            } else {
                println!("{} {}", "file".bold(), timeline.path.display());
                println!(
                    "{} {} ({:.1}s)",
                    "duration".bold(),
                    format_timestamp(timeline.duration),
                    timeline.duration
                );
                for stream in &timeline.streams {
                    println!(
                        "  #{} {:?} {}{}",
                        stream.index,
                        stream.kind,
                        stream.codec,
                        stream
                            .language
                            .as_deref()
                            .map(|language| format!(" [{language}]"))
                            .unwrap_or_default()
                    );
                }
                if timeline.chapters.is_empty() {
                    println!("{}", "no chapters".dimmed());
                } else {
                    println!("{} {}", "chapters".bold(), timeline.chapters.len());
                    for chapter in &timeline.chapters {
                        println!(
                            "  {} - {}  {}",
                            format_timestamp(chapter.start),
                            format_timestamp(chapter.end),
                            chapter.title_or_empty()
                        );
                    }
                }
            }
        }
        Commands::Windows { input, detect, json } => {
            let config = build_config(&cli.global, &detect)?;
            let pipeline = Pipeline::new(config);
            let expected = pipeline
                .expected_episodes(&input)
                .ok_or("episode count unknown: pass --episodes or use an SxxEyy-Ezz filename")?;
            let timeline = MediaProbe::probe(&input)?;
            let plan = pipeline.plan_windows(&timeline, expected);
            if json {
                let payload = json!({
                    "expected_episodes": expected,
                    "total_duration": timeline.duration,
                    "plan": plan,
                });
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "{} {} episodes, {} windows",
                    "plan".bold(),
                    expected,
                    plan.windows.len()
                );
                if let Some(message) = &plan.runtime_message {
                    println!("{} {}", "runtimes".bold(), message.dimmed());
                }
                for window in &plan.windows {
                    println!(
                        "  E{:02}|E{:02}  {} - {}  center {}  {:.0}%  {}",
                        window.episode_before,
                        window.episode_after,
                        format_timestamp(window.start_time),
                        format_timestamp(window.end_time),
                        format_timestamp(window.center_time),
                        window.confidence * 100.0,
                        window.source.cyan()
                    );
                }
            }
        }
        Commands::Detect { input, detect, json } => {
            let config = build_config(&cli.global, &detect)?;
            let report = Pipeline::new(config).run(&input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Split {
            input,
            out,
            detect,
            name_pattern,
            season,
            start_episode,
            overwrite,
            dry_run,
            verify,
        } => {
            let mut config = build_config(&cli.global, &detect)?;
            if let Some(pattern) = name_pattern {
                config.naming.pattern = pattern;
            }
            config.naming.season = season.or(config.naming.season);
            config.naming.start_episode = start_episode.or(config.naming.start_episode);

            let report = Pipeline::new(config.clone()).run(&input)?;
            print_report(&report);
            if !report.is_split() {
                return Ok(());
            }

            let namer = EpisodeNamer::new()
                .with_pattern(config.naming.pattern.clone())
                .with_quality_info(config.naming.preserve_quality_info);
            let mut parsed = namer.parse_filename(&input);
            if let Some(title) = &config.naming.title {
                parsed.title = title.clone();
            }
            let names: Vec<String> = (1..=report.split_points.len() as u32)
                .map(|n| namer.generate_episode_name(&parsed, n, config.naming.season, config.naming.start_episode))
                .collect();

            for name in &names {
                ensure_writable_path(&out.join(name), overwrite || dry_run)?;
            }
            if dry_run {
                for (name, (start, duration)) in names.iter().zip(&report.split_points) {
                    println!(
                        "{} {} @ {} (+{:.1}s)",
                        "would write".cyan(),
                        out.join(name).display(),
                        format_timestamp(*start),
                        duration
                    );
                }
                return Ok(());
            }

            fs::create_dir_all(&out)?;
            let bar = if cli.global.progress {
                let pb = ProgressBar::new(names.len() as u64);
                let style = ProgressStyle::with_template("{spinner:.green} {bar:40.cyan/blue} {pos}/{len} {msg}")?;
                pb.set_style(style.progress_chars("##-"));
                Some(pb)
            } else {
                None
            };
            let advance = |done: usize, _total: usize| {
                if let Some(pb) = &bar {
                    pb.set_position(done as u64);
                }
            };

            let splitter = EpisodeSplitter::new();
            let results = splitter.split_all(
                &input,
                &out,
                &report.split_points,
                |n| names.get(n - 1).cloned().unwrap_or_else(|| format!("episode_{n:02}.mkv")),
                Some(&advance),
            )?;
            if let Some(pb) = bar {
                pb.finish_and_clear();
            }

            for result in &results {
                let status = if !verify || splitter.verify_split(result, 0.05) {
                    "saved".green().bold()
                } else {
                    "suspect".yellow().bold()
                };
                println!(
                    "{} {} ({:.1} MB)",
                    status,
                    result.output_path.display(),
                    result.file_size as f64 / 1024.0 / 1024.0
                );
            }
        }
        Commands::Names {
            input,
            count,
            pattern,
            season,
            start_episode,
        } => {
            let mut namer = EpisodeNamer::new();
            if let Some(pattern) = pattern {
                namer = namer.with_pattern(pattern);
            }
            let count = count
                .or_else(|| namer.expected_episode_count(&input))
                .ok_or("episode count unknown: pass --count or use an SxxEyy-Ezz filename")?;
            for name in namer.generate_all_names(&input, count, season, start_episode) {
                println!("{name}");
            }
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "episplit", &mut std::io::stdout());
        }
    }

    Ok(())
}

fn main() {
    if let Err(error) = run() {
        eprintln!("{} {error}", "error:".red().bold());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{format_timestamp, parse_log_level, parse_runtimes, parse_strategy};
    use episplit::Strategy;

    #[test]
    fn parse_strategy_aliases() {
        assert_eq!(parse_strategy("clustered"), Some(Strategy::Clustered));
        assert_eq!(parse_strategy("Boundaries"), Some(Strategy::Boundaries));
        assert_eq!(parse_strategy("merge"), Some(Strategy::Boundaries));
        assert_eq!(parse_strategy("vote"), None);
    }

    #[test]
    fn parse_runtime_lists() {
        assert_eq!(parse_runtimes("22,23.5, 21").unwrap(), vec![22.0, 23.5, 21.0]);
        assert_eq!(parse_runtimes("44,").unwrap(), vec![44.0]);
        assert!(parse_runtimes("22,abc").is_err());
    }

    #[test]
    fn parse_log_levels() {
        assert!(parse_log_level("quiet").is_some());
        assert!(parse_log_level("WARNING").is_some());
        assert!(parse_log_level("loud").is_none());
    }

    #[test]
    fn timestamps() {
        assert_eq!(format_timestamp(0.0), "00:00:00.00");
        assert_eq!(format_timestamp(1350.5), "00:22:30.50");
        assert_eq!(format_timestamp(3725.0), "01:02:05.00");
    }
}

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Config;

pub const TIMING_TARGET: &str = "bot.timing";
pub const GENERAL_LOG_FILE: &str = "bot.log";

/// Crates that are chatty at info level; capped at warn.
const QUIET_TARGETS: [&str; 5] = ["hyper", "hyper_util", "reqwest", "sqlx", "teloxide::dispatching"];

/// Flushes the file writers when dropped; keep alive for the whole process.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

#[derive(Debug, Clone)]
pub struct LogTail {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

fn parse_log_level(value: &str) -> LevelFilter {
    match value.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

fn general_filter(level: LevelFilter) -> Targets {
    QUIET_TARGETS
        .iter()
        .fold(Targets::new().with_default(level), |targets, target| {
            targets.with_target(*target, level.min(LevelFilter::WARN))
        })
        .with_target(TIMING_TARGET, LevelFilter::OFF)
}

fn timing_filter() -> Targets {
    Targets::new()
        .with_default(LevelFilter::OFF)
        .with_target(TIMING_TARGET, LevelFilter::INFO)
}

fn daily_writer(dir: &Path, file_name: &str, guards: &mut Vec<WorkerGuard>) -> NonBlocking {
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
    guards.push(guard);
    writer
}

/// Stdout plus daily files under `LOG_DIR`: `bot.log`/`bot.jsonl` for the app,
/// `timing.log`/`timing.jsonl` for the `bot.timing` channel only.
pub fn init_logging(config: &Config) -> LoggingGuards {
    let dir = config.log_dir.as_path();
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("Failed to create log directory {}: {err}", dir.display());
    }

    let mut guards = Vec::with_capacity(4);
    let general_text = daily_writer(dir, GENERAL_LOG_FILE, &mut guards);
    let general_json = daily_writer(dir, "bot.jsonl", &mut guards);
    let timing_text = daily_writer(dir, "timing.log", &mut guards);
    let timing_json = daily_writer(dir, "timing.jsonl", &mut guards);

    let general = general_filter(parse_log_level(&config.log_level));
    let timing = timing_filter();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(general.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(general_text)
                .with_ansi(false)
                .with_filter(general.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(general_json)
                .with_filter(general),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(timing_text)
                .with_ansi(false)
                .with_filter(timing.clone()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(timing_json)
                .with_filter(timing),
        )
        .init();

    LoggingGuards { _guards: guards }
}

/// Last `max_lines` of the newest rolled file whose name starts with `base_name`.
pub fn read_recent_log_lines(dir: &Path, base_name: &str, max_lines: usize) -> io::Result<Option<LogTail>> {
    if max_lines == 0 {
        return Ok(None);
    }

    let Some(path) = newest_log_file(dir, base_name)? else {
        return Ok(None);
    };

    let lines = tail_file_lines(&path, max_lines)?;
    Ok(Some(LogTail { path, lines }))
}

fn newest_log_file(dir: &Path, base_name: &str) -> io::Result<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        // `bot.log` must not pick up `bot.jsonl`.
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name == base_name || name.starts_with(&format!("{base_name}.")));
        if !path.is_file() || !matches {
            continue;
        }

        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(current, _)| modified > *current) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

fn tail_file_lines(path: &Path, max_lines: usize) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut ring = VecDeque::with_capacity(max_lines);

    for line in reader.lines() {
        if ring.len() == max_lines {
            ring.pop_front();
        }
        ring.push_back(line?);
    }

    Ok(ring.into())
}

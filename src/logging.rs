//! Tracing subscriber setup.
//!
//! DESIGN
//! ======
//! Every line is stamped in UTC (`YYYY-MM-DDTHH:MM:SSZ`) regardless of the
//! host timezone so audit entries correlate across machines. Output goes to
//! stderr and to `infra.log`, which rotates by size (`infra.log.1` is the
//! newest backup). Production writes under `/var/log/` and refuses to start if
//! that directory is absent.
//!
//! `tracing` has no critical level; critical events are logged at `ERROR`
//! with a `severity = "critical"` field. At `LogLevel::Critical` only those
//! events pass.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use time::macros::format_description;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, time::FormatTime, time::UtcTime};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::AppEnv;

pub const LOG_FILE_NAME: &str = "infra.log";
pub const DEFAULT_LOG_MAX_BYTES: usize = 500_000;
pub const DEFAULT_LOG_BACKUPS: usize = 5;
const PROD_LOG_DIR: &str = "/var/log";
const SEVERITY_FIELD: &str = "severity";
const CRITICAL: &str = "critical";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("production log directory '{0}' does not exist")]
    MissingDirectory(PathBuf),
    #[error("failed to open log file {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    #[must_use]
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            Self::Error | Self::Critical => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Accepts level names or the conventional numeric levels 10..=50.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "debug" | "10" => Ok(Self::Debug),
            "info" | "20" => Ok(Self::Info),
            "warning" | "warn" | "30" => Ok(Self::Warning),
            "error" | "40" => Ok(Self::Error),
            "critical" | "50" => Ok(Self::Critical),
            other => Err(format!(
                "unknown log level '{other}' (expected debug|info|warning|error|critical or 10-50)"
            )),
        }
    }
}

/// Size-based rotation of the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRotation {
    /// Bytes written to `infra.log` before it is rotated.
    pub max_bytes: usize,
    /// Rotated files kept; older ones are deleted.
    pub backups: usize,
}

impl Default for LogRotation {
    fn default() -> Self {
        Self { max_bytes: DEFAULT_LOG_MAX_BYTES, backups: DEFAULT_LOG_BACKUPS }
    }
}

/// Passes only events carrying `severity = "critical"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CriticalOnly;

impl<S: Subscriber> Layer<S> for CriticalOnly {
    fn event_enabled(&self, event: &Event<'_>, _ctx: Context<'_, S>) -> bool {
        let mut visitor = SeverityVisitor::default();
        event.record(&mut visitor);
        visitor.critical
    }
}

#[derive(Default)]
struct SeverityVisitor {
    critical: bool,
}

impl Visit for SeverityVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == SEVERITY_FIELD && value == CRITICAL {
            self.critical = true;
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

/// The extra event filter `level` needs on top of its `LevelFilter`.
#[must_use]
pub fn severity_filter(level: LogLevel) -> Option<CriticalOnly> {
    (level == LogLevel::Critical).then_some(CriticalOnly)
}

/// Pick the log file location for the given environment.
///
/// # Errors
///
/// Returns `LoggingError::MissingDirectory` when the production directory is
/// absent, or `LoggingError::Open` if a non-production directory cannot be
/// created.
pub fn resolve_log_path(app_env: &AppEnv, log_dir: Option<&Path>) -> Result<PathBuf, LoggingError> {
    let dir = match log_dir {
        Some(dir) => dir.to_path_buf(),
        None if app_env.is_prod() => PathBuf::from(PROD_LOG_DIR),
        None => PathBuf::from("."),
    };

    if app_env.is_prod() {
        if !dir.is_dir() {
            return Err(LoggingError::MissingDirectory(dir));
        }
    } else {
        std::fs::create_dir_all(&dir).map_err(|source| LoggingError::Open { path: dir.clone(), source })?;
    }

    Ok(dir.join(LOG_FILE_NAME))
}

fn utc_timer() -> impl FormatTime {
    UtcTime::new(format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z"))
}

/// Open the size-rotated log file at `path`.
///
/// # Errors
///
/// Returns `LoggingError::Open` if the file cannot be created or appended to.
pub fn rotating_writer(path: &Path, rotation: LogRotation) -> Result<FileRotate<AppendCount>, LoggingError> {
    // FileRotate defers open errors to the first write; surface them here.
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::Open { path: path.to_path_buf(), source })?;

    Ok(FileRotate::new(
        path,
        AppendCount::new(rotation.backups),
        ContentLimit::Bytes(rotation.max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}

/// Install the global subscriber. Returns the log file path in use.
///
/// # Errors
///
/// Returns `LoggingError` if the log file cannot be opened or a global
/// subscriber is already installed.
pub fn init(
    level: LogLevel,
    app_env: &AppEnv,
    log_dir: Option<&Path>,
    rotation: LogRotation,
) -> Result<PathBuf, LoggingError> {
    let path = resolve_log_path(app_env, log_dir)?;
    let file = rotating_writer(&path, rotation)?;

    let console = fmt::layer().with_timer(utc_timer()).with_writer(std::io::stderr);
    let file_layer = fmt::layer()
        .with_timer(utc_timer())
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    tracing_subscriber::registry()
        .with(level.level_filter())
        .with(severity_filter(level))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(path)
}

#[cfg(test)]
#[path = "logging_test.rs"]
mod tests;

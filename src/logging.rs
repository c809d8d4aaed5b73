//! Logging setup shared by the supervisor and worker processes.
//!
//! All output goes to stderr: a worker's stdout carries its control channel.
//!
//! # Environment Variables
//!
//! - `INGESTD_LOG` - Log filter (overrides RUST_LOG)
//! - `INGESTD_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `INGESTD_LOG_FORMAT` - Output format: pretty, compact, json
//! - `INGESTD_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker processes inherit the supervisor's effective settings through
//! [`LogConfig::worker_env`].

use std::io::IsTerminal;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Filter variable, also used to hand settings to workers.
pub const LOG_ENV: &str = "INGESTD_LOG";
/// Format variable, also used to hand settings to workers.
pub const LOG_FORMAT_ENV: &str = "INGESTD_LOG_FORMAT";
/// Log file variable, also used to hand settings to workers.
pub const LOG_FILE_ENV: &str = "INGESTD_LOG_FILE";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level when no filter is set (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Log file written alongside stderr
    pub file_path: Option<PathBuf>,
    /// Filter directives; take precedence over `level`
    pub filter: Option<String>,
    /// Colored stderr output (default: stderr is a terminal)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            ansi: std::io::stderr().is_terminal(),
        }
    }
}

impl LogConfig {
    /// Configuration for the given `-v` count and `-q` flag.
    ///
    /// Explicit flags become a filter so environment variables cannot
    /// override them.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let config = Self::default();
        let level = match (quiet, verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => return config,
            (false, 1) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        config.with_level(level).with_filter(level_directive(level))
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// `INGESTD_LOG`/`RUST_LOG` and `INGESTD_LOG_LEVEL` only apply when no
    /// filter came from the command line.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var(LOG_ENV) {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none() {
            if let Some(level) = std::env::var("INGESTD_LOG_LEVEL")
                .ok()
                .and_then(|s| parse_level(&s))
            {
                self.level = level;
            }
        }

        if let Ok(format) = std::env::var(LOG_FORMAT_ENV) {
            if let Ok(f) = format.parse() {
                self.format = f;
            }
        }

        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// Filter directives in effect.
    pub fn effective_filter(&self) -> String {
        self.filter
            .clone()
            .unwrap_or_else(|| level_directive(self.level))
    }

    /// Environment that makes a worker log the way this process does.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (LOG_ENV.to_string(), self.effective_filter()),
            (LOG_FORMAT_ENV.to_string(), self.format.to_string()),
        ];
        if let Some(path) = &self.file_path {
            env.push((LOG_FILE_ENV.to_string(), path.display().to_string()));
        }
        env
    }

    fn build_filter(&self) -> EnvFilter {
        let directives = self.effective_filter();
        EnvFilter::try_new(&directives).unwrap_or_else(|_| {
            eprintln!("Warning: Invalid log filter '{}', using default", directives);
            EnvFilter::new(level_directive(self.level))
        })
    }
}

fn level_directive(level: Level) -> String {
    level.to_string().to_lowercase()
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_ansi(ansi).with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Initialize the global tracing subscriber.
///
/// Logs to stderr, and to `config.file_path` when set (never rotated, so
/// every process of a pool appends to the same file). Subsequent calls are
/// silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![fmt_layer(config.format, config.ansi, std::io::stderr)];

    if let Some(path) = &config.file_path {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("ingestd.log");
        let appender = RollingFileAppender::new(Rotation::NEVER, parent, file_name);
        layers.push(fmt_layer(config.format, false, appender));
    }

    // Silently ignore if already initialized
    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

//! Logging bootstrap.
//!
//! Installs a `tracing-subscriber` registry with one formatting layer chosen
//! from [`LogFormat`]. `RUST_LOG` takes precedence over the configured level,
//! so `RUST_LOG=visa_vulture::instruments=trace` shows raw SCPI traffic.
//!
//! # Example
//! ```no_run
//! use visa_vulture::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use crate::error::{VultureError, VultureResult};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log line layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, coloured on a terminal
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = VultureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(VultureError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: pretty, compact, json",
                s
            ))),
        }
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: LevelFilter,
    /// Line layout
    pub format: LogFormat,
    /// Emit an event when a span (such as a test run) opens and closes
    pub span_events: bool,
    /// Append here instead of writing to stdout
    pub log_file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Pretty,
            span_events: false,
            log_file: None,
        }
    }
}

impl LogSettings {
    /// Level, format and file from the application config.
    pub fn from_app_config(config: &AppConfig) -> VultureResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.log_level)?,
            format: config.log_format.parse()?,
            log_file: config.log_file.clone(),
            ..Self::default()
        })
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }
}

/// Install the global subscriber from `config`.
pub fn init_from_config(config: &AppConfig) -> VultureResult<()> {
    init(&LogSettings::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// A second call is a no-op, so tests and embedders may call it freely.
pub fn init(settings: &LogSettings) -> VultureResult<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(settings.level.into())
        .from_env_lossy();

    let file = settings
        .log_file
        .as_ref()
        .map(|path| {
            OpenOptions::new().create(true).append(true).open(path).map_err(|e| {
                VultureError::Configuration(format!(
                    "Cannot open log file {}: {}",
                    path.display(),
                    e
                ))
            })
        })
        .transpose()?;

    let layer = format_layer(settings, file).with_filter(filter);
    // Err only when a subscriber is already installed.
    let _ = tracing_subscriber::registry().with(layer).try_init();
    Ok(())
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer(settings: &LogSettings, file: Option<File>) -> BoxedLayer {
    let span_events = if settings.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer().with_span_events(span_events).with_target(true);

    match (settings.format, file) {
        (LogFormat::Pretty, None) => base.pretty().boxed(),
        (LogFormat::Pretty, Some(file)) => base
            .pretty()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed(),
        (LogFormat::Compact, None) => base.compact().boxed(),
        (LogFormat::Compact, Some(file)) => base
            .compact()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .boxed(),
        (LogFormat::Json, None) => base.json().boxed(),
        (LogFormat::Json, Some(file)) => base.json().with_writer(Mutex::new(file)).boxed(),
    }
}

/// Parse a level name. "warning" is accepted as an alias of "warn".
pub fn parse_log_level(level: &str) -> VultureResult<LevelFilter> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        _ => Err(VultureError::Configuration(format!(
            "Invalid log_level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}

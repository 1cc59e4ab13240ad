//! Tracing setup for the command-line tool.
//!
//! The driver crate only emits `tracing` events; this module installs the
//! subscriber that prints them:
//! - an `EnvFilter` (`RUST_LOG` wins over the configured level)
//! - a pretty, compact or JSON `fmt` layer
//!
//! # Example
//! ```no_run
//! use edl_daq::{config::AppConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("ready");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::AppConfig;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (for interactive use)
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Structured JSON (for log collection)
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level emitted
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include the thread name
    pub with_thread_names: bool,
    /// ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Config at `level` with the other options at their defaults.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Level and format from the application configuration.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;
        Ok(Self {
            level,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span open and close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Raise the level to at least `level` (used by `-v` flags).
    pub fn at_least(mut self, level: Level) -> Self {
        // tracing orders levels by verbosity: TRACE > DEBUG > ... > ERROR
        if level > self.level {
            self.level = level;
        }
        self
    }
}

/// Initialize logging from the application configuration.
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(LoggingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Calling this again after a subscriber is installed is a no-op, so tests
/// and embedding applications can call it freely.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize logging: {}", e))
            }
        })
}

/// Parse a log level name.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

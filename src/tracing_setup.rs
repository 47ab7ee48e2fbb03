//! Tracing initialisation.
//!
//! Sets up a `tracing-subscriber` registry with one formatting layer (pretty,
//! compact or JSON) behind an `EnvFilter`. `RUST_LOG` wins over the configured
//! level when it is set.
//!
//! # Example
//! ```no_run
//! use daq_relay::{config::AppConfig, tracing_setup};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! tracing_setup::init_from_config(&config)?;
//! info!("Relay starting");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// Single-line, no colours (services)
    Compact,
    /// One JSON object per line (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(DaqError::Configuration(format!(
                "Invalid log format '{s}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Tracing options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
    /// Enable ANSI colours (pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: true,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Options from the `application` section.
    pub fn from_app_config(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Options with a custom level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colours
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialise tracing from the relay configuration.
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(TracingConfig::from_app_config(config)?)
}

/// Initialise tracing.
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`,
/// so tests and embedding applications can call it freely.
pub fn init(config: TracingConfig) -> AppResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
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
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Expected in tests and when several components race to initialise.
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(DaqError::Configuration(format!(
            "Failed to initialize tracing: {e}"
        ))),
    }
}

/// Parse a log level name (case-insensitive).
fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        DaqError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}

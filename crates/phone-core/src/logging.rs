//! Logging setup
//!
//! The core logs through `tracing`. Applications that do not install their own
//! subscriber can call [`setup_logging`]. Engine log lines are re-emitted under
//! the [`ENGINE_TARGET`] target at the level mapped from the engine's own
//! severity.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::engine::EngineLogLevel;
use crate::error::{PhoneError, PhoneResult};

/// Target used for lines forwarded from the engine
pub const ENGINE_TARGET: &str = "sipline::engine";

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// The log level to use
    pub level: Level,
    /// Whether to enable JSON formatting
    pub json: bool,
    /// Whether to include file and line information
    pub file_info: bool,
    /// Whether to log spans
    pub log_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
            log_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }

    pub fn with_spans(mut self) -> Self {
        self.log_spans = true;
        self
    }
}

/// Install a global fmt subscriber
///
/// Fails if another global subscriber is already installed.
pub fn setup_logging(config: LoggingConfig) -> PhoneResult<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.level.into());

    let span_events = if config.log_spans {
        FmtSpan::ACTIVE
    } else {
        FmtSpan::NONE
    };

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_span_events(span_events)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_thread_names(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| PhoneError::configuration("logging", e.to_string()))
}

/// Parse a log level from a string
pub fn parse_log_level(level: &str) -> PhoneResult<Level> {
    Level::from_str(level)
        .map_err(|_| PhoneError::configuration("log_level", format!("Invalid log level: {}", level)))
}

/// Re-emit an engine log line through tracing
pub(crate) fn forward_engine_log(level: EngineLogLevel, domain: &str, message: &str) {
    match level {
        EngineLogLevel::Debug => tracing::debug!(target: ENGINE_TARGET, domain, "{}", message),
        EngineLogLevel::Trace => tracing::trace!(target: ENGINE_TARGET, domain, "{}", message),
        EngineLogLevel::Message => tracing::info!(target: ENGINE_TARGET, domain, "{}", message),
        EngineLogLevel::Warning => tracing::warn!(target: ENGINE_TARGET, domain, "{}", message),
        EngineLogLevel::Error | EngineLogLevel::Fatal => {
            tracing::error!(target: ENGINE_TARGET, domain, "{}", message)
        }
        EngineLogLevel::Off => {}
    }
}

//! Log subscriber setup for the batch and server binaries.
//!
//! `RM_LOG_LEVEL` takes an `EnvFilter` directive, `RM_LOG_FORMAT` is `json` or
//! `pretty` and `RM_LOG_TARGET` toggles the target field. Invalid values are
//! [`ConfigError::Invalid`], the same as every other `RM_*` variable.

use std::net::SocketAddr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

use crate::config::{invalid, non_empty, parse_bool, ConfigError};

const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl LogFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `radar_moisture=debug`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::default(),
            include_target: true,
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> Result<EnvFilter, ParseError> {
        EnvFilter::try_new(&self.level)
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

pub fn logging_config_from_env() -> Result<LoggingConfig, ConfigError> {
    let mut config = LoggingConfig::default();

    if let Some(level) = non_empty("RM_LOG_LEVEL") {
        config.level = level;
        config
            .env_filter()
            .map_err(|err| invalid("RM_LOG_LEVEL", &config.level, &err.to_string()))?;
    }
    if let Some(raw) = non_empty("RM_LOG_FORMAT") {
        config.format = LogFormat::parse(&raw)
            .ok_or_else(|| invalid("RM_LOG_FORMAT", &raw, "expected json or pretty"))?;
    }
    if let Some(raw) = non_empty("RM_LOG_TARGET") {
        config.include_target = parse_bool(&raw)
            .ok_or_else(|| invalid("RM_LOG_TARGET", &raw, "expected a boolean"))?;
    }

    Ok(config)
}

/// Installs the global subscriber, writing to stderr so stdout stays free
/// for exported CSV.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter()?)
        .with_target(config.include_target)
        .with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Json => builder.json().with_ansi(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|err| LoggingInitError::AlreadyInitialized(err.to_string()))
}

pub fn log_app_start(component: &'static str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        crate_name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        log_level = %config.level,
        log_format = config.format.as_str(),
        include_target = config.include_target
    );
}

pub fn log_app_bind(component: &'static str, bound_addr: SocketAddr, routes: &[&str]) {
    info!(
        component,
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = %routes.join(",")
    );
}

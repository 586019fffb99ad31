//! Log sink setup
//!
//! Installs a `tracing-subscriber` fmt layer behind a reloadable
//! `EnvFilter`. The returned `Logger` is the only way to change the level
//! afterwards.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::AppError;

/// Target the level directive applies to
const LOG_TARGET: &str = "ws_relay";

/// Minimum level emitted, ordered from quietest filter to loudest
///
/// `None` emits nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    None,
    Verbose,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// `tracing` level name for this setting
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::None => "off",
            Self::Verbose => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }

    /// Filter directive scoped to this crate
    pub fn directive(self) -> String {
        format!("{}={}", LOG_TARGET, self.as_filter())
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "verbose" | "trace" => Ok(Self::Verbose),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(AppError::Logging(format!("unknown log level: {}", other))),
        }
    }
}

/// Handle to the installed subscriber
#[derive(Clone)]
pub struct Logger {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl Logger {
    /// Install the global subscriber
    ///
    /// `RUST_LOG`, when set, takes precedence over `level`. Fails if a
    /// subscriber is already installed.
    pub fn init(level: LogLevel, color: bool) -> Result<Self, AppError> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.directive()));
        let (filter, handle) = reload::Layer::new(filter);

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(color))
            .try_init()
            .map_err(|e| AppError::Logging(e.to_string()))?;

        Ok(Self { handle })
    }

    /// Replace the active filter
    pub fn set_level(&self, level: LogLevel) -> Result<(), AppError> {
        self.handle
            .reload(EnvFilter::new(level.directive()))
            .map_err(|e| AppError::Logging(e.to_string()))
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

//! Tracing setup.
//!
//! Structured logging through `tracing` with one `fmt` layer chosen by
//! `[logging] format`:
//!
//! - `pretty`: multi-line with colours, for running by hand
//! - `compact`: single line, no colours, for service managers
//! - `json`: one object per event, for log collectors
//!
//! `RUST_LOG` overrides `[logging] level` when set.
//!
//! ```no_run
//! use asicam::{config::ServiceConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::load()?;
//! logging::init(&config.logging)?;
//! tracing::info!(port = config.server.port, "Starting");
//! # Ok(())
//! # }
//! ```

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colours
    Pretty,
    /// Single line without colours
    Compact,
    /// JSON objects
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Parse a level name, case-insensitively.
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

fn already_set(e: &tracing_subscriber::util::TryInitError) -> bool {
    e.to_string()
        .contains("a global default trace dispatcher has already been set")
}

/// Install the global subscriber.
///
/// Idempotent: a second call (tests, embedding) returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    let level = parse_log_level(&config.level)?;
    let format: OutputFormat = config.format.parse()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if already_set(&e) => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

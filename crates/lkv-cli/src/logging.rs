use lkv_core::config::{LogConfig, LogFormat};
use std::io;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. Logs go to stderr so stdout stays
/// reserved for command output (`get --plain` pipes the raw key).
///
/// `RUST_LOG` overrides `logging.level` when set.
pub fn init(config: &LogConfig, verbose: bool) -> lkv_core::Result<()> {
    let default_level = if verbose {
        Level::DEBUG
    } else {
        parse_log_level(&config.level)?
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let result = match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(io::stderr)
                .with_current_span(true)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        }
        LogFormat::Pretty => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(io::stderr)
                .with_target(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .try_init()
        }
    };

    result.map_err(|e| lkv_core::Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn parse_log_level(level: &str) -> lkv_core::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(lkv_core::Error::Config(format!("Invalid log level: {}", other))),
    }
}

/*!
 * Logging and tracing initialization
 */

use std::fs::File;
use std::sync::Mutex;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::config::LoggingConfig;
use crate::error::{Result, TollgateError};

/// Where log events are written
#[derive(Debug)]
enum LogSink {
    /// Compact human-readable lines; stdout stays free for command output
    Stderr,
    /// One JSON object per event
    File(File),
}

impl LogSink {
    fn for_config(config: &LoggingConfig) -> Result<Self> {
        match &config.file {
            None => Ok(LogSink::Stderr),
            Some(path) => File::create(path).map(LogSink::File).map_err(|e| {
                TollgateError::Config(format!(
                    "Failed to create log file {}: {}",
                    path.display(),
                    e
                ))
            }),
        }
    }
}

/// Initialize structured logging based on configuration
///
/// Fails if the log file cannot be created or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(config)?;

    let output = match LogSink::for_config(config)? {
        LogSink::Stderr => console_layer::<Registry>().boxed(),
        LogSink::File(file) => json_layer::<Registry>(file).boxed(),
    };

    tracing_subscriber::registry()
        .with(output.with_filter(env_filter))
        .try_init()
        .map_err(|e| TollgateError::Config(format!("Failed to install log subscriber: {}", e)))
}

fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.level.to_tracing_level()
    }
}

/// `RUST_LOG` wins; otherwise both crates log at the configured level
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let log_level = effective_level(config);

    EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(format!(
                "tollgate={log_level},tollgate_core_resilience={log_level}"
            ))
        })
        .map_err(|e| TollgateError::Config(format!("Failed to create log filter: {}", e)))
}

fn console_layer<S>() -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
}

fn json_layer<S>(file: File) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .json()
        .flatten_event(true)
}

//! Logging.

use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer};

/// Environment variable holding the log filtering directives.
pub const LOG_LEVEL_ENV_VAR: &str = "SKEIN_LOG_LEVEL";

/// Environment variable selecting JSON-formatted output.
pub const LOG_FORMAT_JSON_ENV_VAR: &str = "SKEIN_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `SKEIN_LOG_LEVEL` environment variable to determine the filtering directives to use. If the
/// environment variable is not set, `default_level` is used, or `INFO` if that is not set either. Additionally, it reads
/// the `SKEIN_LOG_FORMAT_JSON` environment variable to determine which output format to use. If it is set to `true` or
/// `1`, the logs will be formatted as JSON. Otherwise, the logs will be written in a colored, human-readable format
/// that includes the name of the emitting thread, since worker and supervisor threads are named after their pools.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = is_json_format(std::env::var(LOG_FORMAT_JSON_ENV_VAR).ok().as_deref());

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    if is_json {
        tracing_subscriber::registry()
            .with(initialize_tracing_json().with_filter(level_filter))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(initialize_tracing_pretty().with_filter(level_filter))
            .try_init()?;
    }

    Ok(())
}

fn is_json_format(value: Option<&str>) -> bool {
    value
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false)
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_ansi(true)
        .with_target(true)
        .with_thread_names(true)
}

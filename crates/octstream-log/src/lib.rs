//! Structured logging for the octstream server.
//!
//! Console output with uptime timestamps, plus an optional JSON file for
//! post-mortem analysis. `RUST_LOG` wins over the configured level.

use std::path::Path;

use octstream_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";
const LOG_FILE: &str = "octstream.log";

/// Install the global tracing subscriber.
///
/// * `log_dir` - directory for the JSON log file
/// * `json_file` - also write JSON records to `log_dir/octstream.log`
/// * `config` - source of the default log level
///
/// ```no_run
/// use octstream_log::init_logging;
///
/// init_logging(Some(std::path::Path::new("./logs")), true, None);
/// ```
pub fn init_logging(log_dir: Option<&Path>, json_file: bool, config: Option<&Config>) {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_timer(fmt::time::uptime()),
        );

    if json_file
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = std::fs::File::create(log_dir.join(LOG_FILE))
    {
        let file_layer = fmt::layer()
            .with_writer(log_file)
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json();

        subscriber.with(file_layer).init();
        tracing::info!("logging to {}", log_dir.join(LOG_FILE).display());
        return;
    }

    subscriber.init();
}

/// The level filter `init_logging` would install, before `RUST_LOG`.
pub fn configured_filter(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

fn env_filter(config: Option<&Config>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured_filter(config)))
}

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "conveyor.log";

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// With `log_dir` set, events are appended to `conveyor.log` in that
/// directory instead of stdout.
pub fn install_tracing_from_config(cfg: &conveyor_config::LoggingConfig) -> anyhow::Result<()> {
    let filter = || {
        let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| cfg.level.clone());
        EnvFilter::new(directives)
    };

    let log_file = match cfg.log_dir.as_deref() {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(Path::new(dir).join(LOG_FILE_NAME))?,
            )
        }
        None => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_timer(ChronoUtc::rfc_3339());

    let installed = match (cfg.json, log_file) {
        (true, Some(file)) => builder
            .json()
            .with_writer(Mutex::new(file))
            .try_init(),
        (true, None) => builder.json().try_init(),
        (false, Some(file)) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        (false, None) => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, Layer,
};

/// Keeps the file writer thread alive; drop it last
pub struct LogGuard {
    _worker: WorkerGuard,
    pub path: PathBuf,
}

/// Install the global subscriber: stderr and/or a per-run log file.
///
/// `RUST_LOG` overrides `config.level`.
pub fn init(config: &LogConfig) -> Result<Option<LogGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.parse_level().into())
        .from_env_lossy();

    let console_layer = config.console_output.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter.clone())
    });

    let (file_layer, guard) = match open_log_file(config)? {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    match &guard {
        Some(guard) => tracing::info!(
            "Logging at level {} (file: {:?})",
            config.level,
            guard.path
        ),
        None => tracing::info!("Logging at level {}", config.level),
    }

    Ok(guard)
}

fn open_log_file(config: &LogConfig) -> Result<Option<(NonBlocking, LogGuard)>> {
    if !config.file_output {
        return Ok(None);
    }

    config
        .ensure_log_directory()
        .with_context(|| format!("Failed to create log directory {:?}", config.log_dir))?;

    // Subscriber is not installed yet
    match config.cleanup_old_logs() {
        Ok(0) => {}
        Ok(n) => eprintln!("Removed {} old log file(s)", n),
        Err(e) => eprintln!("Warning: Failed to cleanup old log files: {}", e),
    }

    let path = config.current_log_path();
    let file =
        File::create(&path).with_context(|| format!("Failed to create log file {:?}", path))?;
    let (writer, worker) = tracing_appender::non_blocking(file);

    Ok(Some((
        writer,
        LogGuard {
            _worker: worker,
            path,
        },
    )))
}

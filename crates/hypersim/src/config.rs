//! Application configuration, loaded from an optional TOML file.
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 7890
//! read_timeout_ms = 3000
//!
//! [log]
//! level = "debug"
//! file_output = true
//! log_dir = "logs"
//! ```
//!
//! Every key is optional; missing keys take their defaults.

use anyhow::{Context, Result};
use hypersim_opc::OpcServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;

/// Maximum config file size accepted by [`AppConfig::load`]
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: OpcServerConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load from `path`, or use defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let size = fs::metadata(path)
            .with_context(|| format!("Cannot read config file {:?}", path))?
            .len();
        if size > MAX_CONFIG_FILE_SIZE {
            anyhow::bail!(
                "Config file {:?} is {} bytes (limit {})",
                path,
                size,
                MAX_CONFIG_FILE_SIZE
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.server.validate()?;
        Ok(config)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    /// Number of log files kept in `log_dir`
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: false,
            log_dir: PathBuf::from("logs"),
            max_files: 10,
        }
    }
}

impl LogConfig {
    /// Parsed level, INFO if the string is not a level name
    pub fn parse_level(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::INFO)
    }

    pub fn ensure_log_directory(&self) -> std::io::Result<()> {
        if self.file_output {
            fs::create_dir_all(&self.log_dir)?;
        }
        Ok(())
    }

    /// Path of the log file for this run
    pub fn current_log_path(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
        self.log_dir.join(format!("hypersim_{}.log", timestamp))
    }

    /// Delete the oldest `hypersim_*.log` files so that at most
    /// `max_files - 1` remain before the new one is created
    pub fn cleanup_old_logs(&self) -> std::io::Result<usize> {
        if !self.file_output || !self.log_dir.exists() {
            return Ok(0);
        }

        let mut logs: Vec<PathBuf> = fs::read_dir(&self.log_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("hypersim_") && name.ends_with(".log"))
            })
            .collect();

        let keep = self.max_files.saturating_sub(1);
        if logs.len() <= keep {
            return Ok(0);
        }

        // Timestamped names sort chronologically
        logs.sort();
        let excess = logs.len() - keep;
        let mut removed = 0;
        for path in logs.into_iter().take(excess) {
            fs::remove_file(&path)?;
            removed += 1;
        }
        Ok(removed)
    }
}

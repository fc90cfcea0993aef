mod file_config;

pub use file_config::FileConfig;

use crate::task_store::{DEFAULT_LOG_RETENTION_DAYS, MAX_CRON_TIME, TRIGGER_WINDOW};
use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub budget_secs: u64,
    pub trigger_window_secs: i64,
    pub log_retention_days: i64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            port: 3080,
            budget_secs: MAX_CRON_TIME as u64,
            trigger_window_secs: TRIGGER_WINDOW,
            log_retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub budget_secs: u64,
    pub trigger_window_secs: i64,
    pub log_retention_days: i64,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let budget_secs = file.budget_secs.unwrap_or(cli.budget_secs);
        let trigger_window_secs = file.trigger_window_secs.unwrap_or(cli.trigger_window_secs);
        let log_retention_days = file.log_retention_days.unwrap_or(cli.log_retention_days);

        if budget_secs == 0 {
            bail!("budget_secs must be greater than zero");
        }

        Ok(Self {
            db_dir,
            port,
            budget_secs,
            trigger_window_secs,
            log_retention_days,
        })
    }

    pub fn cron_db_path(&self) -> PathBuf {
        self.db_dir.join("cron.db")
    }
}

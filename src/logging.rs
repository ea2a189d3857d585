// src/logging.rs

//! Log output for the `labflow` binary.
//!
//! `--log-level` sets one level for everything. Without it, `LABFLOW_LOG`
//! is read as filter directives, so `LABFLOW_LOG=info,labflow::scheduler=debug`
//! traces only the scheduler. Directives that do not parse are skipped and
//! `info` is the floor.
//!
//! Output goes to stderr. Jobs write to their own `.out` / `.err` markers.

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "LABFLOW_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli_level, env.as_deref()))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))
}

fn log_filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into());
    match cli_level {
        Some(level) => builder.parse_lossy(LevelFilter::from_level(level.into()).to_string()),
        None => builder.parse_lossy(env.unwrap_or_default()),
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_overrides_environment() {
        let filter = log_filter(Some(LogLevel::Warn), Some("trace"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn environment_directives_are_honoured() {
        let filter = log_filter(None, Some("info,labflow::scheduler=debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn info_without_flag_or_environment() {
        assert_eq!(log_filter(None, None).max_level_hint(), Some(LevelFilter::INFO));
    }
}

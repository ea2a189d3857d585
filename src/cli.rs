// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `labflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "labflow",
    version,
    about = "Schedule experiment jobs with dependencies, locks and tokens.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the manifest (TOML).
    ///
    /// Default: `Labflow.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Labflow.toml")]
    pub config: String,

    /// Exit once no job is ready or running any more.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LABFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse and validate the manifest, print it in submission order, but
    /// do not submit anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["labflow"]).unwrap();
        assert_eq!(args.config, "Labflow.toml");
        assert!(!args.once);
        assert!(!args.dry_run);
        assert!(args.log_level.is_none());
    }

    #[test]
    fn flags() {
        let args = CliArgs::try_parse_from([
            "labflow",
            "--config",
            "exp/Labflow.toml",
            "--once",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.config, "exp/Labflow.toml");
        assert!(args.once);
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }
}

//! CLI argument definitions for the Tidemark application.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use tidemark_core::config::{expand_home, TidemarkConfig};

/// Tidemark: a local browsing-activity log with a daily digest.
#[derive(Parser, Debug)]
#[command(name = "tidemark", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port", global = true)]
    pub port: Option<u16>,

    /// Data directory for the SQLite database.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the API server and the scheduler (default).
    Serve,
    /// Build and deliver a digest now.
    Digest {
        /// Day to report on, YYYY-MM-DD. Defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Print the report instead of delivering it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print event store statistics and dwell totals.
    Stats,
    /// Delete every stored event and all page content.
    Clear {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

impl CliArgs {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }

    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TIDEMARK_CONFIG env var > ~/.tidemark/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TIDEMARK_CONFIG") {
            return PathBuf::from(p);
        }
        expand_home("~/.tidemark/config.toml")
    }

    /// Resolve the API server port.
    ///
    /// Priority: --port flag > TIDEMARK_PORT env var > config file value.
    pub fn resolve_port(&self, config_port: u16) -> u16 {
        if let Some(p) = self.port {
            return p;
        }
        std::env::var("TIDEMARK_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(config_port)
    }

    /// Fold command-line overrides into the loaded configuration.
    pub fn apply_overrides(&self, config: &mut TidemarkConfig) {
        config.general.port = self.resolve_port(config.general.port);
        if let Some(dir) = &self.data_dir {
            config.general.data_dir = dir.to_string_lossy().to_string();
        }
        if let Some(level) = &self.log_level {
            config.general.log_level = level.clone();
        }
    }
}

//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Virtual gateway - capability discovery and composite tool workflows
#[derive(Parser, Debug)]
#[command(name = "vmcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "VMCP_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "VMCP_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "VMCP_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration or a standalone composite tool file
    Validate {
        /// Composite tool or configuration YAML (defaults to --config)
        file: Option<PathBuf>,
    },

    /// Print the fully merged configuration as YAML
    ShowConfig,
}

//! Command-line interface definition for toolgate
//!
//! This module defines the CLI structure using clap's derive API. Every
//! command loads the gateway configuration, and all but `validate` start the
//! gateway so they see live servers.

use clap::{Parser, Subcommand};

/// toolgate - resilient gateway for out-of-process tool servers
///
/// Connects to the configured tool servers, indexes their tools and calls
/// them with retries, circuit breaking and health tracking.
#[derive(Parser, Debug, Clone)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TOOLGATE_CONFIG", default_value = "toolgate.yaml")]
    pub config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List configured servers with their health
    Servers {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List the tools offered by enabled servers
    Tools {
        /// Only tools matching this name or glob (`get_*`)
        #[arg(short, long)]
        pattern: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Call a tool and print the response
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Send to this server instead of routing by name
        #[arg(short, long)]
        server: Option<String>,

        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Probe every enabled server and report its health
    Health {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check the configuration file without connecting to anything
    Validate,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

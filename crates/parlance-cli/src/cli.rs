use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "parlance", about = "Control plane for the parlance chat platform")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane: API, supervisors, event delivery workers.
    Serve {
        /// Path to the YAML config file. Defaults apply when omitted.
        #[arg(long, env = "PARLANCE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Check the health endpoint of a running control plane.
    Check {
        #[arg(long, default_value = "http://127.0.0.1:8075")]
        url: String,
        /// Bearer token, when the API has auth enabled.
        #[arg(long, env = "PARLANCE_TOKEN")]
        token: Option<String>,
    },
}

//! CLI command definitions
//!
//! All CLI structs and subcommand enums are defined here.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Apple DEP device sync and enrollment profile assignment
#[derive(Parser, Debug)]
#[command(name = "dep-assigner")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.config/dep-assigner/config.yaml)
    #[arg(short, long, env = "DEP_ASSIGNER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default configuration file
    Init {
        /// Public URL devices use to reach the server
        #[arg(long, default_value = "https://localhost:8080")]
        server_url: String,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Run one assigner pass
    Run,

    /// Run assigner passes periodically until interrupted
    Daemon {
        /// Seconds between passes (overrides the config file)
        #[arg(long)]
        interval: Option<u64>,

        /// Rewrite this Prometheus textfile after every pass
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Show terms status, sync cursor and registered profiles
    Status,

    /// Manage custom setup assistants
    #[command(subcommand)]
    SetupAssistant(SetupAssistantCommand),

    /// Manage teams
    #[command(subcommand)]
    Team(TeamCommand),

    /// Run one full pass, then print its Prometheus metrics
    ///
    /// Counters only live in this process, so this performs a real pass:
    /// profiles are defined and assigned with DEP. Use `daemon
    /// --metrics-file` to export metrics without extra passes.
    Metrics,
}

#[derive(Subcommand, Debug)]
pub enum SetupAssistantCommand {
    /// Upload (or replace) a custom setup assistant profile
    Set(SetAssistantArgs),

    /// Remove the custom setup assistant of a team (or of no team)
    Delete {
        /// Team name (default: no team)
        #[arg(long)]
        team: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct SetAssistantArgs {
    /// DEP profile JSON file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Team name (default: no team)
    #[arg(long)]
    pub team: Option<String>,

    /// Display name (default: the file name)
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum TeamCommand {
    /// Create a team
    Create {
        name: String,

        /// Enable end-user authentication for the team's devices
        #[arg(long)]
        end_user_auth: bool,
    },
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mirra", version, about = "Synchronization worker for the mirra registry mirror")]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "mirra.toml")]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// HTTP proxy URL for upstream requests
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    /// Override the HTTP user agent
    #[arg(long, global = true)]
    pub user_agent: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the change-feed subscriptions and sync workers
    Run {
        /// Drain the queues once and exit instead of running forever
        #[arg(long)]
        once: bool,
    },
    /// Recover stuck tasks and exit
    Sweep,
    /// Queue one package for synchronization
    Enqueue {
        /// Package fullname, e.g. `lodash` or `@scope/pkg`
        package: String,

        /// Restrict the sync to these versions (repeatable)
        #[arg(short = 'V', long = "version")]
        versions: Vec<String>,

        /// Delete and re-publish the listed versions even if held locally
        #[arg(long)]
        force: bool,

        /// Sync from this configured registry
        #[arg(long)]
        registry: Option<String>,
    },
}

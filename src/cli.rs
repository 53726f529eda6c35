use std::{path::PathBuf, sync::OnceLock};

use clap::{Parser, Subcommand};

/// Status aggregation and housekeeping for a fleet of container hosts.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "fleetd.toml")]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the status monitor until interrupted
    Monitor,
    /// Probe every node once and print the result
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Manage applications
    #[command(subcommand)]
    Apps(AppsCommand),
}

#[derive(Subcommand, Debug)]
pub enum AppsCommand {
    Create {
        name: String,
        /// One of the supported build packs, e.g. python
        build_pack: String,
    },
    Destroy {
        name: String,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    List,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

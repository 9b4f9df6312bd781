//! TreePrefetch CLI - Command-line interface
//!
//! Runs the prefetch engine against a synthetic in-memory block tree and
//! reports the aggregate sync progress.

mod commands;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::simulate::{ActionArg, SimulateArgs};
use error::CliError;

#[derive(Parser)]
#[command(name = "treeprefetch")]
#[command(version, about = "Background block prefetching for content-addressed filesystems", long_about = None)]
struct Cli {
    /// Path to a config file (default: <config dir>/treeprefetch/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prefetch a synthetic block tree and report progress
    Simulate {
        /// Levels of indirect blocks below each root entry
        #[arg(long, default_value_t = 3)]
        depth: u32,

        /// Children per indirect block, and entries in the root directory
        #[arg(long, default_value_t = 4)]
        fanout: usize,

        /// Encoded size of every block, e.g. 512KB
        #[arg(long, default_value = "64KB")]
        block_size: String,

        /// Capacity of the sync cache partition, e.g. 10MB (unbounded if unset)
        #[arg(long)]
        sync_capacity: Option<String>,

        /// Prefetch action for the root block
        #[arg(long, value_enum, default_value_t = ActionArg::DeepSync)]
        action: ActionArg,

        /// Simulated retrieval latency per block in milliseconds
        #[arg(long, default_value_t = 2)]
        latency_ms: u64,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout: u64,

        /// Print the final sync status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate {
            depth,
            fanout,
            block_size,
            sync_capacity,
            action,
            latency_ms,
            timeout,
            json,
        } => commands::simulate::run(SimulateArgs {
            config: cli.config,
            depth,
            fanout,
            block_size,
            sync_capacity,
            action,
            latency_ms,
            timeout,
            json,
        }),
        Commands::Config => commands::config::run(cli.config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

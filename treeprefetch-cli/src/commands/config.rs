//! `config` command - print the effective configuration.

use std::path::Path;

use treeprefetch::config::default_config_path;

use super::load_config;
use crate::error::CliError;

pub fn run(path: Option<&Path>) -> Result<(), CliError> {
    let config = load_config(path)?;
    let source = path
        .map(Path::to_path_buf)
        .or_else(default_config_path)
        .filter(|p| p.exists());

    println!("Configuration Settings");
    println!("======================");
    match source {
        Some(p) => println!("Loaded from: {}", p.display()),
        None => println!("Loaded from: (defaults)"),
    }
    println!();

    let prefetch = &config.prefetch;
    println!("[prefetch]");
    println!("  node_timeout_secs        = {}", prefetch.node_timeout.as_secs());
    println!(
        "  status_interval_ms       = {}",
        prefetch.overall_status_interval.as_millis()
    );
    println!(
        "  low_space_threshold      = {}",
        prefetch.low_space_threshold_bytes
    );
    println!(
        "  backoff_initial_ms       = {}",
        prefetch.backoff.initial_interval.as_millis()
    );
    println!(
        "  backoff_max_ms           = {}",
        prefetch.backoff.max_interval.as_millis()
    );
    println!(
        "  backoff_max_elapsed_secs = {}",
        prefetch.backoff.max_elapsed.as_secs()
    );
    println!("  backoff_multiplier       = {}", prefetch.backoff.multiplier);
    println!();

    println!("[logging]");
    println!("  level     = {}", config.logging.level);
    match &config.logging.directory {
        Some(dir) => println!("  directory = {}", dir.display()),
        None => println!("  directory = (not set)"),
    }

    Ok(())
}

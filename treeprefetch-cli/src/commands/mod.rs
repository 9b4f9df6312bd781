//! CLI command implementations.

pub mod config;
pub mod simulate;

use std::path::Path;

use treeprefetch::config::ConfigFile;

use crate::error::CliError;

/// Loads the config file given on the command line, or the default one.
pub fn load_config(path: Option<&Path>) -> Result<ConfigFile, CliError> {
    let config = match path {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    Ok(config)
}

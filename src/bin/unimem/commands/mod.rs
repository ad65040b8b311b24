//! Command implementations

pub mod adapters;
pub mod ipc_open;
pub mod probe;
pub mod providers;

use std::path::Path;

use anyhow::{Context, Result};
use unimem::util::config::discover_config;
use unimem::Config;

/// Load the explicit config file, or discover the layered one.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => {
            let cwd = std::env::current_dir().context("failed to get current directory")?;
            Ok(discover_config(&cwd))
        }
    }
}

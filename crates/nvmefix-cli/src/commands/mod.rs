//! CLI command implementations.

pub mod hex;
pub mod patterns;
pub mod plan;
pub mod scan;

use anyhow::{Context, Result};
use nvmefix_core::Config;
use std::path::Path;
use tracing::info;

/// Load the configuration file, or the defaults when none is given.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

//! Patterns command implementation.

use anyhow::Result;
use nvmefix_core::builtin_patterns;
use nvmefix_core::offset::save_patterns;
use std::path::Path;
use tracing::info;

/// Run the patterns command
pub fn run(output: Option<&Path>) -> Result<()> {
    let patterns = builtin_patterns();
    match output {
        Some(path) => {
            save_patterns(path, &patterns)?;
            info!("Wrote {} patterns to {}", patterns.len(), path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&patterns)?),
    }
    Ok(())
}

//! Scan command implementation.
//!
//! Runs member-offset discovery over bytes copied out of a driver image, with
//! accessor entry points given on the command line.

use anyhow::{Context, Result, bail};
use nvmefix_core::report::ScanReport;
use nvmefix_core::{CodeDump, Config, builtin_patterns, offset::load_patterns};
use owo_colors::OwoColorize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

use super::hex::{parse_entry, parse_hex_address};

/// Run the scan command
pub fn run(
    config: &Config,
    dump: &Path,
    base: &str,
    entries: &[String],
    patterns: Option<&Path>,
    json: bool,
) -> Result<()> {
    let base = parse_hex_address(base)?;
    let data = fs::read(dump).with_context(|| format!("Failed to read {}", dump.display()))?;
    if data.is_empty() {
        bail!("{} is empty", dump.display());
    }

    let entries: BTreeMap<String, u64> = entries
        .iter()
        .map(|e| parse_entry(e))
        .collect::<Result<_>>()?;
    if entries.is_empty() {
        warn!("No accessor entry points given, nothing will match");
    }

    let patterns = match patterns {
        Some(path) => load_patterns(path)
            .with_context(|| format!("Failed to load patterns from {}", path.display()))?,
        None => config.patterns.clone().unwrap_or_else(builtin_patterns),
    };

    let reader = CodeDump::new(base, data);
    let report = ScanReport::scan(&reader, &entries, &patterns, config.max_scan_instructions);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Code dump at {}", report.base_address);
    for row in &report.members {
        match &row.offset {
            Some(offset) => println!("  {:<40} {}", row.member, offset.green()),
            None if row.entry.is_none() => {
                println!("  {:<40} {}", row.member, "no entry point".dimmed())
            }
            None => println!("  {:<40} {}", row.member, "not found".red()),
        }
    }

    Ok(())
}

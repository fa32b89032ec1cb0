//! Plan command implementation.
//!
//! Runs the APST decision the plugin would make for a controller, from a raw
//! Identify Controller page captured on the machine.

use anyhow::{Context, Result};
use nvmefix_core::Config;
use nvmefix_core::report::PlanReport;
use owo_colors::OwoColorize;
use std::fs;
use std::path::Path;
use tracing::info;

/// Run the plan command
pub fn run(
    config: &Config,
    identify: &Path,
    latency: Option<u64>,
    json: bool,
    output: Option<&Path>,
) -> Result<()> {
    let data = fs::read(identify)
        .with_context(|| format!("Failed to read {}", identify.display()))?;
    let latency = latency.unwrap_or(config.default_ps_max_latency_us);
    let report = PlanReport::from_identify(&data, latency, &config.extra_quirks)?;

    if let Some(output) = output {
        report.save(output)?;
        info!("Saved report to {}", output.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} {} (fw {}), vendor {}",
        "Controller:".bold(),
        report.model,
        report.firmware,
        report.vid
    );
    println!(
        "Power states: {}, APST supported: {}, quirks: {:?}",
        report.npss as usize + 1,
        report.apst_supported,
        report.quirks
    );
    println!();

    for ps in &report.power_states {
        let kind = if ps.non_operational { "non-op" } else { "op" };
        println!(
            "  PS{:<2} {:>6} {:>7} mW  entry {:>7} us  exit {:>7} us",
            ps.state, kind, ps.max_power_mw, ps.entry_lat_us, ps.exit_lat_us
        );
    }
    println!();

    match &report.plan {
        Some(plan) if plan.is_enabled() => {
            println!(
                "{} with budget {} us, deepest target PS{}",
                "APST enabled".green(),
                latency,
                plan.max_ps().unwrap_or(0)
            );
            for line in &report.table {
                println!("  {}", line);
            }
        }
        Some(_) => println!(
            "{}: no non-operational state fits {} us",
            "APST disabled".yellow(),
            latency
        ),
        None => println!("{}: controller not eligible", "APST untouched".red()),
    }

    Ok(())
}

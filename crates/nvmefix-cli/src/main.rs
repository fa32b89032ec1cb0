use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "nvmefix")]
#[command(about = "Offline diagnostics for the NVMe APST fix", version)]
struct Cli {
    /// Plugin configuration (JSON); defaults apply when absent
    #[arg(short, long, global = true, env = "NVMEFIX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute the APST configuration for a raw Identify Controller page
    Plan {
        /// 4096-byte Identify Controller dump
        identify: PathBuf,

        /// Latency budget in microseconds (overrides the configuration)
        #[arg(short, long)]
        latency: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Also write the JSON report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Discover member offsets in a raw code dump
    Scan {
        /// Bytes copied from the driver image
        dump: PathBuf,

        /// Address the first byte of the dump was loaded at
        #[arg(short, long, default_value = "0")]
        base: String,

        /// Accessor entry point as NAME=ADDRESS (repeatable)
        #[arg(short = 'e', long = "entry", value_name = "NAME=ADDRESS")]
        entries: Vec<String>,

        /// Accessor patterns (JSON) replacing the built-in ones
        #[arg(short, long)]
        patterns: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write the built-in accessor patterns as JSON
    Patterns {
        /// Output file; stdout when absent
        output: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        /// Boot arguments to apply
        #[arg(long, default_value = "")]
        boot_args: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("nvmefix=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Plan {
            identify,
            latency,
            json,
            output,
        } => commands::plan::run(&config, &identify, latency, json, output.as_deref()),
        Command::Scan {
            dump,
            base,
            entries,
            patterns,
            json,
        } => commands::scan::run(&config, &dump, &base, &entries, patterns.as_deref(), json),
        Command::Patterns { output } => commands::patterns::run(output.as_deref()),
        Command::Config { boot_args } => {
            let config = config.with_boot_args(&boot_args);
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

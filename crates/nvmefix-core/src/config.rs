//! Plugin configuration
//!
//! Defaults match the stock behavior. The boot arguments only toggle the
//! plugin and its debug output; everything else can come from a JSON file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::nvme::QuirkEntry;
use crate::offset::{AccessorPattern, DEFAULT_MAX_INSTRUCTIONS};

/// Boot argument disabling the plugin
pub const BOOT_ARG_OFF: &str = "-nvmefixoff";
/// Boot argument enabling debug output and the APST table dump
pub const BOOT_ARG_DEBUG: &str = "-nvmefixdbg";

/// Registry property overriding the APST latency budget of one controller
pub const LATENCY_PROPERTY: &str = "ps-max-latency-us";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    pub debug: bool,
    /// APST latency budget in microseconds when no property overrides it
    pub default_ps_max_latency_us: u64,
    /// Seconds of inactivity before the PM proxy lets the device drop
    pub idle_period_secs: u64,
    pub max_scan_instructions: usize,
    /// How far up the service tree to look for per-controller properties.
    /// Typical depth is 9 on real machines.
    pub controller_search_depth: usize,
    /// Additional quirk entries, merged with the built-in table
    pub extra_quirks: Vec<QuirkEntry>,
    /// Byte offset of `activityTickle` in the controller vtable. Overrides
    /// the slot found by looking up `IOService::activityTickle` in the table.
    pub activity_tickle_slot: Option<usize>,
    /// Replaces the built-in accessor patterns when set
    pub patterns: Option<Vec<AccessorPattern>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            default_ps_max_latency_us: 100_000,
            idle_period_secs: 2,
            max_scan_instructions: DEFAULT_MAX_INSTRUCTIONS,
            controller_search_depth: 20,
            extra_quirks: Vec::new(),
            activity_tickle_slot: None,
            patterns: None,
        }
    }
}

impl Config {
    /// Apply the plugin's boot arguments on top of the defaults.
    pub fn from_boot_args(args: &str) -> Self {
        Self::default().with_boot_args(args)
    }

    pub fn with_boot_args(mut self, args: &str) -> Self {
        for arg in args.split_whitespace() {
            match arg {
                BOOT_ARG_OFF => self.enabled = false,
                BOOT_ARG_DEBUG => self.debug = true,
                _ => {}
            }
        }
        debug!(
            "Boot args: enabled={} debug={}",
            self.enabled, self.debug
        );
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&content)?;
        info!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }
}

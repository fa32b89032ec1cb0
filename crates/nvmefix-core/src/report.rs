use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::disasm::IcedDisassembler;
use crate::memory::ReadMemory;
use crate::nvme::{
    ApstPlan, IdentifyController, QuirkEntry, Quirks, builtin_quirks, decode_apst_table,
    lookup_quirks,
};
use crate::offset::{AccessorPattern, scan_accessor};

/// APST decision for one Identify Controller page
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub vid: String,
    pub model: String,
    pub firmware: String,
    pub npss: u8,
    pub apst_supported: bool,
    pub quirks: Quirks,
    pub max_latency_us: u64,
    pub eligible: bool,
    pub power_states: Vec<PowerStateRow>,
    pub plan: Option<ApstPlan>,
    /// Entries as the device would report them
    pub table: Vec<String>,
}

/// Power state descriptor in display units
#[derive(Debug, Clone, Serialize)]
pub struct PowerStateRow {
    pub state: u8,
    pub non_operational: bool,
    pub max_power_mw: u32,
    pub entry_lat_us: u32,
    pub exit_lat_us: u32,
}

impl PlanReport {
    /// Run the configuration decision offline, without a device.
    pub fn from_identify(data: &[u8], max_latency_us: u64, extra_quirks: &[QuirkEntry]) -> Result<Self> {
        let ctrl = IdentifyController::parse(data).context("Failed to parse identify data")?;

        let mut table = builtin_quirks();
        table.extend(extra_quirks.iter().cloned());
        let quirks = lookup_quirks(&table, &ctrl);
        let eligible =
            !quirks.contains(Quirks::NO_APST) && max_latency_us > 0 && ctrl.supports_apst();

        let plan = eligible.then(|| ApstPlan::build(&ctrl.power_states, max_latency_us, quirks));
        let table = plan
            .as_ref()
            .map(|plan| {
                decode_apst_table(&plan.to_bytes(), ctrl.npss)
                    .into_iter()
                    .map(|e| {
                        if e.idle_time_ms == 0 {
                            format!("PS{}: stay", e.state)
                        } else {
                            format!("PS{} -> PS{} after {} ms", e.state, e.target_state, e.idle_time_ms)
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let power_states = ctrl
            .power_states
            .iter()
            .enumerate()
            .map(|(i, psd)| PowerStateRow {
                state: i as u8,
                non_operational: psd.is_non_operational(),
                max_power_mw: psd.max_power_mw(),
                entry_lat_us: psd.entry_lat,
                exit_lat_us: psd.exit_lat,
            })
            .collect();

        let apst_supported = ctrl.supports_apst();
        Ok(Self {
            vid: format!("0x{:04X}", ctrl.vid),
            model: ctrl.model,
            firmware: ctrl.firmware,
            npss: ctrl.npss,
            apst_supported,
            quirks,
            max_latency_us,
            eligible,
            power_states,
            plan,
            table,
        })
    }

    /// Save report to JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Member offsets discovered in a code dump
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub base_address: String,
    pub members: Vec<ScanRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRow {
    pub member: String,
    pub function: String,
    pub entry: Option<String>,
    pub offset: Option<String>,
}

impl ScanReport {
    /// Scan every pattern whose accessor has a known entry point in `entries`.
    pub fn scan<R: ReadMemory>(
        reader: &R,
        entries: &BTreeMap<String, u64>,
        patterns: &[AccessorPattern],
        max_instructions: usize,
    ) -> Self {
        let members = patterns
            .iter()
            .map(|pattern| {
                let entry = entries.get(&pattern.function).copied();
                let offset = entry.and_then(|start| {
                    scan_accessor(reader, &IcedDisassembler, start, pattern, max_instructions)
                });
                ScanRow {
                    member: pattern.member.to_string(),
                    function: pattern.function.clone(),
                    entry: entry.map(|e| format!("0x{:X}", e)),
                    offset: offset.map(|o| format!("0x{:X}", o)),
                }
            })
            .collect();

        Self {
            base_address: format!("0x{:X}", reader.base_address()),
            members,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.members.iter().all(|m| m.offset.is_some())
    }
}

use serde::Serialize;

use crate::memory::layout::apst;
use crate::nvme::{PowerStateDescriptor, Quirks};

/// A power state the controller may autonomously drop into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApstTarget {
    pub state: u8,
    pub total_latency_us: u64,
    pub idle_time_ms: u64,
}

impl ApstTarget {
    fn entry(&self) -> u64 {
        ((self.state as u64) << apst::ITPS_SHIFT) | (self.idle_time_ms << apst::ITPT_SHIFT)
    }
}

/// Idle time before transitioning into a state: 50 times its total latency,
/// rounded up to whole milliseconds.
pub fn idle_time_ms(total_latency_us: u64) -> u64 {
    total_latency_us.saturating_add(19).div_euclid(20).min(apst::ITPT_MAX)
}

/// APST configuration for one controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApstPlan {
    /// Feature 0Ch payload, one entry per power state
    pub table: [u64; apst::ENTRIES],
    /// Usable targets, fastest first
    pub targets: Vec<ApstTarget>,
    pub max_latency_us: u64,
}

impl ApstPlan {
    /// Build the APST table from the controller's power states.
    ///
    /// Only non-operational states are targets. A target whose entry plus exit
    /// latency exceeds `max_latency_us` is dropped, together with every slower
    /// one. Each state transitions into the closest deeper target.
    pub fn build(states: &[PowerStateDescriptor], max_latency_us: u64, quirks: Quirks) -> Self {
        let states = &states[..states.len().min(apst::ENTRIES)];
        let deepest = states.len().saturating_sub(1);

        let mut candidates: Vec<ApstTarget> = states
            .iter()
            .enumerate()
            .filter(|&(i, _)| !(i == deepest && quirks.contains(Quirks::NO_DEEPEST_PS)))
            .filter(|(_, psd)| psd.is_non_operational())
            .map(|(i, psd)| {
                let total = psd.total_latency_us();
                ApstTarget {
                    state: i as u8,
                    total_latency_us: total,
                    idle_time_ms: idle_time_ms(total),
                }
            })
            .collect();
        candidates.sort_by_key(|t| (t.total_latency_us, t.state));
        let targets: Vec<ApstTarget> = candidates
            .into_iter()
            .take_while(|t| t.total_latency_us <= max_latency_us)
            .collect();

        let mut table = [0u64; apst::ENTRIES];
        let mut next: Option<&ApstTarget> = None;
        for state in (0..states.len()).rev() {
            if let Some(target) = next {
                table[state] = target.entry();
            }
            if let Some(target) = targets.iter().find(|t| t.state as usize == state) {
                next = Some(target);
            }
        }

        Self {
            table,
            targets,
            max_latency_us,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Deepest state used as a target
    pub fn max_ps(&self) -> Option<u8> {
        self.targets.iter().map(|t| t.state).max()
    }

    /// Worst-case latency over all targets
    pub fn worst_latency_us(&self) -> u64 {
        self.targets
            .iter()
            .map(|t| t.total_latency_us)
            .max()
            .unwrap_or(0)
    }

    /// Set Features dword 11
    pub fn dword11(&self) -> u32 {
        if self.is_enabled() { apst::ENABLE } else { 0 }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|e| e.to_le_bytes()).collect()
    }
}

/// One decoded entry of a controller's APST table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApstEntry {
    pub state: u8,
    pub target_state: u8,
    pub idle_time_ms: u64,
}

/// Decode the entries for states `0..=npss` of an APST payload.
pub fn decode_apst_table(bytes: &[u8], npss: u8) -> Vec<ApstEntry> {
    bytes
        .chunks_exact(apst::ENTRY_SIZE)
        .take(npss as usize + 1)
        .enumerate()
        .map(|(state, chunk)| {
            let mut raw = [0u8; apst::ENTRY_SIZE];
            raw.copy_from_slice(chunk);
            let value = u64::from_le_bytes(raw);
            ApstEntry {
                state: state as u8,
                target_state: ((value >> apst::ITPS_SHIFT) & apst::ITPS_MASK) as u8,
                idle_time_ms: (value >> apst::ITPT_SHIFT) & apst::ITPT_MAX,
            }
        })
        .collect()
}

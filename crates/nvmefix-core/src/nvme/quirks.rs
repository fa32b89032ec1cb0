use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::nvme::IdentifyController;

bitflags! {
    /// Known controller defects. Bit values follow the Linux NVMe driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(from = "u32", into = "u32")]
    pub struct Quirks: u32 {
        const STRIPE_SIZE = 1 << 0;
        const IDENTIFY_CNS = 1 << 1;
        const DEALLOCATE_ZEROES = 1 << 2;
        const DELAY_BEFORE_CHK_RDY = 1 << 3;
        /// APST must not be enabled
        const NO_APST = 1 << 4;
        /// The deepest power state must not be used as an APST target
        const NO_DEEPEST_PS = 1 << 5;
        const IGNORE_DEV_SUBNQN = 1 << 8;
        const DISABLE_WRITE_ZEROES = 1 << 9;
        const SIMPLE_SUSPEND = 1 << 10;
    }
}

impl Default for Quirks {
    fn default() -> Self {
        Quirks::empty()
    }
}

impl From<u32> for Quirks {
    fn from(bits: u32) -> Self {
        Quirks::from_bits_retain(bits)
    }
}

impl From<Quirks> for u32 {
    fn from(quirks: Quirks) -> Self {
        quirks.bits()
    }
}

/// Quirk table entry. Absent string fields match any value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuirkEntry {
    pub vid: u16,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    pub quirks: Quirks,
}

impl QuirkEntry {
    pub fn matches(&self, ctrl: &IdentifyController) -> bool {
        self.vid == ctrl.vid
            && self
                .model
                .as_deref()
                .is_none_or(|m| padded_matches(&ctrl.model_raw, m))
            && self
                .firmware
                .as_deref()
                .is_none_or(|f| padded_matches(&ctrl.firmware_raw, f))
    }
}

/// Compare a space padded identify field against `expected`: the field must
/// start with it and contain only padding afterwards.
pub fn padded_matches(field: &[u8], expected: &str) -> bool {
    let expected = expected.as_bytes();
    if expected.len() > field.len() {
        return false;
    }
    field.starts_with(expected) && field[expected.len()..].iter().all(|&b| b == b' ' || b == 0)
}

fn entry(vid: u16, model: Option<&str>, firmware: Option<&str>, quirks: Quirks) -> QuirkEntry {
    QuirkEntry {
        vid,
        model: model.map(str::to_string),
        firmware: firmware.map(str::to_string),
        quirks,
    }
}

/// Built-in table of controllers with known defects
pub fn builtin_quirks() -> Vec<QuirkEntry> {
    vec![
        // Dies in any APST state
        entry(0x1179, Some("THNSF5256GPUK TOSHIBA"), None, Quirks::NO_APST),
        // Suspend-to-idle race in this firmware
        entry(0x14a4, None, Some("22301111"), Quirks::SIMPLE_SUSPEND),
        // Times out and aborts I/O with APST enabled
        entry(0x1e0f, Some("KCD6XVUL6T40"), None, Quirks::NO_APST),
        entry(0x1e0f, Some("KCD61LUL3T84"), None, Quirks::NO_APST),
    ]
}

/// Union of the quirks of every table entry matching the controller.
pub fn lookup_quirks(table: &[QuirkEntry], ctrl: &IdentifyController) -> Quirks {
    table
        .iter()
        .filter(|e| e.matches(ctrl))
        .fold(Quirks::empty(), |acc, e| {
            debug!(
                "Quirks {:?} apply to {:04x} {} {}",
                e.quirks, ctrl.vid, ctrl.model, ctrl.firmware
            );
            acc | e.quirks
        })
}

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::layout::{identify, power_state};

/// One entry of the Identify Controller power state table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerStateDescriptor {
    /// Maximum power in centiwatts (or 0.1 mW units with the scale flag)
    pub max_power: u16,
    pub flags: u8,
    /// Entry latency in microseconds
    pub entry_lat: u32,
    /// Exit latency in microseconds
    pub exit_lat: u32,
    pub idle_power: u16,
    pub active_power: u16,
}

impl PowerStateDescriptor {
    pub fn is_non_operational(&self) -> bool {
        self.flags & power_state::FLAG_NON_OP_STATE != 0
    }

    pub fn total_latency_us(&self) -> u64 {
        self.entry_lat as u64 + self.exit_lat as u64
    }

    /// Maximum power in milliwatts
    pub fn max_power_mw(&self) -> u32 {
        if self.flags & power_state::FLAG_MAX_POWER_SCALE != 0 {
            self.max_power as u32 / 10
        } else {
            self.max_power as u32 * 10
        }
    }

    fn parse(bytes: &[u8]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        Self {
            max_power: u16_at(power_state::MAX_POWER),
            flags: bytes[power_state::FLAGS],
            entry_lat: u32_at(power_state::ENTRY_LAT),
            exit_lat: u32_at(power_state::EXIT_LAT),
            idle_power: u16_at(power_state::IDLE_POWER),
            active_power: u16_at(power_state::ACTIVE_POWER),
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        bytes[power_state::MAX_POWER..power_state::MAX_POWER + 2]
            .copy_from_slice(&self.max_power.to_le_bytes());
        bytes[power_state::FLAGS] = self.flags;
        bytes[power_state::ENTRY_LAT..power_state::ENTRY_LAT + 4]
            .copy_from_slice(&self.entry_lat.to_le_bytes());
        bytes[power_state::EXIT_LAT..power_state::EXIT_LAT + 4]
            .copy_from_slice(&self.exit_lat.to_le_bytes());
        bytes[power_state::IDLE_POWER..power_state::IDLE_POWER + 2]
            .copy_from_slice(&self.idle_power.to_le_bytes());
        bytes[power_state::ACTIVE_POWER..power_state::ACTIVE_POWER + 2]
            .copy_from_slice(&self.active_power.to_le_bytes());
    }
}

/// The fields of the Identify Controller page the plugin uses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Raw, space padded model field for quirk matching
    #[serde(skip)]
    pub model_raw: Vec<u8>,
    /// Raw, space padded firmware revision for quirk matching
    #[serde(skip)]
    pub firmware_raw: Vec<u8>,
    pub version: u32,
    /// Zero-based number of power states supported
    pub npss: u8,
    pub apsta: u8,
    /// Descriptors 0..=npss
    pub power_states: Vec<PowerStateDescriptor>,
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

impl IdentifyController {
    /// Parse an Identify Controller page.
    ///
    /// `npss` is clamped to the 32 descriptors the page can hold, so a
    /// corrupted count never reads past the descriptor table.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < identify::SIZE {
            return Err(Error::InvalidIdentify(format!(
                "buffer is {} bytes, expected {}",
                data.len(),
                identify::SIZE
            )));
        }

        let vid = u16::from_le_bytes([data[identify::VID], data[identify::VID + 1]]);
        if vid == 0 || vid == 0xFFFF {
            return Err(Error::InvalidIdentify(format!("vendor id {:#06x}", vid)));
        }
        let ssvid = u16::from_le_bytes([data[identify::SSVID], data[identify::SSVID + 1]]);
        let version = u32::from_le_bytes([
            data[identify::VER],
            data[identify::VER + 1],
            data[identify::VER + 2],
            data[identify::VER + 3],
        ]);

        let sn = &data[identify::SN..identify::SN + identify::SN_LEN];
        let mn = &data[identify::MN..identify::MN + identify::MN_LEN];
        let fr = &data[identify::FR..identify::FR + identify::FR_LEN];

        let npss = data[identify::NPSS].min((identify::PSD_COUNT - 1) as u8);
        let power_states = (0..=npss as usize)
            .map(|i| {
                let start = identify::PSD + i * power_state::SIZE;
                PowerStateDescriptor::parse(&data[start..start + power_state::SIZE])
            })
            .collect();

        Ok(Self {
            vid,
            ssvid,
            serial: ascii_field(sn),
            model: ascii_field(mn),
            firmware: ascii_field(fr),
            model_raw: mn.to_vec(),
            firmware_raw: fr.to_vec(),
            version,
            npss,
            apsta: data[identify::APSTA],
            power_states,
        })
    }

    pub fn supports_apst(&self) -> bool {
        self.apsta & 1 != 0
    }

    /// Encode back into a 4096-byte page. Fields not modelled stay zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; identify::SIZE];
        data[identify::VID..identify::VID + 2].copy_from_slice(&self.vid.to_le_bytes());
        data[identify::SSVID..identify::SSVID + 2].copy_from_slice(&self.ssvid.to_le_bytes());
        write_padded(&mut data[identify::SN..identify::SN + identify::SN_LEN], &self.serial);
        write_padded(&mut data[identify::MN..identify::MN + identify::MN_LEN], &self.model);
        write_padded(&mut data[identify::FR..identify::FR + identify::FR_LEN], &self.firmware);
        data[identify::VER..identify::VER + 4].copy_from_slice(&self.version.to_le_bytes());
        data[identify::NPSS] = self.npss;
        data[identify::APSTA] = self.apsta;
        for (i, psd) in self.power_states.iter().take(identify::PSD_COUNT).enumerate() {
            let start = identify::PSD + i * power_state::SIZE;
            psd.write(&mut data[start..start + power_state::SIZE]);
        }
        data
    }
}

fn write_padded(field: &mut [u8], value: &str) {
    field.fill(b' ');
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len());
    field[..len].copy_from_slice(&bytes[..len]);
}

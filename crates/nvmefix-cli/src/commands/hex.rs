//! Hex address parsing.

use anyhow::{Result, anyhow};

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).map_err(|e| anyhow!("Invalid hex address: {}", e))
}

/// Parse `NAME=ADDRESS` into a symbol name and address.
pub fn parse_entry(s: &str) -> Result<(String, u64)> {
    let (name, address) = s
        .rsplit_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=ADDRESS, got {}", s))?;
    if name.is_empty() {
        return Err(anyhow!("Missing symbol name in {}", s));
    }
    Ok((name.to_string(), parse_hex_address(address)?))
}

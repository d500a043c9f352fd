//! `netpath-probe dscp` — resolves a DSCP/TOS name or numeric literal and
//! prints the resulting byte in decimal and hex.

use anyhow::{Context, Result};

pub fn run(value: &str) -> Result<()> {
    let byte = netpath_core::dscp::parse(value).with_context(|| format!("resolving DSCP/TOS value '{value}'"))?;
    let name = netpath_core::dscp::name_for(byte).unwrap_or("(unnamed)");
    println!("{value} -> {byte} (0x{byte:02x}) [{name}]");
    Ok(())
}

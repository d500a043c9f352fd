//! `netpath.toml` configuration for netpath-probe.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Default minimum MTU to probe, in bytes. Omit to use the per-family
    /// default (576 for IPv4, 1280 for IPv6).
    #[serde(default)]
    pub mtu_min: Option<u32>,
    /// Default maximum MTU to probe, in bytes. Omit to use 9216.
    #[serde(default)]
    pub mtu_max: Option<u32>,
    /// Probe interval in milliseconds between send/receive rounds.
    #[serde(default = "ProbeConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// DSCP/TOS name or numeric literal applied to probe sockets (see
    /// `netpath-probe dscp` for the accepted forms). Omit to leave the
    /// kernel default (CS0).
    #[serde(default)]
    pub dscp: Option<String>,
    /// Named destinations this config's `probe` invocations can target by
    /// name instead of repeating `--dest`.
    #[serde(default)]
    pub destinations: Vec<DestinationEntry>,
}

impl ProbeConfig {
    fn default_interval_ms() -> u64 {
        500
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A representative example for `netpath-probe init`.
    pub fn default_example() -> Self {
        Self {
            mtu_min: Some(576),
            mtu_max: Some(9216),
            interval_ms: Self::default_interval_ms(),
            dscp: Some("EF".into()),
            destinations: vec![
                DestinationEntry { name: "gateway".into(), host: "10.0.0.1".into(), port: 19332 },
                DestinationEntry { name: "peer-edge".into(), host: "203.0.113.9".into(), port: 19332 },
            ],
        }
    }
}

/// One named destination for `netpath-probe probe --name <name>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DestinationEntry {
    pub name: String,
    pub host: String,
    pub port: u16,
}

//! `netpath-probe probe` — runs a single path-MTU probe against one
//! destination and prints a terminal report.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::time::Duration;

use netpath_core::{Address, MtuProber};

use crate::config::ProbeConfig;

pub fn run(config: &ProbeConfig, dest: &str, mtu_min: Option<u32>, mtu_max: Option<u32>, timeout_secs: u64) -> Result<()> {
    let (host, port) = dest
        .rsplit_once(':')
        .with_context(|| format!("--dest '{dest}' must be host:port"))?;
    let port: u16 = port.parse().with_context(|| format!("'{port}' is not a valid port"))?;

    let far = netpath_core::resolve::resolve_default(host, port)
        .with_context(|| format!("resolving destination {dest}"))?;
    let near_ip: IpAddr = if far.is_ipv4() { "0.0.0.0".parse().unwrap() } else { "::".parse().unwrap() };
    let near = Address::from_ip_port(near_ip, 0);

    let mtu_min = mtu_min.or(config.mtu_min);
    let mtu_max = mtu_max.or(config.mtu_max);

    eprintln!("netpath-probe: probing {dest} (mtu window {mtu_min:?}..{mtu_max:?})...");

    let mut prober = MtuProber::new(near, far).with_interval(Duration::from_millis(config.interval_ms));
    if let Some(v) = mtu_min {
        prober = prober.with_mtu_min(v);
    }
    if let Some(v) = mtu_max {
        prober = prober.with_mtu_max(v);
    }
    if let Some(name) = &config.dscp {
        let tos = netpath_core::dscp::parse(name).with_context(|| format!("config dscp '{name}'"))?;
        prober = prober.with_dscp(tos);
    }

    let pmtu = prober
        .run(Duration::from_secs(timeout_secs))
        .with_context(|| format!("probing {dest}"))?;

    let telemetry = prober.telemetry();
    println!("destination: {dest}");
    println!("path MTU:    {pmtu} bytes");
    println!("packets:     sent {} / received {}", telemetry.sent, telemetry.received);
    if let (Some(min), Some(avg), Some(max)) =
        (telemetry.min_latency, telemetry.avg_latency(), telemetry.max_latency)
    {
        println!(
            "latency:     min {:.2}ms / avg {:.2}ms / max {:.2}ms",
            min.as_secs_f64() * 1000.0,
            avg.as_secs_f64() * 1000.0,
            max.as_secs_f64() * 1000.0
        );
    }

    Ok(())
}

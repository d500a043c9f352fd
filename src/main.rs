//! netpath-probe — Linux path-MTU prober and echoer.
//!
//! Finds the largest UDP payload that actually round-trips to a
//! destination. Run `netpath-probe --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod dscp;
mod echo;
mod probe;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Init | Commands::Dscp { .. } => None,
        _ => {
            if !cli.config.exists() {
                std::fs::write(&cli.config, b"")?;
                eprintln!(
                    "Created '{}' — run `netpath-probe init > {}` to populate it.",
                    cli.config.display(),
                    cli.config.display()
                );
            }
            Some(config::ProbeConfig::load(&cli.config)?)
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::ProbeConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Dscp { value } => {
            dscp::run(&value)?;
        }
        Commands::Probe { dest, mtu_min, mtu_max, timeout } => {
            probe::run(config.as_ref().unwrap(), &dest, mtu_min, mtu_max, timeout)?;
        }
        Commands::Echo { bind } => {
            echo::run(&bind)?;
        }
    }

    Ok(())
}

//! CLI definitions for netpath-probe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "netpath-probe",
    version,
    about = "Linux path-MTU prober and echoer\n\nFind the largest UDP payload that actually round-trips to a destination, without trusting the kernel's cached PMTU guess.",
    long_about = None
)]
pub struct Cli {
    /// Path to netpath.toml config file
    #[clap(long, short, default_value = "netpath.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe one destination for its path MTU
    Probe {
        /// Destination as host:port
        #[clap(long)]
        dest: String,

        /// Minimum MTU to probe (defaults to config, then the family minimum)
        #[clap(long)]
        mtu_min: Option<u32>,

        /// Maximum MTU to probe (defaults to config, then 9216)
        #[clap(long)]
        mtu_max: Option<u32>,

        /// Overall deadline for the probe, in seconds
        #[clap(long, default_value = "10")]
        timeout: u64,
    },

    /// Run the echo responder in the foreground (Ctrl-C to stop)
    Echo {
        /// Local address to bind as host:port
        #[clap(long)]
        bind: String,
    },

    /// Resolve a DSCP/TOS name or numeric literal and print its byte value
    Dscp {
        /// Name (e.g. `AF42`, `EF`) or numeric literal (decimal, 0x, 0o, 0b)
        value: String,
    },

    /// Print an example netpath.toml to stdout
    Init,
}

//! Command-line argument parsing.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// octstream server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "octstream", about = "Octree view streaming server")]
pub struct CliArgs {
    /// Address to bind the UDP socket to.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// UDP port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Datagram size budget in bytes.
    #[arg(long)]
    pub mtu: Option<usize>,

    /// Per-client packets-per-second cap.
    #[arg(long)]
    pub max_pps: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(bind) = args.bind {
            self.network.bind_address = bind;
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(mtu) = args.mtu {
            self.network.mtu = mtu;
        }
        if let Some(pps) = args.max_pps {
            self.streaming.server_max_packets_per_second = pps;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

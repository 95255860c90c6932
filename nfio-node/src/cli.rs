//! Command-line argument parsing.

use clap::{Parser, Subcommand};

use crate::operations::GuestStat;

/// nfio Node - VNF lifecycle management agent
#[derive(Parser, Debug)]
#[command(name = "nfio-node")]
#[command(about = "nfio Node - VNF lifecycle management agent")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Default backend kind (docker, libvirt)
    #[arg(long, env = "NFIO_BACKEND")]
    pub backend: Option<String>,

    /// Graceful stop timeout in seconds
    #[arg(long)]
    pub stop_timeout: Option<u64>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Lifecycle verbs. VNFs are referenced by their configured name.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Allocate backend resources without starting
    Create { name: String },
    /// Create (if needed) and start
    Deploy { name: String },
    Start { name: String },
    Restart { name: String },
    /// Stop gracefully, forcing after the stop timeout
    Stop { name: String },
    Pause { name: String },
    Unpause { name: String },
    /// Tear down all backend resources
    Destroy { name: String },
    /// Run a shell command inside a running VNF
    Exec {
        name: String,
        /// Command line passed to /bin/bash -c
        #[arg(long)]
        command: String,
    },
    /// Show backend state (all configured VNFs if no name is given)
    Status { name: Option<String> },
    /// Read a guest network counter (rx_bytes, tx_bytes, pkt_drops)
    Stats {
        name: String,
        #[arg(long, default_value = "rx_bytes")]
        stat: GuestStat,
    },
    /// Deploy a chain of VNFs (all configured VNFs if none are given)
    Chain { names: Vec<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exec() {
        let args = Args::parse_from(["nfio-node", "-l", "debug", "exec", "fw", "--command", "ip a"]);
        assert_eq!(args.log_level, "debug");
        match args.command {
            Command::Exec { name, command } => {
                assert_eq!(name, "fw");
                assert_eq!(command, "ip a");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_stats() {
        let args = Args::parse_from(["nfio-node", "stats", "fw", "--stat", "pkt_drops"]);
        assert!(matches!(args.command, Command::Stats { stat: GuestStat::PktDrops, .. }));

        assert!(Args::try_parse_from(["nfio-node", "stats", "fw", "--stat", "cpu"]).is_err());
    }

    #[test]
    fn test_parse_chain() {
        let args = Args::parse_from(["nfio-node", "--dev", "chain", "fw", "dpi"]);
        assert!(args.dev);
        match args.command {
            Command::Chain { names } => assert_eq!(names, vec!["fw", "dpi"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

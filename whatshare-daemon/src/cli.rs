//! Command-line interface and logging setup

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};
use whatshare_protocol::DeviceRole;

/// Whatshare daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "whatshare-daemon")]
#[command(about = "Pair devices and forward shared content", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Hide timestamps in logs
    #[arg(long, global = true)]
    pub no_timestamps: bool,

    /// Configuration file (defaults to <config dir>/whatshare/daemon.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pair a device that will send content here (scan its QR code)
    PairInbound {
        /// Text decoded from the counterpart's QR code (prompted if omitted)
        #[arg(long)]
        scan: Option<String>,

        /// Name for the counterpart (prompted if omitted)
        #[arg(long)]
        name: Option<String>,
    },

    /// Pair the desktop shared content is forwarded to (show a QR code, type its code)
    PairOutbound {
        /// Name for the counterpart (prompted if omitted)
        #[arg(long)]
        name: Option<String>,
    },

    /// List paired devices
    List {
        /// Only show devices with this role
        #[arg(long, value_enum)]
        role: Option<RoleArg>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove a pairing
    Unpair {
        /// Name of the inbound device to remove
        #[arg(required_unless_present = "outbound")]
        name: Option<String>,

        /// Remove the outbound device instead
        #[arg(long, conflicts_with = "name")]
        outbound: bool,
    },

    /// Encrypt stdin for the outbound device, print base64
    Seal,

    /// Decrypt base64 from stdin sent by an inbound device
    Open {
        /// Name of the sending inbound device
        #[arg(long)]
        from: String,
    },

    /// Show current configuration
    DumpConfig,
}

/// Device role argument
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    Inbound,
    Outbound,
}

impl From<RoleArg> for DeviceRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Inbound => DeviceRole::Inbound,
            RoleArg::Outbound => DeviceRole::Outbound,
        }
    }
}

/// Initialize logging based on CLI options
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    match (cli.json_logs, cli.no_timestamps) {
        (true, false) => subscriber.json().init(),
        (true, true) => subscriber.without_time().json().init(),
        (false, false) => subscriber.init(),
        (false, true) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}",
        log_level, cli.json_logs
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pair_outbound() {
        let cli = Cli::try_parse_from([
            "whatshare-daemon",
            "pair-outbound",
            "--name",
            "kitchen-pc",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Command::PairOutbound { name } => {
                assert_eq!(name.as_deref(), Some("kitchen-pc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unpair_arguments() {
        let cli = Cli::try_parse_from(["whatshare-daemon", "unpair", "--outbound"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Unpair { name: None, outbound: true }
        ));

        assert!(Cli::try_parse_from(["whatshare-daemon", "unpair"]).is_err());
        assert!(Cli::try_parse_from(["whatshare-daemon", "unpair", "office", "--outbound"]).is_err());
    }

    #[test]
    fn test_outbound_code_is_not_an_argument() {
        // The code only exists after the counterpart scanned this run's QR code
        assert!(Cli::try_parse_from(["whatshare-daemon", "pair-outbound", "--code", "ab12"]).is_err());
        assert!(Cli::try_parse_from(["whatshare-daemon", "descriptor"]).is_err());
    }

    #[test]
    fn test_role_filter() {
        let cli =
            Cli::try_parse_from(["whatshare-daemon", "list", "--role", "inbound"]).unwrap();
        match cli.command {
            Command::List { role, json } => {
                assert_eq!(role.map(DeviceRole::from), Some(DeviceRole::Inbound));
                assert!(!json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

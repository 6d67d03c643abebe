use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::paths::DEFAULT_CONFIG;

#[derive(Parser, Debug)]
#[command(name = "vmxctl", about = "Declarative guest, disk and resource pool management for ESXi hosts over SSH")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Show debug logs on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check connectivity and credentials
    Check,

    /// Manage the configured guest
    Guest {
        #[command(subcommand)]
        action: GuestCommand,
    },

    /// Manage a configured virtual disk
    Disk {
        #[command(subcommand)]
        action: DiskCommand,
    },

    /// Manage a configured resource pool
    Pool {
        #[command(subcommand)]
        action: PoolCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum GuestCommand {
    /// Create the guest, or update it in place if it exists
    Apply,

    /// Read the guest back from the host
    Show {
        /// Guest identifier (defaults to a lookup by configured name)
        #[arg(long)]
        vmid: Option<String>,
    },

    /// Power off and delete the guest, keeping attached disks
    Destroy,

    /// Change or report the power state
    Power {
        #[arg(value_enum)]
        action: PowerAction,
    },

    /// Check that an existing guest identifier is known to the host
    Adopt { vmid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PowerAction {
    On,
    Off,
    State,
}

#[derive(Subcommand, Debug)]
pub enum DiskCommand {
    /// Create the disk, or grow it to the configured size
    Apply { name: String },
    /// Report size and type
    Show { name: String },
    /// Destroy the disk
    Destroy { name: String },
}

#[derive(Subcommand, Debug)]
pub enum PoolCommand {
    /// Create the pool, or update it if it exists
    Apply { path: String },
    /// Report the current allocation
    Show { path: String },
    /// Destroy the pool
    Destroy { path: String },
    /// Resolve a pool path to its identifier and back
    Resolve { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::parse_from(["vmxctl", "-o", "json", "guest", "show", "--vmid", "42"]);
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.config, PathBuf::from("vmxctl.toml"));
        match cli.command {
            Command::Guest {
                action: GuestCommand::Show { vmid },
            } => assert_eq!(vmid.as_deref(), Some("42")),
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::parse_from(["vmxctl", "guest", "power", "off"]);
        assert!(matches!(
            cli.command,
            Command::Guest {
                action: GuestCommand::Power {
                    action: PowerAction::Off
                }
            }
        ));
    }
}

//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Validate and apply `WireGuard` interface configurations.
#[derive(Parser, Debug, Clone)]
#[command(name = "wg-manager")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table, global = true)]
    pub format: Format,

    /// Directory key file references are resolved against.
    #[arg(
        long,
        env = "WG_MANAGER_KEY_ROOT",
        default_value = "/etc/wireguard",
        global = true
    )]
    pub key_root: PathBuf,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Check a configuration file without touching the system.
    Validate(ConfigArgs),

    /// Bring an interface into the state a configuration file describes.
    Apply(ApplyArgs),

    /// Show the live state of an interface.
    Show {
        /// Interface name.
        name: String,
    },

    /// Delete an interface.
    Down {
        /// Interface name.
        name: String,
    },

    /// Generate a private key.
    Genkey,

    /// Read a private key from stdin and print its public key.
    Pubkey,

    /// Generate a preshared key.
    Genpsk,
}

/// Where to load a configuration from.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// JSON document, or a `wg-quick` file when the extension is `.conf`.
    pub path: PathBuf,

    /// Interface name. Defaults to the document's `name`, or the file stem
    /// for `.conf` files.
    #[arg(short, long)]
    pub name: Option<String>,
}

/// Arguments for the apply command.
#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    /// Configuration to apply.
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Stop starting new operations after this many seconds.
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Report what would change without changing anything.
    #[arg(long)]
    pub dry_run: bool,
}

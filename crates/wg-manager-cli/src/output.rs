//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use serde::Serialize;
use wg_manager::{InterfaceConfig, LiveState, PeerAction, ReconcileResult};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay + ?Sized,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay + ?Sized,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

impl TableDisplay for ReconcileResult {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Interface {}", self.interface)?;
        writeln!(writer, "══════════════════════════════════")?;

        if self.device_changes.is_empty() {
            writeln!(writer, "Device:      unchanged")?;
        } else {
            for change in &self.device_changes {
                writeln!(writer, "Device:      {change:?}")?;
            }
        }
        if let Some(error) = &self.device_error {
            writeln!(writer, "Device error: {error}")?;
        }

        if !self.peer_outcomes.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "{:<10}  {:<10}  {:<22}  ERROR", "PEER", "ACTION", "ENDPOINT")?;
            writeln!(writer, "{}", "─".repeat(64))?;
            for outcome in &self.peer_outcomes {
                writeln!(
                    writer,
                    "{:<10}  {:<10}  {:<22}  {}",
                    outcome.public_key.short(),
                    action_label(outcome.action),
                    outcome.endpoint.map(|e| e.to_string()).unwrap_or_default(),
                    outcome.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                )?;
            }
        }

        writeln!(writer)?;
        let status = if self.is_success() {
            "converged"
        } else if self.incomplete {
            "incomplete"
        } else {
            "errors"
        };
        writeln!(
            writer,
            "{} operation(s), {} error(s): {status}",
            self.operation_count(),
            self.errors().len()
        )?;
        Ok(())
    }
}

const fn action_label(action: PeerAction) -> &'static str {
    match action {
        PeerAction::Added => "added",
        PeerAction::Removed => "removed",
        PeerAction::Updated => "updated",
        PeerAction::Replaced => "replaced",
        PeerAction::Unchanged => "unchanged",
        PeerAction::Failed => "failed",
        PeerAction::Skipped => "skipped",
    }
}

/// Live state of a named interface.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    /// Interface name.
    pub name: String,
    /// State read from the device.
    #[serde(flatten)]
    pub state: LiveState,
}

impl TableDisplay for InterfaceStatus {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        let state = &self.state;
        if !state.exists {
            writeln!(writer, "Interface {} does not exist", self.name)?;
            return Ok(());
        }

        writeln!(writer, "Interface {}", self.name)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Public key:  {}", optional(state.public_key))?;
        writeln!(writer, "Listen port: {}", optional(state.listen_port))?;
        writeln!(writer, "MTU:         {}", optional(state.mtu))?;
        writeln!(
            writer,
            "FwMark:      {}",
            state.fwmark.map_or_else(|| "off".to_string(), |m| format!("{m:#x}"))
        )?;
        writeln!(writer, "Addresses:   {}", join(&state.addresses))?;

        writeln!(writer)?;
        if state.peers.is_empty() {
            writeln!(writer, "No peers")?;
            return Ok(());
        }
        writeln!(
            writer,
            "{:<44}  {:<22}  {:>9}  {:>6}  ALLOWED IPS",
            "PEER", "ENDPOINT", "KEEPALIVE", "METRIC"
        )?;
        writeln!(writer, "{}", "─".repeat(104))?;
        for peer in &state.peers {
            writeln!(
                writer,
                "{:<44}  {:<22}  {:>9}  {:>6}  {}",
                peer.public_key,
                optional(peer.endpoint),
                peer.persistent_keepalive,
                optional(peer.routes.first().map(|(_, metric)| metric)),
                join(&peer.allowed_ips)
            )?;
        }
        writeln!(writer)?;
        writeln!(writer, "Total: {} peer(s)", state.peers.len())?;
        Ok(())
    }
}

/// Summary of a validated configuration. Holds no secrets.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    /// Interface name.
    pub name: String,
    /// Public key of an inline private key.
    pub public_key: Option<String>,
    /// Private key file reference.
    pub private_key_file: Option<String>,
    /// Listen port.
    pub listen_port: Option<u16>,
    /// Addresses.
    pub addresses: Vec<String>,
    /// MTU that will be applied.
    pub mtu: u16,
    /// Firewall mark.
    pub fwmark: Option<String>,
    /// Peers.
    pub peers: Vec<PeerSummary>,
}

/// One peer of a [`ConfigSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    /// Public key.
    pub public_key: String,
    /// Description.
    pub description: Option<String>,
    /// Allowed IPs.
    pub allowed_ips: Vec<String>,
    /// Endpoint as configured.
    pub endpoint: Option<String>,
    /// Keepalive interval.
    pub persistent_keepalive: u16,
}

impl From<&InterfaceConfig> for ConfigSummary {
    fn from(config: &InterfaceConfig) -> Self {
        Self {
            name: config.name.clone(),
            public_key: config
                .private_key
                .inline()
                .map(|k| k.public_key().to_base64()),
            private_key_file: config.private_key.file().map(|p| p.display().to_string()),
            listen_port: config.listen_port,
            addresses: config.addresses.iter().map(ToString::to_string).collect(),
            mtu: config.effective_mtu(),
            fwmark: config.fwmark.clone(),
            peers: config
                .peers
                .iter()
                .map(|peer| PeerSummary {
                    public_key: peer.public_key.to_base64(),
                    description: peer.description.clone(),
                    allowed_ips: peer.allowed_ips.iter().map(ToString::to_string).collect(),
                    endpoint: peer.endpoint.as_ref().map(ToString::to_string),
                    persistent_keepalive: peer.persistent_keepalive,
                })
                .collect(),
        }
    }
}

impl TableDisplay for ConfigSummary {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Configuration for {} is valid", self.name)?;
        writeln!(writer, "══════════════════════════════════")?;
        let key = match (&self.public_key, &self.private_key_file) {
            (Some(public), _) => public.clone(),
            (None, Some(file)) => format!("from {file}"),
            (None, None) => "-".to_string(),
        };
        writeln!(writer, "Public key:  {key}")?;
        writeln!(writer, "Listen port: {}", optional(self.listen_port))?;
        writeln!(writer, "MTU:         {}", self.mtu)?;
        writeln!(writer, "FwMark:      {}", self.fwmark.as_deref().unwrap_or("off"))?;
        writeln!(writer, "Addresses:   {}", self.addresses.join(", "))?;
        writeln!(writer)?;

        for peer in &self.peers {
            writeln!(
                writer,
                "{:<44}  {:<24}  {}",
                peer.public_key,
                truncate(peer.endpoint.as_deref().unwrap_or("-"), 24),
                peer.allowed_ips.join(", ")
            )?;
        }
        writeln!(writer, "Total: {} peer(s)", self.peers.len())?;
        Ok(())
    }
}

/// Result of deleting an interface.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    /// Interface name.
    pub name: String,
    /// Whether the interface existed.
    pub removed: bool,
}

impl TableDisplay for RemoveOutcome {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.removed {
            writeln!(writer, "Removed {}", self.name)?;
        } else {
            writeln!(writer, "{} does not exist", self.name)?;
        }
        Ok(())
    }
}

/// A generated or derived key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyOutput {
    /// Base64 key text.
    pub key: String,
}

impl TableDisplay for KeyOutput {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "{}", self.key)?;
        Ok(())
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn join<T: ToString>(values: &[T]) -> String {
    if values.is_empty() {
        return "-".to_string();
    }
    values.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Truncate a string to the given length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        format!("{}...", &s[..max_len - 3])
    } else {
        s[..max_len].to_string()
    }
}

//! Apply command implementation.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;
use wg_manager::{
    CommandDriver, InterfaceConfig, InterfaceDriver, MemoryDriver, ReconcileError,
    ReconcileOptions, Reconciler, ReconcilerConfig,
};

use crate::cli::ApplyArgs;
use crate::commands::load::load_config;
use crate::error::CliError;
use crate::output::OutputFormat;

/// Apply command executor.
pub struct ApplyCommand {
    key_root: PathBuf,
}

impl ApplyCommand {
    /// Create a new apply command resolving key files under `key_root`.
    #[must_use]
    pub fn new(key_root: impl Into<PathBuf>) -> Self {
        Self {
            key_root: key_root.into(),
        }
    }

    /// Execute the apply command against the system.
    ///
    /// A dry run reads the live state, copies it into an in-memory device
    /// and reconciles that instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable, the reconcile
    /// cannot run, or it finishes with peers not in their desired state.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &ApplyArgs,
    ) -> Result<(), CliError> {
        let config = load_config(&args.config).await?;
        let timeout = args.timeout.map(Duration::from_secs);

        if args.dry_run {
            let live = CommandDriver::new().read_state(&config.name).await?;
            let preview = MemoryDriver::new();
            preview.seed(&config.name, &live).await;
            info!(interface = %config.name, "dry run against a copy of the live state");
            return self.apply(preview, &config, timeout, writer, format).await;
        }
        self.apply(CommandDriver::new(), &config, timeout, writer, format)
            .await
    }

    /// Reconciles `config` through `driver` and reports the result.
    ///
    /// # Errors
    ///
    /// See [`execute`](Self::execute).
    pub async fn apply<D, W>(
        &self,
        driver: D,
        config: &InterfaceConfig,
        timeout: Option<Duration>,
        writer: &mut W,
        format: &OutputFormat,
    ) -> Result<(), CliError>
    where
        D: InterfaceDriver,
        W: Write,
    {
        let reconciler = Reconciler::with_config(
            driver,
            ReconcilerConfig::default().with_key_root(&self.key_root),
        );
        let options = timeout.map_or_else(ReconcileOptions::new, |t| {
            ReconcileOptions::new().with_timeout(t)
        });

        let result = match reconciler.reconcile_with(config, options).await {
            Ok(result) => result,
            Err(ReconcileError::Device { error, result, .. }) => {
                format.write(writer, &*result)?;
                return Err(CliError::Driver(error));
            }
            Err(e) => return Err(e.into()),
        };

        format.write(writer, &result)?;
        if result.is_success() {
            return Ok(());
        }
        let errors = result.errors().len();
        Err(CliError::Unconverged(if result.incomplete {
            format!("{} stopped early, {errors} peer error(s)", result.interface)
        } else {
            format!("{}: {errors} peer error(s)", result.interface)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Format;
    use wg_manager::{DriverOperation, PeerConfig, PrivateKey, PublicKey};

    fn config() -> InterfaceConfig {
        InterfaceConfig::new("wg0")
            .with_private_key(PrivateKey::from_bytes_array([1u8; 32]))
            .with_address("10.0.0.1/24".parse().expect("cidr"))
            .with_peer(
                PeerConfig::new(PublicKey::from_bytes_array([2u8; 32]))
                    .with_allowed_ip("10.0.0.2/32".parse().expect("cidr")),
            )
    }

    #[tokio::test]
    async fn applies_through_driver() {
        let driver = MemoryDriver::new();
        let mut out = Vec::new();
        ApplyCommand::new("/etc/wireguard")
            .apply(driver.clone(), &config(), None, &mut out, &OutputFormat::new(Format::Json))
            .await
            .expect("apply");

        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["created"], true);
        assert!(driver.snapshot("wg0").await.exists);
    }

    #[tokio::test]
    async fn peer_errors_fail_the_command_after_printing() {
        let driver = MemoryDriver::new();
        driver.fail(DriverOperation::AddPeer, "EINVAL").await;
        let mut out = Vec::new();

        let err = ApplyCommand::new("/etc/wireguard")
            .apply(driver, &config(), None, &mut out, &OutputFormat::default())
            .await
            .expect_err("peer error");
        assert!(matches!(err, CliError::Unconverged(_)));
        assert!(String::from_utf8_lossy(&out).contains("failed"));
    }

    #[tokio::test]
    async fn device_errors_print_partial_result() {
        let driver = MemoryDriver::new();
        driver.fail(DriverOperation::SetAddresses, "EPERM").await;
        let mut out = Vec::new();

        let err = ApplyCommand::new("/etc/wireguard")
            .apply(driver, &config(), None, &mut out, &OutputFormat::default())
            .await
            .expect_err("device error");
        assert!(matches!(err, CliError::Driver(ref e) if e.operation == DriverOperation::SetAddresses));
        assert!(String::from_utf8_lossy(&out).contains("Device error"));
    }
}

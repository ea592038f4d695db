//! Show and down commands.

use std::io::Write;

use wg_manager::{InterfaceDriver, Reconciler};

use crate::error::CliError;
use crate::output::{InterfaceStatus, OutputFormat, RemoveOutcome};

/// Executor for commands that act on an existing interface.
pub struct InterfaceCommand<D> {
    reconciler: Reconciler<D>,
}

impl<D: InterfaceDriver> InterfaceCommand<D> {
    /// Create a command backed by `driver`.
    #[must_use]
    pub fn new(driver: D) -> Self {
        Self {
            reconciler: Reconciler::new(driver),
        }
    }

    /// Print the live state of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn show<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        name: &str,
    ) -> Result<(), CliError> {
        let state = self.reconciler.state(name).await?;
        format.write(
            writer,
            &InterfaceStatus {
                name: name.to_string(),
                state,
            },
        )
    }

    /// Delete `name`. Succeeds if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed name, a reconcile in flight, or a
    /// driver failure.
    pub async fn down<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        name: &str,
    ) -> Result<(), CliError> {
        let removed = self.reconciler.remove(name).await?;
        format.write(
            writer,
            &RemoveOutcome {
                name: name.to_string(),
                removed,
            },
        )
    }
}

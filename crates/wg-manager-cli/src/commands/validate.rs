//! Validate command implementation.

use std::io::Write;

use crate::cli::ConfigArgs;
use crate::commands::load::load_config;
use crate::error::CliError;
use crate::output::{ConfigSummary, OutputFormat};

/// Validate command executor. Never touches the system.
pub struct ValidateCommand;

impl ValidateCommand {
    /// Execute the validate command.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unreadable or invalid.
    pub async fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &ConfigArgs,
    ) -> Result<(), CliError> {
        let config = load_config(args).await?;
        format.write(writer, &ConfigSummary::from(&config))
    }
}

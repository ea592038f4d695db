//! # wg-manager-cli
//!
//! Command-line front end for the `wg-manager` library.
//!
//! Provides commands for:
//! - Validating JSON documents and `wg-quick` files
//! - Applying a configuration to a kernel interface (or a dry run of it)
//! - Showing and deleting interfaces
//! - Generating and deriving keys

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{ApplyArgs, Cli, Commands, ConfigArgs, Format};
pub use error::CliError;
pub use output::OutputFormat;

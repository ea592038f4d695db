//! CLI command implementations.
//!
//! - [`validate`] - Check a configuration file
//! - [`apply`] - Reconcile an interface onto a configuration
//! - [`interface`] - Show and delete interfaces
//! - [`keys`] - Key generation and derivation
//! - [`load`] - Configuration file loading shared by the above

pub mod apply;
pub mod interface;
pub mod keys;
pub mod load;
pub mod validate;

pub use apply::ApplyCommand;
pub use interface::InterfaceCommand;
pub use keys::KeyCommand;
pub use validate::ValidateCommand;

//! `WireGuard` interface configuration manager.
//!
//! Takes the desired configuration of one interface (keys, listen port,
//! addresses, MTU, firewall mark and peers), validates it, and converges the
//! live device onto it through an [`InterfaceDriver`]:
//!
//! - [`InterfaceConfig`] is the validated desired state. It is built in code,
//!   from an [`InterfaceDocument`] (JSON from a front end), or from a
//!   `wg-quick` style file via [`parse_wg_config`].
//! - [`Reconciler`] diffs desired against live state and applies the minimal
//!   set of driver calls. Per-peer failures are reported in the
//!   [`ReconcileResult`] instead of aborting the run.
//! - [`CommandDriver`] drives a real device with `wg` and `ip`;
//!   [`MemoryDriver`] keeps devices in memory for tests.
//!
//! # Example
//!
//! ```no_run
//! use wg_manager::{InterfaceConfig, MemoryDriver, PeerConfig, PrivateKey, Reconciler};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let peer = PrivateKey::generate().public_key();
//! let config = InterfaceConfig::new("wg0")
//!     .with_private_key(PrivateKey::generate())
//!     .with_listen_port(51820)
//!     .with_address("10.0.0.1/24".parse()?)
//!     .with_peer(PeerConfig::new(peer).with_allowed_ip("10.0.0.2/32".parse()?));
//!
//! let reconciler = Reconciler::new(MemoryDriver::new());
//! let result = reconciler.reconcile(&config).await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod conf;
pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod keys;
pub mod keystore;
pub mod reconciler;
pub mod resolver;
pub mod state;
pub mod types;

pub use codec::KEY_SIZE;
pub use conf::parse_wg_config;
pub use config::{InterfaceConfig, PeerConfig};
pub use document::{InterfaceDocument, PeerDocument};
pub use driver::{CommandDriver, DriverOperation, InterfaceDriver, MemoryDriver};
pub use error::{
    DriverError, KeyStoreError, PeerError, ReconcileError, UnresolvedEndpoint, ValidationError,
    WireGuardError,
};
pub use keys::{PresharedKey, PrivateKey, PublicKey};
pub use keystore::{FsKeyStore, KeyStore};
pub use reconciler::{
    DeviceChange, PeerAction, PeerOutcome, ReconcileOptions, ReconcileResult, Reconciler,
    ReconcilerConfig,
};
pub use resolver::{EndpointResolver, HostLookup, ResolverConfig, SystemLookup};
pub use state::{DevicePeer, LivePeer, LiveState};
pub use types::{Endpoint, KeySource};

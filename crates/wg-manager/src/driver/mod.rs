//! The OS control surface for `WireGuard` interfaces.
//!
//! The reconciler only ever talks to an [`InterfaceDriver`]. Two drivers
//! ship with the crate: [`MemoryDriver`] for tests and [`CommandDriver`],
//! which shells out to `wg` and `ip`.

mod command;
mod memory;

use std::fmt;
use std::future::Future;

use ipnet::IpNet;
use serde::Serialize;

pub use command::{CommandDriver, parse_addresses, parse_dump, parse_mtu};
pub use memory::{JournalEntry, MemoryDriver};

use crate::error::DriverError;
use crate::keys::{PrivateKey, PublicKey};
use crate::state::{DevicePeer, LiveState};

/// A single call on the driver, as named in errors and journals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOperation {
    /// Check whether the device exists.
    DeviceExists,
    /// Create the device.
    CreateDevice,
    /// Delete the device.
    RemoveDevice,
    /// Set the device private key.
    SetPrivateKey,
    /// Set the listen port.
    SetListenPort,
    /// Set or clear the firewall mark.
    SetFwmark,
    /// Set the MTU.
    SetMtu,
    /// Replace the address set.
    SetAddresses,
    /// Install a peer.
    AddPeer,
    /// Remove a peer.
    RemovePeer,
    /// Replace a peer's settings in one step.
    UpdatePeer,
    /// Read the live state.
    ReadState,
}

impl DriverOperation {
    /// Snake-case name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceExists => "device_exists",
            Self::CreateDevice => "create_device",
            Self::RemoveDevice => "remove_device",
            Self::SetPrivateKey => "set_private_key",
            Self::SetListenPort => "set_listen_port",
            Self::SetFwmark => "set_fwmark",
            Self::SetMtu => "set_mtu",
            Self::SetAddresses => "set_addresses",
            Self::AddPeer => "add_peer",
            Self::RemovePeer => "remove_peer",
            Self::UpdatePeer => "update_peer",
            Self::ReadState => "read_state",
        }
    }

    /// Whether the operation changes the device.
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::DeviceExists | Self::ReadState)
    }
}

impl fmt::Display for DriverOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive operations on a `WireGuard` interface.
///
/// Every method acts on the interface named `name` and either fully
/// succeeds or fails with a [`DriverError`]. Callers serialize access per
/// interface; drivers need not.
pub trait InterfaceDriver: Send + Sync {
    /// Returns whether the device exists.
    fn device_exists(&self, name: &str) -> impl Future<Output = Result<bool, DriverError>> + Send;

    /// Creates an unconfigured device and brings it up.
    fn create_device(&self, name: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Deletes the device and everything on it.
    fn remove_device(&self, name: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Sets the private key.
    fn set_private_key(
        &self,
        name: &str,
        key: &PrivateKey,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Sets the UDP listen port.
    fn set_listen_port(
        &self,
        name: &str,
        port: u16,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Sets the firewall mark; 0 turns it off.
    fn set_fwmark(&self, name: &str, mark: u32)
    -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Sets the MTU.
    fn set_mtu(&self, name: &str, mtu: u16) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Replaces the set of addresses on the device.
    fn set_addresses(
        &self,
        name: &str,
        addresses: &[IpNet],
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Installs a peer that is not yet present.
    fn add_peer(
        &self,
        name: &str,
        peer: &DevicePeer,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Removes a peer.
    fn remove_peer(
        &self,
        name: &str,
        public_key: &PublicKey,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Replaces an installed peer's settings without removing it.
    ///
    /// Only called when [`supports_peer_update`](Self::supports_peer_update)
    /// returns `true`.
    fn update_peer(
        &self,
        name: &str,
        peer: &DevicePeer,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Reads the live state. A missing device is not an error.
    fn read_state(&self, name: &str) -> impl Future<Output = Result<LiveState, DriverError>> + Send;

    /// Whether [`update_peer`](Self::update_peer) is atomic. When `false`
    /// the reconciler falls back to remove then add.
    fn supports_peer_update(&self) -> bool {
        true
    }
}

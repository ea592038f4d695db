//! Live interface state as reported by a driver, and the peer shape a
//! driver is asked to install.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::Serialize;

use crate::keys::{PresharedKey, PublicKey};

/// Snapshot of a live interface.
///
/// Read at the start of every reconcile and dropped at the end; external
/// actors may change the interface between reconciles.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LiveState {
    /// Whether the device exists at all.
    pub exists: bool,
    /// Public key derived from the device's private key, if one is set.
    pub public_key: Option<PublicKey>,
    /// Current listen port.
    pub listen_port: Option<u16>,
    /// Current firewall mark, `None` when off.
    pub fwmark: Option<u32>,
    /// Current MTU.
    pub mtu: Option<u16>,
    /// Addresses assigned to the device.
    pub addresses: Vec<IpNet>,
    /// Installed peers, in no particular order.
    pub peers: Vec<LivePeer>,
}

impl LiveState {
    /// State of a device that does not exist.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    /// Finds a peer by public key.
    #[must_use]
    pub fn peer(&self, public_key: &PublicKey) -> Option<&LivePeer> {
        self.peers.iter().find(|p| &p.public_key == public_key)
    }
}

/// A peer as installed on a live interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LivePeer {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Installed preshared key. Never serialized.
    #[serde(skip)]
    pub preshared_key: Option<PresharedKey>,
    /// Installed allowed IPs.
    pub allowed_ips: Vec<IpNet>,
    /// Current endpoint (configured or learned from roaming).
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval in seconds, 0 = off.
    pub persistent_keepalive: u16,
    /// Routes through the interface covering this peer's allowed IPs, as
    /// (network, metric) pairs.
    pub routes: Vec<(IpNet, u32)>,
}

impl LivePeer {
    /// Creates a live peer with only a key and allowed IPs.
    #[must_use]
    pub fn new(public_key: PublicKey, allowed_ips: Vec<IpNet>) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips,
            endpoint: None,
            persistent_keepalive: 0,
            routes: Vec::new(),
        }
    }
}

/// Peer settings handed to a driver for `add_peer` / `update_peer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevicePeer {
    /// Peer public key.
    pub public_key: PublicKey,
    /// Preshared key, `None` removes any installed one.
    pub preshared_key: Option<PresharedKey>,
    /// Allowed IPs, replacing the installed set.
    pub allowed_ips: Vec<IpNet>,
    /// Endpoint. `None` leaves the current endpoint as it is.
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval in seconds, 0 = off.
    pub persistent_keepalive: u16,
    /// Install routes for the allowed IPs with this metric.
    pub route_metric: Option<u32>,
}

impl DevicePeer {
    /// Creates a device peer with only a key and allowed IPs.
    #[must_use]
    pub fn new(public_key: PublicKey, allowed_ips: Vec<IpNet>) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips,
            endpoint: None,
            persistent_keepalive: 0,
            route_metric: None,
        }
    }

    /// The live peer this would produce on a fresh install.
    #[must_use]
    pub fn to_live(&self) -> LivePeer {
        LivePeer {
            public_key: self.public_key,
            preshared_key: self.preshared_key.clone(),
            allowed_ips: self.allowed_ips.clone(),
            endpoint: self.endpoint,
            persistent_keepalive: self.persistent_keepalive,
            routes: self.routes(),
        }
    }

    /// Routes this peer should have, sorted, with the kernel's effective
    /// metric. Empty unless `route_metric` is set.
    #[must_use]
    pub fn routes(&self) -> Vec<(IpNet, u32)> {
        let Some(metric) = self.route_metric else {
            return Vec::new();
        };
        normalize_routes(
            self.allowed_ips
                .iter()
                .map(|network| (network.trunc(), effective_metric(network, metric))),
        )
    }
}

/// Metric the kernel assigns to an IPv6 route added with metric 0.
pub const IPV6_DEFAULT_METRIC: u32 = 1024;

/// The metric a route to `network` ends up with when added with `metric`.
#[must_use]
pub fn effective_metric(network: &IpNet, metric: u32) -> u32 {
    match network {
        IpNet::V6(_) if metric == 0 => IPV6_DEFAULT_METRIC,
        _ => metric,
    }
}

/// Compares two route lists as sets.
#[must_use]
pub fn same_routes(a: &[(IpNet, u32)], b: &[(IpNet, u32)]) -> bool {
    normalize_routes(a.iter().copied()) == normalize_routes(b.iter().copied())
}

fn normalize_routes(routes: impl Iterator<Item = (IpNet, u32)>) -> Vec<(IpNet, u32)> {
    let mut routes: Vec<(IpNet, u32)> = routes
        .map(|(network, metric)| (network.trunc(), metric))
        .collect();
    routes.sort_unstable();
    routes.dedup();
    routes
}

/// Compares two lists of networks as sets.
#[must_use]
pub fn same_networks(a: &[IpNet], b: &[IpNet]) -> bool {
    let mut a: Vec<IpNet> = a.iter().map(IpNet::trunc).collect();
    let mut b: Vec<IpNet> = b.iter().map(IpNet::trunc).collect();
    a.sort_unstable();
    a.dedup();
    b.sort_unstable();
    b.dedup();
    a == b
}

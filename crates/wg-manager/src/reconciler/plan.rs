//! Pure diff between desired configuration and live state.

use std::collections::HashSet;
use std::net::SocketAddr;

use ipnet::IpNet;

use super::result::DeviceChange;
use crate::config::{InterfaceConfig, PeerConfig};
use crate::error::KeyStoreError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::state::{DevicePeer, LivePeer, LiveState, same_networks, same_routes};
use crate::types::Endpoint;

/// Ordered work for one reconcile.
#[derive(Debug)]
pub(crate) struct Plan {
    /// Device changes, applied before any peer work.
    pub device: Vec<DeviceChange>,
    /// Live peers to remove, ordered by Base64 key.
    pub removals: Vec<PublicKey>,
    /// One step per desired peer, in desired order.
    pub peers: Vec<PeerStep>,
}

#[derive(Debug)]
pub(crate) struct PeerStep {
    pub public_key: PublicKey,
    pub kind: StepKind,
    /// Hostname and port still to be resolved.
    pub resolve: Option<(String, u16)>,
    /// Endpoint the live peer had when the plan was built.
    pub live_endpoint: Option<SocketAddr>,
}

#[derive(Debug)]
pub(crate) enum StepKind {
    Add(DevicePeer),
    Update(DevicePeer),
    Unchanged(DevicePeer),
    /// The preshared key file could not be loaded; the peer is left alone.
    Blocked(KeyStoreError),
}

impl PeerStep {
    pub fn device_peer(&self) -> Option<&DevicePeer> {
        match &self.kind {
            StepKind::Add(peer) | StepKind::Update(peer) | StepKind::Unchanged(peer) => Some(peer),
            StepKind::Blocked(_) => None,
        }
    }
}

impl Plan {
    /// Diffs `desired` against `live`.
    ///
    /// `preshared` holds the loaded preshared key of each desired peer, by
    /// index.
    pub fn build(
        desired: &InterfaceConfig,
        private_key: Option<&PrivateKey>,
        preshared: Vec<Result<Option<PresharedKey>, KeyStoreError>>,
        live: &LiveState,
    ) -> Self {
        let device = device_changes(desired, private_key, live);

        let wanted: HashSet<PublicKey> = desired.peers.iter().map(|p| p.public_key).collect();
        let mut removals: Vec<PublicKey> = live
            .peers
            .iter()
            .map(|p| p.public_key)
            .filter(|key| !wanted.contains(key))
            .collect();
        removals.sort_by_cached_key(PublicKey::to_base64);

        let peers = desired
            .peers
            .iter()
            .zip(preshared)
            .map(|(config, psk)| peer_step(config, psk, desired.metric, live.peer(&config.public_key)))
            .collect();

        Self {
            device,
            removals,
            peers,
        }
    }

    /// Whether applying the plan would change nothing.
    pub fn is_empty(&self) -> bool {
        self.device.is_empty()
            && self.removals.is_empty()
            && self
                .peers
                .iter()
                .all(|s| matches!(s.kind, StepKind::Unchanged(_)) && s.resolve.is_none())
    }
}

fn device_changes(
    desired: &InterfaceConfig,
    private_key: Option<&PrivateKey>,
    live: &LiveState,
) -> Vec<DeviceChange> {
    let mut changes = Vec::new();

    if !live.exists {
        changes.push(DeviceChange::Create);
    }
    if private_key.is_some_and(|key| live.public_key != Some(key.public_key())) {
        changes.push(DeviceChange::PrivateKey);
    }
    if let Some(port) = desired.listen_port.filter(|p| live.listen_port != Some(*p)) {
        changes.push(DeviceChange::ListenPort(port));
    }
    let mark = desired.fwmark_value().unwrap_or(0);
    if live.fwmark.unwrap_or(0) != mark {
        changes.push(DeviceChange::Fwmark(mark));
    }
    let mtu = desired.effective_mtu();
    if live.mtu != Some(mtu) {
        changes.push(DeviceChange::Mtu(mtu));
    }
    if sorted(&desired.addresses) != sorted(&live.addresses) {
        changes.push(DeviceChange::Addresses(desired.addresses.clone()));
    }

    changes
}

fn peer_step(
    config: &PeerConfig,
    preshared: Result<Option<PresharedKey>, KeyStoreError>,
    metric: Option<u32>,
    live: Option<&LivePeer>,
) -> PeerStep {
    let resolve = match &config.endpoint {
        Some(Endpoint::Host { host, port }) => Some((host.clone(), *port)),
        _ => None,
    };
    let live_endpoint = live.and_then(|l| l.endpoint);

    let kind = match preshared {
        Err(error) => StepKind::Blocked(error),
        Ok(preshared_key) => {
            let peer = DevicePeer {
                public_key: config.public_key,
                preshared_key,
                allowed_ips: config.allowed_ips.clone(),
                endpoint: config.endpoint.as_ref().and_then(Endpoint::addr),
                persistent_keepalive: config.persistent_keepalive,
                route_metric: config.route_allowed_ips.then(|| metric.unwrap_or(0)),
            };
            match live {
                None => StepKind::Add(peer),
                Some(live) if differs(&peer, live) => StepKind::Update(peer),
                Some(_) => StepKind::Unchanged(peer),
            }
        }
    };

    PeerStep {
        public_key: config.public_key,
        kind,
        resolve,
        live_endpoint,
    }
}

/// A missing desired endpoint never counts as a difference: the live one
/// may have been learned from the peer roaming.
fn differs(desired: &DevicePeer, live: &LivePeer) -> bool {
    !same_networks(&desired.allowed_ips, &live.allowed_ips)
        || desired.preshared_key != live.preshared_key
        || desired.persistent_keepalive != live.persistent_keepalive
        || desired.endpoint.is_some_and(|e| live.endpoint != Some(e))
        || !same_routes(&desired.routes(), &live.routes)
}

fn sorted(networks: &[IpNet]) -> Vec<IpNet> {
    let mut networks = networks.to_vec();
    networks.sort_unstable();
    networks.dedup();
    networks
}

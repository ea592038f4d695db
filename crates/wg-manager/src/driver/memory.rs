//! In-memory driver for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tokio::sync::RwLock;

use super::{DriverOperation, InterfaceDriver};
use crate::config::DEFAULT_MTU;
use crate::error::DriverError;
use crate::keys::{PrivateKey, PublicKey};
use crate::state::{DevicePeer, LivePeer, LiveState};

/// One recorded driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    /// Interface the call targeted.
    pub interface: String,
    /// Operation performed.
    pub operation: DriverOperation,
    /// Peer the call targeted, if any.
    pub peer: Option<PublicKey>,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

#[derive(Debug)]
struct MemoryDevice {
    public_key: Option<PublicKey>,
    listen_port: Option<u16>,
    fwmark: u32,
    mtu: u16,
    addresses: Vec<IpNet>,
    peers: BTreeMap<PublicKey, LivePeer>,
}

impl MemoryDevice {
    fn new() -> Self {
        Self {
            public_key: None,
            listen_port: None,
            fwmark: 0,
            mtu: DEFAULT_MTU,
            addresses: Vec::new(),
            peers: BTreeMap::new(),
        }
    }

    fn snapshot(&self) -> LiveState {
        LiveState {
            exists: true,
            public_key: self.public_key,
            listen_port: self.listen_port,
            fwmark: (self.fwmark != 0).then_some(self.fwmark),
            mtu: Some(self.mtu),
            addresses: self.addresses.clone(),
            peers: self.peers.values().cloned().collect(),
        }
    }
}

#[derive(Debug)]
struct FailureRule {
    operation: DriverOperation,
    peer: Option<PublicKey>,
    remaining: Option<u32>,
    cause: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    devices: HashMap<String, MemoryDevice>,
    journal: Vec<JournalEntry>,
    failures: Vec<FailureRule>,
}

impl MemoryState {
    fn check_failure(
        &mut self,
        operation: DriverOperation,
        peer: Option<&PublicKey>,
    ) -> Result<(), DriverError> {
        let rule = self.failures.iter_mut().find(|rule| {
            rule.operation == operation
                && rule.remaining != Some(0)
                && rule.peer.as_ref().is_none_or(|p| Some(p) == peer)
        });
        match rule {
            Some(rule) => {
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                Err(DriverError::new(operation, rule.cause.clone()))
            }
            None => Ok(()),
        }
    }

    fn device_mut(
        &mut self,
        name: &str,
        operation: DriverOperation,
    ) -> Result<&mut MemoryDevice, DriverError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| DriverError::new(operation, format!("no such device: {name}")))
    }

    /// Runs `apply` unless an injected failure fires, and journals the call.
    fn record<T>(
        &mut self,
        name: &str,
        operation: DriverOperation,
        peer: Option<&PublicKey>,
        apply: impl FnOnce(&mut Self) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        let result = self.check_failure(operation, peer).and_then(|()| apply(self));
        self.journal.push(JournalEntry {
            interface: name.to_string(),
            operation,
            peer: peer.copied(),
            succeeded: result.is_ok(),
        });
        result
    }
}

/// A driver that keeps interfaces in memory.
///
/// Clones share state, so a test can hand one clone to the reconciler and
/// inspect or mutate through another.
#[derive(Clone, Debug)]
pub struct MemoryDriver {
    state: Arc<RwLock<MemoryState>>,
    peer_update: bool,
}

impl MemoryDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            peer_update: true,
        }
    }

    /// Returns a driver sharing this state that reports no atomic peer
    /// update, forcing the remove-then-add fallback.
    #[must_use]
    pub fn without_peer_update(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            peer_update: false,
        }
    }

    /// Makes every call to `operation` fail.
    pub async fn fail(&self, operation: DriverOperation, cause: impl Into<String>) {
        self.push_failure(operation, None, None, cause.into()).await;
    }

    /// Makes the next `times` calls to `operation` fail.
    pub async fn fail_times(&self, operation: DriverOperation, times: u32, cause: impl Into<String>) {
        self.push_failure(operation, None, Some(times), cause.into()).await;
    }

    /// Makes every call to `operation` for `peer` fail.
    pub async fn fail_peer(
        &self,
        operation: DriverOperation,
        peer: PublicKey,
        cause: impl Into<String>,
    ) {
        self.push_failure(operation, Some(peer), None, cause.into()).await;
    }

    /// Removes all injected failures.
    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    async fn push_failure(
        &self,
        operation: DriverOperation,
        peer: Option<PublicKey>,
        remaining: Option<u32>,
        cause: String,
    ) {
        self.state.write().await.failures.push(FailureRule {
            operation,
            peer,
            remaining,
            cause,
        });
    }

    /// Every call made so far, oldest first.
    pub async fn journal(&self) -> Vec<JournalEntry> {
        self.state.read().await.journal.clone()
    }

    /// Successful write calls made so far.
    pub async fn writes(&self) -> Vec<JournalEntry> {
        self.state
            .read()
            .await
            .journal
            .iter()
            .filter(|entry| entry.succeeded && entry.operation.is_write())
            .cloned()
            .collect()
    }

    /// Forgets the recorded calls.
    pub async fn clear_journal(&self) {
        self.state.write().await.journal.clear();
    }

    /// Current state of `name`, without journaling the read.
    pub async fn snapshot(&self, name: &str) -> LiveState {
        self.state
            .read()
            .await
            .devices
            .get(name)
            .map_or_else(LiveState::absent, MemoryDevice::snapshot)
    }

    /// Routes installed on `name` as (network, metric) pairs.
    pub async fn routes(&self, name: &str) -> Vec<(IpNet, u32)> {
        let state = self.state.read().await;
        let Some(device) = state.devices.get(name) else {
            return Vec::new();
        };
        device
            .peers
            .values()
            .flat_map(|peer| peer.routes.iter().copied())
            .collect()
    }

    /// Installs a peer behind the reconciler's back.
    pub async fn insert_peer_externally(&self, name: &str, peer: LivePeer) {
        let mut state = self.state.write().await;
        let device = state
            .devices
            .entry(name.to_string())
            .or_insert_with(MemoryDevice::new);
        device.peers.insert(peer.public_key, peer);
    }

    /// Removes a peer behind the reconciler's back.
    pub async fn remove_peer_externally(&self, name: &str, public_key: &PublicKey) {
        if let Some(device) = self.state.write().await.devices.get_mut(name) {
            device.peers.remove(public_key);
        }
    }

    /// Simulates roaming: the peer's endpoint changes under us.
    pub async fn set_endpoint_externally(
        &self,
        name: &str,
        public_key: &PublicKey,
        endpoint: SocketAddr,
    ) {
        if let Some(peer) = self
            .state
            .write()
            .await
            .devices
            .get_mut(name)
            .and_then(|device| device.peers.get_mut(public_key))
        {
            peer.endpoint = Some(endpoint);
        }
    }

    /// Replaces device `name` with one matching `live`.
    ///
    /// Seeding an absent state removes the device.
    pub async fn seed(&self, name: &str, live: &LiveState) {
        let mut state = self.state.write().await;
        if !live.exists {
            state.devices.remove(name);
            return;
        }
        let device = MemoryDevice {
            public_key: live.public_key,
            listen_port: live.listen_port,
            fwmark: live.fwmark.unwrap_or(0),
            mtu: live.mtu.unwrap_or(DEFAULT_MTU),
            addresses: live.addresses.clone(),
            peers: live
                .peers
                .iter()
                .map(|peer| (peer.public_key, peer.clone()))
                .collect(),
        };
        state.devices.insert(name.to_string(), device);
    }

    /// Changes the MTU behind the reconciler's back.
    pub async fn set_mtu_externally(&self, name: &str, mtu: u16) {
        if let Some(device) = self.state.write().await.devices.get_mut(name) {
            device.mtu = mtu;
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceDriver for MemoryDriver {
    async fn device_exists(&self, name: &str) -> Result<bool, DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::DeviceExists, None, |s| {
            Ok(s.devices.contains_key(name))
        })
    }

    async fn create_device(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::CreateDevice, None, |s| {
            if s.devices.contains_key(name) {
                return Err(DriverError::new(
                    DriverOperation::CreateDevice,
                    format!("device exists: {name}"),
                ));
            }
            s.devices.insert(name.to_string(), MemoryDevice::new());
            Ok(())
        })
    }

    async fn remove_device(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::RemoveDevice, None, |s| {
            s.devices.remove(name).map(|_| ()).ok_or_else(|| {
                DriverError::new(DriverOperation::RemoveDevice, format!("no such device: {name}"))
            })
        })
    }

    async fn set_private_key(&self, name: &str, key: &PrivateKey) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::SetPrivateKey, None, |s| {
            s.device_mut(name, DriverOperation::SetPrivateKey)?.public_key =
                Some(key.public_key());
            Ok(())
        })
    }

    async fn set_listen_port(&self, name: &str, port: u16) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::SetListenPort, None, |s| {
            s.device_mut(name, DriverOperation::SetListenPort)?.listen_port = Some(port);
            Ok(())
        })
    }

    async fn set_fwmark(&self, name: &str, mark: u32) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::SetFwmark, None, |s| {
            s.device_mut(name, DriverOperation::SetFwmark)?.fwmark = mark;
            Ok(())
        })
    }

    async fn set_mtu(&self, name: &str, mtu: u16) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::SetMtu, None, |s| {
            s.device_mut(name, DriverOperation::SetMtu)?.mtu = mtu;
            Ok(())
        })
    }

    async fn set_addresses(&self, name: &str, addresses: &[IpNet]) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::SetAddresses, None, |s| {
            s.device_mut(name, DriverOperation::SetAddresses)?.addresses = addresses.to_vec();
            Ok(())
        })
    }

    async fn add_peer(&self, name: &str, peer: &DevicePeer) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::AddPeer, Some(&peer.public_key), |s| {
            let device = s.device_mut(name, DriverOperation::AddPeer)?;
            if device.peers.contains_key(&peer.public_key) {
                return Err(DriverError::new(
                    DriverOperation::AddPeer,
                    format!("peer {} already present", peer.public_key.short()),
                ));
            }
            device.peers.insert(peer.public_key, peer.to_live());
            Ok(())
        })
    }

    async fn remove_peer(&self, name: &str, public_key: &PublicKey) -> Result<(), DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::RemovePeer, Some(public_key), |s| {
            s.device_mut(name, DriverOperation::RemovePeer)?
                .peers
                .remove(public_key)
                .map(|_| ())
                .ok_or_else(|| {
                    DriverError::new(
                        DriverOperation::RemovePeer,
                        format!("no such peer: {}", public_key.short()),
                    )
                })
        })
    }

    async fn update_peer(&self, name: &str, peer: &DevicePeer) -> Result<(), DriverError> {
        let peer_update = self.peer_update;
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::UpdatePeer, Some(&peer.public_key), |s| {
            if !peer_update {
                return Err(DriverError::new(
                    DriverOperation::UpdatePeer,
                    "atomic peer update not supported",
                ));
            }
            let live = s
                .device_mut(name, DriverOperation::UpdatePeer)?
                .peers
                .get_mut(&peer.public_key)
                .ok_or_else(|| {
                    DriverError::new(
                        DriverOperation::UpdatePeer,
                        format!("no such peer: {}", peer.public_key.short()),
                    )
                })?;
            let endpoint = peer.endpoint.or(live.endpoint);
            *live = peer.to_live();
            live.endpoint = endpoint;
            Ok(())
        })
    }

    async fn read_state(&self, name: &str) -> Result<LiveState, DriverError> {
        let mut state = self.state.write().await;
        state.record(name, DriverOperation::ReadState, None, |s| {
            Ok(s.devices
                .get(name)
                .map_or_else(LiveState::absent, MemoryDevice::snapshot))
        })
    }

    fn supports_peer_update(&self) -> bool {
        self.peer_update
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes_array([seed; 32])
    }

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    #[tokio::test]
    async fn create_and_read_device() {
        let driver = MemoryDriver::new();
        assert!(!driver.device_exists("wg0").await.expect("exists"));

        driver.create_device("wg0").await.expect("create");
        let state = driver.read_state("wg0").await.expect("read");
        assert!(state.exists);
        assert_eq!(state.mtu, Some(DEFAULT_MTU));
        assert!(state.peers.is_empty());
    }

    #[tokio::test]
    async fn read_missing_device_is_absent() {
        let driver = MemoryDriver::new();
        let state = driver.read_state("wg9").await.expect("read");
        assert_eq!(state, LiveState::absent());
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let driver = MemoryDriver::new();
        driver.create_device("wg0").await.expect("create");
        let err = driver.create_device("wg0").await.expect_err("exists");
        assert_eq!(err.operation, DriverOperation::CreateDevice);
    }

    #[tokio::test]
    async fn private_key_reports_public_key() {
        let driver = MemoryDriver::new();
        let private = PrivateKey::generate();
        driver.create_device("wg0").await.expect("create");
        driver.set_private_key("wg0", &private).await.expect("key");
        let state = driver.snapshot("wg0").await;
        assert_eq!(state.public_key, Some(private.public_key()));
    }

    #[tokio::test]
    async fn add_update_remove_peer() {
        let driver = MemoryDriver::new();
        driver.create_device("wg0").await.expect("create");

        let mut peer = DevicePeer::new(key(1), vec![net("10.0.0.2/32")]);
        peer.endpoint = Some("192.0.2.1:51820".parse().expect("addr"));
        driver.add_peer("wg0", &peer).await.expect("add");
        assert!(driver.add_peer("wg0", &peer).await.is_err());

        peer.endpoint = None;
        peer.persistent_keepalive = 25;
        driver.update_peer("wg0", &peer).await.expect("update");
        let state = driver.snapshot("wg0").await;
        let live = state.peer(&key(1)).expect("peer");
        assert_eq!(live.persistent_keepalive, 25);
        assert_eq!(live.endpoint, Some("192.0.2.1:51820".parse().expect("addr")));

        driver.remove_peer("wg0", &key(1)).await.expect("remove");
        assert!(driver.snapshot("wg0").await.peers.is_empty());
        assert!(driver.remove_peer("wg0", &key(1)).await.is_err());
    }

    #[tokio::test]
    async fn operations_on_missing_device_fail() {
        let driver = MemoryDriver::new();
        let err = driver.set_mtu("wg0", 1300).await.expect_err("no device");
        assert_eq!(err.operation, DriverOperation::SetMtu);
    }

    #[tokio::test]
    async fn injected_failure_counts_down() {
        let driver = MemoryDriver::new();
        driver.fail_times(DriverOperation::CreateDevice, 1, "busy").await;
        assert!(driver.create_device("wg0").await.is_err());
        assert!(driver.create_device("wg0").await.is_ok());
    }

    #[tokio::test]
    async fn injected_peer_failure_only_hits_that_peer() {
        let driver = MemoryDriver::new();
        driver.create_device("wg0").await.expect("create");
        driver.fail_peer(DriverOperation::AddPeer, key(2), "EINVAL").await;

        assert!(driver
            .add_peer("wg0", &DevicePeer::new(key(1), vec![net("10.0.0.1/32")]))
            .await
            .is_ok());
        let err = driver
            .add_peer("wg0", &DevicePeer::new(key(2), vec![net("10.0.0.2/32")]))
            .await
            .expect_err("injected");
        assert_eq!(err.cause, "EINVAL");
    }

    #[tokio::test]
    async fn journal_records_calls() {
        let driver = MemoryDriver::new();
        driver.create_device("wg0").await.expect("create");
        driver.read_state("wg0").await.expect("read");
        let _ = driver.set_mtu("wg1", 1300).await;

        let journal = driver.journal().await;
        assert_eq!(journal.len(), 3);
        assert!(!journal[2].succeeded);
        assert_eq!(driver.writes().await.len(), 1);

        driver.clear_journal().await;
        assert!(driver.journal().await.is_empty());
    }

    #[tokio::test]
    async fn routes_follow_metric() {
        let driver = MemoryDriver::new();
        driver.create_device("wg0").await.expect("create");
        let mut peer = DevicePeer::new(key(1), vec![net("10.1.0.0/16")]);
        peer.route_metric = Some(100);
        driver.add_peer("wg0", &peer).await.expect("add");
        assert_eq!(driver.routes("wg0").await, vec![(net("10.1.0.0/16"), 100)]);

        peer.route_metric = Some(200);
        driver.update_peer("wg0", &peer).await.expect("update");
        let state = driver.read_state("wg0").await.expect("read");
        assert_eq!(
            state.peer(&key(1)).map(|p| p.routes.clone()),
            Some(vec![(net("10.1.0.0/16"), 200)])
        );

        peer.route_metric = None;
        driver.update_peer("wg0", &peer).await.expect("update");
        assert!(driver.routes("wg0").await.is_empty());
    }

    #[tokio::test]
    async fn without_peer_update_shares_state() {
        let driver = MemoryDriver::new();
        let fallback = driver.without_peer_update();
        assert!(!fallback.supports_peer_update());

        fallback.create_device("wg0").await.expect("create");
        assert!(driver.snapshot("wg0").await.exists);

        let peer = DevicePeer::new(key(1), vec![net("10.0.0.1/32")]);
        fallback.add_peer("wg0", &peer).await.expect("add");
        assert!(fallback.update_peer("wg0", &peer).await.is_err());
    }

    #[tokio::test]
    async fn seed_mirrors_live_state() {
        let driver = MemoryDriver::new();
        let live = LiveState {
            exists: true,
            public_key: Some(key(9)),
            listen_port: Some(51820),
            fwmark: Some(0x20),
            mtu: Some(1400),
            addresses: vec![net("10.0.0.1/24")],
            peers: vec![LivePeer::new(key(1), vec![net("10.0.0.2/32")])],
        };
        driver.seed("wg0", &live).await;
        assert_eq!(driver.snapshot("wg0").await, live);
        assert!(driver.journal().await.is_empty());

        tokio_test::assert_ok!(driver.remove_peer("wg0", &key(1)).await);
        tokio_test::assert_err!(driver.remove_peer("wg0", &key(1)).await);

        driver.seed("wg0", &LiveState::absent()).await;
        assert!(!driver.snapshot("wg0").await.exists);
    }
}

//! What a reconcile did.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::Serialize;

use crate::driver::DriverOperation;
use crate::error::{DriverError, PeerError};
use crate::keys::PublicKey;

/// A device-level change that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", content = "value", rename_all = "snake_case")]
pub enum DeviceChange {
    /// The device was created.
    Create,
    /// The private key was set. The key itself is never reported.
    PrivateKey,
    /// The listen port was set.
    ListenPort(u16),
    /// The firewall mark was set (0 = off).
    Fwmark(u32),
    /// The MTU was set.
    Mtu(u16),
    /// The address set was replaced.
    Addresses(Vec<IpNet>),
}

impl DeviceChange {
    /// Driver operation that applies this change.
    #[must_use]
    pub const fn operation(&self) -> DriverOperation {
        match self {
            Self::Create => DriverOperation::CreateDevice,
            Self::PrivateKey => DriverOperation::SetPrivateKey,
            Self::ListenPort(_) => DriverOperation::SetListenPort,
            Self::Fwmark(_) => DriverOperation::SetFwmark,
            Self::Mtu(_) => DriverOperation::SetMtu,
            Self::Addresses(_) => DriverOperation::SetAddresses,
        }
    }
}

/// What happened to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerAction {
    /// Installed.
    Added,
    /// Removed because it is no longer desired.
    Removed,
    /// Changed in place.
    Updated,
    /// Changed by removing and re-adding it.
    Replaced,
    /// Already matched the desired state.
    Unchanged,
    /// The change was attempted and failed.
    Failed,
    /// Never attempted.
    Skipped,
}

impl PeerAction {
    /// Whether the peer was changed on the device.
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Added | Self::Removed | Self::Updated | Self::Replaced)
    }

    /// Whether the peer is on the device in its desired form.
    #[must_use]
    pub const fn is_installed(self) -> bool {
        matches!(self, Self::Added | Self::Updated | Self::Replaced | Self::Unchanged)
    }
}

/// Outcome for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerOutcome {
    /// The peer.
    pub public_key: PublicKey,
    /// What was done.
    pub action: PeerAction,
    /// Endpoint set during this reconcile, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
    /// Why the peer is not fully in its desired state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PeerError>,
}

impl PeerOutcome {
    /// An outcome without error.
    #[must_use]
    pub fn new(public_key: PublicKey, action: PeerAction) -> Self {
        Self {
            public_key,
            action,
            endpoint: None,
            error: None,
        }
    }

    /// A failed change.
    #[must_use]
    pub fn failed(public_key: PublicKey, error: PeerError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(public_key, PeerAction::Failed)
        }
    }

    /// A peer the reconcile stopped before reaching.
    #[must_use]
    pub fn skipped(public_key: PublicKey) -> Self {
        Self {
            error: Some(PeerError::Incomplete),
            ..Self::new(public_key, PeerAction::Skipped)
        }
    }
}

/// Result of a reconcile.
///
/// Per-peer failures land here rather than aborting the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileResult {
    /// Interface name.
    pub interface: String,
    /// Whether the device was created.
    pub created: bool,
    /// Device-level changes applied, in order.
    pub device_changes: Vec<DeviceChange>,
    /// Peer outcomes: removals first, then desired peers in order.
    pub peer_outcomes: Vec<PeerOutcome>,
    /// Device-level failure that stopped the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_error: Option<DriverError>,
    /// The deadline passed or the run was cancelled before all work started.
    pub incomplete: bool,
}

impl ReconcileResult {
    /// Empty result for `interface`.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    /// Number of changes applied (device changes plus changed peers).
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.device_changes.len()
            + self
                .peer_outcomes
                .iter()
                .filter(|o| o.action.is_change())
                .count()
    }

    /// Every per-peer error, with the peer it belongs to.
    #[must_use]
    pub fn errors(&self) -> Vec<(&PublicKey, &PeerError)> {
        self.peer_outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| (&o.public_key, e)))
            .collect()
    }

    /// Whether everything reached its desired state.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.device_error.is_none()
            && !self.incomplete
            && self.peer_outcomes.iter().all(|o| o.error.is_none())
    }

    /// Whether anything was changed.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operation_count() > 0
    }

    /// Outcome for `public_key`, if the peer was part of the run.
    #[must_use]
    pub fn peer(&self, public_key: &PublicKey) -> Option<&PeerOutcome> {
        self.peer_outcomes.iter().find(|o| &o.public_key == public_key)
    }

    pub(crate) fn record(&mut self, outcome: PeerOutcome) -> usize {
        if matches!(outcome.error, Some(PeerError::Incomplete)) {
            self.incomplete = true;
        }
        self.peer_outcomes.push(outcome);
        self.peer_outcomes.len() - 1
    }

    pub(crate) fn skip_all(&mut self, peers: impl IntoIterator<Item = PublicKey>) {
        self.incomplete = true;
        for public_key in peers {
            self.record(PeerOutcome::skipped(public_key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        PublicKey::from_bytes_array([seed; 32])
    }

    #[test]
    fn empty_result_is_success_without_changes() {
        let result = ReconcileResult::new("wg0");
        assert!(result.is_success());
        assert!(!result.has_changes());
        assert_eq!(result.operation_count(), 0);
    }

    #[test]
    fn counts_device_and_peer_changes() {
        let mut result = ReconcileResult::new("wg0");
        result.device_changes.push(DeviceChange::Create);
        result.device_changes.push(DeviceChange::Mtu(1420));
        result.record(PeerOutcome::new(key(1), PeerAction::Added));
        result.record(PeerOutcome::new(key(2), PeerAction::Unchanged));
        result.record(PeerOutcome::new(key(3), PeerAction::Replaced));
        assert_eq!(result.operation_count(), 4);
        assert!(result.has_changes());
        assert!(result.is_success());
    }

    #[test]
    fn peer_error_breaks_success() {
        let mut result = ReconcileResult::new("wg0");
        result.record(PeerOutcome::failed(
            key(1),
            DriverError::new(DriverOperation::AddPeer, "EPERM").into(),
        ));
        assert!(!result.is_success());
        assert_eq!(result.errors().len(), 1);
        assert_eq!(result.errors()[0].0, &key(1));
    }

    #[test]
    fn skipped_peers_mark_incomplete() {
        let mut result = ReconcileResult::new("wg0");
        result.skip_all([key(1), key(2)]);
        assert!(result.incomplete);
        assert!(!result.is_success());
        assert_eq!(result.peer(&key(2)).map(|o| o.action), Some(PeerAction::Skipped));
    }

    #[test]
    fn serializes_without_secrets() {
        let mut result = ReconcileResult::new("wg0");
        result.device_changes.push(DeviceChange::PrivateKey);
        result.device_changes.push(DeviceChange::ListenPort(51820));
        result.record(PeerOutcome::new(key(1), PeerAction::Added));

        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["device_changes"][0]["change"], "private_key");
        assert_eq!(json["device_changes"][1]["value"], 51820);
        assert_eq!(json["peer_outcomes"][0]["action"], "added");
        assert!(json["peer_outcomes"][0].get("error").is_none());
    }

    #[test]
    fn change_maps_to_operation() {
        assert_eq!(DeviceChange::Fwmark(1).operation(), DriverOperation::SetFwmark);
        assert_eq!(
            DeviceChange::Addresses(Vec::new()).operation(),
            DriverOperation::SetAddresses
        );
    }
}

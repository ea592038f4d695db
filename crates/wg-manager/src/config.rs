//! Typed interface and peer configuration with pure validation.

use std::collections::HashSet;

use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ValidationError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{Endpoint, KeySource, is_valid_hostname};

/// Smallest MTU accepted for a tunnel interface.
pub const MIN_MTU: u16 = 1280;

/// Largest MTU accepted for a tunnel interface, and the default.
pub const MAX_MTU: u16 = 1420;

/// Default MTU when none is configured.
pub const DEFAULT_MTU: u16 = MAX_MTU;

/// Maximum length of a Linux interface name (`IFNAMSIZ` - 1).
pub const MAX_INTERFACE_NAME_LENGTH: usize = 15;

static FWMARK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[a-fA-F0-9]{1,4}$").unwrap_or_else(|_| unreachable!()));

static INTERFACE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap_or_else(|_| unreachable!()));

/// Desired configuration of a `WireGuard` interface.
#[derive(Clone, Debug, Default)]
pub struct InterfaceConfig {
    /// Interface name, e.g. `wg0`.
    pub name: String,
    /// Private key source. `Absent` leaves the key to the driver.
    pub private_key: KeySource<PrivateKey>,
    /// UDP listen port. `None` lets the kernel pick a random one.
    pub listen_port: Option<u16>,
    /// Addresses assigned to the interface.
    pub addresses: Vec<IpNet>,
    /// MTU, 1280..=1420. `None` means 1420.
    pub mtu: Option<u16>,
    /// Firewall mark as entered, `0x` followed by 1-4 hex digits.
    pub fwmark: Option<String>,
    /// Route metric for peers with `route_allowed_ips`.
    pub metric: Option<u32>,
    /// Peers, in the order they are applied.
    pub peers: Vec<PeerConfig>,
}

impl InterfaceConfig {
    /// Creates an empty configuration for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets an inline private key.
    #[must_use]
    pub fn with_private_key(mut self, key: PrivateKey) -> Self {
        self.private_key = KeySource::Inline(key);
        self
    }

    /// References a private key file under the key root.
    #[must_use]
    pub fn with_private_key_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.private_key = KeySource::File(path.into());
        self
    }

    /// Sets the listen port.
    #[must_use]
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Adds an address.
    #[must_use]
    pub fn with_address(mut self, address: IpNet) -> Self {
        self.addresses.push(address);
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// Sets the firewall mark text.
    #[must_use]
    pub fn with_fwmark(mut self, fwmark: impl Into<String>) -> Self {
        self.fwmark = Some(fwmark.into());
        self
    }

    /// Sets the route metric.
    #[must_use]
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    /// Adds a peer.
    #[must_use]
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(peer);
        self
    }

    /// Effective MTU.
    #[must_use]
    pub fn effective_mtu(&self) -> u16 {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    /// Firewall mark as a number. `None` if unset or malformed.
    #[must_use]
    pub fn fwmark_value(&self) -> Option<u32> {
        self.fwmark.as_deref().and_then(parse_fwmark)
    }

    /// Checks every structural invariant of the configuration.
    ///
    /// Pure: never touches the OS and never reads key files.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_interface_name(&self.name)?;

        if let Some(mtu) = self.mtu.filter(|mtu| !(MIN_MTU..=MAX_MTU).contains(mtu)) {
            return Err(ValidationError::new(
                "mtu",
                format!("{mtu} is outside {MIN_MTU}..={MAX_MTU}"),
            ));
        }

        if let Some(fwmark) = self.fwmark.as_deref().filter(|f| !FWMARK_REGEX.is_match(f)) {
            return Err(ValidationError::new(
                "fwmark",
                format!("{fwmark:?} is not a hexadecimal value starting with 0x"),
            ));
        }

        if self.private_key.file().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(ValidationError::new("private_key_file", "empty path"));
        }

        let own_key = self.private_key.inline().map(PrivateKey::public_key);
        let mut seen = HashSet::with_capacity(self.peers.len());

        for (index, peer) in self.peers.iter().enumerate() {
            let field = |name: &str| format!("peers[{index}].{name}");

            if !seen.insert(peer.public_key) {
                return Err(ValidationError::new(
                    field("public_key"),
                    format!("duplicate peer {}", peer.public_key.short()),
                ));
            }
            if own_key == Some(peer.public_key) {
                return Err(ValidationError::new(
                    field("public_key"),
                    "peer key equals the interface's own public key",
                ));
            }
            peer.validate().map_err(|e| ValidationError {
                field: field(&e.field),
                reason: e.reason,
            })?;
        }

        Ok(())
    }
}

/// Desired configuration of one peer.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Free-form description.
    pub description: Option<String>,
    /// The peer's public key, unique within the interface.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: KeySource<PresharedKey>,
    /// Networks the peer may source traffic from. Must be non-empty.
    pub allowed_ips: Vec<IpNet>,
    /// Optional endpoint.
    pub endpoint: Option<Endpoint>,
    /// Keepalive interval in seconds, 0 disables it.
    pub persistent_keepalive: u16,
    /// Whether routes for the allowed IPs are installed.
    pub route_allowed_ips: bool,
}

impl PeerConfig {
    /// Creates a peer config with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            description: None,
            public_key,
            preshared_key: KeySource::Absent,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: 0,
            route_allowed_ips: false,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets an inline preshared key.
    #[must_use]
    pub fn with_preshared_key(mut self, key: PresharedKey) -> Self {
        self.preshared_key = KeySource::Inline(key);
        self
    }

    /// References a preshared key file under the key root.
    #[must_use]
    pub fn with_preshared_key_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.preshared_key = KeySource::File(path.into());
        self
    }

    /// Adds an allowed IP.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: IpNet) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = seconds;
        self
    }

    /// Installs routes for the allowed IPs.
    #[must_use]
    pub fn with_route_allowed_ips(mut self, route: bool) -> Self {
        self.route_allowed_ips = route;
        self
    }

    /// Checks the peer on its own. Field names are relative to the peer.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.allowed_ips.is_empty() {
            return Err(ValidationError::new(
                "allowed_ips",
                "at least one allowed IP is required",
            ));
        }
        if let Some(Endpoint::Host { host, .. }) = &self.endpoint {
            if !is_valid_hostname(host) {
                return Err(ValidationError::new(
                    "endpoint",
                    format!("invalid host: {host}"),
                ));
            }
        }
        if self.preshared_key.file().is_some_and(|p| p.as_os_str().is_empty()) {
            return Err(ValidationError::new("preshared_key_file", "empty path"));
        }
        Ok(())
    }
}

/// Parses `0x`-prefixed firewall mark text.
#[must_use]
pub fn parse_fwmark(text: &str) -> Option<u32> {
    if !FWMARK_REGEX.is_match(text) {
        return None;
    }
    u32::from_str_radix(&text[2..], 16).ok()
}

pub(crate) fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_INTERFACE_NAME_LENGTH {
        return Err(ValidationError::new(
            "name",
            format!("must be 1-{MAX_INTERFACE_NAME_LENGTH} characters"),
        ));
    }
    if !INTERFACE_NAME_REGEX.is_match(name) || name == "." || name == ".." {
        return Err(ValidationError::new(
            "name",
            format!("{name:?} contains invalid characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KEY_SIZE;
    use test_case::test_case;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    fn public(seed: u8) -> PublicKey {
        PublicKey::from_bytes_array([seed; KEY_SIZE])
    }

    fn peer(seed: u8, cidr: &str) -> PeerConfig {
        PeerConfig::new(public(seed)).with_allowed_ip(net(cidr))
    }

    fn valid_config() -> InterfaceConfig {
        InterfaceConfig::new("wg0")
            .with_private_key(PrivateKey::from_bytes_array([1u8; KEY_SIZE]))
            .with_listen_port(51820)
            .with_address(net("10.0.0.1/24"))
            .with_peer(peer(2, "10.0.0.2/32"))
            .with_peer(peer(3, "10.0.0.3/32"))
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn absent_private_key_is_deferred() {
        let mut config = valid_config();
        config.private_key = KeySource::Absent;
        assert!(config.validate().is_ok());
    }

    #[test_case(1279, false ; "below range")]
    #[test_case(1280, true ; "lower bound")]
    #[test_case(1420, true ; "upper bound")]
    #[test_case(1500, false ; "ethernet mtu")]
    fn mtu_range(mtu: u16, ok: bool) {
        let result = valid_config().with_mtu(mtu).validate();
        assert_eq!(result.is_ok(), ok);
        if let Err(err) = result {
            assert_eq!(err.field, "mtu");
        }
    }

    #[test_case("0x1", true ; "one digit")]
    #[test_case("0xcafe", true ; "four digits")]
    #[test_case("0xCAFE", true ; "upper case")]
    #[test_case("0xZZZZ", false ; "not hex")]
    #[test_case("0x12345", false ; "five digits")]
    #[test_case("1234", false ; "missing prefix")]
    #[test_case("", false ; "empty")]
    fn fwmark_format(fwmark: &str, ok: bool) {
        let result = valid_config().with_fwmark(fwmark).validate();
        assert_eq!(result.is_ok(), ok);
        if let Err(err) = result {
            assert_eq!(err.field, "fwmark");
        }
    }

    #[test]
    fn fwmark_value_parses_hex() {
        assert_eq!(valid_config().with_fwmark("0xca6c").fwmark_value(), Some(0xca6c));
        assert_eq!(valid_config().fwmark_value(), None);
    }

    #[test]
    fn default_mtu_is_1420() {
        assert_eq!(valid_config().effective_mtu(), 1420);
        assert_eq!(valid_config().with_mtu(1300).effective_mtu(), 1300);
    }

    #[test]
    fn duplicate_peer_rejected() {
        let config = valid_config().with_peer(peer(2, "10.0.0.9/32"));
        let err = config.validate().expect_err("duplicate");
        assert_eq!(err.field, "peers[2].public_key");
    }

    #[test]
    fn empty_allowed_ips_rejected() {
        let config = valid_config().with_peer(PeerConfig::new(public(9)));
        let err = config.validate().expect_err("no allowed ips");
        assert_eq!(err.field, "peers[2].allowed_ips");
    }

    #[test]
    fn peer_equal_to_own_key_rejected() {
        let private = PrivateKey::from_bytes_array([7u8; KEY_SIZE]);
        let config = InterfaceConfig::new("wg0")
            .with_private_key(private.clone())
            .with_peer(PeerConfig::new(private.public_key()).with_allowed_ip(net("10.0.0.2/32")));
        let err = config.validate().expect_err("self peer");
        assert_eq!(err.field, "peers[0].public_key");
    }

    #[test_case("" ; "empty")]
    #[test_case("wireguard-tunnel0" ; "too long")]
    #[test_case("wg 0" ; "space")]
    #[test_case("wg/0" ; "slash")]
    #[test_case(".." ; "dot dot")]
    fn bad_interface_name(name: &str) {
        let mut config = valid_config();
        config.name = name.to_string();
        let err = config.validate().expect_err("bad name");
        assert_eq!(err.field, "name");
    }
}

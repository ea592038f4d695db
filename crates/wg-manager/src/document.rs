//! Raw configuration records as submitted by an administration front end.
//!
//! Documents carry strings and loose numbers exactly as entered. Converting
//! one into an [`InterfaceConfig`] parses every field and validates the
//! result, so every failure comes back as a [`ValidationError`] naming the
//! offending field.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::config::{InterfaceConfig, PeerConfig};
use crate::error::{ValidationError, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{Endpoint, KeySource};

/// An interface record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceDocument {
    /// Interface name.
    pub name: String,
    /// Inline private key, Base64.
    pub private_key: Option<String>,
    /// Private key file reference.
    pub private_key_file: Option<String>,
    /// Listen port.
    pub listen_port: Option<u32>,
    /// Interface addresses in CIDR notation.
    pub addresses: Vec<String>,
    /// MTU.
    pub mtu: Option<u32>,
    /// Firewall mark, `0x`-prefixed hex.
    pub fwmark: Option<String>,
    /// Route metric.
    pub metric: Option<u32>,
    /// Peers.
    pub peers: Vec<PeerDocument>,
}

/// A peer record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDocument {
    /// Free-form description.
    pub description: Option<String>,
    /// Public key, Base64.
    pub public_key: String,
    /// Inline preshared key, Base64.
    pub preshared_key: Option<String>,
    /// Preshared key file reference.
    pub preshared_key_file: Option<String>,
    /// Allowed IPs in CIDR notation.
    pub allowed_ips: Vec<String>,
    /// Install routes for the allowed IPs.
    pub route_allowed_ips: bool,
    /// Endpoint host, an IP address or DNS name.
    pub endpoint_host: Option<String>,
    /// Endpoint port, 51820 when omitted.
    pub endpoint_port: Option<u32>,
    /// Keepalive interval in seconds.
    pub persistent_keepalive: Option<u32>,
}

impl InterfaceDocument {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::ParseError`] with the JSON line number.
    pub fn from_json(text: &str) -> Result<Self, WireGuardError> {
        serde_json::from_str(text).map_err(|e| WireGuardError::ParseError {
            line: e.line(),
            message: e.to_string(),
        })
    }
}

impl TryFrom<InterfaceDocument> for InterfaceConfig {
    type Error = ValidationError;

    fn try_from(doc: InterfaceDocument) -> Result<Self, Self::Error> {
        let peers = doc
            .peers
            .iter()
            .enumerate()
            .map(|(index, peer)| {
                peer_config(peer).map_err(|e| ValidationError {
                    field: format!("peers[{index}].{}", e.field),
                    reason: e.reason,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            private_key: KeySource::from_fields(
                "private_key",
                doc.private_key.as_deref(),
                doc.private_key_file.as_deref(),
                PrivateKey::from_base64,
            )?,
            listen_port: narrow("listen_port", doc.listen_port)?,
            addresses: networks("addresses", &doc.addresses)?,
            mtu: narrow("mtu", doc.mtu)?,
            fwmark: doc
                .fwmark
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
            metric: doc.metric,
            peers,
            name: doc.name,
        };
        config.validate()?;
        Ok(config)
    }
}

fn peer_config(doc: &PeerDocument) -> Result<PeerConfig, ValidationError> {
    let public_key = PublicKey::from_base64(doc.public_key.trim())
        .map_err(|e| ValidationError::new("public_key", e.to_string()))?;

    let endpoint = match doc.endpoint_host.as_deref().map(str::trim) {
        Some(host) if !host.is_empty() => Some(
            Endpoint::from_parts(host, narrow("endpoint_port", doc.endpoint_port)?)
                .map_err(|e| ValidationError::new("endpoint", e.to_string()))?,
        ),
        _ => None,
    };

    Ok(PeerConfig {
        description: doc
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(ToString::to_string),
        public_key,
        preshared_key: KeySource::from_fields(
            "preshared_key",
            doc.preshared_key.as_deref(),
            doc.preshared_key_file.as_deref(),
            PresharedKey::from_base64,
        )?,
        allowed_ips: networks("allowed_ips", &doc.allowed_ips)?,
        endpoint,
        persistent_keepalive: narrow("persistent_keepalive", doc.persistent_keepalive)?
            .unwrap_or(0),
        route_allowed_ips: doc.route_allowed_ips,
    })
}

fn narrow(field: &str, value: Option<u32>) -> Result<Option<u16>, ValidationError> {
    value
        .map(|v| {
            u16::try_from(v)
                .map_err(|_| ValidationError::new(field, format!("{v} is outside 0..=65535")))
        })
        .transpose()
}

fn networks(field: &str, values: &[String]) -> Result<Vec<IpNet>, ValidationError> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<IpNet>()
                .map_err(|e| ValidationError::new(field, format!("{v}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";
    const PEER: &str = "ZIbfqEjc7LKm2sPNK2kKOpVM5BDQbmWrWBBBnEOPmgU=";

    fn json() -> String {
        format!(
            r#"{{
                "name": "wg0",
                "private_key": "{PRIVATE}",
                "listen_port": 51820,
                "addresses": ["10.0.0.1/24", "fd00::1/64"],
                "mtu": 1420,
                "fwmark": "0xca6c",
                "metric": 10,
                "peers": [{{
                    "description": "office",
                    "public_key": "{PEER}",
                    "allowed_ips": ["10.0.0.2/32", "192.168.10.0/24"],
                    "route_allowed_ips": true,
                    "endpoint_host": "vpn.example.com",
                    "persistent_keepalive": 25
                }}]
            }}"#
        )
    }

    fn document() -> InterfaceDocument {
        InterfaceDocument::from_json(&json()).expect("valid json")
    }

    #[test]
    fn converts_full_document() {
        let config = InterfaceConfig::try_from(document()).expect("valid document");
        assert_eq!(config.name, "wg0");
        assert!(config.private_key.inline().is_some());
        assert_eq!(config.listen_port, Some(51820));
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.fwmark_value(), Some(0xca6c));

        let peer = &config.peers[0];
        assert_eq!(peer.description.as_deref(), Some("office"));
        assert_eq!(
            peer.endpoint,
            Some(Endpoint::Host {
                host: "vpn.example.com".into(),
                port: 51820
            })
        );
        assert_eq!(peer.persistent_keepalive, 25);
        assert!(peer.route_allowed_ips);
    }

    #[test]
    fn missing_fields_default() {
        let doc = InterfaceDocument::from_json(r#"{"name": "wg1"}"#).expect("minimal");
        let config = InterfaceConfig::try_from(doc).expect("valid");
        assert!(config.private_key.is_absent());
        assert!(config.peers.is_empty());
    }

    #[test]
    fn both_key_fields_rejected() {
        let mut doc = document();
        doc.private_key_file = Some("wg0.key".into());
        let err = InterfaceConfig::try_from(doc).expect_err("both keys");
        assert_eq!(err.field, "private_key");
    }

    #[test]
    fn keepalive_overflow_rejected_with_path() {
        let mut doc = document();
        doc.peers[0].persistent_keepalive = Some(70_000);
        let err = InterfaceConfig::try_from(doc).expect_err("overflow");
        assert_eq!(err.field, "peers[0].persistent_keepalive");
    }

    #[test]
    fn bad_allowed_ip_rejected_with_path() {
        let mut doc = document();
        doc.peers[0].allowed_ips.push("10.0.0.300/32".into());
        let err = InterfaceConfig::try_from(doc).expect_err("bad cidr");
        assert_eq!(err.field, "peers[0].allowed_ips");
    }

    #[test]
    fn bad_public_key_rejected_with_path() {
        let mut doc = document();
        doc.peers[0].public_key = "abc".into();
        let err = InterfaceConfig::try_from(doc).expect_err("bad key");
        assert_eq!(err.field, "peers[0].public_key");
    }

    #[test]
    fn bad_endpoint_host_rejected_with_path() {
        let mut doc = document();
        doc.peers[0].endpoint_host = Some("bad host!".into());
        let err = InterfaceConfig::try_from(doc).expect_err("bad host");
        assert_eq!(err.field, "peers[0].endpoint");
    }

    #[test]
    fn structural_validation_runs() {
        let mut doc = document();
        doc.mtu = Some(1500);
        assert_eq!(InterfaceConfig::try_from(doc).expect_err("mtu").field, "mtu");

        let mut doc = document();
        doc.fwmark = Some("0xZZZZ".into());
        assert_eq!(InterfaceConfig::try_from(doc).expect_err("fwmark").field, "fwmark");
    }

    #[test]
    fn empty_strings_are_absent() {
        let mut doc = document();
        doc.fwmark = Some(String::new());
        doc.peers[0].preshared_key = Some(String::new());
        doc.peers[0].endpoint_host = Some("  ".into());
        let config = InterfaceConfig::try_from(doc).expect("valid");
        assert!(config.fwmark.is_none());
        assert!(config.peers[0].preshared_key.is_absent());
        assert!(config.peers[0].endpoint.is_none());
    }

    #[test]
    fn json_errors_carry_line() {
        let err = InterfaceDocument::from_json("{\n  \"name\": 5\n}").expect_err("type error");
        assert!(matches!(err, WireGuardError::ParseError { line: 2, .. }));
    }
}

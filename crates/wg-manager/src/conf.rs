//! `wg-quick` style INI configuration files.
//!
//! Recognised keys, matched case-insensitively:
//!
//! | Section       | Keys                                                   |
//! |---------------|--------------------------------------------------------|
//! | `[Interface]` | `PrivateKey`, `ListenPort`, `Address`, `MTU`, `FwMark` |
//! | `[Peer]`      | `PublicKey`, `PresharedKey`, `AllowedIPs`, `Endpoint`, `PersistentKeepalive` |
//!
//! Keys that only matter to `wg-quick` itself (`DNS`, `PostUp`, `Table`, ...)
//! are skipped.

use ipnet::IpNet;
use tracing::debug;

use crate::config::{InterfaceConfig, PeerConfig};
use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{Endpoint, KeySource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parses a configuration file into the desired state of interface `name`.
///
/// The result is validated before it is returned.
///
/// # Errors
///
/// Returns [`WireGuardError::ParseError`] with the 1-based line number for
/// malformed lines or values, and [`WireGuardError::Validation`] if the
/// parsed configuration is structurally invalid.
pub fn parse_wg_config(name: &str, text: &str) -> Result<InterfaceConfig> {
    let mut parser = Parser {
        config: InterfaceConfig::new(name),
        section: Section::None,
        peer: None,
    };

    for (index, raw) in text.lines().enumerate() {
        parser.line(index + 1, raw)?;
    }
    parser.finish_peer(text.lines().count())?;

    parser.config.validate()?;
    Ok(parser.config)
}

struct Parser {
    config: InterfaceConfig,
    section: Section,
    peer: Option<PeerBuilder>,
}

impl Parser {
    fn line(&mut self, number: usize, raw: &str) -> Result<()> {
        let line = raw.split_once('#').map_or(raw, |(before, _)| before).trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            self.finish_peer(number)?;
            self.section = match header.trim().to_ascii_lowercase().as_str() {
                "interface" => Section::Interface,
                "peer" => {
                    self.peer = Some(PeerBuilder::new(number));
                    Section::Peer
                }
                _ => return Err(parse_error(number, format!("unknown section: {header}"))),
            };
            return Ok(());
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(number, format!("expected key = value: {line}")));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match (self.section, self.peer.as_mut()) {
            (Section::Interface, _) => self.interface_key(number, &key, value),
            (Section::Peer, Some(peer)) => peer.key(number, &key, value),
            _ => Err(parse_error(number, "key-value pair outside of a section")),
        }
    }

    fn interface_key(&mut self, number: usize, key: &str, value: &str) -> Result<()> {
        let config = &mut self.config;
        match key {
            "privatekey" => {
                let key = PrivateKey::from_base64(value)
                    .map_err(|_| parse_error(number, "invalid PrivateKey"))?;
                config.private_key = KeySource::Inline(key);
            }
            "listenport" => config.listen_port = Some(number_value(number, "ListenPort", value)?),
            "address" => config.addresses.extend(networks(number, "Address", value)?),
            "mtu" => config.mtu = Some(number_value(number, "MTU", value)?),
            "fwmark" => {
                config.fwmark = match value {
                    "off" | "0" => None,
                    _ if value.starts_with("0x") => Some(value.to_string()),
                    _ => {
                        let mark: u32 = number_value(number, "FwMark", value)?;
                        Some(format!("{mark:#x}"))
                    }
                };
            }
            _ => debug!(line = number, key, "skipping interface key"),
        }
        Ok(())
    }

    fn finish_peer(&mut self, number: usize) -> Result<()> {
        if let Some(peer) = self.peer.take() {
            self.config.peers.push(peer.build(number)?);
        }
        Ok(())
    }
}

struct PeerBuilder {
    header: usize,
    public_key: Option<PublicKey>,
    preshared_key: Option<PresharedKey>,
    allowed_ips: Vec<IpNet>,
    endpoint: Option<Endpoint>,
    persistent_keepalive: u16,
}

impl PeerBuilder {
    const fn new(header: usize) -> Self {
        Self {
            header,
            public_key: None,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: 0,
        }
    }

    fn key(&mut self, number: usize, key: &str, value: &str) -> Result<()> {
        match key {
            "publickey" => {
                self.public_key = Some(
                    PublicKey::from_base64(value)
                        .map_err(|_| parse_error(number, "invalid PublicKey"))?,
                );
            }
            "presharedkey" => {
                self.preshared_key = Some(
                    PresharedKey::from_base64(value)
                        .map_err(|_| parse_error(number, "invalid PresharedKey"))?,
                );
            }
            "allowedips" => self.allowed_ips.extend(networks(number, "AllowedIPs", value)?),
            "endpoint" => {
                self.endpoint = Some(
                    value
                        .parse()
                        .map_err(|e| parse_error(number, format!("invalid Endpoint: {e}")))?,
                );
            }
            "persistentkeepalive" => {
                self.persistent_keepalive = if value == "off" {
                    0
                } else {
                    number_value(number, "PersistentKeepalive", value)?
                };
            }
            _ => debug!(line = number, key, "skipping peer key"),
        }
        Ok(())
    }

    fn build(self, number: usize) -> Result<PeerConfig> {
        let public_key = self.public_key.ok_or_else(|| {
            parse_error(
                number,
                format!("[Peer] starting at line {} has no PublicKey", self.header),
            )
        })?;

        let mut peer = PeerConfig::new(public_key);
        peer.preshared_key = self
            .preshared_key
            .map_or(KeySource::Absent, KeySource::Inline);
        peer.allowed_ips = self.allowed_ips;
        peer.endpoint = self.endpoint;
        peer.persistent_keepalive = self.persistent_keepalive;
        Ok(peer)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> WireGuardError {
    WireGuardError::ParseError {
        line,
        message: message.into(),
    }
}

fn number_value<T: std::str::FromStr>(number: usize, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| parse_error(number, format!("invalid {key}: {value}")))
}

fn networks(number: usize, key: &str, value: &str) -> Result<Vec<IpNet>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse()
                .map_err(|_| parse_error(number, format!("invalid {key}: {v}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";
    const PEER_A: &str = "o+5emsMXvOUqeUSmwATZN10v2lYMu/FgMMsABclML3c=";
    const PEER_B: &str = "ZIbfqEjc7LKm2sPNK2kKOpVM5BDQbmWrWBBBnEOPmgU=";

    fn sample() -> String {
        format!(
            "# office tunnel\n\
             [Interface]\n\
             PrivateKey = {PRIVATE}\n\
             ListenPort = 51820\n\
             Address = 10.0.0.1/24, fd00::1/64\n\
             MTU = 1400\n\
             FwMark = 51820\n\
             DNS = 1.1.1.1\n\
             \n\
             [Peer]\n\
             PublicKey = {PEER_A}\n\
             AllowedIPs = 10.0.0.2/32\n\
             Endpoint = 203.0.113.5:51820\n\
             PersistentKeepalive = 25\n\
             \n\
             [Peer]\n\
             PublicKey = {PEER_B}\n\
             PresharedKey = {PRIVATE}\n\
             AllowedIPs = 10.0.0.3/32, 192.168.0.0/16\n\
             Endpoint = vpn.example.com:4500  # roaming\n"
        )
    }

    #[test]
    fn parses_interface_and_peers() {
        let config = parse_wg_config("wg0", &sample()).expect("valid config");

        assert_eq!(config.name, "wg0");
        assert!(config.private_key.inline().is_some());
        assert_eq!(config.listen_port, Some(51820));
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.mtu, Some(1400));
        assert_eq!(config.fwmark.as_deref(), Some("0xca6c"));
        assert_eq!(config.peers.len(), 2);

        let a = &config.peers[0];
        assert_eq!(a.public_key.to_base64(), PEER_A);
        assert_eq!(a.persistent_keepalive, 25);
        assert_eq!(a.endpoint, Some("203.0.113.5:51820".parse().expect("endpoint")));

        let b = &config.peers[1];
        assert!(b.preshared_key.inline().is_some());
        assert_eq!(b.allowed_ips.len(), 2);
        assert_eq!(
            b.endpoint,
            Some(Endpoint::Host {
                host: "vpn.example.com".into(),
                port: 4500
            })
        );
    }

    #[test]
    fn keys_are_case_insensitive() {
        let text = format!("[interface]\nprivatekey={PRIVATE}\n[PEER]\npublickey={PEER_A}\nallowedips=10.0.0.2/32\n");
        let config = parse_wg_config("wg0", &text).expect("valid config");
        assert_eq!(config.peers.len(), 1);
    }

    #[test]
    fn fwmark_off_clears() {
        let text = format!("[Interface]\nPrivateKey = {PRIVATE}\nFwMark = off\n");
        let config = parse_wg_config("wg0", &text).expect("valid config");
        assert!(config.fwmark.is_none());
    }

    #[test]
    fn reports_line_of_bad_value() {
        let text = format!("[Interface]\nPrivateKey = {PRIVATE}\nListenPort = 70000\n");
        let err = parse_wg_config("wg0", &text).expect_err("bad port");
        assert!(matches!(err, WireGuardError::ParseError { line: 3, .. }), "{err}");
    }

    #[test]
    fn peer_without_public_key() {
        let text = "[Interface]\n[Peer]\nAllowedIPs = 10.0.0.2/32\n";
        let err = parse_wg_config("wg0", text).expect_err("missing key");
        match err {
            WireGuardError::ParseError { message, .. } => {
                assert!(message.contains("line 2"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_unknown_section_and_stray_keys() {
        assert!(matches!(
            parse_wg_config("wg0", "[Tunnel]\n"),
            Err(WireGuardError::ParseError { line: 1, .. })
        ));
        assert!(matches!(
            parse_wg_config("wg0", "ListenPort = 1\n"),
            Err(WireGuardError::ParseError { line: 1, .. })
        ));
        assert!(matches!(
            parse_wg_config("wg0", "[Interface]\nnonsense\n"),
            Err(WireGuardError::ParseError { line: 2, .. })
        ));
    }

    #[test]
    fn validates_result() {
        let text = format!("[Interface]\nPrivateKey = {PRIVATE}\n[Peer]\nPublicKey = {PEER_A}\n");
        let err = parse_wg_config("wg0", &text).expect_err("no allowed ips");
        match err {
            WireGuardError::Validation(e) => assert_eq!(e.field, "peers[0].allowed_ips"),
            other => panic!("unexpected error: {other}"),
        }

        let err = parse_wg_config("wg0/evil", "[Interface]\n").expect_err("bad name");
        assert!(matches!(err, WireGuardError::Validation(_)));
    }
}

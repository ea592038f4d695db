//! Driver backed by the `wg` and `ip` command-line tools.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;

use ipnet::IpNet;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{DriverOperation, InterfaceDriver};
use crate::error::DriverError;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::state::{DevicePeer, LivePeer, LiveState};

const NONE: &str = "(none)";
const OFF: &str = "off";

/// Drives kernel `WireGuard` interfaces through `wg(8)` and `ip(8)`.
///
/// Secrets are passed on stdin, never on the command line.
#[derive(Clone, Debug)]
pub struct CommandDriver {
    wg: String,
    ip: String,
}

impl CommandDriver {
    /// Uses `wg` and `ip` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_programs("wg", "ip")
    }

    /// Uses the given program paths.
    #[must_use]
    pub fn with_programs(wg: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            wg: wg.into(),
            ip: ip.into(),
        }
    }

    async fn wg(
        &self,
        operation: DriverOperation,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<String, DriverError> {
        run(&self.wg, operation, args, stdin).await
    }

    async fn ip(&self, operation: DriverOperation, args: &[String]) -> Result<String, DriverError> {
        run(&self.ip, operation, args, None).await
    }

    async fn dump(
        &self,
        operation: DriverOperation,
        name: &str,
    ) -> Result<LiveState, DriverError> {
        let dump = self
            .wg(operation, &strings(&["show", name, "dump"]), None)
            .await?;
        parse_dump(&dump).map_err(|message| DriverError::new(operation, message))
    }

    /// Networks currently allowed for `public_key`, truncated.
    async fn peer_networks(
        &self,
        operation: DriverOperation,
        name: &str,
        public_key: &PublicKey,
    ) -> Result<Vec<IpNet>, DriverError> {
        Ok(self
            .dump(operation, name)
            .await?
            .peer(public_key)
            .map(|peer| peer.allowed_ips.iter().map(IpNet::trunc).collect())
            .unwrap_or_default())
    }

    /// Routes through `name`, excluding the ones the kernel adds for
    /// interface addresses.
    async fn routes(
        &self,
        operation: DriverOperation,
        name: &str,
    ) -> Result<Vec<(IpNet, u32)>, DriverError> {
        let mut routes = Vec::new();
        for (family, unspecified) in [
            ("-4", IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ("-6", IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        ] {
            let shown = self
                .ip(operation, &strings(&[family, "route", "show", "dev", name]))
                .await?;
            routes.extend(parse_routes(&shown, unspecified));
        }
        Ok(routes)
    }

    async fn route(
        &self,
        operation: DriverOperation,
        verb: &str,
        name: &str,
        (network, metric): (IpNet, u32),
    ) -> Result<(), DriverError> {
        self.ip(
            operation,
            &strings(&[
                "route",
                verb,
                &network.to_string(),
                "dev",
                name,
                "metric",
                &metric.to_string(),
            ]),
        )
        .await
        .map(|_| ())
    }

    async fn set_peer(
        &self,
        operation: DriverOperation,
        name: &str,
        peer: &DevicePeer,
    ) -> Result<(), DriverError> {
        let previous = self.peer_networks(operation, name, &peer.public_key).await?;
        let (args, stdin) = peer_args(name, peer);
        self.wg(operation, &args, stdin).await?;

        let wanted = peer.routes();
        let covered: Vec<IpNet> = previous
            .into_iter()
            .chain(peer.allowed_ips.iter().map(IpNet::trunc))
            .collect();
        let installed = self.routes(operation, name).await?;

        for &stale in installed
            .iter()
            .filter(|route| covered.contains(&route.0) && !wanted.contains(route))
        {
            debug!(interface = %name, network = %stale.0, metric = stale.1, "removing route");
            self.route(operation, "del", name, stale).await?;
        }
        for &missing in wanted.iter().filter(|route| !installed.contains(route)) {
            debug!(interface = %name, network = %missing.0, metric = missing.1, "adding route");
            self.route(operation, "replace", name, missing).await?;
        }
        Ok(())
    }
}

impl Default for CommandDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceDriver for CommandDriver {
    async fn device_exists(&self, name: &str) -> Result<bool, DriverError> {
        match self
            .ip(DriverOperation::DeviceExists, &strings(&["link", "show", "dev", name]))
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.cause.contains("does not exist") => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn create_device(&self, name: &str) -> Result<(), DriverError> {
        let op = DriverOperation::CreateDevice;
        self.ip(op, &strings(&["link", "add", "dev", name, "type", "wireguard"]))
            .await?;
        self.ip(op, &strings(&["link", "set", "up", "dev", name])).await?;
        Ok(())
    }

    async fn remove_device(&self, name: &str) -> Result<(), DriverError> {
        self.ip(DriverOperation::RemoveDevice, &strings(&["link", "del", "dev", name]))
            .await
            .map(|_| ())
    }

    async fn set_private_key(&self, name: &str, key: &PrivateKey) -> Result<(), DriverError> {
        self.wg(
            DriverOperation::SetPrivateKey,
            &strings(&["set", name, "private-key", "/dev/stdin"]),
            Some(key.to_base64()),
        )
        .await
        .map(|_| ())
    }

    async fn set_listen_port(&self, name: &str, port: u16) -> Result<(), DriverError> {
        self.wg(
            DriverOperation::SetListenPort,
            &strings(&["set", name, "listen-port", &port.to_string()]),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn set_fwmark(&self, name: &str, mark: u32) -> Result<(), DriverError> {
        let mark = if mark == 0 {
            OFF.to_string()
        } else {
            format!("0x{mark:x}")
        };
        self.wg(
            DriverOperation::SetFwmark,
            &strings(&["set", name, "fwmark", &mark]),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn set_mtu(&self, name: &str, mtu: u16) -> Result<(), DriverError> {
        self.ip(
            DriverOperation::SetMtu,
            &strings(&["link", "set", "dev", name, "mtu", &mtu.to_string()]),
        )
        .await
        .map(|_| ())
    }

    async fn set_addresses(&self, name: &str, addresses: &[IpNet]) -> Result<(), DriverError> {
        let op = DriverOperation::SetAddresses;
        let shown = self
            .ip(op, &strings(&["-o", "addr", "show", "dev", name]))
            .await?;
        let current = parse_addresses(&shown);

        for stale in current.iter().filter(|a| !addresses.contains(a)) {
            debug!(interface = %name, address = %stale, "removing address");
            self.ip(op, &strings(&["addr", "del", &stale.to_string(), "dev", name]))
                .await?;
        }
        for missing in addresses.iter().filter(|a| !current.contains(a)) {
            debug!(interface = %name, address = %missing, "adding address");
            self.ip(op, &strings(&["addr", "add", &missing.to_string(), "dev", name]))
                .await?;
        }
        Ok(())
    }

    async fn add_peer(&self, name: &str, peer: &DevicePeer) -> Result<(), DriverError> {
        self.set_peer(DriverOperation::AddPeer, name, peer).await
    }

    async fn remove_peer(&self, name: &str, public_key: &PublicKey) -> Result<(), DriverError> {
        let op = DriverOperation::RemovePeer;
        let routed = self.peer_networks(op, name, public_key).await?;

        self.wg(
            op,
            &strings(&["set", name, "peer", &public_key.to_base64(), "remove"]),
            None,
        )
        .await?;
        if routed.is_empty() {
            return Ok(());
        }

        let installed = match self.routes(op, name).await {
            Ok(installed) => installed,
            Err(err) => {
                warn!(interface = %name, error = %err, "could not list routes of removed peer");
                return Ok(());
            }
        };
        for &route in installed.iter().filter(|route| routed.contains(&route.0)) {
            if let Err(err) = self.route(op, "del", name, route).await {
                debug!(interface = %name, network = %route.0, error = %err, "no route to remove");
            }
        }
        Ok(())
    }

    async fn update_peer(&self, name: &str, peer: &DevicePeer) -> Result<(), DriverError> {
        self.set_peer(DriverOperation::UpdatePeer, name, peer).await
    }

    async fn read_state(&self, name: &str) -> Result<LiveState, DriverError> {
        let op = DriverOperation::ReadState;
        if !self.device_exists(name).await? {
            return Ok(LiveState::absent());
        }

        let mut state = self.dump(op, name).await?;
        let routes = self.routes(op, name).await?;
        attribute_routes(&mut state, &routes);

        let link = self
            .ip(op, &strings(&["-o", "link", "show", "dev", name]))
            .await?;
        state.mtu = parse_mtu(&link);
        let addrs = self
            .ip(op, &strings(&["-o", "addr", "show", "dev", name]))
            .await?;
        state.addresses = parse_addresses(&addrs);
        Ok(state)
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

fn peer_args(name: &str, peer: &DevicePeer) -> (Vec<String>, Option<String>) {
    let mut args = strings(&["set", name, "peer", &peer.public_key.to_base64()]);
    let stdin = peer.preshared_key.as_ref().map(PresharedKey::to_base64);

    args.push("preshared-key".into());
    args.push(if stdin.is_some() { "/dev/stdin" } else { "/dev/null" }.into());

    args.push("allowed-ips".into());
    args.push(
        peer.allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(","),
    );

    if let Some(endpoint) = peer.endpoint {
        args.push("endpoint".into());
        args.push(endpoint.to_string());
    }

    args.push("persistent-keepalive".into());
    args.push(if peer.persistent_keepalive == 0 {
        OFF.to_string()
    } else {
        peer.persistent_keepalive.to_string()
    });

    (args, stdin)
}

async fn run(
    program: &str,
    operation: DriverOperation,
    args: &[String],
    stdin: Option<String>,
) -> Result<String, DriverError> {
    debug!(program, ?args, %operation, "running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| DriverError::new(operation, format!("{program} failed to start: {err}")))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|err| DriverError::new(operation, format!("{program} stdin: {err}")))?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|err| DriverError::new(operation, format!("{program} failed: {err}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        return Err(DriverError::new(
            operation,
            format!("{program} exited with {}: {stderr}", output.status),
        ));
    }
    if !stderr.is_empty() {
        warn!(program, %operation, %stderr, "command wrote to stderr");
    }

    String::from_utf8(output.stdout)
        .map_err(|err| DriverError::new(operation, format!("{program} output: {err}")))
}

/// Parses `wg show <name> dump` output.
///
/// The first line describes the interface, each following line a peer.
/// MTU and addresses are not part of the dump and are left empty.
///
/// # Errors
///
/// Returns a message naming the malformed line.
pub fn parse_dump(text: &str) -> Result<LiveState, String> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines.next().ok_or("empty dump")?;
    let fields: Vec<&str> = header.split('\t').collect();
    if fields.len() != 4 {
        return Err(format!("interface line has {} fields, expected 4", fields.len()));
    }

    let public_key = optional(fields[1])
        .map(PublicKey::from_base64)
        .transpose()
        .map_err(|e| format!("interface public key: {e}"))?;
    let listen_port = fields[2]
        .parse::<u16>()
        .map_err(|e| format!("listen port {:?}: {e}", fields[2]))?;
    let fwmark = parse_mark(fields[3])?;

    let peers = lines
        .enumerate()
        .map(|(index, line)| {
            parse_peer_line(line).map_err(|e| format!("peer line {}: {e}", index + 1))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(LiveState {
        exists: true,
        public_key,
        listen_port: (listen_port != 0).then_some(listen_port),
        fwmark,
        mtu: None,
        addresses: Vec::new(),
        peers,
    })
}

fn parse_peer_line(line: &str) -> Result<LivePeer, String> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 8 {
        return Err(format!("{} fields, expected 8", fields.len()));
    }

    let public_key = PublicKey::from_base64(fields[0]).map_err(|e| e.to_string())?;
    let preshared_key = optional(fields[1])
        .map(PresharedKey::from_base64)
        .transpose()
        .map_err(|e| format!("preshared key: {e}"))?;
    let endpoint = optional(fields[2])
        .map(str::parse::<SocketAddr>)
        .transpose()
        .map_err(|e| format!("endpoint {:?}: {e}", fields[2]))?;
    let allowed_ips = optional(fields[3])
        .map(|list| {
            list.split(',')
                .map(|net| {
                    net.trim()
                        .parse::<IpNet>()
                        .map_err(|e| format!("allowed ip {net:?}: {e}"))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();
    let persistent_keepalive = if fields[7] == OFF {
        0
    } else {
        fields[7]
            .parse::<u16>()
            .map_err(|e| format!("keepalive {:?}: {e}", fields[7]))?
    };

    Ok(LivePeer {
        public_key,
        preshared_key,
        allowed_ips,
        endpoint,
        persistent_keepalive,
        routes: Vec::new(),
    })
}

fn optional(field: &str) -> Option<&str> {
    (field != NONE && !field.is_empty()).then_some(field)
}

fn parse_mark(field: &str) -> Result<Option<u32>, String> {
    if field == OFF {
        return Ok(None);
    }
    let value = match field.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => field.parse::<u32>(),
    }
    .map_err(|e| format!("fwmark {field:?}: {e}"))?;
    Ok((value != 0).then_some(value))
}

/// Extracts routes from `ip route show dev <name>` output for one address
/// family, skipping kernel-installed routes. `default` maps to the
/// zero-length prefix of `unspecified`; a missing metric is 0.
#[must_use]
pub fn parse_routes(text: &str, unspecified: IpAddr) -> Vec<(IpNet, u32)> {
    text.lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.windows(2).any(|pair| pair == ["proto", "kernel"]) {
                return None;
            }
            let network = match *tokens.first()? {
                "default" => IpNet::new(unspecified, 0).ok()?,
                prefix if prefix.contains('/') => prefix.parse::<IpNet>().ok()?.trunc(),
                host => IpNet::from(host.parse::<IpAddr>().ok()?),
            };
            let metric = match tokens.iter().position(|t| *t == "metric") {
                Some(at) => tokens.get(at + 1)?.parse().ok()?,
                None => 0,
            };
            Some((network, metric))
        })
        .collect()
}

/// Assigns each route to the peer whose allowed IPs contain its network.
pub fn attribute_routes(state: &mut LiveState, routes: &[(IpNet, u32)]) {
    for peer in &mut state.peers {
        let networks: Vec<IpNet> = peer.allowed_ips.iter().map(IpNet::trunc).collect();
        peer.routes = routes
            .iter()
            .filter(|(network, _)| networks.contains(network))
            .copied()
            .collect();
    }
}

/// Extracts the MTU from `ip -o link show` output.
#[must_use]
pub fn parse_mtu(text: &str) -> Option<u16> {
    let mut tokens = text.split_whitespace();
    tokens.find(|t| *t == "mtu")?;
    tokens.next()?.parse().ok()
}

/// Extracts interface addresses from `ip -o addr show` output.
#[must_use]
pub fn parse_addresses(text: &str) -> Vec<IpNet> {
    text.lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet" || *t == "inet6")?;
            tokens.next()?.parse::<IpNet>().ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB_A: &str = "o+5emsMXvOUqeUSmwATZN10v2lYMu/FgMMsABclML3c=";
    const PRIV: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";
    const PUB_B: &str = "ZIbfqEjc7LKm2sPNK2kKOpVM5BDQbmWrWBBBnEOPmgU=";

    fn dump() -> String {
        [
            format!("{PRIV}\t{PUB_A}\t51820\t0xca6c"),
            format!("{PUB_B}\t(none)\t192.0.2.7:51820\t10.0.0.2/32,10.1.0.0/16\t1700000000\t100\t200\t25"),
            format!("{PRIV}\t{PRIV}\t(none)\t(none)\t0\t0\t0\toff"),
        ]
        .join("\n")
    }

    #[test]
    fn parses_interface_line() {
        let state = parse_dump(&dump()).expect("valid dump");
        assert!(state.exists);
        assert_eq!(state.public_key.map(|k| k.to_base64()).as_deref(), Some(PUB_A));
        assert_eq!(state.listen_port, Some(51820));
        assert_eq!(state.fwmark, Some(0xca6c));
        assert_eq!(state.peers.len(), 2);
    }

    #[test]
    fn parses_peer_lines() {
        let state = parse_dump(&dump()).expect("valid dump");
        let peer = &state.peers[0];
        assert_eq!(peer.public_key.to_base64(), PUB_B);
        assert!(peer.preshared_key.is_none());
        assert_eq!(peer.endpoint, Some("192.0.2.7:51820".parse().expect("addr")));
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(peer.persistent_keepalive, 25);

        let bare = &state.peers[1];
        assert!(bare.preshared_key.is_some());
        assert!(bare.endpoint.is_none());
        assert!(bare.allowed_ips.is_empty());
        assert_eq!(bare.persistent_keepalive, 0);
    }

    #[test]
    fn fwmark_off_and_port_zero() {
        let state = parse_dump("(none)\t(none)\t0\toff\n").expect("valid dump");
        assert_eq!(state.public_key, None);
        assert_eq!(state.listen_port, None);
        assert_eq!(state.fwmark, None);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_dump("").is_err());
        assert!(parse_dump("a\tb").is_err());
        let bad_peer = format!("(none)\t(none)\t0\toff\n{PUB_B}\t(none)");
        assert!(parse_dump(&bad_peer).expect_err("short peer").contains("peer line 1"));
    }

    #[test]
    fn parses_mtu() {
        let link = "5: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN mode DEFAULT group default qlen 1000\\    link/none";
        assert_eq!(parse_mtu(link), Some(1420));
        assert_eq!(parse_mtu("garbage"), None);
    }

    #[test]
    fn parses_addresses() {
        let addrs = "5: wg0    inet 10.0.0.1/24 scope global wg0\\       valid_lft forever preferred_lft forever\n\
                     5: wg0    inet6 fd00::1/64 scope global \\       valid_lft forever preferred_lft forever\n";
        let parsed = parse_addresses(addrs);
        assert_eq!(
            parsed,
            vec![
                "10.0.0.1/24".parse::<IpNet>().expect("v4"),
                "fd00::1/64".parse::<IpNet>().expect("v6"),
            ]
        );
    }

    #[test]
    fn parses_routes_skipping_kernel_ones() {
        let v4 = "default scope link metric 5\n\
                  10.0.0.0/24 proto kernel scope link src 10.0.0.1\n\
                  10.0.0.2 scope link metric 10\n\
                  10.1.0.0/16 scope link\n";
        let routes = parse_routes(v4, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(
            routes,
            vec![
                ("0.0.0.0/0".parse::<IpNet>().expect("default"), 5),
                ("10.0.0.2/32".parse::<IpNet>().expect("host"), 10),
                ("10.1.0.0/16".parse::<IpNet>().expect("net"), 0),
            ]
        );

        let v6 = "fd00::/64 proto kernel metric 256 pref medium\n\
                  fd00:1::/64 metric 1024 pref medium\n";
        let routes = parse_routes(v6, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(routes, vec![("fd00:1::/64".parse::<IpNet>().expect("v6"), 1024)]);
    }

    #[test]
    fn routes_attributed_to_owning_peer() {
        let mut state = parse_dump(&dump()).expect("valid dump");
        let routes = vec![
            ("10.1.0.0/16".parse::<IpNet>().expect("net"), 20),
            ("192.168.9.0/24".parse::<IpNet>().expect("foreign"), 20),
        ];
        attribute_routes(&mut state, &routes);
        assert_eq!(state.peers[0].routes, routes[..1].to_vec());
        assert!(state.peers[1].routes.is_empty());
    }

    #[test]
    fn peer_args_pass_secrets_on_stdin() {
        let mut peer = DevicePeer::new(
            PublicKey::from_base64(PUB_B).expect("key"),
            vec!["10.0.0.2/32".parse().expect("net")],
        );
        peer.preshared_key = Some(PresharedKey::from_base64(PRIV).expect("psk"));
        peer.persistent_keepalive = 25;

        let (args, stdin) = peer_args("wg0", &peer);
        assert_eq!(stdin.as_deref(), Some(PRIV));
        assert!(!args.iter().any(|a| a == PRIV));
        assert_eq!(
            args,
            strings(&[
                "set", "wg0", "peer", PUB_B, "preshared-key", "/dev/stdin", "allowed-ips",
                "10.0.0.2/32", "persistent-keepalive", "25",
            ])
        );
    }

    #[test]
    fn peer_args_without_endpoint_leave_it_alone() {
        let peer = DevicePeer::new(
            PublicKey::from_base64(PUB_B).expect("key"),
            vec!["10.0.0.2/32".parse().expect("net")],
        );
        let (args, stdin) = peer_args("wg0", &peer);
        assert!(stdin.is_none());
        assert!(!args.iter().any(|a| a == "endpoint"));
        assert!(args.iter().any(|a| a == "/dev/null"));
        assert_eq!(args.last().map(String::as_str), Some(OFF));
    }
}

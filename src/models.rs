//! # Domain Model
//!
//! The authoritative overlay graph: [`Host`]s (physical endpoints running a
//! WireGuard data plane), [`Node`]s (a host's membership in one network),
//! [`ExtClient`]s (non-host peers attached to an ingress gateway), and the
//! payload types the reconciliation bus carries between server and agents.
//!
//! Everything here is plain serializable data; behavior lives in the store
//! operations ([`crate::hosts`], [`crate::nodes`]) and the peer-graph engine
//! ([`crate::peers`]). Maps that feed published payloads are `BTreeMap` so a
//! frozen store snapshot always serializes identically.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys::PublicKey;

/// Name of the WireGuard interface managed on every host.
pub const WIREGUARD_INTERFACE: &str = "wiremesh";

/// Port the data-plane UDP proxy listens on when a host enables it without
/// picking a port of its own.
pub const DEFAULT_PROXY_PORT: u16 = 51722;

/// A network interface reported by a host agent at checkin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    pub address: Option<IpNet>,
    #[serde(default)]
    pub address_string: String,
}

/// Identity of a physical endpoint. Owns its [`Node`]s: `nodes` holds the id
/// of every membership, and nodes are only ever created or deleted through
/// association with a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    pub os: String,
    pub version: String,
    pub public_key: PublicKey,
    pub traffic_key_public: PublicKey,
    pub endpoint_ip: Option<IpAddr>,
    pub local_range: Option<IpNet>,
    pub local_listen_port: u16,
    pub listen_port: u16,
    pub proxy_listen_port: u16,
    pub proxy_enabled: bool,
    /// Salted hash of the host password. The plaintext is hashed on intake
    /// and never stored.
    pub host_pass_hash: String,
    pub mac_address: String,
    pub mtu: u32,
    pub interfaces: Vec<Interface>,
    pub daemon_installed: bool,
    pub debug: bool,
    pub ip_forwarding: bool,
    pub internet_gateway: bool,
    pub is_relay: bool,
    pub is_relayed: bool,
    /// Host id of the relay when `is_relayed` is set.
    pub relayed_by: String,
    /// Default hosts are auto-joined to new networks.
    pub is_default: bool,
    /// Ids of the nodes this host owns.
    pub nodes: Vec<String>,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            name: String::new(),
            os: String::new(),
            version: String::new(),
            public_key: PublicKey::default(),
            traffic_key_public: PublicKey::default(),
            endpoint_ip: None,
            local_range: None,
            local_listen_port: 0,
            listen_port: 0,
            proxy_listen_port: 0,
            proxy_enabled: false,
            host_pass_hash: String::new(),
            mac_address: String::new(),
            mtu: 0,
            interfaces: Vec::new(),
            daemon_installed: false,
            debug: false,
            ip_forwarding: false,
            internet_gateway: false,
            is_relay: false,
            is_relayed: false,
            relayed_by: String::new(),
            is_default: false,
            nodes: Vec::new(),
        }
    }
}

/// Action an agent should take on a pushed node record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAction {
    #[default]
    NoOp,
    Update,
    Delete,
}

/// A host's membership in one overlay network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub host_id: Uuid,
    pub network: String,
    pub address: Option<IpNet>,
    pub address6: Option<IpNet>,
    pub local_address: Option<IpNet>,
    pub connected: bool,
    pub pending_delete: bool,
    pub persistent_keepalive: Duration,
    pub is_ingress_gateway: bool,
    pub is_egress_gateway: bool,
    pub is_relay: bool,
    pub failover: bool,
    /// Node that takes over this node's routes when it goes dark.
    pub failover_node: Option<Uuid>,
    pub ingress_gateway_range: String,
    pub ingress_gateway_ranges: Vec<String>,
    pub egress_gateway_ranges: Vec<String>,
    pub last_checkin: DateTime<Utc>,
    pub server: String,
    pub action: NodeAction,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            host_id: Uuid::nil(),
            network: String::new(),
            address: None,
            address6: None,
            local_address: None,
            connected: false,
            pending_delete: false,
            persistent_keepalive: Duration::ZERO,
            is_ingress_gateway: false,
            is_egress_gateway: false,
            is_relay: false,
            failover: false,
            failover_node: None,
            ingress_gateway_range: String::new(),
            ingress_gateway_ranges: Vec::new(),
            egress_gateway_ranges: Vec::new(),
            last_checkin: DateTime::<Utc>::UNIX_EPOCH,
            server: String::new(),
            action: NodeAction::NoOp,
        }
    }
}

impl Node {
    /// The node's v4 address if it has one, else its v6 address.
    pub fn primary_address(&self) -> String {
        if let Some(addr) = self.address {
            return addr.addr().to_string();
        }
        if let Some(addr6) = self.address6 {
            return addr6.addr().to_string();
        }
        String::new()
    }

    pub fn set_last_checkin(&mut self) {
        self.last_checkin = Utc::now();
    }
}

/// Did a node update touch anything a peer's WireGuard config depends on?
pub fn iface_delta(current: &Node, new: &Node) -> bool {
    current.address != new.address
        || current.address6 != new.address6
        || current.local_address != new.local_address
        || current.egress_gateway_ranges != new.egress_gateway_ranges
        || current.is_egress_gateway != new.is_egress_gateway
        || current.is_ingress_gateway != new.is_ingress_gateway
}

/// A WireGuard peer that is not itself a host (a phone, a laptop on the
/// street), attached to an ingress gateway node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtClient {
    pub client_id: String,
    pub public_key: String,
    pub network: String,
    pub address: String,
    pub address6: String,
    pub internal_ip_addr: String,
    pub internal_ip_addr6: String,
    pub ingress_gateway_id: String,
    pub ingress_gateway_endpoint: String,
    pub enabled: bool,
}

impl ExtClient {
    pub fn primary_address(&self) -> String {
        if self.address.is_empty() {
            self.address6.clone()
        } else {
            self.address.clone()
        }
    }
}

/// Connectivity sample for one peer as measured by a reporting node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub node_name: String,
    pub connected: bool,
    pub uptime: i64,
    pub total_time: i64,
    pub total_received: i64,
    pub total_sent: i64,
    pub percent_up: f64,
    pub actual_uptime: Duration,
    pub collected_by_proxy: bool,
}

/// Per-node metrics record: connectivity by peer id plus the failover
/// assignments derived from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub connectivity: BTreeMap<String, Metric>,
    /// node id → node id of the failover node handling it.
    pub failover_peers: BTreeMap<String, String>,
}

/// One WireGuard peer entry as the agent will apply it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: PublicKey,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub persistent_keepalive: Option<Duration>,
    pub replace_allowed_ips: bool,
}

/// Identity triple recorded per admissible peer in update payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdAndAddr {
    pub id: String,
    pub address: String,
    pub name: String,
    pub network: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub dns: String,
}

/// The consolidated per-host peer update: one WireGuard peer list covering
/// every network the host participates in, peers coalesced by public key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostPeerUpdate {
    pub host: Host,
    pub server_version: String,
    pub peers: Vec<PeerConfig>,
    /// peer public key → node id → identity of that node.
    pub peer_ids: BTreeMap<String, BTreeMap<String, IdAndAddr>>,
    /// network name → network-scoped metadata.
    pub network_info: BTreeMap<String, NetworkInfo>,
    /// Relay-plane payload, present when the host is a relay or relayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_update: Option<ProxyManagerPayload>,
}

/// The single-network peer update used by the per-node and legacy paths.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub network: String,
    pub server_version: String,
    pub dns: String,
    pub peers: Vec<PeerConfig>,
    pub peer_ids: BTreeMap<String, IdAndAddr>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAction {
    #[default]
    ProxyUpdate,
}

/// Peer entry in the proxy payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyPeerConf {
    pub proxy: bool,
    pub public_listen_port: u16,
    /// network name → overlay address of the peer on that network.
    pub network_info: BTreeMap<String, ProxyNetworkInfo>,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    pub is_ext_client: bool,
    pub is_attached_ext_client: bool,
    pub address: Option<IpAddr>,
    pub ext_internal_ip: Option<IpAddr>,
    pub ingress_gateway_endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyNetworkInfo {
    pub address: Option<IpAddr>,
}

/// Full peer set relayed on behalf of one relayed host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayedConf {
    pub relayed_peer_endpoint: Option<SocketAddr>,
    pub relayed_peer_pub_key: String,
    pub peers: Vec<PeerConfig>,
}

/// Secondary update for hosts participating in the relay plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyManagerPayload {
    pub action: ProxyAction,
    pub interface_name: String,
    pub is_relayed: bool,
    pub relayed_to: Option<SocketAddr>,
    pub is_relay: bool,
    /// relayed host public key → that host's relayed configuration.
    pub relayed_peer_conf: BTreeMap<String, RelayedConf>,
    /// peer public key → proxy-plane peer settings.
    pub peer_map: BTreeMap<String, ProxyPeerConf>,
}

/// Actions carried on the host-update topic, both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostAction {
    JoinHostToNetwork,
    Acknowledgement,
    UpdateHost,
    DeleteHost,
}

/// Envelope for host-scoped commands and client host updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostUpdate {
    pub action: HostAction,
    pub host: Host,
    #[serde(default)]
    pub node: Option<Node>,
}

/// Checkin payload pushed by agents on the ping topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckin {
    pub version: String,
    pub connected: bool,
    pub ifaces: Vec<Interface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsAction {
    Insert,
    Delete,
}

/// Pushed to every host in a network when a name↔address binding changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsUpdate {
    pub action: DnsAction,
    pub name: String,
    pub address: String,
}

/// Operator-registered DNS entry, aggregated into peer DNS alongside node
/// records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomDnsEntry {
    pub name: String,
    pub address: String,
    pub network: String,
}

/// Server facts returned to a freshly enrolled host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server: String,
    pub version: String,
    pub broker_endpoint: String,
}

/// Response to a successful enrollment registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub server_config: ServerInfo,
    pub requested_host: Host,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_address_prefers_v4() {
        let node = Node {
            address: Some("10.0.0.1/32".parse().unwrap()),
            address6: Some("fd00::1/128".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(node.primary_address(), "10.0.0.1");
    }

    #[test]
    fn primary_address_falls_back_to_v6() {
        let node = Node {
            address6: Some("fd00::1/128".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(node.primary_address(), "fd00::1");
    }

    #[test]
    fn host_json_roundtrip() {
        let host = Host {
            id: Uuid::new_v4(),
            name: "edge-1".into(),
            endpoint_ip: Some("1.2.3.4".parse().unwrap()),
            local_range: Some("192.168.1.0/24".parse().unwrap()),
            listen_port: 51820,
            nodes: vec!["n1".into()],
            ..Default::default()
        };
        let json = serde_json::to_string(&host).unwrap();
        let restored: Host = serde_json::from_str(&json).unwrap();
        assert_eq!(host, restored);
    }

    #[test]
    fn iface_delta_detects_address_change() {
        let a = Node {
            address: Some("10.0.0.1/32".parse().unwrap()),
            ..Default::default()
        };
        let mut b = a.clone();
        assert!(!iface_delta(&a, &b));
        b.address = Some("10.0.0.2/32".parse().unwrap());
        assert!(iface_delta(&a, &b));
    }

    #[test]
    fn node_action_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&NodeAction::Delete).unwrap(),
            "\"delete\""
        );
    }
}

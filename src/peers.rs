//! # Peer-Graph Engine
//!
//! Turns the authoritative host/node graph into per-host WireGuard peer
//! configuration. Two views exist over the same graph:
//!
//! - The **consolidated per-host update** ([`get_peer_update_for_host`]):
//!   one peer list spanning every network the host participates in, peers
//!   coalesced by public key, allowed-IPs merged across networks.
//! - The **per-node updates** ([`get_peer_update`], [`get_peer_update_legacy`]):
//!   single-network views used by relayed and ingress-only paths, with UDP
//!   probe port overrides, failover filtering, and a public-key-sorted peer
//!   list.
//!
//! Every function here is a pure computation over a store snapshot; nothing
//! is mutated. Per-item failures during a scan (missing peer host, corrupt
//! record, bad CIDR) are logged and skipped; one bad record must never
//! wedge peer distribution for everyone else.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use anyhow::Result;
use ipnet::IpNet;
use tracing::{debug, warn};

use crate::acl;
use crate::hosts;
use crate::models::{
    Host, HostPeerUpdate, IdAndAddr, NetworkInfo, Node, PeerConfig, PeerUpdate,
    ProxyManagerPayload, ProxyNetworkInfo, ProxyPeerConf, RelayedConf, DEFAULT_PROXY_PORT,
    WIREGUARD_INTERFACE,
};
use crate::nodes;
use crate::store::{self, Store};

/// Effective listen port of a host as its peers reach it: the proxy port
/// when the proxy is enabled (canonical port if unset), otherwise the local
/// listen port with the WireGuard port as fallback.
fn reachable_port(host: &Host) -> u16 {
    if host.proxy_enabled {
        if host.proxy_listen_port == 0 {
            DEFAULT_PROXY_PORT
        } else {
            host.proxy_listen_port
        }
    } else if host.local_listen_port == 0 {
        host.listen_port
    } else {
        host.local_listen_port
    }
}

/// The consolidated peer update for one host across all of its networks.
pub fn get_peer_update_for_host(
    store: &Store,
    host: &Host,
    server_version: &str,
) -> Result<HostPeerUpdate> {
    let mut update = HostPeerUpdate {
        host: host.clone(),
        server_version: server_version.to_string(),
        ..Default::default()
    };
    debug!(host = %host.id, "computing peer update for host");

    // peer public key → index into update.peers, for coalescing
    let mut peer_index: HashMap<String, usize> = HashMap::new();

    for node_id in &host.nodes {
        let node = match nodes::get_node(store, node_id) {
            Ok(node) => node,
            Err(_) => continue,
        };
        if !node.connected {
            continue;
        }
        update.network_info.insert(
            node.network.clone(),
            NetworkInfo {
                dns: get_peer_dns(store, &node.network),
            },
        );
        let current_peers = nodes::get_network_nodes(store, &node.network)?;
        for peer in current_peers {
            if peer.id == node.id {
                continue;
            }
            if !peer.connected {
                continue;
            }
            if !acl::are_nodes_allowed(
                store,
                &node.network,
                &node.id.to_string(),
                &peer.id.to_string(),
            ) {
                continue;
            }
            let peer_host = match hosts::get_host(store, &peer.host_id.to_string()) {
                Ok(peer_host) => peer_host,
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "skipping peer with no host");
                    continue;
                }
            };

            let mut uselocal = false;
            if host.endpoint_ip == peer_host.endpoint_ip {
                // same public endpoint, try hairpinning over the LAN
                uselocal = true;
                if node.local_address.is_none() {
                    uselocal = false;
                }
                if node.local_address == peer.local_address {
                    uselocal = false;
                }
            }

            let mut endpoint_ip = peer_host.endpoint_ip;
            let mut port = peer_host.listen_port;
            if !host.proxy_enabled && peer_host.proxy_enabled {
                port = if peer_host.proxy_listen_port == 0 {
                    DEFAULT_PROXY_PORT
                } else {
                    peer_host.proxy_listen_port
                };
            }
            if uselocal {
                endpoint_ip = peer.local_address.map(|a| a.addr());
            }

            let mut allowed_ips = get_node_allowed_ips(store, &peer, &node);
            if peer.is_ingress_gateway {
                for entry in &peer.ingress_gateway_ranges {
                    match entry.parse::<IpNet>() {
                        Ok(cidr) => allowed_ips.push(cidr),
                        Err(_) => warn!(range = %entry, "skipping unparsable ingress range"),
                    }
                }
            }

            let pubkey = peer_host.public_key.to_base64();
            let id_entry = IdAndAddr {
                id: peer.id.to_string(),
                address: peer.primary_address(),
                name: peer_host.name.clone(),
                network: peer.network.clone(),
            };
            match peer_index.get(&pubkey) {
                None => {
                    update.peers.push(PeerConfig {
                        public_key: peer_host.public_key,
                        endpoint: endpoint_ip.map(|ip| SocketAddr::new(ip, port)),
                        allowed_ips,
                        persistent_keepalive: Some(peer.persistent_keepalive),
                        replace_allowed_ips: true,
                    });
                    peer_index.insert(pubkey.clone(), update.peers.len() - 1);
                }
                Some(&index) => {
                    update.peers[index].allowed_ips.extend(allowed_ips);
                }
            }
            update
                .peer_ids
                .entry(pubkey)
                .or_default()
                .insert(peer.id.to_string(), id_entry);
        }
    }

    Ok(update)
}

/// Single-network peer update for one node.
pub fn get_peer_update(
    store: &Store,
    node: &Node,
    host: &Host,
    server_version: &str,
) -> Result<PeerUpdate> {
    let mut update = PeerUpdate {
        network: node.network.clone(),
        server_version: server_version.to_string(),
        dns: get_peer_dns(store, &node.network),
        ..Default::default()
    };
    for peer in nodes::get_network_nodes(store, &node.network)? {
        if peer.id == node.id {
            continue;
        }
        if !peer.connected {
            continue;
        }
        if !acl::are_nodes_allowed(
            store,
            &node.network,
            &node.id.to_string(),
            &peer.id.to_string(),
        ) {
            continue;
        }
        let peer_host = match hosts::get_host(store, &peer.host_id.to_string()) {
            Ok(peer_host) => peer_host,
            Err(e) => {
                warn!(peer = %peer.id, error = %e, "skipping peer with no host");
                continue;
            }
        };

        let mut uselocal = false;
        if host.endpoint_ip == peer_host.endpoint_ip {
            uselocal = true;
            if node.local_address.is_none() {
                uselocal = false;
            }
            if node.local_address == peer.local_address {
                uselocal = false;
            }
        }

        let mut endpoint_ip = peer_host.endpoint_ip;
        let mut port = peer_host.listen_port;
        if !host.proxy_enabled && peer_host.proxy_enabled {
            port = if peer_host.proxy_listen_port == 0 {
                DEFAULT_PROXY_PORT
            } else {
                peer_host.proxy_listen_port
            };
        }
        if uselocal {
            endpoint_ip = peer.local_address.map(|a| a.addr());
        }

        let mut allowed_ips = get_node_allowed_ips(store, &peer, node);
        if peer.is_ingress_gateway {
            for entry in &peer.ingress_gateway_ranges {
                if let Ok(cidr) = entry.parse::<IpNet>() {
                    allowed_ips.push(cidr);
                }
            }
        }

        update.peer_ids.insert(
            peer_host.public_key.to_base64(),
            IdAndAddr {
                id: peer.id.to_string(),
                address: peer.primary_address(),
                name: peer_host.name.clone(),
                network: peer.network.clone(),
            },
        );
        update.peers.push(PeerConfig {
            public_key: peer_host.public_key,
            endpoint: endpoint_ip.map(|ip| SocketAddr::new(ip, port)),
            allowed_ips,
            persistent_keepalive: Some(peer.persistent_keepalive),
            replace_allowed_ips: true,
        });
    }
    Ok(update)
}

/// Is this a well-formed `ip:port` probe result?
fn check_endpoint(endpoint: &str) -> bool {
    endpoint.parse::<SocketAddr>().is_ok()
}

/// The legacy per-node peer update. Differs from [`get_peer_update`] in
/// three ways: a local UDP probe map overrides the peer's reachable port,
/// peers already being handled by a failover node are filtered out, and the
/// result is sorted by public key for deterministic application.
pub fn get_peer_update_legacy(
    store: &Store,
    node: &Node,
    udp_peers: &HashMap<String, String>,
    server_version: &str,
) -> Result<PeerUpdate> {
    let metrics = nodes::get_metrics(store, &node.id.to_string()).unwrap_or_default();
    let host = hosts::get_host(store, &node.host_id.to_string())?;
    let mut peers: Vec<PeerConfig> = Vec::new();
    let mut peer_map: BTreeMap<String, IdAndAddr> = BTreeMap::new();

    for peer in nodes::get_network_nodes(store, &node.network)? {
        let peer_host = match hosts::get_host(store, &peer.host_id.to_string()) {
            Ok(peer_host) => peer_host,
            Err(e) => {
                warn!(peer = %peer.id, error = %e, "skipping peer with no host");
                continue;
            }
        };
        if peer.id == node.id {
            continue;
        }
        if node.connected {
            // skip unconnected nodes
            continue;
        }
        if !acl::are_nodes_allowed(
            store,
            &node.network,
            &node.id.to_string(),
            &peer.id.to_string(),
        ) {
            continue;
        }
        if metrics
            .failover_peers
            .get(&peer.id.to_string())
            .is_some_and(|v| !v.is_empty())
            && nodes::is_failover_present(store, &node.network)
        {
            debug!(peer = %peer.id, node = %node.id, "peer is handled by a failover node");
            continue;
        }

        let mut endpoint_ip = peer_host.endpoint_ip;
        let mut listen_port = peer_host.listen_port;
        if host.endpoint_ip == peer_host.endpoint_ip {
            if node.local_address != peer.local_address && peer.local_address.is_some() {
                endpoint_ip = peer.local_address.map(|a| a.addr());
                if peer_host.local_listen_port != 0 {
                    listen_port = peer_host.local_listen_port;
                }
            } else {
                continue;
            }
        }

        // UDP probe knows the port the peer is actually reachable on
        let pubkey = peer_host.public_key.to_base64();
        let mut set_udp_port = false;
        if let Some(probed) = udp_peers.get(&pubkey) {
            if check_endpoint(probed) {
                if let Some((_, port_str)) = probed.rsplit_once(':') {
                    if let Ok(port) = port_str.parse::<u16>() {
                        set_udp_port = true;
                        listen_port = port;
                    }
                }
            }
        }
        if (!set_udp_port || listen_port == 0) && peer_host.local_listen_port != 0 {
            listen_port = peer_host.local_listen_port;
        }

        let allowed_ips = get_allowed_ips(store, node, &peer, &metrics);
        let keepalive = (node.persistent_keepalive != std::time::Duration::ZERO)
            .then_some(node.persistent_keepalive);

        peers.push(PeerConfig {
            public_key: peer_host.public_key,
            endpoint: endpoint_ip.map(|ip| SocketAddr::new(ip, listen_port)),
            allowed_ips,
            persistent_keepalive: keepalive,
            replace_allowed_ips: true,
        });
        peer_map.insert(
            pubkey,
            IdAndAddr {
                id: peer.id.to_string(),
                address: peer.primary_address(),
                name: peer_host.name.clone(),
                network: peer.network.clone(),
            },
        );
    }

    if node.is_ingress_gateway {
        match get_ext_peers(store, node, true) {
            Ok((ext_peers, ids)) => {
                peers.extend(ext_peers);
                for id in ids {
                    peer_map.insert(id.id.clone(), id);
                }
            }
            Err(e) if store::is_missing(&e) => {}
            Err(e) => warn!(node = %node.id, error = %e, "error retrieving external clients"),
        }
    }

    peers.sort_by_key(|p| p.public_key.to_base64());

    Ok(PeerUpdate {
        network: node.network.clone(),
        server_version: server_version.to_string(),
        dns: get_peer_dns(store, &node.network),
        peers,
        peer_ids: peer_map,
    })
}

/// Peer update for a node reached through a relay. The relay plane carries
/// the node's host peers, so this view only re-announces the ext clients it
/// terminates (when it is an ingress gateway), sorted by public key.
pub fn get_peer_update_for_relayed_node(
    store: &Store,
    node: &Node,
    server_version: &str,
) -> Result<PeerUpdate> {
    let mut peers: Vec<PeerConfig> = Vec::new();
    if node.is_ingress_gateway {
        match get_ext_peers(store, node, true) {
            Ok((ext_peers, _)) => peers.extend(ext_peers),
            Err(e) if store::is_missing(&e) => {}
            Err(e) => warn!(node = %node.id, error = %e, "could not retrieve ext peers"),
        }
    }
    peers.sort_by_key(|p| p.public_key.to_base64());
    Ok(PeerUpdate {
        network: node.network.clone(),
        server_version: server_version.to_string(),
        dns: get_peer_dns(store, &node.network),
        peers,
        ..Default::default()
    })
}

/// External clients of a node's network as WireGuard peers. For the ingress
/// side (`for_ingress_node`) the clients' overlay addresses become the
/// allowed-IPs; other viewers get the internal addresses instead.
fn get_ext_peers(
    store: &Store,
    node: &Node,
    for_ingress_node: bool,
) -> Result<(Vec<PeerConfig>, Vec<IdAndAddr>)> {
    let mut peers = Vec::new();
    let mut ids = Vec::new();
    let ext_clients = nodes::get_network_ext_clients(store, &node.network)?;
    let host = hosts::get_host(store, &node.host_id.to_string())?;

    for ext in ext_clients {
        let pubkey = match crate::keys::PublicKey::from_base64(&ext.public_key) {
            Ok(pubkey) => pubkey,
            Err(e) => {
                warn!(client = %ext.client_id, error = %e, "error parsing ext client public key");
                continue;
            }
        };
        if host.public_key == pubkey {
            continue;
        }

        let mut allowed_ips: Vec<IpNet> = Vec::new();
        if for_ingress_node {
            if let Ok(addr) = ext.address.parse::<std::net::IpAddr>() {
                allowed_ips.push(IpNet::from(addr));
            }
            if let Ok(addr6) = ext.address6.parse::<std::net::IpAddr>() {
                allowed_ips.push(IpNet::from(addr6));
            }
        } else {
            if let Ok(addr) = ext.internal_ip_addr.parse::<std::net::IpAddr>() {
                allowed_ips.push(IpNet::from(addr));
            }
            if let Ok(addr6) = ext.internal_ip_addr6.parse::<std::net::IpAddr>() {
                allowed_ips.push(IpNet::from(addr6));
            }
        }

        peers.push(PeerConfig {
            public_key: pubkey,
            replace_allowed_ips: true,
            allowed_ips,
            ..Default::default()
        });
        ids.push(IdAndAddr {
            id: ext.public_key.clone(),
            address: ext.primary_address(),
            ..Default::default()
        });
    }
    Ok((peers, ids))
}

/// Allowed-IPs for one peer of a node, including ext-client and failover
/// expansion when the peer is an ingress gateway.
pub fn get_allowed_ips(
    store: &Store,
    node: &Node,
    peer: &Node,
    metrics: &crate::models::Metrics,
) -> Vec<IpNet> {
    let mut allowed_ips = get_node_allowed_ips(store, peer, node);

    if peer.is_ingress_gateway {
        match get_ext_peers(store, peer, false) {
            Ok((ext_peers, _)) => {
                for ext in ext_peers {
                    allowed_ips.extend(ext.allowed_ips);
                }
            }
            Err(e) => {
                debug!(peer = %peer.id, error = %e, "could not retrieve ext peers");
            }
        }
        // a failover ingress node draws the traffic of every node it handles
        if peer.failover && !metrics.failover_peers.is_empty() {
            let peer_id = peer.id.to_string();
            for (handled, failover_node) in &metrics.failover_peers {
                if *failover_node != peer_id {
                    continue;
                }
                let Ok(node_to_failover) = nodes::get_node(store, handled) else {
                    continue;
                };
                let Ok(failover_metrics) =
                    nodes::get_metrics(store, &node_to_failover.id.to_string())
                else {
                    continue;
                };
                let has_reporter = failover_metrics
                    .connectivity
                    .values()
                    .any(|m| !m.node_name.is_empty());
                if has_reporter {
                    allowed_ips.extend(get_node_allowed_ips(store, &node_to_failover, peer));
                    debug!(
                        down = %node_to_failover.id,
                        failover = %peer.id,
                        "failing over node routes"
                    );
                }
            }
        }
    }
    allowed_ips
}

/// Base allowed-IPs of a peer: its host routes plus its egress ranges.
fn get_node_allowed_ips(store: &Store, peer: &Node, node: &Node) -> Vec<IpNet> {
    let mut allowed_ips = Vec::new();
    if let Some(address) = peer.address {
        allowed_ips.push(IpNet::from(address.addr()));
    }
    if let Some(address6) = peer.address6 {
        allowed_ips.push(IpNet::from(address6.addr()));
    }
    if peer.is_egress_gateway {
        allowed_ips.extend(get_egress_ips(store, node, peer));
    }
    allowed_ips
}

fn is_default_route(cidr: &IpNet) -> bool {
    cidr.prefix_len() == 0
}

/// Egress ranges a peer advertises, minus any range that would swallow the
/// querying node's own endpoint or LAN address. Default routes (internet
/// gateway) are always kept.
fn get_egress_ips(store: &Store, node: &Node, peer: &Node) -> Vec<IpNet> {
    let peer_endpoint = hosts::get_host(store, &peer.host_id.to_string())
        .ok()
        .and_then(|h| h.endpoint_ip);
    let local_addr = node.local_address.map(|a| a.addr());

    let mut allowed_ips = Vec::new();
    for iprange in &peer.egress_gateway_ranges {
        let cidr = match iprange.parse::<IpNet>() {
            Ok(cidr) => cidr,
            Err(_) => {
                warn!(range = %iprange, "could not parse gateway range, not adding");
                continue;
            }
        };
        if !is_default_route(&cidr) {
            if peer_endpoint.is_some_and(|ip| cidr.contains(&ip)) {
                debug!(range = %cidr, "egress range overlaps peer endpoint, omitting");
                continue;
            }
            if local_addr.is_some_and(|ip| cidr.contains(&ip)) {
                debug!(range = %cidr, "egress range overlaps local address, omitting");
                continue;
            }
        }
        allowed_ips.push(cidr);
    }
    allowed_ips
}

/// The DNS blob for a network: one `address hostname.network` line per node,
/// plus any operator-registered entries.
pub fn get_peer_dns(store: &Store, network: &str) -> String {
    let mut dns = String::new();
    if let Ok(network_nodes) = nodes::get_network_nodes(store, network) {
        for node in &network_nodes {
            let host = match hosts::get_host(store, &node.host_id.to_string()) {
                Ok(host) => host,
                Err(e) => {
                    warn!(node = %node.id, error = %e, "error retrieving host for node");
                    continue;
                }
            };
            if let Some(address) = node.address.map(|a| a.addr()) {
                dns.push_str(&format!("{} {}.{}\n", address, host.name, node.network));
            }
        }
    }
    if let Ok(entries) = nodes::get_custom_dns(store, network) {
        for entry in entries {
            dns.push_str(&format!(
                "{} {}.{}\n",
                entry.address, entry.name, entry.network
            ));
        }
    }
    dns
}

/// Secondary payload for hosts on the relay plane: where a relayed host
/// should send its traffic, and, for relays, the full peer set of every
/// host they forward for.
pub fn get_proxy_update_for_host(
    store: &Store,
    host: &Host,
    server_version: &str,
) -> Result<ProxyManagerPayload> {
    let mut payload = ProxyManagerPayload {
        interface_name: WIREGUARD_INTERFACE.to_string(),
        ..Default::default()
    };

    if host.is_relayed {
        match hosts::get_host(store, &host.relayed_by) {
            Ok(relay_host) => {
                let port = reachable_port(&relay_host);
                payload.is_relayed = true;
                payload.relayed_to = relay_host
                    .endpoint_ip
                    .map(|ip| SocketAddr::new(ip, port));
            }
            Err(_) => {
                warn!(host = %host.id, "couldn't find relay host");
            }
        }
    }

    if host.is_relay {
        let mut relayed_conf = BTreeMap::new();
        for relayed_host in hosts::get_relayed_hosts(store, host) {
            let Ok(update) = get_peer_update_for_host(store, &relayed_host, server_version)
            else {
                continue;
            };
            let port = reachable_port(&relayed_host);
            let pubkey = relayed_host.public_key.to_base64();
            relayed_conf.insert(
                pubkey.clone(),
                RelayedConf {
                    relayed_peer_endpoint: relayed_host
                        .endpoint_ip
                        .map(|ip| SocketAddr::new(ip, port)),
                    relayed_peer_pub_key: pubkey,
                    peers: update.peers,
                },
            );
        }
        payload.is_relay = true;
        payload.relayed_peer_conf = relayed_conf;
    }

    for node_id in &host.nodes {
        let node = match nodes::get_node(store, node_id) {
            Ok(node) => node,
            Err(_) => continue,
        };
        for peer in nodes::get_network_nodes(store, &node.network)? {
            if peer.id == node.id {
                continue;
            }
            let peer_host = match hosts::get_host(store, &peer.host_id.to_string()) {
                Ok(peer_host) => peer_host,
                Err(_) => continue,
            };
            let port = reachable_port(&peer_host);
            let pubkey = peer_host.public_key.to_base64();
            let entry = payload
                .peer_map
                .entry(pubkey)
                .or_insert_with(|| ProxyPeerConf {
                    proxy: peer_host.proxy_enabled,
                    public_listen_port: port,
                    ..Default::default()
                });
            entry.network_info.insert(
                peer.network.clone(),
                ProxyNetworkInfo {
                    address: peer.primary_address().parse().ok(),
                },
            );
            if peer_host.is_relayed && peer_host.relayed_by != host.id.to_string() {
                if let Ok(relay_host) = hosts::get_host(store, &peer_host.relayed_by) {
                    entry.is_relayed = true;
                    entry.relayed_to = relay_host
                        .endpoint_ip
                        .map(|ip| SocketAddr::new(ip, reachable_port(&peer_host)));
                }
            }
        }
    }

    Ok(payload)
}

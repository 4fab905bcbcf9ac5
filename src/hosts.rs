//! # Host Store Operations
//!
//! CRUD over host records plus the transactional host↔node association.
//! A host owns its nodes exclusively: `host.nodes` is the forward reference
//! and `node.host_id` the weak back-reference, and both are only ever
//! written together under the store's association lock. Disassociation is
//! the single node-deletion path in the whole crate.

use anyhow::{Context, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use tracing::{debug, warn};

use crate::models::{Host, Node};
use crate::nodes;
use crate::store::{self, Store};

/// Domain errors callers match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    /// A host with this id already exists.
    HostExists,
    /// The host id is nil or empty.
    InvalidHostId,
    /// The host still has associated nodes and cannot be removed.
    HasNodes,
    /// The node does not belong to the given host.
    NodeNotAssociated,
    /// The host has no nodes to disassociate.
    NoNodes,
    /// The host already has a node on this network.
    AlreadyInNetwork(String),
    /// The host has no node on this network.
    NotInNetwork(String),
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostError::HostExists => write!(f, "host already exists"),
            HostError::InvalidHostId => write!(f, "invalid host id"),
            HostError::HasNodes => write!(f, "host still has associated nodes"),
            HostError::NodeNotAssociated => write!(f, "node is not associated with host"),
            HostError::NoNodes => write!(f, "no nodes present in given host"),
            HostError::AlreadyInNetwork(net) => {
                write!(f, "host already part of network {}", net)
            }
            HostError::NotInNetwork(net) => write!(f, "host not part of the network {}", net),
        }
    }
}

impl std::error::Error for HostError {}

pub fn get_host(store: &Store, id: &str) -> Result<Host> {
    let record = store.fetch(store::HOSTS_TABLE, id)?;
    serde_json::from_str(&record).with_context(|| format!("corrupt host record {}", id))
}

/// All hosts in record order. Corrupt records are logged and skipped.
pub fn get_all_hosts(store: &Store) -> Result<Vec<Host>> {
    let records = match store.fetch_all(store::HOSTS_TABLE) {
        Ok(records) => records,
        Err(e) if store::is_no_record(&e) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut hosts = Vec::with_capacity(records.len());
    for (key, record) in records {
        match serde_json::from_str::<Host>(&record) {
            Ok(host) => hosts.push(host),
            Err(e) => warn!(host = %key, error = %e, "skipping corrupt host record"),
        }
    }
    Ok(hosts)
}

pub fn upsert_host(store: &Store, host: &Host) -> Result<()> {
    let record = serde_json::to_string(host).context("failed to serialize host")?;
    store.insert(store::HOSTS_TABLE, &host.id.to_string(), record)?;
    Ok(())
}

/// Create a host. The `host_pass_hash` field carries the plaintext on
/// intake and is replaced by its salted hash before anything is stored.
pub fn create_host(store: &Store, host: &mut Host) -> Result<()> {
    match get_host(store, &host.id.to_string()) {
        Ok(_) => return Err(HostError::HostExists.into()),
        Err(e) if store::is_missing(&e) => {}
        Err(_) => return Err(HostError::HostExists.into()),
    }
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(host.host_pass_hash.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash host password: {}", e))?;
    host.host_pass_hash = hash.to_string();
    upsert_host(store, host)
}

/// Check a presented password against the stored hash.
pub fn verify_host_password(host: &Host, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(&host.host_pass_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Merge a client-authored host into the stored one, field by field.
/// Server-protected fields always come from `current`; empty or zero
/// mutable fields fall back to `current`. The local range is pinned to the
/// stored value outright.
pub fn update_host(new: &mut Host, current: &Host) {
    // fields the client can never change
    new.daemon_installed = current.daemon_installed;
    new.os = current.os.clone();
    new.ip_forwarding = current.ip_forwarding;
    new.host_pass_hash = current.host_pass_hash.clone();
    new.mac_address = current.mac_address.clone();
    new.debug = current.debug;
    new.nodes = current.nodes.clone();
    new.public_key = current.public_key;
    new.internet_gateway = current.internet_gateway;
    new.traffic_key_public = current.traffic_key_public;

    // changeable fields, zero value falls back to stored
    if new.version.is_empty() {
        new.version = current.version.clone();
    }
    if new.name.is_empty() {
        new.name = current.name.clone();
    }
    if new.local_range != current.local_range {
        new.local_range = current.local_range;
    }
    if new.mtu == 0 {
        new.mtu = current.mtu;
    }
    if new.listen_port == 0 {
        new.listen_port = current.listen_port;
    }
    if new.proxy_listen_port == 0 {
        new.proxy_listen_port = current.proxy_listen_port;
    }
}

/// Apply a client-authored host update onto the stored host and report
/// whether anything peer-visible changed (endpoint or reachable ports), in
/// which case the caller owes the mesh a peer republish.
pub fn update_host_from_client(new: &Host, current: &mut Host) -> bool {
    let send_peer_update = current.endpoint_ip != new.endpoint_ip
        || current.listen_port != new.listen_port
        || current.proxy_listen_port != new.proxy_listen_port
        || current.proxy_enabled != new.proxy_enabled;
    let mut merged = new.clone();
    update_host(&mut merged, current);
    *current = merged;
    send_peer_update
}

/// Remove a host. Refused while any node still references it.
pub fn remove_host(store: &Store, host: &Host) -> Result<()> {
    if !host.nodes.is_empty() {
        return Err(HostError::HasNodes.into());
    }
    store.delete(store::HOSTS_TABLE, &host.id.to_string())?;
    Ok(())
}

/// Unconditional host record removal, for the forced cascade path.
pub fn remove_host_by_id(store: &Store, host_id: &str) -> Result<()> {
    store.delete(store::HOSTS_TABLE, host_id)?;
    Ok(())
}

/// Create a node and bind it to its owning host: node record first, then
/// the host's node list, both under the association lock.
pub fn associate_node_to_host(store: &Store, node: &mut Node, host: &mut Host) -> Result<()> {
    if host.id.is_nil() {
        return Err(HostError::InvalidHostId.into());
    }
    let _guard = store.association_lock();
    node.host_id = host.id;
    nodes::create_node(store, node)?;
    host.nodes.push(node.id.to_string());
    upsert_host(store, host)
}

/// Delete a node and drop it from its host's node list. The only node
/// deletion path. Node-list order is not preserved.
pub fn disassociate_node_from_host(store: &Store, node: &Node, host: &mut Host) -> Result<()> {
    if host.id.is_nil() {
        return Err(HostError::InvalidHostId.into());
    }
    if node.host_id != host.id {
        return Err(HostError::NodeNotAssociated.into());
    }
    if host.nodes.is_empty() {
        return Err(HostError::NoNodes.into());
    }
    let _guard = store.association_lock();
    let node_id = node.id.to_string();
    if let Some(index) = host.nodes.iter().position(|n| *n == node_id) {
        host.nodes.swap_remove(index);
    }
    nodes::delete_node(store, node)?;
    upsert_host(store, host)
}

/// Cascade-delete every node of a host. Per-node failures are logged and
/// skipped so one bad record cannot leave the rest dangling.
pub fn disassociate_all_nodes_from_host(store: &Store, host_id: &str) -> Result<()> {
    let mut host = get_host(store, host_id)?;
    for node_id in host.nodes.clone() {
        let node = match nodes::get_node(store, &node_id) {
            Ok(node) => node,
            Err(e) => {
                warn!(node = %node_id, error = %e, "failed to load host node");
                continue;
            }
        };
        if let Err(e) = nodes::delete_node(store, &node) {
            warn!(node = %node_id, error = %e, "failed to delete node");
            continue;
        }
        debug!(node = %node_id, host = %host_id, "deleted node of host");
    }
    host.nodes = Vec::new();
    upsert_host(store, &host)
}

/// Add a host to a network (creating and associating a node) or resolve its
/// existing membership for removal. With `add = false` the found node is
/// returned and actual deletion stays with the caller. Nodes already marked
/// for deletion are invisible to the scan.
pub fn update_host_network(
    store: &Store,
    host: &mut Host,
    network: &str,
    server: &str,
    add: bool,
) -> Result<Node> {
    for node_id in &host.nodes {
        let node = match nodes::get_node(store, node_id) {
            Ok(node) => node,
            Err(_) => continue,
        };
        if node.pending_delete {
            continue;
        }
        if node.network == network {
            if add {
                return Err(HostError::AlreadyInNetwork(network.to_string()).into());
            }
            return Ok(node);
        }
    }
    if !add {
        return Err(HostError::NotInNetwork(network.to_string()).into());
    }
    let mut node = Node {
        network: network.to_string(),
        server: server.to_string(),
        ..Default::default()
    };
    associate_node_to_host(store, &mut node, host)?;
    Ok(node)
}

/// Hosts flagged to auto-join new networks.
pub fn get_default_hosts(store: &Store) -> Vec<Host> {
    get_all_hosts(store)
        .map(|hosts| hosts.into_iter().filter(|h| h.is_default).collect())
        .unwrap_or_default()
}

/// Associate a node on `network` for every default host.
pub fn add_default_hosts_to_network(store: &Store, network: &str, server: &str) -> Result<()> {
    for mut host in get_default_hosts(store) {
        let mut node = Node {
            network: network.to_string(),
            server: server.to_string(),
            ..Default::default()
        };
        associate_node_to_host(store, &mut node, &mut host)?;
    }
    Ok(())
}

/// The set of networks a host participates in.
pub fn get_host_networks(store: &Store, host_id: &str) -> Vec<String> {
    let Ok(host) = get_host(store, host_id) else {
        return Vec::new();
    };
    let mut networks = Vec::new();
    for node_id in &host.nodes {
        match nodes::get_node(store, node_id) {
            Ok(node) => networks.push(node.network),
            Err(e) => {
                warn!(node = %node_id, error = %e, "failed to load node for network scan");
            }
        }
    }
    networks
}

/// All other hosts sharing at least one network with the given host.
pub fn get_related_hosts(store: &Store, host_id: &str) -> Vec<Host> {
    let networks: std::collections::BTreeSet<String> =
        get_host_networks(store, host_id).into_iter().collect();
    let mut related = Vec::new();
    let Ok(hosts) = get_all_hosts(store) else {
        return related;
    };
    for host in hosts {
        if host.id.to_string() == host_id {
            continue;
        }
        if get_host_networks(store, &host.id.to_string())
            .iter()
            .any(|n| networks.contains(n))
        {
            related.push(host);
        }
    }
    related
}

/// Find the host owning a node id, if any. Used to clean up agents whose
/// node record is already gone.
pub fn get_host_by_node_id(store: &Store, node_id: &str) -> Option<Host> {
    get_all_hosts(store)
        .ok()?
        .into_iter()
        .find(|h| h.nodes.iter().any(|n| n == node_id))
}

/// Queue a host action (typically a pending node join) to be delivered when
/// the host next acknowledges. FIFO per host.
pub fn queue_host_action(store: &Store, action: &crate::models::HostUpdate) -> Result<()> {
    let key = action.host.id.to_string();
    let mut queue: Vec<crate::models::HostUpdate> = match store.fetch(store::HOST_ACTIONS_TABLE, &key)
    {
        Ok(record) => serde_json::from_str(&record).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    queue.push(action.clone());
    let record = serde_json::to_string(&queue).context("failed to serialize host actions")?;
    store.insert(store::HOST_ACTIONS_TABLE, &key, record)?;
    Ok(())
}

/// Pop the oldest queued action for a host, if any.
pub fn dequeue_host_action(store: &Store, host_id: &str) -> Option<crate::models::HostUpdate> {
    let record = store.fetch(store::HOST_ACTIONS_TABLE, host_id).ok()?;
    let mut queue: Vec<crate::models::HostUpdate> = serde_json::from_str(&record).ok()?;
    if queue.is_empty() {
        return None;
    }
    let action = queue.remove(0);
    let record = serde_json::to_string(&queue).ok()?;
    let _ = store.insert(store::HOST_ACTIONS_TABLE, host_id, record);
    Some(action)
}

/// Hosts relayed by the given relay host.
pub fn get_relayed_hosts(store: &Store, relay: &Host) -> Vec<Host> {
    let relay_id = relay.id.to_string();
    get_all_hosts(store)
        .map(|hosts| {
            hosts
                .into_iter()
                .filter(|h| h.is_relayed && h.relayed_by == relay_id)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn fresh_host(name: &str) -> Host {
        Host {
            id: Uuid::new_v4(),
            name: name.into(),
            host_pass_hash: "hunter2".into(),
            ..Default::default()
        }
    }

    #[test]
    fn create_host_hashes_password() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        assert_ne!(host.host_pass_hash, "hunter2");
        assert!(verify_host_password(&host, "hunter2"));
        assert!(!verify_host_password(&host, "wrong"));
    }

    #[test]
    fn create_host_twice_is_conflict() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        let err = create_host(&store, &mut host.clone()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HostError>(),
            Some(&HostError::HostExists)
        );
    }

    #[test]
    fn update_host_is_identity_on_self() {
        let mut host = fresh_host("alpha");
        host.version = "0.9".into();
        host.mtu = 1420;
        host.listen_port = 51820;
        let current = host.clone();
        let mut new = host.clone();
        update_host(&mut new, &current);
        assert_eq!(new, current);
    }

    #[test]
    fn update_host_protects_server_fields() {
        let current = Host {
            os: "linux".into(),
            ip_forwarding: true,
            nodes: vec!["n1".into()],
            host_pass_hash: "$stored$".into(),
            ..fresh_host("alpha")
        };
        let mut new = Host {
            os: "windows".into(),
            ip_forwarding: false,
            nodes: vec![],
            host_pass_hash: "evil".into(),
            ..current.clone()
        };
        update_host(&mut new, &current);
        assert_eq!(new.os, "linux");
        assert!(new.ip_forwarding);
        assert_eq!(new.nodes, vec!["n1".to_string()]);
        assert_eq!(new.host_pass_hash, "$stored$");
    }

    #[test]
    fn update_host_local_range_is_pinned() {
        let current = Host {
            local_range: Some("192.168.0.0/24".parse().unwrap()),
            ..fresh_host("alpha")
        };
        let mut new = Host {
            local_range: Some("10.9.0.0/16".parse().unwrap()),
            ..current.clone()
        };
        update_host(&mut new, &current);
        assert_eq!(new.local_range, current.local_range);
    }

    #[test]
    fn update_host_zero_fields_fall_back() {
        let current = Host {
            version: "0.9".into(),
            mtu: 1420,
            listen_port: 51820,
            proxy_listen_port: 51722,
            ..fresh_host("alpha")
        };
        let mut new = Host {
            version: String::new(),
            mtu: 0,
            listen_port: 0,
            proxy_listen_port: 0,
            ..current.clone()
        };
        update_host(&mut new, &current);
        assert_eq!(new.version, "0.9");
        assert_eq!(new.mtu, 1420);
        assert_eq!(new.listen_port, 51820);
        assert_eq!(new.proxy_listen_port, 51722);
    }

    #[test]
    fn associate_then_disassociate_restores_host() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        let before = get_host(&store, &host.id.to_string()).unwrap();

        let mut node = Node {
            network: "net1".into(),
            ..Default::default()
        };
        associate_node_to_host(&store, &mut node, &mut host).unwrap();
        assert_eq!(node.host_id, host.id);
        assert!(host.nodes.contains(&node.id.to_string()));
        assert!(nodes::get_node(&store, &node.id.to_string()).is_ok());

        disassociate_node_from_host(&store, &node, &mut host).unwrap();
        assert!(host.nodes.is_empty());
        assert!(nodes::get_node(&store, &node.id.to_string()).is_err());
        assert_eq!(get_host(&store, &host.id.to_string()).unwrap(), before);
    }

    #[test]
    fn associate_refuses_nil_host_id() {
        let store = Store::new();
        let mut host = Host::default();
        let mut node = Node::default();
        let err = associate_node_to_host(&store, &mut node, &mut host).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HostError>(),
            Some(&HostError::InvalidHostId)
        );
    }

    #[test]
    fn disassociate_refuses_foreign_node() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        let node = Node {
            host_id: Uuid::new_v4(),
            ..Default::default()
        };
        let err = disassociate_node_from_host(&store, &node, &mut host).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HostError>(),
            Some(&HostError::NodeNotAssociated)
        );
    }

    #[test]
    fn remove_host_refused_while_nodes_exist() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        let mut node = Node::default();
        associate_node_to_host(&store, &mut node, &mut host).unwrap();
        let err = remove_host(&store, &host).unwrap_err();
        assert_eq!(err.downcast_ref::<HostError>(), Some(&HostError::HasNodes));
    }

    #[test]
    fn update_host_network_add_and_conflict() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();

        let node = update_host_network(&store, &mut host, "net1", "srv", true).unwrap();
        assert_eq!(node.network, "net1");

        let err = update_host_network(&store, &mut host, "net1", "srv", true).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HostError>(),
            Some(&HostError::AlreadyInNetwork("net1".into()))
        );

        let found = update_host_network(&store, &mut host, "net1", "srv", false).unwrap();
        assert_eq!(found.id, node.id);

        let err = update_host_network(&store, &mut host, "net2", "srv", false).unwrap_err();
        assert_eq!(
            err.downcast_ref::<HostError>(),
            Some(&HostError::NotInNetwork("net2".into()))
        );
    }

    #[test]
    fn pending_delete_nodes_are_invisible_to_membership_scan() {
        let store = Store::new();
        let mut host = fresh_host("alpha");
        create_host(&store, &mut host).unwrap();
        let mut node = update_host_network(&store, &mut host, "net1", "srv", true).unwrap();
        node.pending_delete = true;
        nodes::upsert_node(&store, &node).unwrap();

        // membership scan skips it, so a second add succeeds
        assert!(update_host_network(&store, &mut host, "net1", "srv", true).is_ok());
    }

    #[test]
    fn related_hosts_share_a_network() {
        let store = Store::new();
        let mut a = fresh_host("a");
        let mut b = fresh_host("b");
        let mut c = fresh_host("c");
        for h in [&mut a, &mut b, &mut c] {
            create_host(&store, h).unwrap();
        }
        update_host_network(&store, &mut a, "net1", "srv", true).unwrap();
        update_host_network(&store, &mut b, "net1", "srv", true).unwrap();
        update_host_network(&store, &mut c, "net2", "srv", true).unwrap();

        let related = get_related_hosts(&store, &a.id.to_string());
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].id, b.id);
    }
}

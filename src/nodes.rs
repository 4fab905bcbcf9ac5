//! # Node Records
//!
//! CRUD helpers over the node, metrics, ext-client, and custom-DNS tables.
//! Nodes are never created or deleted directly: creation happens through
//! [`crate::hosts::associate_node_to_host`] and deletion through
//! disassociation, which keeps the host's node list and the node table in
//! step. The helpers here are the record-level plumbing those paths use.

use anyhow::{Context, Result};
use tracing::warn;
use uuid::Uuid;

use crate::acl;
use crate::models::{CustomDnsEntry, ExtClient, Metrics, Node};
use crate::store::{self, Store};

pub fn get_node(store: &Store, id: &str) -> Result<Node> {
    let record = store.fetch(store::NODES_TABLE, id)?;
    serde_json::from_str(&record).with_context(|| format!("corrupt node record {}", id))
}

pub fn upsert_node(store: &Store, node: &Node) -> Result<()> {
    let record = serde_json::to_string(node).context("failed to serialize node")?;
    store.insert(store::NODES_TABLE, &node.id.to_string(), record)?;
    Ok(())
}

/// Record-level creation. Only the association path calls this.
pub(crate) fn create_node(store: &Store, node: &mut Node) -> Result<()> {
    if node.id.is_nil() {
        node.id = Uuid::new_v4();
    }
    node.set_last_checkin();
    upsert_node(store, node)
}

/// Record-level deletion plus cleanup of state keyed by the node id. Only
/// the disassociation path calls this.
pub(crate) fn delete_node(store: &Store, node: &Node) -> Result<()> {
    let id = node.id.to_string();
    store.delete(store::NODES_TABLE, &id)?;
    store.delete(store::METRICS_TABLE, &id)?;
    if let Err(e) = acl::purge_node(store, &node.network, &id) {
        warn!(node = %id, error = %e, "failed to purge ACL entries for deleted node");
    }
    Ok(())
}

/// All nodes in the store. Corrupt records are logged and skipped so one bad
/// record cannot wedge a scan; a never-written table is just empty.
pub fn get_all_nodes(store: &Store) -> Result<Vec<Node>> {
    let records = match store.fetch_all(store::NODES_TABLE) {
        Ok(records) => records,
        Err(e) if store::is_no_record(&e) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut nodes = Vec::with_capacity(records.len());
    for (key, record) in records {
        match serde_json::from_str::<Node>(&record) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!(node = %key, error = %e, "skipping corrupt node record"),
        }
    }
    Ok(nodes)
}

/// Every node of one network, in record order.
pub fn get_network_nodes(store: &Store, network: &str) -> Result<Vec<Node>> {
    Ok(get_all_nodes(store)?
        .into_iter()
        .filter(|n| n.network == network)
        .collect())
}

/// Does any node of the network carry the failover role?
pub fn is_failover_present(store: &Store, network: &str) -> bool {
    get_network_nodes(store, network)
        .map(|nodes| nodes.iter().any(|n| n.failover))
        .unwrap_or(false)
}

/// The stored metrics for a node. A node that has never reported gets an
/// empty record rather than an error.
pub fn get_metrics(store: &Store, node_id: &str) -> Result<Metrics> {
    match store.fetch(store::METRICS_TABLE, node_id) {
        Ok(record) => serde_json::from_str(&record)
            .with_context(|| format!("corrupt metrics record {}", node_id)),
        Err(e) if store::is_no_record(&e) => Ok(Metrics::default()),
        Err(e) => Err(e.into()),
    }
}

pub fn update_metrics(store: &Store, node_id: &str, metrics: &Metrics) -> Result<()> {
    let record = serde_json::to_string(metrics).context("failed to serialize metrics")?;
    store.insert(store::METRICS_TABLE, node_id, record)?;
    Ok(())
}

/// External clients of one network. Propagates the no-record sentinel so
/// callers can distinguish "no table yet" from transport failure.
pub fn get_network_ext_clients(store: &Store, network: &str) -> Result<Vec<ExtClient>> {
    let records = store.fetch_all(store::EXT_CLIENTS_TABLE)?;
    let mut clients = Vec::new();
    for (key, record) in records {
        match serde_json::from_str::<ExtClient>(&record) {
            Ok(client) if client.network == network => clients.push(client),
            Ok(_) => {}
            Err(e) => warn!(client = %key, error = %e, "skipping corrupt ext client record"),
        }
    }
    Ok(clients)
}

/// External clients attached to one ingress gateway node.
pub fn get_ext_clients_by_gateway(
    store: &Store,
    node_id: &str,
    network: &str,
) -> Result<Vec<ExtClient>> {
    Ok(get_network_ext_clients(store, network)?
        .into_iter()
        .filter(|c| c.ingress_gateway_id == node_id)
        .collect())
}

pub fn upsert_ext_client(store: &Store, client: &ExtClient) -> Result<()> {
    let record = serde_json::to_string(client).context("failed to serialize ext client")?;
    store.insert(store::EXT_CLIENTS_TABLE, &client.client_id, record)?;
    Ok(())
}

/// Operator-registered DNS entries for a network.
pub fn get_custom_dns(store: &Store, network: &str) -> Result<Vec<CustomDnsEntry>> {
    let records = match store.fetch_all(store::CUSTOM_DNS_TABLE) {
        Ok(records) => records,
        Err(e) if store::is_no_record(&e) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for (key, record) in records {
        match serde_json::from_str::<CustomDnsEntry>(&record) {
            Ok(entry) if entry.network == network => entries.push(entry),
            Ok(_) => {}
            Err(e) => warn!(entry = %key, error = %e, "skipping corrupt DNS record"),
        }
    }
    Ok(entries)
}

pub fn upsert_custom_dns(store: &Store, entry: &CustomDnsEntry) -> Result<()> {
    let key = format!("{}.{}", entry.network, entry.name);
    let record = serde_json::to_string(entry).context("failed to serialize DNS entry")?;
    store.insert(store::CUSTOM_DNS_TABLE, &key, record)?;
    Ok(())
}

/// Merge a client-authored node into the stored one. Identity, ownership,
/// and network are pinned server-side; everything else follows the client.
pub fn update_node(store: &Store, current: &Node, new: &mut Node) -> Result<()> {
    new.id = current.id;
    new.host_id = current.host_id;
    new.network = current.network.clone();
    new.server = current.server.clone();
    upsert_node(store, new)
}

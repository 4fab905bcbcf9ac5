//! # Network ACLs
//!
//! A per-network, directional allow-set over node ids. The peer-graph engine
//! asks one question: is traffic from `a` to `b` permitted on this network?
//! Absent records and absent entries default to *allowed*; only an explicit
//! deny removes a peer from the graph.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::store::{self, Store};

/// One network's ACL: source node id → destination node id → allowed.
/// Pairs with no entry are allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkAcl {
    pub rules: BTreeMap<String, BTreeMap<String, bool>>,
}

impl NetworkAcl {
    fn set(&mut self, src: &str, dst: &str, allowed: bool) {
        self.rules
            .entry(src.to_string())
            .or_default()
            .insert(dst.to_string(), allowed);
    }

    fn is_allowed(&self, src: &str, dst: &str) -> bool {
        self.rules
            .get(src)
            .and_then(|dsts| dsts.get(dst))
            .copied()
            .unwrap_or(true)
    }
}

fn fetch_acl(store: &Store, network: &str) -> NetworkAcl {
    match store.fetch(store::ACLS_TABLE, network) {
        Ok(record) => serde_json::from_str(&record).unwrap_or_else(|e| {
            warn!(network, error = %e, "corrupt ACL record, defaulting to allow");
            NetworkAcl::default()
        }),
        Err(_) => NetworkAcl::default(),
    }
}

fn save_acl(store: &Store, network: &str, acl: &NetworkAcl) -> Result<()> {
    let record = serde_json::to_string(acl).context("failed to serialize ACL")?;
    store.insert(store::ACLS_TABLE, network, record)?;
    Ok(())
}

/// Is traffic from node `src` to node `dst` permitted on `network`?
pub fn are_nodes_allowed(store: &Store, network: &str, src: &str, dst: &str) -> bool {
    fetch_acl(store, network).is_allowed(src, dst)
}

/// Deny traffic between two nodes, both directions.
pub fn deny_nodes(store: &Store, network: &str, a: &str, b: &str) -> Result<()> {
    let mut acl = fetch_acl(store, network);
    acl.set(a, b, false);
    acl.set(b, a, false);
    save_acl(store, network, &acl)
}

/// Re-allow traffic between two nodes, both directions.
pub fn allow_nodes(store: &Store, network: &str, a: &str, b: &str) -> Result<()> {
    let mut acl = fetch_acl(store, network);
    acl.set(a, b, true);
    acl.set(b, a, true);
    save_acl(store, network, &acl)
}

/// Drop every rule that mentions a node. Called when a node is deleted so
/// its id cannot shadow a future node.
pub fn purge_node(store: &Store, network: &str, node_id: &str) -> Result<()> {
    let mut acl = fetch_acl(store, network);
    acl.rules.remove(node_id);
    for dsts in acl.rules.values_mut() {
        dsts.remove(node_id);
    }
    save_acl(store, network, &acl)
}

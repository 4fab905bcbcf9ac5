//! # Failover Controller
//!
//! Folds each incoming metrics report into the stored record and decides
//! which peers need a failover node to take over their routes. A peer needs
//! failover when its reporter can no longer reach it, the peer itself still
//! claims to be connected, it has a failover node assigned, and it is not a
//! failover node itself. The resulting `failover_peers` map is what the
//! allowed-IP computation reads to reroute traffic (see
//! [`crate::peers::get_allowed_ips`]).

use anyhow::Result;
use tracing::{debug, warn};

use crate::models::{Metrics, Node};
use crate::nodes;
use crate::store::Store;

/// Agents check in once per interval; uptime counters are in units of it.
const CHECKIN_INTERVAL_MINUTES: i64 = 1;

/// Merge `new_metrics` (one checkin cycle from `current_node`) with the
/// stored record: accumulate counters, re-key ext-client entries, classify
/// failover peers, and drop stale connectivity entries. Returns whether the
/// failover assignments changed in a way that requires a peer republish.
pub fn update_node_metrics(
    store: &Store,
    current_node: &Node,
    new_metrics: &mut Metrics,
) -> Result<bool> {
    let mut old_metrics = match nodes::get_metrics(store, &current_node.id.to_string()) {
        Ok(metrics) => metrics,
        Err(e) => {
            warn!(node = %current_node.id, error = %e, "error finding old metrics for node");
            return Ok(false);
        }
    };

    // ingress gateways report ext clients by public key; re-key by client id
    if current_node.is_ingress_gateway {
        let clients = nodes::get_ext_clients_by_gateway(
            store,
            &current_node.id.to_string(),
            &current_node.network,
        )
        .unwrap_or_default();
        for client in clients {
            let mut ext_metric = new_metrics
                .connectivity
                .get(&client.public_key)
                .cloned()
                .unwrap_or_default();
            if ext_metric.node_name.is_empty() {
                if let Some(by_id) = new_metrics.connectivity.get(&client.client_id) {
                    if !by_id.node_name.is_empty() {
                        ext_metric = by_id.clone();
                        if ext_metric.total_received > 0 && ext_metric.total_sent > 0 {
                            ext_metric.connected = true;
                        }
                    }
                }
            }
            ext_metric.node_name = client.client_id.clone();
            new_metrics.connectivity.remove(&client.public_key);
            new_metrics.connectivity.insert(client.client_id, ext_metric);
        }
    }

    // accumulate this cycle's samples onto the stored totals
    let keys: Vec<String> = new_metrics.connectivity.keys().cloned().collect();
    for k in keys {
        let old = old_metrics.connectivity.remove(&k).unwrap_or_default();
        let curr = new_metrics.connectivity.get_mut(&k).expect("key just read");
        curr.total_time += old.total_time;
        curr.uptime += old.uptime;
        if curr.collected_by_proxy {
            curr.total_received += old.total_received;
            curr.total_sent += old.total_sent;
        } else {
            // counter reset tolerance: a shrinking counter means the agent
            // restarted, so the old total is re-added wholesale
            if curr.total_received < old.total_received {
                curr.total_received += old.total_received;
            } else {
                curr.total_received += (curr.total_received - old.total_received).abs();
            }
            if curr.total_sent < old.total_sent {
                curr.total_sent += old.total_sent;
            } else {
                curr.total_sent += (curr.total_sent - old.total_sent).abs();
            }
        }
        curr.percent_up = if curr.uptime == 0 || curr.total_time == 0 {
            0.0
        } else {
            100.0 * (curr.uptime as f64 / curr.total_time as f64)
        };
        let up_minutes = (curr.uptime * CHECKIN_INTERVAL_MINUTES).max(0) as u64;
        curr.actual_uptime = std::time::Duration::from_secs(up_minutes * 60);
    }

    // classify peers that need failover this cycle
    let network_nodes = match nodes::get_network_nodes(store, &current_node.network) {
        Ok(network_nodes) => network_nodes,
        Err(e) => {
            warn!(error = %e, "failed to retrieve nodes while updating metrics");
            return Ok(false);
        }
    };
    for node in &network_nodes {
        let id = node.id.to_string();
        let sample = new_metrics.connectivity.get(&id);
        let unreachable = sample.is_some_and(|m| !m.connected && !m.node_name.is_empty());
        if unreachable && node.connected && !node.failover {
            if let Some(failover_node) = node.failover_node {
                if !failover_node.is_nil() {
                    new_metrics
                        .failover_peers
                        .insert(id, failover_node.to_string());
                }
            }
        }
    }

    let mut should_update =
        old_metrics.failover_peers.is_empty() && !new_metrics.failover_peers.is_empty();
    for (k, v) in &old_metrics.failover_peers {
        let new_v = new_metrics.failover_peers.get(k);
        if new_v.is_some_and(|nv| !nv.is_empty()) && v.is_empty() {
            should_update = true;
        }
        if !v.is_empty() && new_v.map_or(true, |nv| nv.is_empty()) {
            new_metrics.failover_peers.insert(k.clone(), v.clone());
        }
    }

    // whatever is left in the old record did not report this cycle; make
    // sure it does not linger in the new one either
    for k in old_metrics.connectivity.keys() {
        new_metrics.connectivity.remove(k);
    }

    if should_update {
        debug!(node = %current_node.id, "failover assignments changed");
    }
    Ok(should_update)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metric;
    use uuid::Uuid;

    fn reporting_node(network: &str) -> Node {
        Node {
            id: Uuid::new_v4(),
            network: network.into(),
            connected: true,
            ..Default::default()
        }
    }

    fn sample(connected: bool, name: &str) -> Metric {
        Metric {
            connected,
            node_name: name.into(),
            uptime: 1,
            total_time: 2,
            total_received: 100,
            total_sent: 100,
            ..Default::default()
        }
    }

    #[test]
    fn down_peer_with_failover_node_is_classified() {
        let store = Store::new();
        let reporter = reporting_node("net1");
        nodes::upsert_node(&store, &reporter).unwrap();

        let failover = Node {
            failover: true,
            ..reporting_node("net1")
        };
        nodes::upsert_node(&store, &failover).unwrap();

        let down = Node {
            failover_node: Some(failover.id),
            ..reporting_node("net1")
        };
        nodes::upsert_node(&store, &down).unwrap();

        let mut metrics = Metrics::default();
        metrics
            .connectivity
            .insert(down.id.to_string(), sample(false, "down-node"));

        let should_update = update_node_metrics(&store, &reporter, &mut metrics).unwrap();
        assert!(should_update);
        assert_eq!(
            metrics.failover_peers.get(&down.id.to_string()),
            Some(&failover.id.to_string())
        );
    }

    #[test]
    fn failover_node_itself_is_never_reassigned() {
        let store = Store::new();
        let reporter = reporting_node("net1");
        nodes::upsert_node(&store, &reporter).unwrap();

        let failover = Node {
            failover: true,
            failover_node: Some(Uuid::new_v4()),
            ..reporting_node("net1")
        };
        nodes::upsert_node(&store, &failover).unwrap();

        let mut metrics = Metrics::default();
        metrics
            .connectivity
            .insert(failover.id.to_string(), sample(false, "failover"));

        update_node_metrics(&store, &reporter, &mut metrics).unwrap();
        assert!(metrics.failover_peers.is_empty());
    }

    #[test]
    fn connected_peer_is_not_classified() {
        let store = Store::new();
        let reporter = reporting_node("net1");
        let peer = Node {
            failover_node: Some(Uuid::new_v4()),
            ..reporting_node("net1")
        };
        nodes::upsert_node(&store, &reporter).unwrap();
        nodes::upsert_node(&store, &peer).unwrap();

        let mut metrics = Metrics::default();
        metrics
            .connectivity
            .insert(peer.id.to_string(), sample(true, "peer"));

        let should_update = update_node_metrics(&store, &reporter, &mut metrics).unwrap();
        assert!(!should_update);
        assert!(metrics.failover_peers.is_empty());
    }

    #[test]
    fn counters_accumulate_across_cycles() {
        let store = Store::new();
        let reporter = reporting_node("net1");
        nodes::upsert_node(&store, &reporter).unwrap();

        let mut first = Metrics::default();
        first.connectivity.insert("peer".into(), sample(true, "p"));
        update_node_metrics(&store, &reporter, &mut first).unwrap();
        nodes::update_metrics(&store, &reporter.id.to_string(), &first).unwrap();

        let mut second = Metrics::default();
        second.connectivity.insert("peer".into(), sample(true, "p"));
        update_node_metrics(&store, &reporter, &mut second).unwrap();

        let merged = second.connectivity.get("peer").unwrap();
        assert_eq!(merged.uptime, 2);
        assert_eq!(merged.total_time, 4);
        assert_eq!(merged.percent_up, 50.0);
    }

    #[test]
    fn stale_entries_drop_after_one_cycle() {
        let store = Store::new();
        let reporter = reporting_node("net1");
        nodes::upsert_node(&store, &reporter).unwrap();

        let mut first = Metrics::default();
        first.connectivity.insert("gone".into(), sample(true, "g"));
        nodes::update_metrics(&store, &reporter.id.to_string(), &first).unwrap();

        let mut second = Metrics::default();
        second.connectivity.insert("kept".into(), sample(true, "k"));
        update_node_metrics(&store, &reporter, &mut second).unwrap();

        assert!(second.connectivity.contains_key("kept"));
        assert!(!second.connectivity.contains_key("gone"));
    }
}

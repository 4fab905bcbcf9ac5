//! # Reconciliation Handlers
//!
//! The server side of the bus: subscribe to the agent topic families,
//! decrypt, dispatch, and push recomputed state back out. Message handling
//! is a short pipeline (receive, resolve identity, decrypt, decode,
//! dispatch) and each stage's failure is logged with the host or node id
//! and drops the message; a malformed payload from one agent never disturbs
//! the rest of the mesh.
//!
//! | topic | handler | payload |
//! |-------|---------|---------|
//! | `update/<server>/<nodeId>` | [`update_node`] | encrypted `Node` |
//! | `host/serverupdate/<server>/<hostId>` | [`update_host`] | encrypted `HostUpdate` |
//! | `signal/<server>/<nodeId>` | [`client_peer_update`] | 1-byte opcode, clear |
//! | `metrics/<server>/<nodeId>` | [`update_metrics`] | encrypted `Metrics` |
//! | `ping/<server>/<nodeId>` | [`ping`] | encrypted `NodeCheckin` |
//!
//! Server→agent pushes go to `peers/host/<hostId>/<server>`,
//! `node/update/<nodeId>/<server>`, `host/update/<hostId>/<server>`, and
//! `dns/update/<network>/<server>`, each sealed to the receiving host's
//! traffic key. On the shared DNS topic every host of the network gets its
//! own sealed copy and simply drops the ones it cannot open.
//!
//! The keepalive timer republishes all peer updates every
//! [`KEEPALIVE_TIMEOUT`]; it both heartbeats and converges any host that
//! received a stale set.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Message;
use crate::envelope::{self, SIGNAL_ACK, SIGNAL_DONE};
use crate::failover;
use crate::hosts;
use crate::models::{
    DnsAction, DnsUpdate, Host, HostAction, HostUpdate, Metrics, Node, NodeAction, NodeCheckin,
};
use crate::nodes;
use crate::peers;
use crate::server::Server;
use crate::store;

/// Interval of the peer-update heartbeat.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// The id an agent addressed: the last topic segment.
fn topic_id(topic: &str) -> Option<&str> {
    topic.rsplit('/').next().filter(|id| !id.is_empty())
}

fn decrypt_with_host(server: &Server, host: &Host, payload: &[u8]) -> Result<Vec<u8>> {
    envelope::open(
        server.traffic_keys().private_key(),
        &host.traffic_key_public,
        payload,
    )
    .context("payload could not be decrypted")
}

/// Node-scoped payloads are encrypted to the owning host's traffic key; the
/// node is fetched to resolve the host.
fn decrypt_with_node(server: &Server, node: &Node, payload: &[u8]) -> Result<Vec<u8>> {
    let host = hosts::get_host(server.store(), &node.host_id.to_string())?;
    decrypt_with_host(server, &host, payload)
}

/// Subscribe to every agent topic family and dispatch messages until
/// shutdown. Messages are handled in arrival order.
pub async fn run(server: Server, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let server_name = server.config().server_name.clone();
    let broker = server.broker();

    let mut node_updates = broker
        .subscribe(&format!("update/{}/#", server_name))
        .await
        .context("node update subscription failed")?;
    let mut host_updates = broker
        .subscribe(&format!("host/serverupdate/{}/#", server_name))
        .await
        .context("host update subscription failed")?;
    let mut signals = broker
        .subscribe(&format!("signal/{}/#", server_name))
        .await
        .context("signal subscription failed")?;
    let mut metrics_updates = broker
        .subscribe(&format!("metrics/{}/#", server_name))
        .await
        .context("metrics subscription failed")?;
    let mut pings = broker
        .subscribe(&format!("ping/{}/#", server_name))
        .await
        .context("ping subscription failed")?;
    info!(server = %server_name, "subscribed to broker topics");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(msg) = node_updates.recv() => update_node(&server, msg).await,
            Some(msg) = host_updates.recv() => update_host(&server, msg).await,
            Some(msg) = signals.recv() => client_peer_update(&server, msg).await,
            Some(msg) = metrics_updates.recv() => update_metrics(&server, msg).await,
            Some(msg) = pings.recv() => ping(&server, msg).await,
            else => break,
        }
    }
    Ok(())
}

/// Handle a node record pushed by its agent.
pub async fn update_node(server: &Server, msg: Message) {
    let Some(id) = topic_id(&msg.topic) else {
        warn!(topic = %msg.topic, "no node id on update topic");
        return;
    };
    let current_node = match nodes::get_node(server.store(), id) {
        Ok(node) => node,
        Err(e) => {
            warn!(node = %id, error = %e, "error getting node");
            return;
        }
    };
    let decrypted = match decrypt_with_node(server, &current_node, &msg.payload) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            warn!(node = %id, error = %e, "failed to decrypt node update");
            return;
        }
    };
    let mut new_node: Node = match serde_json::from_slice(&decrypted) {
        Ok(node) => node,
        Err(e) => {
            warn!(node = %id, error = %e, "error unmarshaling node payload");
            return;
        }
    };

    let delta = crate::models::iface_delta(&current_node, &new_node);
    new_node.set_last_checkin();
    if let Err(e) = nodes::update_node(server.store(), &current_node, &mut new_node) {
        warn!(node = %id, error = %e, "error saving node");
        return;
    }
    if delta {
        // only fan out when something endpoint-relevant moved
        if let Err(e) = publish_peer_update(server).await {
            warn!(node = %id, error = %e, "error updating peers after interface change");
        }
    }
    info!(node = %id, "updated node");
}

/// Handle a host update pushed by its agent, dispatched by action.
pub async fn update_host(server: &Server, msg: Message) {
    let Some(id) = topic_id(&msg.topic) else {
        warn!(topic = %msg.topic, "no host id on update topic");
        return;
    };
    let mut current_host = match hosts::get_host(server.store(), id) {
        Ok(host) => host,
        Err(e) => {
            warn!(host = %id, error = %e, "error getting host");
            return;
        }
    };
    let decrypted = match decrypt_with_host(server, &current_host, &msg.payload) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            warn!(host = %id, error = %e, "failed to decrypt host update");
            return;
        }
    };
    let host_update: HostUpdate = match serde_json::from_slice(&decrypted) {
        Ok(update) => update,
        Err(e) => {
            warn!(host = %id, error = %e, "error unmarshaling host payload");
            return;
        }
    };
    debug!(host = %id, action = ?host_update.action, "received host update");

    let mut send_peer_update = false;
    match host_update.action {
        HostAction::Acknowledgement => {
            // a join was queued for this host; deliver it now
            if let Some(queued) = hosts::dequeue_host_action(server.store(), id) {
                if let Err(e) = send_host_update(server, &queued).await {
                    warn!(host = %id, error = %e, "failed to send new node to host");
                    return;
                }
                if let Err(e) = publish_single_host_peer_update(server, &current_host).await {
                    warn!(host = %id, error = %e, "failed peers publish after join acknowledged");
                    return;
                }
                if let Some(node) = &queued.node {
                    if let Err(e) = handle_new_node_dns(server, &queued.host, node).await {
                        warn!(host = %id, error = %e, "failed to send dns update for new node");
                    }
                }
            }
        }
        HostAction::UpdateHost => {
            send_peer_update = hosts::update_host_from_client(&host_update.host, &mut current_host);
            if let Err(e) = hosts::upsert_host(server.store(), &current_host) {
                warn!(host = %id, error = %e, "failed to update host");
                return;
            }
        }
        HostAction::DeleteHost => {
            if let Err(e) = hosts::disassociate_all_nodes_from_host(server.store(), id) {
                warn!(host = %id, error = %e, "failed to delete all nodes of host");
                return;
            }
            if let Err(e) = hosts::remove_host_by_id(server.store(), id) {
                warn!(host = %id, error = %e, "failed to delete host");
                return;
            }
            send_peer_update = true;
        }
        HostAction::JoinHostToNetwork => {
            debug!(host = %id, "ignoring join action on server topic");
        }
    }

    if send_peer_update {
        if let Err(e) = publish_peer_update(server).await {
            warn!(error = %e, "failed to publish peer update");
        }
    }
}

/// Handle an agent checkin. Refreshes liveness and interface state; if the
/// node is gone but the host survives, push a delete-action pseudo-node so
/// the agent cleans up locally.
pub async fn ping(server: &Server, msg: Message) {
    let Some(id) = topic_id(&msg.topic) else {
        warn!(topic = %msg.topic, "no node id on ping topic");
        return;
    };
    let mut node = match nodes::get_node(server.store(), id) {
        Ok(node) => node,
        Err(e) if store::is_missing(&e) => {
            // check if a host is still associated and tell it to clean up
            if let Some(host) = hosts::get_host_by_node_id(server.store(), id) {
                let Ok(node_id) = uuid::Uuid::parse_str(id) else {
                    return;
                };
                let fake_node = Node {
                    id: node_id,
                    action: NodeAction::Delete,
                    pending_delete: true,
                    ..Default::default()
                };
                if let Err(e) = publish_node_update(server, &host, &fake_node).await {
                    warn!(host = %host.id, node = %id, error = %e, "failed to inform host to remove node");
                }
            }
            return;
        }
        Err(e) => {
            warn!(node = %id, error = %e, "ping error getting node");
            return;
        }
    };
    let decrypted = match decrypt_with_node(server, &node, &msg.payload) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            warn!(node = %id, error = %e, "error decrypting checkin");
            return;
        }
    };
    let checkin: NodeCheckin = match serde_json::from_slice(&decrypted) {
        Ok(checkin) => checkin,
        Err(e) => {
            warn!(node = %id, error = %e, "error unmarshaling checkin payload");
            return;
        }
    };
    let mut host = match hosts::get_host(server.store(), &node.host_id.to_string()) {
        Ok(host) => host,
        Err(e) => {
            warn!(node = %id, error = %e, "error retrieving host for node");
            return;
        }
    };

    node.set_last_checkin();
    node.connected = checkin.connected;
    host.version = checkin.version;
    host.interfaces = checkin.ifaces;
    for iface in &mut host.interfaces {
        iface.address_string = iface
            .address
            .map(|a| a.to_string())
            .unwrap_or_default();
    }
    if let Err(e) = nodes::upsert_node(server.store(), &node) {
        warn!(node = %id, error = %e, "error updating node on checkin");
        return;
    }
    if let Err(e) = hosts::upsert_host(server.store(), &host) {
        warn!(host = %host.id, error = %e, "error updating host on checkin");
        return;
    }
    debug!(node = %id, "ping processed");
}

/// Handle a one-byte signal from an agent.
pub async fn client_peer_update(server: &Server, msg: Message) {
    let Some(id) = topic_id(&msg.topic) else {
        warn!(topic = %msg.topic, "no node id on signal topic");
        return;
    };
    if nodes::get_node(server.store(), id).is_err() {
        warn!(node = %id, "signal from unknown node");
        return;
    }
    match msg.payload.first() {
        Some(&SIGNAL_ACK) => {}
        Some(&SIGNAL_DONE) => {
            if let Err(e) = publish_peer_update(server).await {
                warn!(node = %id, error = %e, "error publishing peer update on signal");
                return;
            }
            debug!(node = %id, "sent peer updates after signal");
        }
        _ => warn!(node = %id, "unknown signal opcode"),
    }
}

/// Handle a metrics report: aggregate, persist, and republish the reporting
/// host if failover assignments shifted.
pub async fn update_metrics(server: &Server, msg: Message) {
    let Some(id) = topic_id(&msg.topic) else {
        warn!(topic = %msg.topic, "no node id on metrics topic");
        return;
    };
    let current_node = match nodes::get_node(server.store(), id) {
        Ok(node) => node,
        Err(e) => {
            warn!(node = %id, error = %e, "error getting node");
            return;
        }
    };
    let decrypted = match decrypt_with_node(server, &current_node, &msg.payload) {
        Ok(decrypted) => decrypted,
        Err(e) => {
            warn!(node = %id, error = %e, "failed to decrypt metrics");
            return;
        }
    };
    let mut new_metrics: Metrics = match serde_json::from_slice(&decrypted) {
        Ok(metrics) => metrics,
        Err(e) => {
            warn!(node = %id, error = %e, "error unmarshaling metrics payload");
            return;
        }
    };

    let should_update =
        match failover::update_node_metrics(server.store(), &current_node, &mut new_metrics) {
            Ok(should_update) => should_update,
            Err(e) => {
                warn!(node = %id, error = %e, "failed to aggregate metrics");
                return;
            }
        };
    if let Err(e) = nodes::update_metrics(server.store(), id, &new_metrics) {
        warn!(node = %id, error = %e, "failed to update node metrics");
        return;
    }

    if should_update {
        debug!(node = %id, network = %current_node.network, "connectivity issues detected, updating peers");
        if let Ok(host) = hosts::get_host(server.store(), &current_node.host_id.to_string()) {
            if let Err(e) = publish_single_host_peer_update(server, &host).await {
                warn!(node = %id, error = %e, "failed to publish update after failover change");
            }
        }
    }
    info!(node = %id, "updated node metrics");
}

/// Recompute and push the peer update for every host. Per-host failures are
/// logged and skipped.
pub async fn publish_peer_update(server: &Server) -> Result<()> {
    for host in hosts::get_all_hosts(server.store())? {
        if let Err(e) = publish_single_host_peer_update(server, &host).await {
            warn!(host = %host.id, error = %e, "failed to publish peer update for host");
        }
    }
    Ok(())
}

/// Recompute and push the peer update for one host, including the relay
/// plane payload when the host participates in it.
pub async fn publish_single_host_peer_update(server: &Server, host: &Host) -> Result<()> {
    let store = server.store();
    let version = &server.config().version;
    let mut update = peers::get_peer_update_for_host(store, host, version)?;
    if host.is_relay || host.is_relayed {
        update.proxy_update = Some(peers::get_proxy_update_for_host(store, host, version)?);
    }
    let data = serde_json::to_vec(&update).context("failed to serialize peer update")?;
    let sealed = envelope::seal(
        server.traffic_keys().private_key(),
        &host.traffic_key_public,
        &data,
    )?;
    let topic = format!("peers/host/{}/{}", host.id, server.config().server_name);
    server.broker().publish(&topic, sealed).await
}

/// Push a node record to the host that owns it.
pub async fn publish_node_update(server: &Server, host: &Host, node: &Node) -> Result<()> {
    let data = serde_json::to_vec(node).context("failed to serialize node")?;
    let sealed = envelope::seal(
        server.traffic_keys().private_key(),
        &host.traffic_key_public,
        &data,
    )?;
    let topic = format!("node/update/{}/{}", node.id, server.config().server_name);
    server.broker().publish(&topic, sealed).await
}

/// Deliver an out-of-band command to a single host.
pub async fn send_host_update(server: &Server, update: &HostUpdate) -> Result<()> {
    let data = serde_json::to_vec(update).context("failed to serialize host update")?;
    let sealed = envelope::seal(
        server.traffic_keys().private_key(),
        &update.host.traffic_key_public,
        &data,
    )?;
    let topic = format!(
        "host/update/{}/{}",
        update.host.id,
        server.config().server_name
    );
    server.broker().publish(&topic, sealed).await
}

/// Push a DNS change to every host of a network. Each host receives its own
/// sealed copy on the shared topic.
pub async fn publish_dns_update(server: &Server, network: &str, dns: &DnsUpdate) -> Result<()> {
    let data = serde_json::to_vec(dns).context("failed to serialize dns update")?;
    let topic = format!("dns/update/{}/{}", network, server.config().server_name);
    for node in nodes::get_network_nodes(server.store(), network)? {
        let host = match hosts::get_host(server.store(), &node.host_id.to_string()) {
            Ok(host) => host,
            Err(e) => {
                warn!(node = %node.id, error = %e, "skipping dns push for node with no host");
                continue;
            }
        };
        let sealed = envelope::seal(
            server.traffic_keys().private_key(),
            &host.traffic_key_public,
            &data,
        )?;
        server.broker().publish(&topic, sealed).await?;
    }
    Ok(())
}

/// Announce a freshly joined node's name↔address binding.
async fn handle_new_node_dns(server: &Server, host: &Host, node: &Node) -> Result<()> {
    let address = node
        .address
        .map(|a| a.addr().to_string())
        .or_else(|| node.address6.map(|a| a.addr().to_string()));
    let Some(address) = address else {
        return Ok(());
    };
    let dns = DnsUpdate {
        action: DnsAction::Insert,
        name: format!("{}.{}", host.name, node.network),
        address,
    };
    publish_dns_update(server, &node.network, &dns).await
}

/// Periodically republish all peer updates: heartbeat plus drift
/// correction. Exits when shutdown is signalled.
pub async fn keepalive(server: Server, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(KEEPALIVE_TIMEOUT);
    interval.tick().await; // immediate first tick is not a heartbeat
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => {
                if let Err(e) = publish_peer_update(&server).await {
                    warn!(error = %e, "keepalive peer update failed");
                }
            }
        }
    }
}

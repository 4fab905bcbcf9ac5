//! End-to-end tests of the reconciliation bus: a fake agent encrypts
//! payloads to the server's traffic key, publishes on the agent topics, and
//! observes the sealed updates the server pushes back.

use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use wiremesh::envelope::{self, SIGNAL_DONE};
use wiremesh::keys::Keypair;
use wiremesh::models::{
    Host, HostAction, HostPeerUpdate, HostUpdate, Node, NodeAction, NodeCheckin,
};
use wiremesh::{handlers, hosts, nodes, Server, ServerConfig, Store};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct TestBed {
    server: Server,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestBed {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        server_name: "srv".into(),
        node_id: "server-node".into(),
        master_key: Some("master".into()),
        broker_endpoint: "inproc".into(),
        data_dir: dir.path().to_path_buf(),
        version: "test".into(),
        ..Default::default()
    };
    let server = Server::start(config).await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(handlers::run(server.clone(), shutdown_rx));
    // give the subscriber loop time to set up its topics
    tokio::time::sleep(Duration::from_millis(100)).await;
    TestBed {
        server,
        _shutdown: shutdown_tx,
        _dir: dir,
    }
}

/// A data-plane agent: its traffic keypair plus its host and node records.
struct Agent {
    keys: Keypair,
    host: Host,
    node: Node,
}

/// Create a host with one connected node on `network`, as enrollment would.
fn make_agent(store: &Store, name: &str, network: &str, endpoint: &str, addr: &str) -> Agent {
    let keys = Keypair::generate();
    let mut host = Host {
        id: Uuid::new_v4(),
        name: name.into(),
        public_key: *Keypair::generate().public_key(),
        traffic_key_public: *keys.public_key(),
        endpoint_ip: Some(endpoint.parse().unwrap()),
        listen_port: 51820,
        ..Default::default()
    };
    hosts::upsert_host(store, &host).unwrap();
    let mut node = Node {
        network: network.into(),
        address: Some(format!("{}/32", addr).parse().unwrap()),
        connected: true,
        ..Default::default()
    };
    hosts::associate_node_to_host(store, &mut node, &mut host).unwrap();
    Agent { keys, host, node }
}

impl Agent {
    fn seal(&self, server: &Server, plaintext: &[u8]) -> Vec<u8> {
        envelope::seal(
            self.keys.private_key(),
            server.traffic_keys().public_key(),
            plaintext,
        )
        .unwrap()
    }

    fn open(&self, server: &Server, payload: &[u8]) -> Option<Vec<u8>> {
        envelope::open(
            self.keys.private_key(),
            server.traffic_keys().public_key(),
            payload,
        )
        .ok()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn done_signal_triggers_sealed_peer_update() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");
    let b = make_agent(store, "b", "net1", "2.2.2.2", "10.0.0.2");

    let mut peers_rx = bed
        .server
        .broker()
        .subscribe(&format!("peers/host/{}/srv", a.host.id))
        .await
        .unwrap();

    // one-byte DONE signal, sent in the clear
    bed.server
        .broker()
        .publish(&format!("signal/srv/{}", a.node.id), vec![SIGNAL_DONE])
        .await
        .unwrap();

    let msg = tokio::time::timeout(RECV_TIMEOUT, peers_rx.recv())
        .await
        .expect("peer update not published")
        .unwrap();
    let opened = a.open(&bed.server, &msg.payload).expect("sealed to agent a");
    let update: HostPeerUpdate = serde_json::from_slice(&opened).unwrap();
    assert_eq!(update.host.id, a.host.id);
    assert_eq!(update.peers.len(), 1);
    assert_eq!(update.peers[0].public_key, b.host.public_key);
}

#[tokio::test]
async fn host_update_merges_and_fans_out() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");
    let b = make_agent(store, "b", "net1", "2.2.2.2", "10.0.0.2");

    let mut b_rx = bed
        .server
        .broker()
        .subscribe(&format!("peers/host/{}/srv", b.host.id))
        .await
        .unwrap();

    let mut changed = a.host.clone();
    changed.endpoint_ip = Some("9.9.9.9".parse().unwrap());
    changed.listen_port = 40000;
    changed.os = "plan9".into(); // server-protected, must not stick
    let update = HostUpdate {
        action: HostAction::UpdateHost,
        host: changed,
        node: None,
    };
    let sealed = a.seal(&bed.server, &serde_json::to_vec(&update).unwrap());
    bed.server
        .broker()
        .publish(&format!("host/serverupdate/srv/{}", a.host.id), sealed)
        .await
        .unwrap();

    wait_until(|| {
        hosts::get_host(store, &a.host.id.to_string())
            .map(|h| h.listen_port == 40000)
            .unwrap_or(false)
    })
    .await;
    let stored = hosts::get_host(store, &a.host.id.to_string()).unwrap();
    assert_eq!(stored.endpoint_ip.unwrap().to_string(), "9.9.9.9");
    assert!(stored.os.is_empty(), "server-protected field must not change");

    // endpoint change is peer-visible, so B gets a republish
    let msg = tokio::time::timeout(RECV_TIMEOUT, b_rx.recv())
        .await
        .expect("no fan-out after endpoint change")
        .unwrap();
    let opened = b.open(&bed.server, &msg.payload).unwrap();
    let update: HostPeerUpdate = serde_json::from_slice(&opened).unwrap();
    assert_eq!(
        update.peers[0].endpoint.unwrap().to_string(),
        "9.9.9.9:40000"
    );
}

#[tokio::test]
async fn checkin_refreshes_node_and_host() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");

    // agent went quiet; server sees it disconnected
    let mut node = a.node.clone();
    node.connected = false;
    nodes::upsert_node(store, &node).unwrap();

    let checkin = NodeCheckin {
        version: "9.9".into(),
        connected: true,
        ifaces: vec![],
    };
    let sealed = a.seal(&bed.server, &serde_json::to_vec(&checkin).unwrap());
    bed.server
        .broker()
        .publish(&format!("ping/srv/{}", a.node.id), sealed)
        .await
        .unwrap();

    wait_until(|| {
        nodes::get_node(store, &a.node.id.to_string())
            .map(|n| n.connected)
            .unwrap_or(false)
    })
    .await;
    let host = hosts::get_host(store, &a.host.id.to_string()).unwrap();
    assert_eq!(host.version, "9.9");
    let node = nodes::get_node(store, &a.node.id.to_string()).unwrap();
    assert!(node.last_checkin > chrono::DateTime::<chrono::Utc>::UNIX_EPOCH);
}

#[tokio::test]
async fn ping_for_vanished_node_pushes_delete() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");

    // the node record is gone but the host still lists it
    let phantom = a.node.id;
    store
        .delete(wiremesh::store::NODES_TABLE, &phantom.to_string())
        .unwrap();

    let mut node_rx = bed
        .server
        .broker()
        .subscribe(&format!("node/update/{}/srv", phantom))
        .await
        .unwrap();

    bed.server
        .broker()
        .publish(&format!("ping/srv/{}", phantom), vec![0])
        .await
        .unwrap();

    let msg = tokio::time::timeout(RECV_TIMEOUT, node_rx.recv())
        .await
        .expect("no cleanup push for vanished node")
        .unwrap();
    let opened = a.open(&bed.server, &msg.payload).unwrap();
    let pushed: Node = serde_json::from_slice(&opened).unwrap();
    assert_eq!(pushed.id, phantom);
    assert_eq!(pushed.action, NodeAction::Delete);
    assert!(pushed.pending_delete);
}

#[tokio::test]
async fn acknowledgement_drains_queued_join() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");

    let queued = HostUpdate {
        action: HostAction::JoinHostToNetwork,
        host: hosts::get_host(store, &a.host.id.to_string()).unwrap(),
        node: Some(a.node.clone()),
    };
    hosts::queue_host_action(store, &queued).unwrap();

    let mut host_rx = bed
        .server
        .broker()
        .subscribe(&format!("host/update/{}/srv", a.host.id))
        .await
        .unwrap();
    let mut dns_rx = bed
        .server
        .broker()
        .subscribe("dns/update/net1/srv")
        .await
        .unwrap();

    let ack = HostUpdate {
        action: HostAction::Acknowledgement,
        host: a.host.clone(),
        node: None,
    };
    let sealed = a.seal(&bed.server, &serde_json::to_vec(&ack).unwrap());
    bed.server
        .broker()
        .publish(&format!("host/serverupdate/srv/{}", a.host.id), sealed)
        .await
        .unwrap();

    let msg = tokio::time::timeout(RECV_TIMEOUT, host_rx.recv())
        .await
        .expect("queued action not delivered")
        .unwrap();
    let opened = a.open(&bed.server, &msg.payload).unwrap();
    let delivered: HostUpdate = serde_json::from_slice(&opened).unwrap();
    assert_eq!(delivered.action, HostAction::JoinHostToNetwork);
    assert_eq!(delivered.node.unwrap().id, a.node.id);

    // the new node's name is announced to the network
    let msg = tokio::time::timeout(RECV_TIMEOUT, dns_rx.recv())
        .await
        .expect("no dns update after join")
        .unwrap();
    let opened = a.open(&bed.server, &msg.payload).unwrap();
    let dns: wiremesh::models::DnsUpdate = serde_json::from_slice(&opened).unwrap();
    assert_eq!(dns.name, "a.net1");
    assert_eq!(dns.address, "10.0.0.1");

    assert!(hosts::dequeue_host_action(store, &a.host.id.to_string()).is_none());
}

#[tokio::test]
async fn delete_host_cascades() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");

    let delete = HostUpdate {
        action: HostAction::DeleteHost,
        host: a.host.clone(),
        node: None,
    };
    let sealed = a.seal(&bed.server, &serde_json::to_vec(&delete).unwrap());
    bed.server
        .broker()
        .publish(&format!("host/serverupdate/srv/{}", a.host.id), sealed)
        .await
        .unwrap();

    wait_until(|| hosts::get_host(store, &a.host.id.to_string()).is_err()).await;
    assert!(nodes::get_node(store, &a.node.id.to_string()).is_err());
}

#[tokio::test]
async fn garbage_payload_is_dropped_without_side_effects() {
    let bed = start_server().await;
    let store = bed.server.store();
    let a = make_agent(store, "a", "net1", "1.1.1.1", "10.0.0.1");
    let before = hosts::get_host(store, &a.host.id.to_string()).unwrap();

    bed.server
        .broker()
        .publish(
            &format!("host/serverupdate/srv/{}", a.host.id),
            b"not an envelope".to_vec(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(hosts::get_host(store, &a.host.id.to_string()).unwrap(), before);
}

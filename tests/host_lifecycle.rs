//! Integration tests for the host/node lifecycle and its invariants: every
//! node is owned by exactly one host, memberships are unique per network,
//! and enrollment is the only door into the mesh.

use uuid::Uuid;

use wiremesh::enrollment;
use wiremesh::keys::Keypair;
use wiremesh::models::{Host, ServerInfo};
use wiremesh::store::{self, HOSTS_TABLE};
use wiremesh::{hosts, nodes, Store};

fn fresh_host(name: &str) -> Host {
    Host {
        id: Uuid::new_v4(),
        name: name.into(),
        public_key: *Keypair::generate().public_key(),
        traffic_key_public: *Keypair::generate().public_key(),
        host_pass_hash: "swordfish".into(),
        ..Default::default()
    }
}

fn server_info() -> ServerInfo {
    ServerInfo {
        server: "srv".into(),
        version: "test".into(),
        broker_endpoint: "broker:1883".into(),
    }
}

/// Invariant: for every node there is exactly one host whose node list
/// names it, and its back-reference points at that host.
fn assert_ownership_invariant(store: &Store) {
    let all_hosts = hosts::get_all_hosts(store).unwrap();
    for node in nodes::get_all_nodes(store).unwrap() {
        let owners: Vec<&Host> = all_hosts
            .iter()
            .filter(|h| h.nodes.iter().any(|id| *id == node.id.to_string()))
            .collect();
        assert_eq!(owners.len(), 1, "node {} must have exactly one owner", node.id);
        assert_eq!(owners[0].id, node.host_id);
    }
}

#[test]
fn ownership_invariant_holds_across_lifecycle() {
    let store = Store::new();
    let mut a = fresh_host("a");
    let mut b = fresh_host("b");
    hosts::create_host(&store, &mut a).unwrap();
    hosts::create_host(&store, &mut b).unwrap();

    hosts::update_host_network(&store, &mut a, "net1", "srv", true).unwrap();
    hosts::update_host_network(&store, &mut a, "net2", "srv", true).unwrap();
    hosts::update_host_network(&store, &mut b, "net1", "srv", true).unwrap();
    assert_ownership_invariant(&store);

    let node = hosts::update_host_network(&store, &mut a, "net2", "srv", false).unwrap();
    hosts::disassociate_node_from_host(&store, &node, &mut a).unwrap();
    assert_ownership_invariant(&store);

    hosts::disassociate_all_nodes_from_host(&store, &b.id.to_string()).unwrap();
    assert_ownership_invariant(&store);
    let b = hosts::get_host(&store, &b.id.to_string()).unwrap();
    assert!(b.nodes.is_empty());
    hosts::remove_host(&store, &b).unwrap();
}

#[test]
fn one_membership_per_network() {
    let store = Store::new();
    let mut host = fresh_host("a");
    hosts::create_host(&store, &mut host).unwrap();
    hosts::update_host_network(&store, &mut host, "net1", "srv", true).unwrap();
    assert!(hosts::update_host_network(&store, &mut host, "net1", "srv", true).is_err());

    let networks = hosts::get_host_networks(&store, &host.id.to_string());
    assert_eq!(networks, vec!["net1".to_string()]);
}

#[test]
fn relay_back_reference_resolves() {
    let store = Store::new();
    let mut relay = fresh_host("relay");
    relay.is_relay = true;
    hosts::create_host(&store, &mut relay).unwrap();

    let mut relayed = fresh_host("relayed");
    relayed.is_relayed = true;
    relayed.relayed_by = relay.id.to_string();
    hosts::create_host(&store, &mut relayed).unwrap();

    let resolved = hosts::get_host(&store, &relayed.relayed_by).unwrap();
    assert!(resolved.is_relay);
    let relayed_hosts = hosts::get_relayed_hosts(&store, &relay);
    assert_eq!(relayed_hosts.len(), 1);
    assert_eq!(relayed_hosts[0].id, relayed.id);
}

#[test]
fn stored_record_never_contains_plaintext_password() {
    let store = Store::new();
    let mut host = fresh_host("a");
    hosts::create_host(&store, &mut host).unwrap();

    let raw = store.fetch(HOSTS_TABLE, &host.id.to_string()).unwrap();
    assert!(!raw.contains("swordfish"));
    assert!(hosts::verify_host_password(&host, "swordfish"));
}

#[test]
fn cascade_delete_then_remove() {
    let store = Store::new();
    let mut host = fresh_host("a");
    hosts::create_host(&store, &mut host).unwrap();
    for net in ["net1", "net2", "net3"] {
        hosts::update_host_network(&store, &mut host, net, "srv", true).unwrap();
    }
    assert_eq!(nodes::get_all_nodes(&store).unwrap().len(), 3);

    hosts::disassociate_all_nodes_from_host(&store, &host.id.to_string()).unwrap();
    assert!(nodes::get_all_nodes(&store).unwrap().is_empty());
    hosts::remove_host_by_id(&store, &host.id.to_string()).unwrap();
    let err = hosts::get_host(&store, &host.id.to_string()).unwrap_err();
    assert!(store::is_missing(&err));
}

#[test]
fn enrollment_key_registers_into_all_networks_once() {
    let store = Store::new();
    let key = enrollment::create_enrollment_key(
        &store,
        "srv",
        vec!["net1".into(), "net2".into()],
        vec![],
        1,
        None,
        false,
    )
    .unwrap();

    let mut host = fresh_host("enrollee");
    enrollment::register_host_with_token(&store, &key.token, &mut host, server_info()).unwrap();

    let stored = hosts::get_host(&store, &host.id.to_string()).unwrap();
    assert_eq!(stored.nodes.len(), 2);
    assert_ownership_invariant(&store);
    assert_eq!(
        enrollment::get_enrollment_key(&store, &key.value)
            .unwrap()
            .uses_remaining,
        0
    );

    // the spent key cannot register a second host
    let mut second = fresh_host("late");
    assert!(enrollment::register_host_with_token(
        &store,
        &key.token,
        &mut second,
        server_info()
    )
    .is_err());
}

#[test]
fn default_hosts_follow_new_networks() {
    let store = Store::new();
    let mut default_host = fresh_host("default");
    default_host.is_default = true;
    hosts::create_host(&store, &mut default_host).unwrap();
    let mut normal = fresh_host("normal");
    hosts::create_host(&store, &mut normal).unwrap();

    hosts::add_default_hosts_to_network(&store, "net9", "srv").unwrap();

    assert_eq!(
        hosts::get_host_networks(&store, &default_host.id.to_string()),
        vec!["net9".to_string()]
    );
    assert!(hosts::get_host_networks(&store, &normal.id.to_string()).is_empty());
    assert_ownership_invariant(&store);
}

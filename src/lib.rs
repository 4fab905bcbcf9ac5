//! # Wiremesh - WireGuard Mesh Control Plane
//!
//! Wiremesh maintains the authoritative model of a WireGuard overlay, a
//! graph of **hosts** (physical endpoints running the data plane) and
//! **nodes** (per-network memberships of a host), and continuously
//! reconciles each host's peer configuration with that model. The server is
//! the single source of truth; agents subscribe to updates, push checkins,
//! and apply what they are sent.
//!
//! ## Architecture
//!
//! Data flows one way around a loop: an agent publishes on the bus, the
//! handler decrypts and mutates the store, the peer-graph engine recomputes
//! from the fresh snapshot, and the result is pushed back to every affected
//! host. A 60-second keepalive republish converges anything that drifted.
//!
//! The broker uses the **actor pattern**: a public cheap-to-clone handle
//! and a private actor owning all subscription state, processing commands
//! sequentially. That sequencing is what gives per-host updates their
//! arrival-order guarantee.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | Process-wide server value: config + store + broker + keys |
//! | `store` | Ordered string→string record tables, the only persistence |
//! | `models` | Hosts, Nodes, ExtClients, Metrics, wire payloads |
//! | `hosts` | Host CRUD and the host↔node association invariants |
//! | `nodes` | Node, metrics, ext-client, and custom-DNS records |
//! | `acl` | Per-network directional allow-sets |
//! | `peers` | The peer-graph engine: per-host and per-node peer configs |
//! | `broker` | In-process message bus with MQTT-style topic wildcards |
//! | `handlers` | Reconciliation: decrypt, dispatch, publish, keepalive |
//! | `envelope` | Authenticated box for broker payloads |
//! | `keys` | Curve25519 key material (WireGuard + traffic keys) |
//! | `identity` | Seed-derived Ed25519 CA, leaf certs, WireGuard identity |
//! | `enrollment` | Enrollment keys, tokens, and host registration |
//! | `failover` | Metrics aggregation and failover-peer classification |
//! | `config` | Server configuration |

pub mod acl;
pub mod broker;
pub mod config;
pub mod enrollment;
pub mod envelope;
pub mod failover;
pub mod handlers;
pub mod hosts;
pub mod identity;
pub mod keys;
pub mod models;
pub mod nodes;
pub mod peers;
pub mod server;
pub mod store;

pub use broker::Broker;
pub use config::ServerConfig;
pub use server::Server;
pub use store::Store;

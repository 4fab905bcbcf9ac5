//! # Server Assembly
//!
//! The process-wide server value: configuration, record store, broker
//! handle, and the identity keys, built once at startup and threaded into
//! every component as an explicit argument. Teardown is deterministic:
//! keepalive first, then the broker's graceful disconnect, then the record
//! store.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{Broker, CONNECT_BUDGET, CONNECT_RETRY};
use crate::config::ServerConfig;
use crate::handlers;
use crate::identity;
use crate::keys;
use crate::store::Store;

/// Everything a handler needs, cheap to clone.
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    store: Arc<Store>,
    broker: Broker,
    /// Traffic keys for the payload envelope.
    traffic_keys: keys::Keypair,
    /// WireGuard identity derived from the PKI seed.
    wireguard_keys: keys::Keypair,
}

impl Server {
    /// Initialize the server: validate config, ensure identity material on
    /// disk, open the store, and connect the broker within its budget.
    /// Failure here is fatal to the process.
    pub async fn start(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let seed = identity::ensure_certificates(&config.data_dir, &config.server_name)
            .context("TLS material failure")?;
        let wireguard_keys = seed.wireguard_keypair();
        info!(
            public_key = %wireguard_keys.public_key(),
            "server identity ready"
        );

        let store = Arc::new(Store::new());
        let broker = connect_broker().await?;
        info!(endpoint = %config.broker_endpoint, "connected to broker");

        Ok(Self {
            config,
            store,
            broker,
            traffic_keys: keys::Keypair::generate(),
            wireguard_keys,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn traffic_keys(&self) -> &keys::Keypair {
        &self.traffic_keys
    }

    pub fn wireguard_keys(&self) -> &keys::Keypair {
        &self.wireguard_keys
    }

    /// Run the reconciliation loop and keepalive until `shutdown` fires,
    /// then tear down in order: keepalive, broker, store.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let keepalive = tokio::spawn(handlers::keepalive(self.clone(), shutdown.clone()));
        let bus = tokio::spawn(handlers::run(self.clone(), shutdown.clone()));

        if let Err(e) = keepalive.await {
            warn!(error = %e, "keepalive task failed");
        }
        match bus.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "reconciliation loop exited with error"),
            Err(e) => warn!(error = %e, "reconciliation task failed"),
        }

        self.broker.disconnect().await;
        self.store.close();
        info!("server shut down");
        Ok(())
    }
}

/// Bring up the broker connection, retrying within the configured budget.
async fn connect_broker() -> Result<Broker> {
    let deadline = Instant::now() + CONNECT_BUDGET;
    loop {
        let broker = Broker::new();
        if broker.is_connected() {
            return Ok(broker);
        }
        if Instant::now() >= deadline {
            bail!("could not connect to broker");
        }
        warn!("unable to connect to broker, retrying ...");
        tokio::time::sleep(CONNECT_RETRY).await;
    }
}

//! # Server Configuration
//!
//! Plain configuration value assembled from flags and environment in
//! `main.rs` and threaded explicitly into every component. There is no
//! global config: the [`crate::server::Server`] value carries it.

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::ServerInfo;

/// Default directory for identity material (seed, root CA, leaf certs).
pub const DEFAULT_DATA_DIR: &str = "/etc/wiremesh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Name of this server; scopes every broker topic.
    pub server_name: String,
    /// Stable identity of this server process.
    pub node_id: String,
    /// Admin master key. Optional, but recovery is hard without it.
    pub master_key: Option<String>,
    pub broker_endpoint: String,
    pub broker_user: String,
    pub broker_pass: String,
    /// Where identity material lives on disk.
    pub data_dir: PathBuf,
    pub version: String,
}

impl ServerConfig {
    /// Check the fields the server cannot start without. Mirrors process
    /// exit policy: a failed check here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            bail!("NODE_ID must be set");
        }
        if self.server_name.is_empty() {
            bail!("SERVER_NAME must be set");
        }
        if self.master_key.as_deref().unwrap_or_default().is_empty() {
            warn!("MASTER_KEY not set, this could make account recovery difficult");
        }
        Ok(())
    }

    /// The subset of configuration shared with enrolling hosts.
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            server: self.server_name.clone(),
            version: self.version.clone(),
            broker_endpoint: self.broker_endpoint.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            node_id: String::new(),
            master_key: None,
            broker_endpoint: String::new(),
            broker_user: String::new(),
            broker_pass: String::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

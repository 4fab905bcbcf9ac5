//! # Enrollment
//!
//! Enrollment keys bootstrap fresh hosts into a preset list of networks. A
//! key carries an opaque 32-character value, the networks it grants, and a
//! validity rule (unlimited, use-counted, or time-boxed). Its transport form
//! is a token: base64 over the JSON `{server, value}` tuple, handed to the
//! registering agent out of band.
//!
//! Registration decodes the token, looks the key up by value, burns one use
//! (unless unlimited), creates the host, and associates a node per granted
//! network.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use anyhow::{Context, Result};

use crate::hosts;
use crate::models::{Host, RegisterResponse, ServerInfo};
use crate::store::{self, Store};

/// Length of an enrollment key value: 62^32 unique possibilities.
pub const ENROLLMENT_KEY_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    /// The key failed validation at creation time.
    InvalidKey,
    /// The key is expired or used up.
    KeyExhausted,
    /// The token could not be decoded.
    BadToken,
}

impl std::fmt::Display for EnrollmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentError::InvalidKey => write!(f, "invalid enrollment key"),
            EnrollmentError::KeyExhausted => write!(f, "enrollment key is no longer valid"),
            EnrollmentError::BadToken => write!(f, "could not decode enrollment token"),
        }
    }
}

impl std::error::Error for EnrollmentError {}

/// The tokenized form of an enrollment key, given to registering clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentToken {
    pub server: String,
    pub value: String,
}

/// The key used to register hosts and join them to specific networks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentKey {
    pub expiration: Option<DateTime<Utc>>,
    pub uses_remaining: u32,
    pub value: String,
    pub networks: Vec<String>,
    pub unlimited: bool,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

impl EnrollmentKey {
    /// Is the key still usable?
    pub fn is_valid(&self) -> bool {
        if self.uses_remaining > 0 {
            return true;
        }
        if let Some(expiration) = self.expiration {
            if Utc::now() < expiration {
                return true;
            }
        }
        self.unlimited
    }

    /// Creation-time validation: well-formed value and at least one way to
    /// be valid.
    pub fn validate(&self) -> bool {
        self.value.len() == ENROLLMENT_KEY_LENGTH && self.is_valid()
    }
}

fn random_value() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ENROLLMENT_KEY_LENGTH)
        .map(char::from)
        .collect()
}

fn upsert_key(store: &Store, key: &EnrollmentKey) -> Result<()> {
    let record = serde_json::to_string(key).context("failed to serialize enrollment key")?;
    store.insert(store::ENROLLMENT_KEYS_TABLE, &key.value, record)?;
    Ok(())
}

/// Mint and persist a new enrollment key for `networks`, tokenized against
/// `server`.
pub fn create_enrollment_key(
    store: &Store,
    server: &str,
    networks: Vec<String>,
    tags: Vec<String>,
    uses_remaining: u32,
    expiration: Option<DateTime<Utc>>,
    unlimited: bool,
) -> Result<EnrollmentKey> {
    let mut key = EnrollmentKey {
        expiration,
        uses_remaining,
        value: random_value(),
        networks,
        unlimited,
        tags,
        token: String::new(),
    };
    if !key.validate() {
        return Err(EnrollmentError::InvalidKey.into());
    }
    let token = EnrollmentToken {
        server: server.to_string(),
        value: key.value.clone(),
    };
    let token_json = serde_json::to_vec(&token).context("failed to encode enrollment token")?;
    key.token = STANDARD.encode(token_json);
    upsert_key(store, &key)?;
    Ok(key)
}

pub fn get_enrollment_key(store: &Store, value: &str) -> Result<EnrollmentKey> {
    let record = store.fetch(store::ENROLLMENT_KEYS_TABLE, value)?;
    serde_json::from_str(&record).context("corrupt enrollment key record")
}

/// Decode the base64 JSON `{server, value}` transport form.
pub fn decode_token(token: &str) -> Result<EnrollmentToken> {
    let raw = STANDARD
        .decode(token)
        .map_err(|_| EnrollmentError::BadToken)?;
    serde_json::from_slice(&raw).map_err(|_| EnrollmentError::BadToken.into())
}

/// Burn one use of the key (unless unlimited) and persist it.
fn consume_key(store: &Store, key: &mut EnrollmentKey) -> Result<()> {
    if !key.is_valid() {
        return Err(EnrollmentError::KeyExhausted.into());
    }
    if !key.unlimited && key.uses_remaining > 0 {
        key.uses_remaining -= 1;
    }
    upsert_key(store, key)
}

/// Register a host with an enrollment token: validate the key, burn a use,
/// create the host, and associate it to every network the key grants.
pub fn register_host_with_token(
    store: &Store,
    token: &str,
    host: &mut Host,
    server_info: ServerInfo,
) -> Result<RegisterResponse> {
    let decoded = decode_token(token)?;
    let mut key = match get_enrollment_key(store, &decoded.value) {
        Ok(key) => key,
        Err(e) if store::is_missing(&e) => return Err(EnrollmentError::BadToken.into()),
        Err(e) => return Err(e),
    };
    if !key.is_valid() {
        return Err(EnrollmentError::KeyExhausted.into());
    }
    consume_key(store, &mut key)?;

    hosts::create_host(store, host)?;
    for network in &key.networks {
        hosts::update_host_network(store, host, network, &server_info.server, true)?;
    }
    info!(host = %host.id, networks = key.networks.len(), "registered host via enrollment key");

    Ok(RegisterResponse {
        server_config: server_info,
        requested_host: host.clone(),
    })
}

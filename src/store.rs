//! # Record Store
//!
//! The only persistence primitive in the control plane: an ordered mapping
//! from string keys to string values, partitioned by named table. Every
//! domain object (hosts, nodes, ext clients, metrics, ACLs, enrollment keys)
//! is a JSON record in one of these tables.
//!
//! ## Semantics
//!
//! - Single-key writes are atomic; there are no cross-table transactions.
//! - A missing record is the sentinel [`StoreError::NoRecord`], classified
//!   separately from transport failures by [`is_no_record`]. Iteration code
//!   relies on this to skip missing records without aborting a scan.
//! - Tables are ordered (`BTreeMap`), so full-table scans are deterministic.
//!
//! ## Association lock
//!
//! Host↔node association is a two-write operation (node record first, then
//! the owning host's node list). Writers of that compound mutation hold the
//! store's association lock so concurrent joins/leaves of the same host
//! cannot interleave.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

/// Table holding [`crate::models::Host`] records keyed by host id.
pub const HOSTS_TABLE: &str = "hosts";
/// Table holding [`crate::models::Node`] records keyed by node id.
pub const NODES_TABLE: &str = "nodes";
/// Table holding [`crate::models::ExtClient`] records keyed by client id.
pub const EXT_CLIENTS_TABLE: &str = "extclients";
/// Table holding [`crate::models::Metrics`] records keyed by node id.
pub const METRICS_TABLE: &str = "metrics";
/// Table holding per-network ACL records keyed by network name.
pub const ACLS_TABLE: &str = "acls";
/// Table holding enrollment keys keyed by their opaque value.
pub const ENROLLMENT_KEYS_TABLE: &str = "enrollmentkeys";
/// Table holding custom DNS entries keyed by `<network>.<name>`.
pub const CUSTOM_DNS_TABLE: &str = "customdns";
/// Table holding queued host actions keyed by host id.
pub const HOST_ACTIONS_TABLE: &str = "hostactions";

/// Errors surfaced by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The requested record does not exist. Non-fatal in most scans.
    NoRecord,
    /// The store has been closed; no further reads or writes are served.
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NoRecord => write!(f, "no record found"),
            StoreError::Closed => write!(f, "record store is closed"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Classify the not-found sentinel separately from transport errors.
pub fn is_no_record(err: &StoreError) -> bool {
    matches!(err, StoreError::NoRecord)
}

/// Same classification for errors that have passed through `anyhow`.
pub fn is_missing(err: &anyhow::Error) -> bool {
    err.downcast_ref::<StoreError>().is_some_and(is_no_record)
}

/// In-process record store. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct Store {
    tables: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
    assoc: Mutex<()>,
    closed: AtomicBool,
}

impl Store {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
            assoc: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Insert or overwrite a single record. Atomic with respect to readers.
    pub fn insert(&self, table: &str, key: &str, value: String) -> Result<(), StoreError> {
        self.check_open()?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Fetch one record or [`StoreError::NoRecord`].
    pub fn fetch(&self, table: &str, key: &str) -> Result<String, StoreError> {
        self.check_open()?;
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
            .ok_or(StoreError::NoRecord)
    }

    /// Fetch every record of a table in key order. An absent table yields
    /// [`StoreError::NoRecord`] so callers can distinguish "never written"
    /// from "empty".
    pub fn fetch_all(&self, table: &str) -> Result<BTreeMap<String, String>, StoreError> {
        self.check_open()?;
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().ok_or(StoreError::NoRecord)
    }

    /// Delete a record. Deleting an absent key is not an error.
    pub fn delete(&self, table: &str, key: &str) -> Result<(), StoreError> {
        self.check_open()?;
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(t) = tables.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    /// Serialize compound host↔node mutations. Held for the duration of the
    /// two-write association/disassociation sequence.
    pub fn association_lock(&self) -> MutexGuard<'_, ()> {
        self.assoc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse all further operations. Idempotent; last step of teardown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

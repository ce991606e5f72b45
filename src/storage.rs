//! Key-value store backends.
//!
//! The cache client talks to its primary and nearest replica through the
//! byte-oriented [`KvStore`] trait and obtains handles from a [`Connector`].
//! Two backends are included:
//!
//! - [`RespStore`]: a network store speaking RESP (`GET`/`SET ... EX`/`DEL`).
//! - [`RedbStore`]: an embedded redb database with per-key expiry.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::TableDefinition;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::discovery::Endpoint;
use crate::resp::RespValue;
use crate::transport::{RespConnection, TransportError};

/// Cache entries: key -> StoredEntry bytes (msgpack)
const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("_geocache_entries");

// ============================================================================
// Traits
// ============================================================================

/// Byte-oriented key-value store.
///
/// The cache client handles all value encoding; implementations just store
/// and retrieve raw bytes.
pub trait KvStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Raw value stored under `key`, if present and not expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Store `value` under `key`, expiring after `expire_secs` when given.
    fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_secs: Option<u64>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Remove `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Hands out a store handle for a discovered endpoint.
///
/// Connecting is lazy: the handle opens its connection on first use, so a
/// dead endpoint surfaces as operation errors, not here.
pub trait Connector {
    type Store: KvStore;

    fn connect(&self, endpoint: &Endpoint) -> Self::Store;
}

// ============================================================================
// RespStore — network backend
// ============================================================================

/// [`Connector`] for [`RespStore`]s sharing one password and timeout.
#[derive(Debug, Clone, Default)]
pub struct RespConnector {
    password: Option<String>,
    timeout: Option<Duration>,
}

impl RespConnector {
    pub fn new(password: Option<String>, timeout: Option<Duration>) -> Self {
        Self { password, timeout }
    }
}

impl Connector for RespConnector {
    type Store = RespStore;

    fn connect(&self, endpoint: &Endpoint) -> RespStore {
        RespStore::new(endpoint.clone(), self.password.clone(), self.timeout)
    }
}

/// A store reached over TCP.
///
/// Holds at most one connection, opened on first use and reopened once if
/// the peer drops it mid-command.
#[derive(Debug)]
pub struct RespStore {
    conn: Mutex<Option<RespConnection>>,
    endpoint: Endpoint,
    password: Option<String>,
    timeout: Option<Duration>,
}

impl RespStore {
    pub fn new(endpoint: Endpoint, password: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            conn: Mutex::new(None),
            endpoint,
            password,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn open(&self) -> Result<RespConnection, TransportError> {
        RespConnection::connect_with_password(&self.endpoint, self.password.as_deref(), self.timeout)
            .await
    }

    async fn round_trip(&self, args: &[&[u8]]) -> Result<RespValue, TransportError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.open().await?,
        };

        let reply = match conn.command(args).await {
            Err(e) if e.is_connection_lost() => {
                debug!(endpoint = %self.endpoint, error = %e, "Connection lost, reconnecting");
                conn = self.open().await?;
                conn.command(args).await
            }
            other => other,
        };

        // Keep the connection unless its stream state is unknown.
        if matches!(reply, Ok(_) | Err(TransportError::Server(_))) {
            *slot = Some(conn);
        }
        reply
    }
}

impl KvStore for RespStore {
    type Error = TransportError;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, TransportError> {
        match self.round_trip(&[b"GET".as_slice(), key.as_bytes()]).await? {
            RespValue::BulkString(bytes) => Ok(Some(bytes)),
            RespValue::Null => Ok(None),
            other => Err(TransportError::UnexpectedReply(other)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_secs: Option<u64>,
    ) -> Result<(), TransportError> {
        let expire = expire_secs.map(|s| s.to_string());
        let mut args: Vec<&[u8]> = vec![b"SET".as_slice(), key.as_bytes(), value];
        if let Some(ref secs) = expire {
            args.push(b"EX");
            args.push(secs.as_bytes());
        }

        match self.round_trip(&args).await? {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            other => Err(TransportError::UnexpectedReply(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        match self.round_trip(&[b"DEL".as_slice(), key.as_bytes()]).await? {
            RespValue::Integer(_) => Ok(()),
            other => Err(TransportError::UnexpectedReply(other)),
        }
    }
}

// ============================================================================
// RedbStore — embedded backend
// ============================================================================

/// A cache entry as persisted in redb.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    expires_at_ms: Option<u64>,
    value: Vec<u8>,
}

impl StoredEntry {
    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Embedded [`KvStore`] backed by redb.
///
/// Uses a `_geocache_`-prefixed table name to avoid collisions when sharing
/// a redb instance with the consumer's application tables.
#[derive(Debug, Clone)]
pub struct RedbStore {
    db: Arc<redb::Database>,
}

/// Errors from the redb storage backend.
#[derive(Debug, thiserror::Error)]
pub enum RedbStoreError {
    #[error("Commit error: {0}")]
    Commit(Box<redb::CommitError>),
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Invalid expire time: {0}")]
    InvalidExpire(u64),
    #[error("Storage error: {0}")]
    Storage(Box<redb::StorageError>),
    #[error("Table error: {0}")]
    Table(Box<redb::TableError>),
    #[error("Transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
}

impl From<redb::CommitError> for RedbStoreError {
    fn from(e: redb::CommitError) -> Self {
        Self::Commit(Box::new(e))
    }
}

impl From<redb::StorageError> for RedbStoreError {
    fn from(e: redb::StorageError) -> Self {
        Self::Storage(Box::new(e))
    }
}

impl From<redb::TableError> for RedbStoreError {
    fn from(e: redb::TableError) -> Self {
        Self::Table(Box::new(e))
    }
}

impl From<redb::TransactionError> for RedbStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl RedbStore {
    /// Create a store on a shared redb instance, creating its table if needed.
    pub fn new(db: Arc<redb::Database>) -> Result<Self, RedbStoreError> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ENTRIES)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn read_entry(&self, key: &str) -> Result<Option<StoredEntry>, RedbStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ENTRIES)?;
        match table.get(key)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    fn remove(&self, key: &str) -> Result<(), RedbStoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl KvStore for RedbStore {
    type Error = RedbStoreError;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RedbStoreError> {
        match self.read_entry(key)? {
            Some(entry) if entry.is_expired(now_ms()) => {
                self.remove(key)?;
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_secs: Option<u64>,
    ) -> Result<(), RedbStoreError> {
        let expires_at_ms = match expire_secs {
            Some(0) => return Err(RedbStoreError::InvalidExpire(0)),
            Some(secs) => Some(now_ms().saturating_add(secs.saturating_mul(1000))),
            None => None,
        };
        let data = rmp_serde::to_vec(&StoredEntry {
            expires_at_ms,
            value: value.to_vec(),
        })?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ENTRIES)?;
            table.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RedbStoreError> {
        self.remove(key)
    }
}

/// [`Connector`] that serves every endpoint from one [`RedbStore`].
///
/// Primary and replicas then share one database, which suits single-host
/// deployments and tests.
#[derive(Debug, Clone)]
pub struct RedbConnector {
    store: RedbStore,
}

impl RedbConnector {
    pub fn new(store: RedbStore) -> Self {
        Self { store }
    }
}

impl Connector for RedbConnector {
    type Store = RedbStore;

    fn connect(&self, _endpoint: &Endpoint) -> RedbStore {
        self.store.clone()
    }
}

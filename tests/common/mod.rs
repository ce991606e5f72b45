//! Shared test helpers for geocache integration tests.
//!
//! Provides in-process stand-ins for every collaborator of the cache client:
//! a table-driven geolocation provider, a counting origin fetcher, a fake
//! RESP server that plays both sentinel and store, and a one-shot HTTP
//! responder for the reqwest-backed components.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use geocache::resp::{RespCodec, RespValue};
use geocache::{
    CacheClient, Config, Connector, Coordinates, Endpoint, GeoError, GeoLocator, GeoProvider,
    Haversine, KvStore, OriginError, OriginFetcher, OriginRequest, RedbStore, RedbStoreError,
    StaticDiscovery,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const LONDON: Coordinates = Coordinates {
    latitude: 51.5074,
    longitude: -0.1278,
};
pub const PARIS: Coordinates = Coordinates {
    latitude: 48.8566,
    longitude: 2.3522,
};
pub const NEW_YORK: Coordinates = Coordinates {
    latitude: 40.7128,
    longitude: -74.0060,
};
pub const SYDNEY: Coordinates = Coordinates {
    latitude: -33.8688,
    longitude: 151.2093,
};

// ============================================================================
// MapProvider — table-driven geolocation
// ============================================================================

/// Resolves hosts from a fixed table; anything missing is a failure.
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    own: Option<Coordinates>,
    hosts: HashMap<String, Coordinates>,
    lookups: Arc<AtomicUsize>,
}

impl MapProvider {
    pub fn new(own: Option<Coordinates>) -> Self {
        Self {
            own,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: &str, coords: Coordinates) -> Self {
        self.hosts.insert(host.to_string(), coords);
        self
    }

    /// Number of resolve calls so far, shared across clones.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl GeoProvider for MapProvider {
    async fn resolve(&self, host: Option<&str>) -> Result<Coordinates, GeoError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let found = match host {
            None => self.own,
            Some(h) => self.hosts.get(h).copied(),
        };
        found.ok_or_else(|| GeoError::MissingLocation(host.unwrap_or("self").to_string()))
    }
}

// ============================================================================
// CountingFetcher — origin stand-in
// ============================================================================

/// Origin that serves a fixed body (or fails) and counts its calls.
#[derive(Debug, Clone)]
pub struct CountingFetcher {
    body: Option<Vec<u8>>,
    calls: Arc<AtomicUsize>,
}

impl CountingFetcher {
    pub fn serving(body: &[u8]) -> Self {
        Self {
            body: Some(body.to_vec()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            body: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Handle for reading the call count after the fetcher is moved.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl OriginFetcher for CountingFetcher {
    async fn fetch(&self, request: &OriginRequest) -> Result<Vec<u8>, OriginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.body
            .clone()
            .ok_or_else(|| OriginError::Unavailable(request.url.clone()))
    }
}

// ============================================================================
// Client helpers
// ============================================================================

/// A fresh embedded store in a temp dir.
pub fn redb_store() -> (RedbStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(redb::Database::create(dir.path().join("cache.redb")).unwrap());
    (RedbStore::new(db).unwrap(), dir)
}

/// Embedded store that counts the writes made through it.
#[derive(Debug, Clone)]
pub struct CountingStore {
    inner: RedbStore,
    writes: Arc<AtomicUsize>,
}

impl KvStore for CountingStore {
    type Error = RedbStoreError;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RedbStoreError> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_secs: Option<u64>,
    ) -> Result<(), RedbStoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, expire_secs).await
    }

    async fn delete(&self, key: &str) -> Result<(), RedbStoreError> {
        self.inner.delete(key).await
    }
}

/// Hands every endpoint a [`CountingStore`] over one database and one counter.
pub struct CountingConnector {
    store: RedbStore,
    writes: Arc<AtomicUsize>,
}

impl Connector for CountingConnector {
    type Store = CountingStore;

    fn connect(&self, _endpoint: &Endpoint) -> CountingStore {
        CountingStore {
            inner: self.store.clone(),
            writes: Arc::clone(&self.writes),
        }
    }
}

/// A cache client over an embedded store with its call counters and temp dir guard.
pub struct TestCache {
    pub client: CacheClient<CountingStore, CountingFetcher>,
    pub origin_calls: Arc<AtomicUsize>,
    pub store_writes: Arc<AtomicUsize>,
    pub store: RedbStore,
    _dir: TempDir,
}

impl TestCache {
    pub fn origin_calls(&self) -> usize {
        self.origin_calls.load(Ordering::SeqCst)
    }

    /// Store writes made by the client (direct `store` writes are not counted).
    pub fn store_writes(&self) -> usize {
        self.store_writes.load(Ordering::SeqCst)
    }
}

/// Bootstrap a client over `discovery` and `provider`, backed by one redb
/// store shared by primary and replicas.
pub async fn build_cache(
    discovery: StaticDiscovery,
    provider: MapProvider,
    fetcher: CountingFetcher,
) -> TestCache {
    let (store, dir) = redb_store();
    let origin_calls = fetcher.counter();
    let store_writes = Arc::new(AtomicUsize::new(0));
    let connector = CountingConnector {
        store: store.clone(),
        writes: Arc::clone(&store_writes),
    };

    let client = CacheClient::bootstrap(
        &Config::default(),
        &discovery,
        &GeoLocator::new(provider),
        &Haversine,
        &connector,
        fetcher,
    )
    .await
    .unwrap();

    TestCache {
        client,
        origin_calls,
        store_writes,
        store,
        _dir: dir,
    }
}

/// A London caller with one Paris replica: reads and writes both enabled.
pub async fn healthy_cache(fetcher: CountingFetcher) -> TestCache {
    let discovery = StaticDiscovery::new(
        Some(Endpoint::new("primary", 6379)),
        vec![Endpoint::new("replica-paris", 6379)],
    );
    let provider = MapProvider::new(Some(LONDON)).with_host("replica-paris", PARIS);
    build_cache(discovery, provider, fetcher).await
}

// ============================================================================
// FakeRedis — in-process sentinel and store
// ============================================================================

/// A replica as a sentinel reports it.
#[derive(Debug, Clone)]
pub struct FakeReplica {
    pub ip: String,
    pub port: u16,
    pub flags: String,
}

impl FakeReplica {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            flags: "slave".to_string(),
        }
    }

    pub fn flagged(mut self, flags: &str) -> Self {
        self.flags = flags.to_string();
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    entries: HashMap<Vec<u8>, (Vec<u8>, Option<Instant>)>,
    primary_name: String,
    primary: Option<(String, u16)>,
    replicas: Vec<FakeReplica>,
    password: Option<String>,
    sentinel_error: Option<String>,
    commands: Vec<String>,
}

/// A RESP server on localhost answering the subset of commands the client
/// sends: `AUTH`, `GET`, `SET [EX n]`, `DEL`, and the two `SENTINEL` queries.
pub struct FakeRedis {
    endpoint: Endpoint,
    state: Arc<Mutex<FakeState>>,
    drop_next: Arc<AtomicBool>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(FakeState {
            primary_name: "mymaster".to_string(),
            ..FakeState::default()
        }));
        let drop_next = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(AtomicUsize::new(0));

        let handle = {
            let state = Arc::clone(&state);
            let drop_next = Arc::clone(&drop_next);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&state),
                        Arc::clone(&drop_next),
                    ));
                }
            })
        };

        Self {
            endpoint: Endpoint::new("127.0.0.1", port),
            state,
            drop_next,
            connections,
            handle,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Act as a sentinel that knows `primary` and `replicas`.
    pub fn set_topology(&self, primary: Option<Endpoint>, replicas: Vec<FakeReplica>) {
        let mut state = self.state.lock().unwrap();
        state.primary = primary.map(|ep| (ep.host, ep.port));
        state.replicas = replicas;
    }

    /// Answer every `SENTINEL` query with an error reply.
    pub fn refuse_sentinel_queries(&self, message: &str) {
        self.state.lock().unwrap().sentinel_error = Some(message.to_string());
    }

    pub fn require_password(&self, password: &str) {
        self.state.lock().unwrap().password = Some(password.to_string());
    }

    /// Close the connection right after answering the next command.
    pub fn drop_after_next_reply(&self) {
        self.drop_next.store(true, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Command names received so far, uppercased, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Raw stored bytes under `key`, ignoring expiry.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(key.as_bytes())
            .map(|(v, _)| v.clone())
    }

    /// Store raw bytes directly, as another writer would.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(key.as_bytes().to_vec(), (value.to_vec(), None));
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<Mutex<FakeState>>,
    drop_next: Arc<AtomicBool>,
) {
    let mut framed = Framed::new(stream, RespCodec);
    let mut authed = false;

    while let Some(Ok(frame)) = framed.next().await {
        let args = match frame {
            RespValue::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    RespValue::BulkString(b) => b,
                    other => other.as_text().unwrap_or_default().into_bytes(),
                })
                .collect::<Vec<_>>(),
            _ => {
                let _ = framed
                    .send(RespValue::Error("ERR expected array".to_string()))
                    .await;
                continue;
            }
        };

        let reply = {
            let mut state = state.lock().unwrap();
            handle_command(&mut state, &mut authed, &args)
        };
        if framed.send(reply).await.is_err() {
            return;
        }
        if drop_next.swap(false, Ordering::SeqCst) {
            return;
        }
    }
}

fn handle_command(state: &mut FakeState, authed: &mut bool, args: &[Vec<u8>]) -> RespValue {
    let Some((name, rest)) = args.split_first() else {
        return RespValue::Error("ERR empty command".to_string());
    };
    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
    state.commands.push(name.clone());

    if name == "AUTH" {
        return match (&state.password, rest.first()) {
            (Some(expected), Some(given)) if expected.as_bytes() == given.as_slice() => {
                *authed = true;
                RespValue::SimpleString("OK".to_string())
            }
            _ => RespValue::Error("WRONGPASS invalid password".to_string()),
        };
    }
    if state.password.is_some() && !*authed {
        return RespValue::Error("NOAUTH Authentication required.".to_string());
    }

    match (name.as_str(), rest) {
        ("GET", [key]) => {
            let expired = state
                .entries
                .get(key)
                .and_then(|(_, deadline)| *deadline)
                .is_some_and(|deadline| deadline <= Instant::now());
            if expired {
                state.entries.remove(key);
            }
            match state.entries.get(key) {
                Some((value, _)) => RespValue::BulkString(value.clone()),
                None => RespValue::Null,
            }
        }
        ("SET", [key, value]) => {
            state.entries.insert(key.clone(), (value.clone(), None));
            RespValue::SimpleString("OK".to_string())
        }
        ("SET", [key, value, ex, secs]) if ex.eq_ignore_ascii_case(b"EX") => {
            let secs = match std::str::from_utf8(secs).ok().and_then(|s| s.parse::<u64>().ok()) {
                Some(s) if s > 0 => s,
                _ => return RespValue::Error("ERR invalid expire time in 'set' command".to_string()),
            };
            let deadline = Instant::now() + std::time::Duration::from_secs(secs);
            state
                .entries
                .insert(key.clone(), (value.clone(), Some(deadline)));
            RespValue::SimpleString("OK".to_string())
        }
        ("DEL", keys) if !keys.is_empty() => {
            let removed = keys
                .iter()
                .filter(|k| state.entries.remove(k.as_slice()).is_some())
                .count();
            RespValue::Integer(removed as i64)
        }
        ("SENTINEL", _) if state.sentinel_error.is_some() => {
            RespValue::Error(state.sentinel_error.clone().unwrap_or_default())
        }
        ("SENTINEL", [sub, group]) => sentinel_reply(state, sub, group),
        _ => RespValue::Error(format!("ERR unknown command '{name}'")),
    }
}

fn sentinel_reply(state: &FakeState, sub: &[u8], group: &[u8]) -> RespValue {
    let sub = String::from_utf8_lossy(sub).to_ascii_lowercase();
    let known = group == state.primary_name.as_bytes();

    match sub.as_str() {
        "get-master-addr-by-name" => match (&state.primary, known) {
            (Some((host, port)), true) => RespValue::Array(vec![
                RespValue::BulkString(host.clone().into_bytes()),
                RespValue::BulkString(port.to_string().into_bytes()),
            ]),
            _ => RespValue::Null,
        },
        "slaves" | "replicas" if known => RespValue::Array(
            state
                .replicas
                .iter()
                .map(|r| {
                    let fields = [
                        ("name", format!("{}:{}", r.ip, r.port)),
                        ("ip", r.ip.clone()),
                        ("port", r.port.to_string()),
                        ("flags", r.flags.clone()),
                    ];
                    RespValue::Array(
                        fields
                            .iter()
                            .flat_map(|(k, v)| {
                                [
                                    RespValue::BulkString(k.as_bytes().to_vec()),
                                    RespValue::BulkString(v.as_bytes().to_vec()),
                                ]
                            })
                            .collect(),
                    )
                })
                .collect(),
        ),
        "slaves" | "replicas" => RespValue::Error("ERR No such master with that name".to_string()),
        _ => RespValue::Error(format!("ERR unknown sentinel subcommand '{sub}'")),
    }
}

// ============================================================================
// HTTP responder
// ============================================================================

/// Serve every HTTP request on a localhost port with the same response.
///
/// Returns the base URL and a counter of requests served.
pub async fn serve_http(status: u16, content_type: &str, body: &[u8]) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let served = Arc::new(AtomicUsize::new(0));

    let mut response = format!(
        "HTTP/1.1 {status} Status\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);

    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let response = response.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = stream.write_all(&response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://127.0.0.1:{port}"), served)
}

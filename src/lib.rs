//! geocache — Geography-aware read-through cache client.
//!
//! Finds the current primary and replicas of a sentinel-managed key-value
//! store, reads from the replica nearest to the caller, writes through the
//! primary, and falls back to an origin fetch on a miss.
//!
//! # Quick start
//!
//! 1. Build a [`Config`] with the sentinel addresses and primary name.
//! 2. Call [`CacheClient::connect`] (or [`CacheClient::bootstrap`] with your
//!    own discovery, locator, distance and store backends).
//! 3. Use [`fetch_with_cache`](CacheClient::fetch_with_cache) for read-through
//!    fetches, or [`read`](CacheClient::read) / [`write`](CacheClient::write)
//!    for direct access.
//!
//! Every cache-side failure degrades to "cache disabled": reads miss and
//! writes report `false`. Only origin fetch errors reach the caller.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod geo;
pub mod origin;
pub mod resp;
pub mod storage;
pub mod topology;
pub mod transport;

pub use codec::{CacheValue, CodecError, PlainValue, StoredPayload, TypeTag, ValueEnvelope};
pub use config::{Config, ConfigError};
pub use discovery::{Discovery, DiscoveryError, Endpoint, SentinelDiscovery, StaticDiscovery};
pub use geo::{
    Coordinates, DistanceCalculator, GeoError, GeoLocator, GeoProvider, Haversine, IpInfoProvider,
    Vincenty,
};
pub use origin::{HttpFetcher, OriginError, OriginFetcher, OriginRequest};
pub use storage::{
    Connector, KvStore, RedbConnector, RedbStore, RedbStoreError, RespConnector, RespStore,
};
pub use topology::{ReplicaRecord, Topology};

use tracing::{debug, warn};

// ============================================================================
// CacheClient
// ============================================================================

/// Read-through cache client over one discovered [`Topology`].
///
/// Generic over `S` (the [`KvStore`] backend) and `F` (the [`OriginFetcher`]).
/// The topology is fixed for the lifetime of the client; build a new client
/// to pick up a failover.
pub struct CacheClient<S: KvStore, F: OriginFetcher> {
    fetcher: F,
    nearest: Option<S>,
    primary: Option<S>,
    topology: Topology,
}

/// Convenience alias for the sentinel + network store + HTTP origin setup.
pub type SentinelCacheClient = CacheClient<RespStore, HttpFetcher>;

impl CacheClient<RespStore, HttpFetcher> {
    /// Validate `config`, discover through its sentinels, and locate the
    /// caller and replicas through ipinfo.
    pub async fn connect(config: &Config) -> Result<Self, ConfigError> {
        let locator = GeoLocator::new(IpInfoProvider::new(config.geo_token.clone()));
        Self::connect_with(config, &locator).await
    }

    /// Like [`connect`](Self::connect), with a caller-supplied locator.
    pub async fn connect_with<P: GeoProvider>(
        config: &Config,
        locator: &GeoLocator<P>,
    ) -> Result<Self, ConfigError> {
        let discovery =
            SentinelDiscovery::new(config.sentinels.clone(), config.sentinel_socket_timeout);
        let connector = RespConnector::new(config.password.clone(), config.store_socket_timeout);

        Self::bootstrap(
            config,
            &discovery,
            locator,
            &Vincenty,
            &connector,
            HttpFetcher::new(),
        )
        .await
    }
}

impl<S: KvStore, F: OriginFetcher> CacheClient<S, F> {
    /// Build a client over an already discovered topology.
    pub fn new<C>(topology: Topology, connector: &C, fetcher: F) -> Self
    where
        C: Connector<Store = S>,
    {
        let primary = topology.primary().map(|ep| connector.connect(ep));
        let nearest = topology.nearest().map(|r| connector.connect(&r.endpoint));

        Self {
            fetcher,
            nearest,
            primary,
            topology,
        }
    }

    /// Validate `config`, run discovery once, and build the client.
    ///
    /// Only configuration errors fail; discovery problems leave the cache
    /// (partly) disabled.
    pub async fn bootstrap<D, P, C, K>(
        config: &Config,
        discovery: &D,
        locator: &GeoLocator<P>,
        distance: &C,
        connector: &K,
        fetcher: F,
    ) -> Result<Self, ConfigError>
    where
        D: Discovery,
        P: GeoProvider,
        C: DistanceCalculator,
        K: Connector<Store = S>,
    {
        config.validate()?;
        let topology = Topology::discover(discovery, locator, distance, &config.primary_name).await;
        Ok(Self::new(topology, connector, fetcher))
    }

    /// The topology this client was built over.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Read `key` from the nearest replica.
    ///
    /// Returns `None` when there is no nearest replica, the key is absent, or
    /// the store fails.
    pub async fn read(&self, key: &str) -> Option<CacheValue> {
        let store = self.nearest.as_ref()?;

        match store.get(key).await {
            Ok(Some(raw)) => Some(codec::decode_payload(&raw)),
            Ok(None) => None,
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Write `value` under `key` through the primary.
    ///
    /// Returns `false` (and writes nothing) when there is no primary, the
    /// value cannot be encoded, or the store fails.
    pub async fn write(&self, key: &str, value: &CacheValue, expiration_secs: Option<u64>) -> bool {
        let Some(store) = self.primary.as_ref() else {
            debug!(key, "No primary; write skipped");
            return false;
        };

        let payload = match codec::encode(value).and_then(|envelope| envelope.to_payload()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key, error = %e, "Value not cacheable");
                return false;
            }
        };

        match store.set(key, &payload, expiration_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache write failed");
                false
            }
        }
    }

    /// Delete `key` through the primary. Same `false`-on-failure contract as
    /// [`write`](Self::write).
    pub async fn delete(&self, key: &str) -> bool {
        let Some(store) = self.primary.as_ref() else {
            debug!(key, "No primary; delete skipped");
            return false;
        };

        match store.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    /// Fetch `request` through the cache, keyed by its full URL.
    ///
    /// A cached byte or text value is returned as is (no freshness check, no
    /// expiry renewal). Otherwise the origin is fetched, the body written
    /// back with `cache_expiration_secs`, and returned. Origin errors
    /// propagate; a failed write-back does not.
    pub async fn fetch_with_cache(
        &self,
        request: &OriginRequest,
        cache_expiration_secs: Option<u64>,
    ) -> Result<Vec<u8>, OriginError> {
        let key = request.url.as_str();

        if let Some(cached) = self.read(key).await.and_then(CacheValue::into_bytes) {
            debug!(url = key, bytes = cached.len(), "Cache hit");
            return Ok(cached);
        }
        debug!(url = key, "Cache miss");

        let body = self.fetcher.fetch(request).await?;
        self.write(key, &CacheValue::Bytes(body.clone()), cache_expiration_secs)
            .await;
        Ok(body)
    }
}

impl<S: KvStore, F: OriginFetcher> std::fmt::Debug for CacheClient<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("topology", &self.topology)
            .finish()
    }
}

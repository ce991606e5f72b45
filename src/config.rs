use std::time::Duration;

use crate::discovery::Endpoint;

/// Default sentinel group name for the primary.
pub const DEFAULT_PRIMARY_NAME: &str = "mymaster";

/// Default socket timeout for sentinel queries.
pub const DEFAULT_SENTINEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Cache client configuration.
///
/// The consumer constructs this struct however they want (env vars, TOML, CLI
/// flags); geocache does no file I/O or env reading.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sentinel endpoints, queried in order.
    pub sentinels: Vec<Endpoint>,
    /// Name of the monitored primary group (e.g. `mymaster`).
    pub primary_name: String,
    /// Store password. Primary and replicas must share it.
    pub password: Option<String>,
    /// Timeout for each sentinel connection and query.
    pub sentinel_socket_timeout: Duration,
    /// Timeout for store connections and commands (none = wait indefinitely).
    pub store_socket_timeout: Option<Duration>,
    /// Access token for the geolocation provider.
    pub geo_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sentinels: Vec::new(),
            primary_name: DEFAULT_PRIMARY_NAME.to_string(),
            password: None,
            sentinel_socket_timeout: DEFAULT_SENTINEL_TIMEOUT,
            store_socket_timeout: None,
            geo_token: None,
        }
    }
}

/// Errors raised while building or validating a [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid sentinel address {address:?}: {reason}")]
    InvalidSentinelAddress { address: String, reason: String },
    #[error("Primary name must not be empty")]
    EmptyPrimaryName,
    #[error("Sentinel socket timeout must be greater than zero")]
    ZeroTimeout,
}

impl Config {
    /// Build a config from `host:port` sentinel strings, keeping every other
    /// field at its default.
    pub fn with_sentinel_addrs<I, A>(addrs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        let sentinels = addrs
            .into_iter()
            .map(|a| a.as_ref().parse::<Endpoint>())
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            sentinels,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every field. Construction of a client fails on the first error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for sentinel in &self.sentinels {
            validate_endpoint(sentinel)?;
        }

        if self.primary_name.trim().is_empty() {
            return Err(ConfigError::EmptyPrimaryName);
        }

        if self.sentinel_socket_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        if self.sentinels.is_empty() {
            tracing::warn!("No sentinels configured; the cache will start disabled");
        }

        Ok(())
    }
}

fn validate_endpoint(endpoint: &Endpoint) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidSentinelAddress {
        address: endpoint.to_string(),
        reason: reason.to_string(),
    };

    if endpoint.host.trim().is_empty() {
        return Err(invalid("host is empty"));
    }
    if endpoint.port == 0 {
        return Err(invalid("port must be non-zero"));
    }
    Ok(())
}

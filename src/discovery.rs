//! Pluggable topology discovery.
//!
//! - **Sentinel**: asks sentinel processes for the current primary and its
//!   replicas.
//! - **Static**: uses a fixed primary and replica list from configuration.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::ConfigError;
use crate::resp::RespValue;
use crate::transport::{RespConnection, TransportError};

/// A store or sentinel address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse `host:port` (IPv6 hosts in brackets: `[::1]:26379`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidSentinelAddress {
            address: s.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| invalid("port is not a number in 0..=65535"))?;

        Ok(Endpoint::new(host, port))
    }
}

/// Errors from a discovery backend.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("No sentinel could be reached ({attempts} tried)")]
    NoSentinelReachable { attempts: usize },
    #[error("Malformed sentinel reply: {0}")]
    MalformedReply(String),
}

/// Source of the current primary and replica endpoints.
pub trait Discovery: Send + Sync + 'static {
    /// The current primary for `name`, or `None` if the service knows of none.
    fn discover_primary(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Endpoint>, DiscoveryError>> + Send;

    /// The healthy replicas of `name`, in discovery order.
    fn discover_replicas(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<Endpoint>, DiscoveryError>> + Send;
}

// ============================================================================
// Static
// ============================================================================

/// Fixed topology discovery.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    primary: Option<Endpoint>,
    replicas: Vec<Endpoint>,
}

impl StaticDiscovery {
    pub fn new(primary: Option<Endpoint>, replicas: Vec<Endpoint>) -> Self {
        Self { primary, replicas }
    }
}

impl Discovery for StaticDiscovery {
    async fn discover_primary(&self, _name: &str) -> Result<Option<Endpoint>, DiscoveryError> {
        Ok(self.primary.clone())
    }

    async fn discover_replicas(&self, _name: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        Ok(self.replicas.clone())
    }
}

// ============================================================================
// Sentinel
// ============================================================================

/// Replica flags that exclude a replica from the healthy set.
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Sentinel-based discovery.
///
/// Sentinels are tried in configured order; each query opens its own short
/// lived connection bounded by the socket timeout.
#[derive(Debug, Clone)]
pub struct SentinelDiscovery {
    sentinels: Vec<Endpoint>,
    socket_timeout: Duration,
}

impl SentinelDiscovery {
    pub fn new(sentinels: Vec<Endpoint>, socket_timeout: Duration) -> Self {
        Self {
            sentinels,
            socket_timeout,
        }
    }

    async fn query(
        &self,
        sentinel: &Endpoint,
        args: &[&[u8]],
    ) -> Result<RespValue, TransportError> {
        let mut conn = RespConnection::connect(sentinel, Some(self.socket_timeout)).await?;
        conn.command(args).await
    }
}

impl Discovery for SentinelDiscovery {
    async fn discover_primary(&self, name: &str) -> Result<Option<Endpoint>, DiscoveryError> {
        let mut reachable = false;

        for sentinel in &self.sentinels {
            let reply = self
                .query(
                    sentinel,
                    &[
                        b"SENTINEL".as_slice(),
                        b"get-master-addr-by-name".as_slice(),
                        name.as_bytes(),
                    ],
                )
                .await;

            match reply {
                Ok(RespValue::Null) => {
                    reachable = true;
                    trace!(sentinel = %sentinel, name, "Sentinel does not know this primary");
                }
                Ok(value) => match parse_primary_addr(&value) {
                    Ok(endpoint) => {
                        debug!(sentinel = %sentinel, primary = %endpoint, "Primary discovered");
                        return Ok(Some(endpoint));
                    }
                    Err(e) => {
                        reachable = true;
                        warn!(sentinel = %sentinel, error = %e, "Ignoring sentinel reply");
                    }
                },
                Err(TransportError::Server(message)) => {
                    reachable = true;
                    debug!(sentinel = %sentinel, error = %message, "Sentinel refused the query");
                }
                Err(e) => {
                    debug!(sentinel = %sentinel, error = %e, "Sentinel query failed");
                }
            }
        }

        if reachable {
            Ok(None)
        } else {
            Err(DiscoveryError::NoSentinelReachable {
                attempts: self.sentinels.len(),
            })
        }
    }

    async fn discover_replicas(&self, name: &str) -> Result<Vec<Endpoint>, DiscoveryError> {
        let mut reachable = false;

        for sentinel in &self.sentinels {
            let reply = self
                .query(
                    sentinel,
                    &[b"SENTINEL".as_slice(), b"slaves".as_slice(), name.as_bytes()],
                )
                .await;

            match reply {
                Ok(value) => match parse_replicas(&value) {
                    Ok(replicas) if !replicas.is_empty() => {
                        debug!(sentinel = %sentinel, count = replicas.len(), "Replicas discovered");
                        return Ok(replicas);
                    }
                    Ok(_) => reachable = true,
                    Err(e) => {
                        reachable = true;
                        warn!(sentinel = %sentinel, error = %e, "Ignoring sentinel reply");
                    }
                },
                Err(TransportError::Server(message)) => {
                    reachable = true;
                    debug!(sentinel = %sentinel, error = %message, "Sentinel refused the query");
                }
                Err(e) => {
                    debug!(sentinel = %sentinel, error = %e, "Sentinel query failed");
                }
            }
        }

        if reachable {
            Ok(Vec::new())
        } else {
            Err(DiscoveryError::NoSentinelReachable {
                attempts: self.sentinels.len(),
            })
        }
    }
}

/// Parse the `[host, port]` reply of `SENTINEL get-master-addr-by-name`.
fn parse_primary_addr(value: &RespValue) -> Result<Endpoint, DiscoveryError> {
    let RespValue::Array(items) = value else {
        return Err(DiscoveryError::MalformedReply(format!(
            "expected [host, port], got {value:?}"
        )));
    };
    match items.as_slice() {
        [host, port] => {
            let host = host
                .as_text()
                .ok_or_else(|| DiscoveryError::MalformedReply("host is not text".to_string()))?;
            let port = parse_port(port)?;
            Ok(Endpoint::new(host, port))
        }
        _ => Err(DiscoveryError::MalformedReply(format!(
            "expected 2 elements, got {}",
            items.len()
        ))),
    }
}

/// Parse the reply of `SENTINEL slaves`: an array of flat field/value arrays.
///
/// Any malformed entry fails the whole reply.
fn parse_replicas(value: &RespValue) -> Result<Vec<Endpoint>, DiscoveryError> {
    let RespValue::Array(entries) = value else {
        return Err(DiscoveryError::MalformedReply(format!(
            "expected replica list, got {value:?}"
        )));
    };

    let mut replicas = Vec::with_capacity(entries.len());
    for entry in entries {
        let RespValue::Array(fields) = entry else {
            return Err(DiscoveryError::MalformedReply(
                "replica entry is not an array".to_string(),
            ));
        };

        let mut host = None;
        let mut port = None;
        let mut flags = String::new();
        for pair in fields.chunks(2) {
            let [key, val] = pair else {
                return Err(DiscoveryError::MalformedReply(
                    "replica entry has an odd field count".to_string(),
                ));
            };
            match key.as_text().as_deref() {
                Some("ip") => host = val.as_text(),
                Some("port") => port = Some(parse_port(val)?),
                Some("flags") => flags = val.as_text().unwrap_or_default(),
                _ => {}
            }
        }

        let (Some(host), Some(port)) = (host, port) else {
            return Err(DiscoveryError::MalformedReply(
                "replica entry lacks ip or port".to_string(),
            ));
        };

        if flags.split(',').any(|f| UNHEALTHY_FLAGS.contains(&f)) {
            trace!(replica = %Endpoint::new(host.as_str(), port), flags = %flags, "Skipping unhealthy replica");
            continue;
        }
        replicas.push(Endpoint::new(host, port));
    }

    Ok(replicas)
}

fn parse_port(value: &RespValue) -> Result<u16, DiscoveryError> {
    let port = match value {
        RespValue::Integer(i) => u16::try_from(*i).ok(),
        other => other.as_text().and_then(|t| t.parse::<u16>().ok()),
    };
    port.ok_or_else(|| DiscoveryError::MalformedReply(format!("invalid port: {value:?}")))
}

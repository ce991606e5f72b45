//! TCP transport for the store and sentinel protocol.
//!
//! A [`RespConnection`] owns one framed TCP stream and runs strictly
//! request/response: one command out, one reply back.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::discovery::Endpoint;
use crate::resp::{RespCodec, RespError, RespValue};

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        source: std::io::Error,
    },
    #[error("Timed out talking to {0}")]
    Timeout(Endpoint),
    #[error("Protocol error: {0}")]
    Protocol(#[from] RespError),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Server error: {0}")]
    Server(String),
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(RespValue),
}

impl TransportError {
    /// Whether a fresh connection might succeed where this one failed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed
                | TransportError::Protocol(RespError::Io(_))
        )
    }
}

type Connection = Framed<TcpStream, RespCodec>;

/// A single request/response connection to a store or sentinel.
pub struct RespConnection {
    endpoint: Endpoint,
    framed: Connection,
    timeout: Option<Duration>,
}

impl RespConnection {
    /// Open a connection, bounded by `timeout` when set.
    pub async fn connect(
        endpoint: &Endpoint,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        debug!(endpoint = %endpoint, "Connecting");
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
        let stream = with_timeout(endpoint, timeout, connect)
            .await?
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        Ok(Self {
            endpoint: endpoint.clone(),
            framed: Framed::new(stream, RespCodec),
            timeout,
        })
    }

    /// Open a connection and authenticate when a password is given.
    pub async fn connect_with_password(
        endpoint: &Endpoint,
        password: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Self, TransportError> {
        let mut conn = Self::connect(endpoint, timeout).await?;
        if let Some(password) = password {
            conn.command(&[b"AUTH".as_slice(), password.as_bytes()])
                .await?;
        }
        Ok(conn)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Send one command and wait for its reply.
    ///
    /// Error replies from the server surface as [`TransportError::Server`].
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<RespValue, TransportError> {
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;
        let request = RespValue::command(args.iter().copied());

        let reply = with_timeout(&endpoint, timeout, async {
            self.framed.send(request).await?;
            match self.framed.next().await {
                Some(frame) => Ok::<RespValue, TransportError>(frame?),
                None => Err(TransportError::ConnectionClosed),
            }
        })
        .await??;

        match reply {
            RespValue::Error(message) => Err(TransportError::Server(message)),
            other => Ok(other),
        }
    }
}

impl std::fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespConnection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

async fn with_timeout<F: std::future::Future>(
    endpoint: &Endpoint,
    timeout: Option<Duration>,
    fut: F,
) -> Result<F::Output, TransportError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::Timeout(endpoint.clone())),
        None => Ok(fut.await),
    }
}

//! TCP transport for device messages.
//!
//! Every message travels over its own connection: connect, write the whole
//! payload, optionally wait for a reply, close. There is no pooling and no
//! retry; the device decides what to do with a failure.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::ACK_MARKER;

/// Default time allowed for the TCP handshake.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default time to wait for an acknowledgment.
const DEFAULT_ACK_TIMEOUT_SECS: u64 = 5;

/// Largest reply read after a donation send.
const DEFAULT_REPLY_BUFFER_SIZE: usize = 1024;

/// Server address and port a device talks to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Whether a connection attempt makes sense at all.
    pub fn is_routable(&self) -> bool {
        !self.address.trim().is_empty() && self.port != 0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Whether the sender waits for a reply after writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Done once the payload is flushed (status messages)
    None,

    /// Read one reply and classify it (donation messages)
    AwaitAck,
}

/// Successful outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Payload written, no reply requested
    Sent,

    /// Reply started with the acknowledgment marker
    Acknowledged(String),

    /// A reply arrived but was not an acknowledgment
    Unrecognized(String),
}

impl Delivery {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Delivery::Acknowledged(_))
    }
}

/// Classify a non-empty reply.
pub fn classify_reply(reply: &[u8]) -> Delivery {
    let text = String::from_utf8_lossy(reply).into_owned();
    if text.starts_with(ACK_MARKER) {
        Delivery::Acknowledged(text)
    } else {
        Delivery::Unrecognized(text)
    }
}

/// A failed send. Every variant means the message did not get through.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },

    #[error("failed to write to {endpoint}: {source}")]
    Write {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("failed to read reply from {endpoint}: {source}")]
    Read {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("no reply from {endpoint} within {timeout:?}")]
    ReplyTimeout { endpoint: Endpoint, timeout: Duration },

    #[error("{endpoint} closed the connection without replying")]
    NoReply { endpoint: Endpoint },
}

/// Performs one request against the server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `payload` to `endpoint`.
    ///
    /// With [`ReplyMode::AwaitAck`] an unrecognized reply is still a
    /// successful send; only a missing reply is a failure.
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &[u8],
        reply: ReplyMode,
    ) -> Result<Delivery, TransportError>;
}

/// Timeouts and limits for [`TcpTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Time allowed for the TCP handshake
    pub connect_timeout: Duration,

    /// Time to wait for an acknowledgment after a donation send
    pub ack_timeout: Duration,

    /// Maximum number of reply bytes read
    pub reply_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(DEFAULT_ACK_TIMEOUT_SECS),
            reply_buffer_size: DEFAULT_REPLY_BUFFER_SIZE,
        }
    }
}

/// Connection-per-message TCP transport.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TransportConfig,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn read_reply(
        &self,
        stream: &mut TcpStream,
        endpoint: &Endpoint,
    ) -> Result<Delivery, TransportError> {
        let mut buf = vec![0u8; self.config.reply_buffer_size];
        let read = timeout(self.config.ack_timeout, stream.read(&mut buf)).await;

        match read {
            Ok(Ok(0)) => Err(TransportError::NoReply {
                endpoint: endpoint.clone(),
            }),
            Ok(Ok(n)) => Ok(classify_reply(&buf[..n])),
            Ok(Err(source)) => Err(TransportError::Read {
                endpoint: endpoint.clone(),
                source,
            }),
            Err(_) => Err(TransportError::ReplyTimeout {
                endpoint: endpoint.clone(),
                timeout: self.config.ack_timeout,
            }),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &[u8],
        reply: ReplyMode,
    ) -> Result<Delivery, TransportError> {
        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let mut stream = match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    endpoint: endpoint.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout: self.config.connect_timeout,
                })
            }
        };

        let write_error = |source: io::Error| TransportError::Write {
            endpoint: endpoint.clone(),
            source,
        };
        stream.write_all(payload).await.map_err(write_error)?;
        stream.flush().await.map_err(write_error)?;

        let delivery = match reply {
            ReplyMode::None => Delivery::Sent,
            ReplyMode::AwaitAck => self.read_reply(&mut stream, endpoint).await?,
        };

        // The payload is already flushed; a failed close changes nothing
        if let Err(e) = stream.shutdown().await {
            debug!(endpoint = %endpoint, error = %e, "Connection shutdown failed");
        }

        Ok(delivery)
    }
}

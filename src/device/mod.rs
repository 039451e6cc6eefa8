//! Byte-stream link to the charge controller
//!
//! The link is split in two:
//!
//! - [`Connector`] - how a fresh stream is opened (TCP in production, an
//!   in-memory duplex in tests)
//! - [`link::DeviceLink`] - one request/response exchange per call, lazy
//!   reconnection, teardown on any invalid frame

pub mod link;

pub use link::{DeviceLink, LinkState, ReadError};

use crate::config::DeviceSection;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Opens byte streams to the controller
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Establish a new stream
    async fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

/// TCP connector with a bounded connect time
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    pub fn from_config(config: &DeviceSection) -> Self {
        Self::new(config.host.clone(), config.port, config.timeout())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )
        })??;

        stream.set_nodelay(true)?;
        debug!(endpoint = %self.endpoint(), "TCP connection established");
        Ok(stream)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

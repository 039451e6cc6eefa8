//! Request/response exchanges with the charge controller
//!
//! A [`DeviceLink`] owns at most one stream. A read on a disconnected link
//! makes exactly one connect attempt first; any failure after that (send,
//! receive, timeout, or an invalid frame) drops the stream so the next call
//! starts from a fresh connection. Retry policy belongs to the caller.
//!
//! Replies are framed by their MBAP length field, so a reply split across
//! several TCP segments is reassembled within the same I/O timeout.

use super::Connector;
use crate::device_span;
use crate::protocol::codec::{self, DecodeError, RegisterRequest, MBAP_HEADER_LEN};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn, Instrument};

/// Observable link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
}

/// Errors from a single register read
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Invalid register count: {0}")]
    InvalidCount(u16),

    #[error("Connection to {endpoint} failed")]
    Connection {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error during exchange")]
    Io(#[source] io::Error),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by device")]
    Closed,

    #[error("Invalid response frame: {0}")]
    Frame(#[from] DecodeError),

    #[error("Expected {expected} registers, received {actual}")]
    UnexpectedLength { expected: usize, actual: usize },
}

/// Lazily connected link to one controller
pub struct DeviceLink<C: Connector> {
    connector: C,
    stream: Option<C::Stream>,
    unit_id: u8,
    next_transaction: u16,
    io_timeout: Duration,
}

impl<C: Connector> DeviceLink<C> {
    pub fn new(connector: C, unit_id: u8, io_timeout: Duration) -> Self {
        Self {
            connector,
            stream: None,
            unit_id,
            next_transaction: 1,
            io_timeout,
        }
    }

    pub fn state(&self) -> LinkState {
        if self.stream.is_some() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Drop the current stream, if any
    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            debug!(endpoint = %self.connector.endpoint(), "Device link torn down");
        }
    }

    fn take_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction;
        self.next_transaction = self.next_transaction.wrapping_add(1);
        id
    }

    /// Read `count` holding registers starting at `start_address`
    pub async fn read_registers(
        &mut self,
        start_address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        let request = RegisterRequest::new(
            start_address,
            count,
            self.next_transaction,
            self.unit_id,
        )
        .map_err(|_| ReadError::InvalidCount(count))?;
        self.take_transaction_id();

        if self.stream.is_none() {
            let endpoint = self.connector.endpoint();
            let stream = self
                .connector
                .connect()
                .await
                .map_err(|source| ReadError::Connection {
                    endpoint: endpoint.clone(),
                    source,
                })?;
            debug!(endpoint = %endpoint, "Device link connected");
            self.stream = Some(stream);
        }

        let span = device_span!(
            start = start_address,
            count = count,
            transaction_id = request.transaction_id()
        );
        match self.exchange(&request).instrument(span).await {
            Ok(words) => Ok(words),
            Err(e) => {
                warn!(
                    start = %format!("{:#06x}", start_address),
                    count = count,
                    transaction_id = request.transaction_id(),
                    error = %e,
                    "Register read failed, dropping device link"
                );
                self.disconnect();
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, request: &RegisterRequest) -> Result<Vec<u16>, ReadError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(ReadError::Closed)?;
        let frame = codec::encode(request);

        tokio::time::timeout(io_timeout, async {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| ReadError::Timeout(io_timeout))?
        .map_err(ReadError::Io)?;

        let frame = tokio::time::timeout(io_timeout, receive_frame(stream))
            .await
            .map_err(|_| ReadError::Timeout(io_timeout))??;

        let response = codec::decode(&frame, request.transaction_id())?;
        let expected = request.count() as usize;
        if response.words().len() != expected {
            return Err(ReadError::UnexpectedLength {
                expected,
                actual: response.words().len(),
            });
        }

        debug!(
            start = %format!("{:#06x}", request.start_address()),
            count = expected,
            transaction_id = request.transaction_id(),
            "Register read complete"
        );
        Ok(response.into_words())
    }
}

/// Read one response frame: the MBAP header, then as many bytes as its
/// length field announces
async fn receive_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ReadError> {
    let mut frame = vec![0u8; MBAP_HEADER_LEN];
    fill(stream, &mut frame, 0).await?;

    let total = codec::response_frame_len(&frame)?;
    frame.resize(total, 0);
    fill(stream, &mut frame, MBAP_HEADER_LEN).await?;
    Ok(frame)
}

/// Fill `buf[filled..]`, accepting the bytes in as many reads as they arrive
async fn fill<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    mut filled: usize,
) -> Result<(), ReadError> {
    while filled < buf.len() {
        let received = stream.read(&mut buf[filled..]).await.map_err(ReadError::Io)?;
        if received == 0 {
            if filled == 0 {
                return Err(ReadError::Closed);
            }
            return Err(DecodeError::FrameTooShort {
                len: filled,
                min: buf.len(),
            }
            .into());
        }
        filled += received;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{encode_response, RegisterRequest};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_test::io::{Builder, Mock};

    /// Hands out pre-scripted streams, refusing once they run out
    #[derive(Clone, Default)]
    struct ScriptedConnector {
        streams: Arc<Mutex<VecDeque<Mock>>>,
        connects: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn with_streams(streams: Vec<Mock>) -> Self {
            Self {
                streams: Arc::new(Mutex::new(streams.into())),
                connects: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Stream = Mock;

        async fn connect(&self) -> io::Result<Mock> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }

        fn endpoint(&self) -> String {
            "scripted:502".to_string()
        }
    }

    fn request_frame(start: u16, count: u16, transaction_id: u16) -> Vec<u8> {
        codec::encode(&RegisterRequest::new(start, count, transaction_id, 1).unwrap()).to_vec()
    }

    fn link(connector: ScriptedConnector) -> DeviceLink<ScriptedConnector> {
        DeviceLink::new(connector, 1, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_read_connects_lazily_and_returns_words() {
        let stream = Builder::new()
            .write(&request_frame(0x3100, 2, 1))
            .read(&encode_response(1, 1, &[1000, 50]))
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector.clone());

        assert_eq!(link.state(), LinkState::Disconnected);
        let words = link.read_registers(0x3100, 2).await.unwrap();

        assert_eq!(words, vec![1000, 50]);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_connection_is_reused_between_reads() {
        let stream = Builder::new()
            .write(&request_frame(0x3100, 1, 1))
            .read(&encode_response(1, 1, &[7]))
            .write(&request_frame(0x3110, 1, 2))
            .read(&encode_response(2, 1, &[8]))
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector.clone());

        assert_eq!(link.read_registers(0x3100, 1).await.unwrap(), vec![7]);
        assert_eq!(link.read_registers(0x3110, 1).await.unwrap(), vec![8]);
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_without_sending() {
        let connector = ScriptedConnector::with_streams(vec![]);
        let mut link = link(connector.clone());

        let result = link.read_registers(0x3100, 9).await;

        assert!(matches!(result, Err(ReadError::Connection { .. })));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_malformed_frame_forces_fresh_connection() {
        let mut short = encode_response(1, 1, &[1, 2]).to_vec();
        short.truncate(6);
        let bad = Builder::new()
            .write(&request_frame(0x3100, 2, 1))
            .read(&short)
            .build();
        let good = Builder::new()
            .write(&request_frame(0x3100, 2, 2))
            .read(&encode_response(2, 1, &[3, 4]))
            .build();
        let connector = ScriptedConnector::with_streams(vec![bad, good]);
        let mut link = link(connector.clone());

        let first = link.read_registers(0x3100, 2).await;
        assert!(matches!(
            first,
            Err(ReadError::Frame(DecodeError::FrameTooShort { .. }))
        ));
        assert_eq!(link.state(), LinkState::Disconnected);

        let second = link.read_registers(0x3100, 2).await.unwrap();
        assert_eq!(second, vec![3, 4]);
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_fragmented_reply_is_reassembled() {
        let reply = encode_response(1, 1, &[1000, 50]);
        let stream = Builder::new()
            .write(&request_frame(0x3100, 2, 1))
            .read(&reply[..9])
            .wait(Duration::from_millis(5))
            .read(&reply[9..])
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        assert_eq!(link.read_registers(0x3100, 2).await.unwrap(), vec![1000, 50]);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let reply = encode_response(1, 1, &[7, 8, 9]);
        let stream = Builder::new()
            .write(&request_frame(0x3100, 3, 1))
            .read(&reply[..3])
            .read(&reply[3..8])
            .read(&reply[8..])
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        assert_eq!(link.read_registers(0x3100, 3).await.unwrap(), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_reply_cut_short_after_header() {
        let reply = encode_response(1, 1, &[1, 2]);
        let stream = Builder::new()
            .write(&request_frame(0x3100, 2, 1))
            .read(&reply[..10])
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 2).await;

        assert!(matches!(
            result,
            Err(ReadError::Frame(DecodeError::FrameTooShort { len: 10, min: 13 }))
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_impossible_length_field_is_rejected() {
        let mut reply = encode_response(1, 1, &[1]).to_vec();
        reply[4] = 0x04;
        let stream = Builder::new()
            .write(&request_frame(0x3100, 1, 1))
            .read(&reply[..MBAP_HEADER_LEN])
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 1).await;

        assert!(matches!(
            result,
            Err(ReadError::Frame(DecodeError::InvalidLength(_)))
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_transaction_mismatch_tears_down_link() {
        let stream = Builder::new()
            .write(&request_frame(0x3100, 1, 1))
            .read(&encode_response(99, 1, &[5]))
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 1).await;

        assert!(matches!(
            result,
            Err(ReadError::Frame(DecodeError::TransactionMismatch {
                expected: 1,
                received: 99
            }))
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_register_count_is_rejected() {
        let stream = Builder::new()
            .write(&request_frame(0x3100, 3, 1))
            .read(&encode_response(1, 1, &[1, 2]))
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 3).await;

        assert!(matches!(
            result,
            Err(ReadError::UnexpectedLength {
                expected: 3,
                actual: 2
            })
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let stream = Builder::new()
            .write(&request_frame(0x3100, 1, 1))
            .wait(Duration::from_secs(5))
            .build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 1).await;

        assert!(matches!(result, Err(ReadError::Timeout(_))));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_stream_is_reported() {
        let stream = Builder::new().write(&request_frame(0x3100, 1, 1)).build();
        let connector = ScriptedConnector::with_streams(vec![stream]);
        let mut link = link(connector);

        let result = link.read_registers(0x3100, 1).await;

        assert!(matches!(result, Err(ReadError::Closed)));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_count_never_touches_connector() {
        let connector = ScriptedConnector::with_streams(vec![]);
        let mut link = link(connector.clone());

        let result = link.read_registers(0x3100, 0).await;

        assert!(matches!(result, Err(ReadError::InvalidCount(0))));
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn test_transaction_ids_wrap() {
        let mut link = link(ScriptedConnector::default());
        link.next_transaction = u16::MAX;

        assert_eq!(link.take_transaction_id(), u16::MAX);
        assert_eq!(link.take_transaction_id(), 0);
        assert_eq!(link.take_transaction_id(), 1);
    }
}

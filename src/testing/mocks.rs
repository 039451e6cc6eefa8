//! In-memory doubles for the device link and the publisher
//!
//! [`MockDevice`] is a [`Connector`] that answers register reads over
//! `tokio::io::duplex` from a register map, with per-block faults.
//! [`MockPublisher`] records everything published in call order.

use crate::device::Connector;
use crate::protocol::codec::{self, REQUEST_LEN, RESPONSE_HEADER_LEN};
use crate::protocol::topics::{STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::{Publisher, SessionState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const DUPLEX_CAPACITY: usize = 512;

/// Misbehaviour injected into replies for one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFault {
    /// Reply cut short of the 9-byte header, then the connection closes
    Truncate,
    /// Declared byte count disagrees with the payload
    ByteCountMismatch,
    /// Reply carries a different transaction id
    WrongTransaction,
    /// Exception reply with the given code
    Exception(u8),
    /// No reply at all
    Silent,
}

#[derive(Debug, Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    faults: HashMap<u16, ReplyFault>,
    requests: HashMap<u16, usize>,
    connections: usize,
    refuse_connections: bool,
}

/// Fake charge controller
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not hide the device from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `words` at consecutive addresses from `start`
    pub fn set_registers(&self, start: u16, words: &[u16]) {
        let mut state = self.lock();
        for (offset, word) in words.iter().enumerate() {
            state
                .registers
                .insert(start.wrapping_add(offset as u16), *word);
        }
    }

    /// Misbehave on every read starting at `start`
    pub fn set_fault(&self, start: u16, fault: ReplyFault) {
        self.lock().faults.insert(start, fault);
    }

    pub fn clear_fault(&self, start: u16) {
        self.lock().faults.remove(&start);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Streams handed out so far
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    /// Requests received for reads starting at `start`
    pub fn requests_for(&self, start: u16) -> usize {
        self.lock().requests.get(&start).copied().unwrap_or(0)
    }

    /// Reply bytes for one request frame, or None to stay silent
    fn reply_to(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let request = codec::parse_request(frame).ok()?;
        let mut state = self.lock();
        *state.requests.entry(request.start_address()).or_insert(0) += 1;

        let words: Vec<u16> = (0..request.count())
            .map(|i| {
                let address = request.start_address().wrapping_add(i);
                state.registers.get(&address).copied().unwrap_or(0)
            })
            .collect();
        let tid = request.transaction_id();
        let unit = request.unit_id();

        let reply = match state.faults.get(&request.start_address()) {
            None => codec::encode_response(tid, unit, &words).to_vec(),
            Some(ReplyFault::Truncate) => {
                let mut frame = codec::encode_response(tid, unit, &words).to_vec();
                frame.truncate(6);
                frame
            }
            Some(ReplyFault::ByteCountMismatch) => {
                let mut frame = codec::encode_response(tid, unit, &words).to_vec();
                frame[8] = frame[8].wrapping_add(2);
                frame
            }
            Some(ReplyFault::WrongTransaction) => {
                codec::encode_response(tid.wrapping_add(1), unit, &words).to_vec()
            }
            Some(ReplyFault::Exception(code)) => codec::encode_exception(tid, unit, *code).to_vec(),
            Some(ReplyFault::Silent) => return None,
        };
        Some(reply)
    }

    async fn serve(self, mut stream: DuplexStream) {
        let mut frame = [0u8; REQUEST_LEN];
        while stream.read_exact(&mut frame).await.is_ok() {
            let Some(reply) = self.reply_to(&frame) else {
                continue;
            };
            // A truncated reply is followed by the device hanging up
            let hang_up = reply.len() < RESPONSE_HEADER_LEN;
            if stream.write_all(&reply).await.is_err() || hang_up {
                break;
            }
        }
    }
}

#[async_trait]
impl Connector for MockDevice {
    type Stream = DuplexStream;

    async fn connect(&self) -> io::Result<DuplexStream> {
        {
            let mut state = self.lock();
            if state.refuse_connections {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "mock device refusing connections",
                ));
            }
            state.connections += 1;
        }

        let (client, server) = tokio::io::duplex(DUPLEX_CAPACITY);
        tokio::spawn(self.clone().serve(server));
        Ok(client)
    }

    fn endpoint(&self) -> String {
        "mock-device:502".to_string()
    }
}

/// Errors raised by [`MockPublisher`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MockPublishError {
    #[error("Mock connection failure")]
    ConnectRefused,
    #[error("Not connected - current state: {0:?}")]
    NotConnected(SessionState),
    #[error("Mock publish failure for {0}")]
    FieldRejected(String),
}

/// One recorded publisher call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    Status(String),
    Field { name: String, payload: String },
    Disconnected,
}

#[derive(Debug)]
struct PublisherState {
    session: SessionState,
    events: Vec<PublisherEvent>,
    connect_attempts: usize,
    failing_connects: usize,
    failing_fields: HashSet<String>,
}

/// Recording publisher; clones share the same record
#[derive(Debug, Clone)]
pub struct MockPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl Default for MockPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPublisher {
    /// Offline publisher whose connects succeed
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PublisherState {
                session: SessionState::Offline,
                events: Vec::new(),
                connect_attempts: 0,
                failing_connects: 0,
                failing_fields: HashSet::new(),
            })),
        }
    }

    /// Publisher with a session already established
    pub fn online() -> Self {
        let publisher = Self::new();
        publisher.set_session_state(SessionState::Online);
        publisher
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    /// Reject every publish of `name`
    pub fn fail_field(&self, name: &str) {
        self.lock().failing_fields.insert(name.to_string());
    }

    /// Force the session state, e.g. to simulate a lost session
    pub fn set_session_state(&self, state: SessionState) {
        self.lock().session = state;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn events(&self) -> Vec<PublisherEvent> {
        self.lock().events.clone()
    }

    /// Presence payloads in publish order
    pub fn statuses(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                PublisherEvent::Status(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(name, payload)` field publishes in publish order
    pub fn field_publishes(&self) -> Vec<(String, String)> {
        self.lock()
            .events
            .iter()
            .filter_map(|event| match event {
                PublisherEvent::Field { name, payload } => Some((name.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// Last payload published for `name`
    pub fn field_value(&self, name: &str) -> Option<String> {
        self.field_publishes()
            .into_iter()
            .rev()
            .find(|(field, _)| field == name)
            .map(|(_, payload)| payload)
    }

    pub fn clear_history(&self) {
        self.lock().events.clear();
    }

    fn require_online(state: &PublisherState) -> Result<(), MockPublishError> {
        if state.session == SessionState::Online {
            Ok(())
        } else {
            Err(MockPublishError::NotConnected(state.session.clone()))
        }
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    type Error = MockPublishError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            state.session = SessionState::Offline;
            return Err(MockPublishError::ConnectRefused);
        }
        state.session = SessionState::Online;
        state
            .events
            .push(PublisherEvent::Status(STATUS_ONLINE.to_string()));
        Ok(())
    }

    async fn publish_field(&self, name: &str, payload: &str) -> Result<(), Self::Error> {
        let mut state = self.lock();
        Self::require_online(&state)?;
        if state.failing_fields.contains(name) {
            return Err(MockPublishError::FieldRejected(name.to_string()));
        }
        state.events.push(PublisherEvent::Field {
            name: name.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn announce_offline(&self) -> Result<(), Self::Error> {
        let mut state = self.lock();
        Self::require_online(&state)?;
        state
            .events
            .push(PublisherEvent::Status(STATUS_OFFLINE.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        let mut state = self.lock();
        state.session = SessionState::Offline;
        state.events.push(PublisherEvent::Disconnected);
        Ok(())
    }

    fn session_state(&self) -> SessionState {
        self.lock().session.clone()
    }
}

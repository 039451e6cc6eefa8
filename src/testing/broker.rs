//! In-process MQTT v5 broker for publisher tests
//!
//! Speaks just enough of the protocol for the bridge's publisher: CONNECT,
//! QoS 0/1 PUBLISH, SUBSCRIBE, PINGREQ and DISCONNECT. Its behaviour can be
//! changed mid-test to refuse sessions, withhold acknowledgements, advertise
//! a Receive Maximum or drop every open connection.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

/// Property identifier for Receive Maximum
const RECEIVE_MAXIMUM: u8 = 0x21;

/// One PUBLISH packet as the broker saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPublish {
    /// 1-based number of the session it arrived on
    pub connection: usize,
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    receive_maximum: Option<u16>,
    withhold_acks: bool,
    refuse_connections: bool,
    connections: usize,
    publishes: Vec<ReceivedPublish>,
    subscriptions: Vec<(usize, String)>,
}

/// Broker listening on an ephemeral localhost port
pub struct FakeBroker {
    port: u16,
    state: Arc<Mutex<BrokerState>>,
    drop_tx: watch::Sender<u64>,
    handle: JoinHandle<()>,
}

enum Reply {
    Send(Vec<u8>),
    Nothing,
    Close,
}

impl FakeBroker {
    pub async fn start() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(Mutex::new(BrokerState::default()));
        let (drop_tx, _) = watch::channel(0u64);

        let accept_state = state.clone();
        let accept_drop = drop_tx.clone();
        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let drop_rx = accept_drop.subscribe();
                tokio::spawn(serve(socket, accept_state.clone(), drop_rx));
            }
        });

        Ok(Self {
            port,
            state,
            drop_tx,
            handle,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Advertise a Receive Maximum in every following CONNACK
    pub fn set_receive_maximum(&self, maximum: Option<u16>) {
        self.lock().receive_maximum = maximum;
    }

    /// Stop (or resume) sending PUBACK for QoS 1 publishes
    pub fn withhold_acks(&self, withhold: bool) {
        self.lock().withhold_acks = withhold;
    }

    /// Accept TCP connections but close them instead of answering CONNECT
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Close every connection open right now
    pub fn drop_connections(&self) {
        self.drop_tx.send_modify(|generation| *generation += 1);
    }

    /// Sessions that received a CONNACK
    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn publishes(&self) -> Vec<ReceivedPublish> {
        self.lock().publishes.clone()
    }

    /// Payloads published to `topic` on session `connection`
    pub fn payloads_on(&self, connection: usize, topic: &str) -> Vec<String> {
        self.lock()
            .publishes
            .iter()
            .filter(|p| p.connection == connection && p.topic == topic)
            .map(|p| p.payload.clone())
            .collect()
    }

    /// `(session, filter)` pairs in arrival order
    pub fn subscriptions(&self) -> Vec<(usize, String)> {
        self.lock().subscriptions.clone()
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<Mutex<BrokerState>>,
    mut drop_rx: watch::Receiver<u64>,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let mut connection = None;

    loop {
        while let Some((header, body)) = take_packet(&mut buf) {
            match handle_packet(header, body, &state, &mut connection) {
                Reply::Send(bytes) => {
                    if socket.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Reply::Nothing => {}
                Reply::Close => return,
            }
        }

        tokio::select! {
            read = socket.read_buf(&mut buf) => {
                if !matches!(read, Ok(n) if n > 0) {
                    return;
                }
            }
            _ = drop_rx.changed() => {
                debug!(connection = ?connection, "Fake broker dropping connection");
                return;
            }
        }
    }
}

fn handle_packet(
    header: u8,
    mut body: Bytes,
    state: &Mutex<BrokerState>,
    connection: &mut Option<usize>,
) -> Reply {
    let mut state = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    match header >> 4 {
        CONNECT => {
            if state.refuse_connections {
                return Reply::Close;
            }
            state.connections += 1;
            *connection = Some(state.connections);
            Reply::Send(connack(state.receive_maximum))
        }
        PUBLISH => {
            let qos = (header >> 1) & 0x03;
            let retain = header & 0x01 == 1;
            let Some(topic) = read_string(&mut body) else {
                return Reply::Close;
            };
            let packet_id = if qos > 0 {
                if body.remaining() < 2 {
                    return Reply::Close;
                }
                Some(body.get_u16())
            } else {
                None
            };
            if skip_properties(&mut body).is_none() {
                return Reply::Close;
            }

            state.publishes.push(ReceivedPublish {
                connection: connection.unwrap_or(0),
                topic,
                payload: String::from_utf8_lossy(&body).into_owned(),
                retain,
            });

            match packet_id {
                Some(id) if !state.withhold_acks => {
                    let [hi, lo] = id.to_be_bytes();
                    Reply::Send(vec![0x40, 0x02, hi, lo])
                }
                _ => Reply::Nothing,
            }
        }
        SUBSCRIBE => {
            if body.remaining() < 2 {
                return Reply::Close;
            }
            let [hi, lo] = body.get_u16().to_be_bytes();
            if skip_properties(&mut body).is_none() {
                return Reply::Close;
            }

            let mut granted = Vec::new();
            while body.has_remaining() {
                let Some(filter) = read_string(&mut body) else {
                    return Reply::Close;
                };
                if !body.has_remaining() {
                    return Reply::Close;
                }
                let options = body.get_u8();
                state
                    .subscriptions
                    .push((connection.unwrap_or(0), filter));
                granted.push(options & 0x03);
            }

            // packet id + empty properties + one reason code per filter
            let mut suback = vec![0x90, (3 + granted.len()) as u8, hi, lo, 0x00];
            suback.extend(granted);
            Reply::Send(suback)
        }
        PINGREQ => Reply::Send(vec![0xD0, 0x00]),
        DISCONNECT => Reply::Close,
        _ => Reply::Nothing,
    }
}

fn connack(receive_maximum: Option<u16>) -> Vec<u8> {
    match receive_maximum {
        Some(maximum) => {
            let [hi, lo] = maximum.to_be_bytes();
            vec![0x20, 0x06, 0x00, 0x00, 0x03, RECEIVE_MAXIMUM, hi, lo]
        }
        None => vec![0x20, 0x03, 0x00, 0x00, 0x00],
    }
}

/// Split one complete packet off the front of `buf`
fn take_packet(buf: &mut BytesMut) -> Option<(u8, Bytes)> {
    let mut remaining = 0usize;
    let mut pos = 1;
    for shift in [0, 7, 14, 21] {
        let byte = *buf.get(pos)?;
        pos += 1;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            if buf.len() < pos + remaining {
                return None;
            }
            let header = buf[0];
            buf.advance(pos);
            return Some((header, buf.split_to(remaining).freeze()));
        }
    }
    None
}

fn read_varint(body: &mut Bytes) -> Option<usize> {
    let mut value = 0usize;
    for shift in [0, 7, 14, 21] {
        if !body.has_remaining() {
            return None;
        }
        let byte = body.get_u8();
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

fn skip_properties(body: &mut Bytes) -> Option<()> {
    let len = read_varint(body)?;
    if body.remaining() < len {
        return None;
    }
    body.advance(len);
    Some(())
}

fn read_string(body: &mut Bytes) -> Option<String> {
    if body.remaining() < 2 {
        return None;
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return None;
    }
    let raw = body.split_to(len);
    Some(String::from_utf8_lossy(&raw).into_owned())
}

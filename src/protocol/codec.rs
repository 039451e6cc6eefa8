//! Modbus TCP framing for "read holding registers" exchanges
//!
//! This module is pure: it builds request frames and validates response frames
//! without touching any socket. The device side of the exchange
//! ([`parse_request`], [`encode_response`]) lives here too so a simulated
//! controller speaks exactly the same wire format as the real link.
//!
//! Request frame (12 bytes, big-endian):
//!
//! ```text
//! [transaction:2][protocol=0x0000:2][length=0x0006:2][unit:1][function=0x03:1][start:2][count:2]
//! ```
//!
//! Response frame:
//!
//! ```text
//! [transaction:2][protocol:2][length:2][unit:1][function:1][byte_count:1][words: byte_count bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Modbus TCP protocol identifier (always zero)
pub const PROTOCOL_ID: u16 = 0x0000;

/// Function code for "read holding registers"
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Transaction id, protocol id, length and unit id
pub const MBAP_HEADER_LEN: usize = 7;

/// Bytes in a response up to and including the byte-count field
pub const RESPONSE_HEADER_LEN: usize = 9;

/// Bytes in an encoded read request
pub const REQUEST_LEN: usize = 12;

/// Largest register count a single read may ask for
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Largest frame the protocol allows (MBAP header + 253-byte PDU)
pub const MAX_FRAME_LEN: usize = 260;

const EXCEPTION_FLAG: u8 = 0x80;

/// Frame validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame too short: {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("Byte count mismatch: header declares {declared} bytes, payload has {actual}")]
    ByteCountMismatch { declared: usize, actual: usize },

    #[error("Transaction mismatch: expected {expected}, received {received}")]
    TransactionMismatch { expected: u16, received: u16 },

    #[error("Invalid protocol ID: {0:#06x}")]
    InvalidProtocolId(u16),

    #[error("Unexpected function code: {0:#04x}")]
    UnexpectedFunction(u8),

    #[error("Device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("Invalid MBAP length field: {0}")]
    InvalidLength(u16),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// A single "read holding registers" request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRequest {
    start_address: u16,
    count: u16,
    transaction_id: u16,
    unit_id: u8,
}

impl RegisterRequest {
    /// Build a request, rejecting counts outside `1..=MAX_REGISTERS_PER_READ`
    pub fn new(
        start_address: u16,
        count: u16,
        transaction_id: u16,
        unit_id: u8,
    ) -> Result<Self, DecodeError> {
        if count == 0 || count > MAX_REGISTERS_PER_READ {
            return Err(DecodeError::InvalidRequest(format!(
                "register count {count} outside 1..={MAX_REGISTERS_PER_READ}"
            )));
        }

        Ok(Self {
            start_address,
            count,
            transaction_id,
            unit_id,
        })
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }
}

/// Decoded register words from a validated response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    transaction_id: u16,
    unit_id: u8,
    words: Vec<u16>,
}

impl RegisterResponse {
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u16> {
        self.words
    }
}

/// Encode a read request into its 12-byte wire frame
pub fn encode(request: &RegisterRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_LEN);
    buf.put_u16(request.transaction_id);
    buf.put_u16(PROTOCOL_ID);
    // unit + function + start + count
    buf.put_u16(6);
    buf.put_u8(request.unit_id);
    buf.put_u8(READ_HOLDING_REGISTERS);
    buf.put_u16(request.start_address);
    buf.put_u16(request.count);
    buf.freeze()
}

/// Validate a response frame and extract its register words
///
/// Checks, in order: minimum length, transaction id, protocol id, exception
/// flag, function code, and finally that the declared byte count equals the
/// payload actually present. Nothing is truncated or padded.
pub fn decode(frame: &[u8], expected_transaction_id: u16) -> Result<RegisterResponse, DecodeError> {
    if frame.len() < RESPONSE_HEADER_LEN {
        return Err(DecodeError::FrameTooShort {
            len: frame.len(),
            min: RESPONSE_HEADER_LEN,
        });
    }

    let mut buf = frame;
    let transaction_id = buf.get_u16();
    let protocol_id = buf.get_u16();
    let _length = buf.get_u16();
    let unit_id = buf.get_u8();
    let function = buf.get_u8();

    if transaction_id != expected_transaction_id {
        return Err(DecodeError::TransactionMismatch {
            expected: expected_transaction_id,
            received: transaction_id,
        });
    }

    if protocol_id != PROTOCOL_ID {
        return Err(DecodeError::InvalidProtocolId(protocol_id));
    }

    if function & EXCEPTION_FLAG != 0 {
        return Err(DecodeError::Exception {
            function: function & !EXCEPTION_FLAG,
            code: buf.get_u8(),
        });
    }

    if function != READ_HOLDING_REGISTERS {
        return Err(DecodeError::UnexpectedFunction(function));
    }

    let declared = buf.get_u8() as usize;
    let actual = buf.remaining();
    if declared != actual || declared % 2 != 0 {
        return Err(DecodeError::ByteCountMismatch { declared, actual });
    }

    let words = (0..declared / 2).map(|_| buf.get_u16()).collect();

    Ok(RegisterResponse {
        transaction_id,
        unit_id,
        words,
    })
}

/// Total length of a response frame, read from its MBAP header
///
/// The length field counts the unit id and the PDU, so a frame spans
/// `6 + length` bytes. Lengths that cannot hold a minimal reply, or that
/// overrun [`MAX_FRAME_LEN`], are rejected before any further read.
pub fn response_frame_len(header: &[u8]) -> Result<usize, DecodeError> {
    if header.len() < MBAP_HEADER_LEN {
        return Err(DecodeError::FrameTooShort {
            len: header.len(),
            min: MBAP_HEADER_LEN,
        });
    }

    let length = u16::from_be_bytes([header[4], header[5]]);
    let total = MBAP_HEADER_LEN - 1 + length as usize;
    if !(RESPONSE_HEADER_LEN..=MAX_FRAME_LEN).contains(&total) {
        return Err(DecodeError::InvalidLength(length));
    }
    Ok(total)
}

/// Parse a read request as a device would receive it
pub fn parse_request(frame: &[u8]) -> Result<RegisterRequest, DecodeError> {
    if frame.len() < REQUEST_LEN {
        return Err(DecodeError::FrameTooShort {
            len: frame.len(),
            min: REQUEST_LEN,
        });
    }

    let mut buf = frame;
    let transaction_id = buf.get_u16();
    let protocol_id = buf.get_u16();
    let _length = buf.get_u16();
    let unit_id = buf.get_u8();
    let function = buf.get_u8();

    if protocol_id != PROTOCOL_ID {
        return Err(DecodeError::InvalidProtocolId(protocol_id));
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(DecodeError::UnexpectedFunction(function));
    }

    let start_address = buf.get_u16();
    let count = buf.get_u16();
    RegisterRequest::new(start_address, count, transaction_id, unit_id)
}

/// Encode a device reply carrying `words`
pub fn encode_response(transaction_id: u16, unit_id: u8, words: &[u16]) -> Bytes {
    let byte_count = words.len() * 2;
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + byte_count);
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    // unit + function + byte count + payload
    buf.put_u16((3 + byte_count) as u16);
    buf.put_u8(unit_id);
    buf.put_u8(READ_HOLDING_REGISTERS);
    buf.put_u8(byte_count as u8);
    for word in words {
        buf.put_u16(*word);
    }
    buf.freeze()
}

/// Encode a device exception reply
pub fn encode_exception(transaction_id: u16, unit_id: u8, code: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
    buf.put_u16(transaction_id);
    buf.put_u16(PROTOCOL_ID);
    buf.put_u16(3);
    buf.put_u8(unit_id);
    buf.put_u8(READ_HOLDING_REGISTERS | EXCEPTION_FLAG);
    buf.put_u8(code);
    buf.freeze()
}

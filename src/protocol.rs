//! Wire protocol for the qmdev publisher.
//!
//! Wire format (little-endian):
//! ```text
//! [message_id:4][payload_len:4][payload:N]
//! ```
//! One logical message may arrive split across several physical ZeroMQ
//! frames; the header always sits at the start of the first frame and the
//! payload continues into the following frames when needed.

use bytes::Bytes;
use thiserror::Error;

pub const HEARTBEAT_ID: u32 = 0x0732_4D6D;
pub const KEY_EVENT_ID: u32 = 0x0732_4D6E;
pub const PACK_EVENT_ID: u32 = 0x0732_4D6F;

/// Header size: message_id (4) + payload_len (4).
pub const HEADER_SIZE: usize = 8;

const KEY_EVENT_PAYLOAD_LEN: usize = 12;
const PACK_EVENT_LONG_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The first physical frame cannot hold the fixed header.
    #[error("first frame too small: need {HEADER_SIZE} bytes, got {0}")]
    FrameTooSmall(usize),

    /// The payload is shorter than the fixed layout of its message kind.
    #[error("{kind} payload too short: need {needed} bytes, got {available}")]
    ShortPayload {
        kind: &'static str,
        needed: usize,
        available: usize,
    },
}

/// One reassembled logical message, still undecoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub message_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub source_id: i32,
    pub key_code: i32,
    pub is_release: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackEvent {
    pub power_on: bool,
    pub degree: Option<i32>,
}

/// A decoded message, one variant per known message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Heartbeat,
    Key(KeyEvent),
    Pack(PackEvent),
    Unknown { message_id: u32 },
}

/// Reassemble the physical frames of one logical receive into a
/// [`WireMessage`].
///
/// The declared payload length wins in both directions: surplus bytes are
/// truncated and the payload is extended with the follow-up frames when the
/// first frame does not hold all of it.
pub fn read_message(frames: &[Bytes]) -> Result<WireMessage, ProtocolError> {
    let first = frames.first().map(|f| f.as_ref()).unwrap_or(&[]);
    if first.len() < HEADER_SIZE {
        return Err(ProtocolError::FrameTooSmall(first.len()));
    }

    let message_id = u32::from_le_bytes([first[0], first[1], first[2], first[3]]);
    let payload_len = u32::from_le_bytes([first[4], first[5], first[6], first[7]]) as usize;

    let remaining = &first[HEADER_SIZE..];
    let payload = if remaining.len() >= payload_len {
        remaining[..payload_len].to_vec()
    } else {
        let mut buf = remaining.to_vec();
        for frame in &frames[1..] {
            buf.extend_from_slice(frame);
        }
        buf.truncate(payload_len);
        buf
    };

    Ok(WireMessage {
        message_id,
        payload,
    })
}

/// Encode one logical message into a single frame.
pub fn encode_message(message_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&message_id.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode the payload of a [`WireMessage`] according to its message id.
///
/// Unrecognized ids map to [`Event::Unknown`]; only a payload shorter than
/// its fixed layout is an error. Malformed input never panics.
pub fn decode_event(message: &WireMessage) -> Result<Event, ProtocolError> {
    match message.message_id {
        HEARTBEAT_ID => Ok(Event::Heartbeat),
        KEY_EVENT_ID => decode_key_event(&message.payload).map(Event::Key),
        PACK_EVENT_ID => decode_pack_event(&message.payload).map(Event::Pack),
        other => Ok(Event::Unknown { message_id: other }),
    }
}

fn decode_key_event(payload: &[u8]) -> Result<KeyEvent, ProtocolError> {
    if payload.len() < KEY_EVENT_PAYLOAD_LEN {
        return Err(ProtocolError::ShortPayload {
            kind: "key event",
            needed: KEY_EVENT_PAYLOAD_LEN,
            available: payload.len(),
        });
    }
    let source_id = read_i32_le(payload, 0);
    let key_code = read_i32_le(payload, 4);
    let is_release = read_i32_le(payload, 8) != 0;
    Ok(KeyEvent {
        source_id,
        key_code,
        is_release,
    })
}

/// Pack events come in two layouts, told apart by the byte count alone:
/// 8 bytes carry `(power_on: i32, degree: i32)`, a single byte carries just
/// the on/off flag.
fn decode_pack_event(payload: &[u8]) -> Result<PackEvent, ProtocolError> {
    if payload.len() >= PACK_EVENT_LONG_LEN {
        return Ok(PackEvent {
            power_on: read_i32_le(payload, 0) != 0,
            degree: Some(read_i32_le(payload, 4)),
        });
    }
    match payload.first() {
        Some(&flag) => Ok(PackEvent {
            power_on: flag != 0,
            degree: None,
        }),
        None => Err(ProtocolError::ShortPayload {
            kind: "pack event",
            needed: 1,
            available: 0,
        }),
    }
}

fn read_i32_le(payload: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

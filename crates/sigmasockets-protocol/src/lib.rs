//! sigmasockets-protocol: the binary wire envelope and frozen message catalogue.
//!
//! Every frame is a tagged union encoded as `[u8 tag][fields...]` in network
//! byte order. There is no streaming: `encode`/`decode` operate on one
//! self-contained buffer, the same size as a single WebSocket binary message.
//! Unknown tags are rejected rather than silently ignored — new variants are
//! a schema change, not an open extension point.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read};

/// Hard cap on a whole encoded frame, enforced by callers before decoding;
/// the codec itself enforces [`MAX_PAYLOAD_SIZE`] and [`MAX_STRING_FIELD`]
/// since those are intrinsic to decoding without overallocating for hostile
/// input.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
/// Cap on a `Data` frame's payload.
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024;
/// Cap on any string field (`session_id`, `client_version`, `reason`, error `message`).
pub const MAX_STRING_FIELD: usize = 1024;

const TAG_CONNECT: u8 = 0;
const TAG_DISCONNECT: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_HEARTBEAT: u8 = 3;
const TAG_RECONNECT: u8 = 4;
const TAG_ERROR: u8 = 5;

/// Frozen numeric error codes carried in wire `Error` frames.
///
/// No stack traces or internal detail ever cross the wire — only a code and
/// a short message.
pub mod error_code {
    pub const DECODE_ERROR: u32 = 1;
    pub const VALIDATION_ERROR: u32 = 2;
    pub const RATE_LIMITED: u32 = 3;
    pub const PROTOCOL_ERROR: u32 = 4;
    pub const SESSION_NOT_FOUND: u32 = 5;
    pub const SESSION_EXPIRED: u32 = 6;
    pub const SESSION_REPLACED: u32 = 7;
    pub const INTERNAL_ERROR: u32 = 8;
}

/// WebSocket close codes used when terminating a connection.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const SLOW_CONSUMER: u16 = 4000;
    pub const SESSION_REPLACED: u16 = 4001;
    pub const SESSION_EXPIRED: u16 = 4002;
}

/// A single wire frame. Every variant is a structured record; decoding
/// always yields exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Connect {
        session_id: String,
        client_version: String,
    },
    Reconnect {
        session_id: String,
        last_message_id: u64,
    },
    Disconnect {
        reason: Option<String>,
    },
    Data {
        payload: Vec<u8>,
        message_id: u64,
        timestamp: u64,
    },
    Heartbeat {
        timestamp: u64,
    },
    Error {
        code: u32,
        message: String,
    },
}

impl Envelope {
    /// A short name for logging, never a user-facing field.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect { .. } => "connect",
            Envelope::Reconnect { .. } => "reconnect",
            Envelope::Disconnect { .. } => "disconnect",
            Envelope::Data { .. } => "data",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::Error { .. } => "error",
        }
    }
}

/// Decode failures. Never leaks partial/garbage data back to the caller —
/// every arm is a terminal classification of why the bytes didn't parse.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame ended before a required field could be read")]
    TruncatedHeader,
    #[error("unrecognized variant tag {0}")]
    UnknownVariantTag(u8),
    #[error("field {0} was out of the allowed range")]
    OutOfRangeField(&'static str),
    #[error("payload exceeded the maximum size of {MAX_PAYLOAD_SIZE} bytes")]
    PayloadOversize,
}

impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        // Every read in this module only fails with UnexpectedEof.
        DecodeError::TruncatedHeader
    }
}

/// Encode a frame to its wire representation. Deterministic: the same value
/// always produces the same bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::new();
    match envelope {
        Envelope::Connect {
            session_id,
            client_version,
        } => {
            buf.write_u8(TAG_CONNECT).expect("write to Vec never fails");
            write_string(&mut buf, session_id);
            write_string(&mut buf, client_version);
        }
        Envelope::Reconnect {
            session_id,
            last_message_id,
        } => {
            buf.write_u8(TAG_RECONNECT).expect("write to Vec never fails");
            write_string(&mut buf, session_id);
            buf.write_u64::<BigEndian>(*last_message_id)
                .expect("write to Vec never fails");
        }
        Envelope::Disconnect { reason } => {
            buf.write_u8(TAG_DISCONNECT).expect("write to Vec never fails");
            match reason {
                Some(r) => {
                    buf.write_u8(1).expect("write to Vec never fails");
                    write_string(&mut buf, r);
                }
                None => buf.write_u8(0).expect("write to Vec never fails"),
            }
        }
        Envelope::Data {
            payload,
            message_id,
            timestamp,
        } => {
            buf.write_u8(TAG_DATA).expect("write to Vec never fails");
            buf.write_u64::<BigEndian>(*message_id)
                .expect("write to Vec never fails");
            buf.write_u64::<BigEndian>(*timestamp)
                .expect("write to Vec never fails");
            write_bytes(&mut buf, payload);
        }
        Envelope::Heartbeat { timestamp } => {
            buf.write_u8(TAG_HEARTBEAT).expect("write to Vec never fails");
            buf.write_u64::<BigEndian>(*timestamp)
                .expect("write to Vec never fails");
        }
        Envelope::Error { code, message } => {
            buf.write_u8(TAG_ERROR).expect("write to Vec never fails");
            buf.write_u32::<BigEndian>(*code)
                .expect("write to Vec never fails");
            write_string(&mut buf, message);
        }
    }
    buf
}

/// Decode a single self-contained frame. An empty frame is a
/// [`DecodeError::TruncatedHeader`]; a tag outside the declared enumeration
/// is a [`DecodeError::UnknownVariantTag`] rather than being silently
/// extended.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::TruncatedHeader);
    }
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::PayloadOversize);
    }
    let mut cur = Cursor::new(bytes);
    let tag = cur.read_u8()?;
    let envelope = match tag {
        TAG_CONNECT => Envelope::Connect {
            session_id: read_string(&mut cur)?,
            client_version: read_string(&mut cur)?,
        },
        TAG_RECONNECT => Envelope::Reconnect {
            session_id: read_string(&mut cur)?,
            last_message_id: cur.read_u64::<BigEndian>()?,
        },
        TAG_DISCONNECT => {
            let has_reason = cur.read_u8()?;
            let reason = match has_reason {
                0 => None,
                1 => Some(read_string(&mut cur)?),
                _ => return Err(DecodeError::OutOfRangeField("disconnect.reason_present")),
            };
            Envelope::Disconnect { reason }
        }
        TAG_DATA => {
            let message_id = cur.read_u64::<BigEndian>()?;
            let timestamp = cur.read_u64::<BigEndian>()?;
            let payload = read_bytes(&mut cur, MAX_PAYLOAD_SIZE)?;
            Envelope::Data {
                payload,
                message_id,
                timestamp,
            }
        }
        TAG_HEARTBEAT => Envelope::Heartbeat {
            timestamp: cur.read_u64::<BigEndian>()?,
        },
        TAG_ERROR => Envelope::Error {
            code: cur.read_u32::<BigEndian>()?,
            message: read_string(&mut cur)?,
        },
        other => return Err(DecodeError::UnknownVariantTag(other)),
    };
    Ok(envelope)
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_bytes(buf, s.as_bytes());
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.write_u32::<BigEndian>(data.len() as u32)
        .expect("write to Vec never fails");
    buf.extend_from_slice(data);
}

fn read_bytes(cur: &mut Cursor<&[u8]>, max_len: usize) -> Result<Vec<u8>, DecodeError> {
    let len = cur.read_u32::<BigEndian>()? as usize;
    if len > max_len {
        return Err(DecodeError::PayloadOversize);
    }
    let mut data = vec![0u8; len];
    cur.read_exact(&mut data)?;
    Ok(data)
}

fn read_string(cur: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let bytes = read_bytes(cur, MAX_STRING_FIELD)?;
    String::from_utf8(bytes).map_err(|_| DecodeError::OutOfRangeField("string field was not valid UTF-8"))
}

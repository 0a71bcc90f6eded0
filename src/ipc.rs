//! Local IPC frame format.
//!
//! Frames exchanged with local clients over the Unix socket:
//!
//! ```text
//! u64 LE length | u16 LE request id | u8 kind | u8 return code | body...
//!               └──────────────────── counted by the length ────────────┘
//! ```
//!
//! Request/answer pairing is by request id: an [`IpcKind::Answer`] frame
//! carries the id of the frame it answers. Unknown kinds are a protocol
//! fault for that frame only; the connection survives.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::net::StreamSocket;
use crate::connection::{BufferReader, ReadProgress};
use crate::wire::Message;
use crate::{InstanceId, ServiceIdentity};

/// Bytes of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Bytes of the frame header counted by the length prefix.
pub const HEADER_SIZE: usize = 4;

/// Kinds of local IPC frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcKind {
    Ping = 0x01,
    Pong = 0x02,
    /// An embedded SOME/IP message (instance id + header + payload).
    SendMessage = 0x03,
    RegisterService = 0x04,
    UnregisterService = 0x05,
    SubscribeNotification = 0x06,
    GetServiceList = 0x07,
    DumpState = 0x08,
    /// Reply to a request frame, matched by request id.
    Answer = 0x09,
    /// Registry delta / initial registry push to clients.
    ServicesRegistered = 0x0A,
    ServicesUnregistered = 0x0B,
}

impl IpcKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Ping),
            0x02 => Some(Self::Pong),
            0x03 => Some(Self::SendMessage),
            0x04 => Some(Self::RegisterService),
            0x05 => Some(Self::UnregisterService),
            0x06 => Some(Self::SubscribeNotification),
            0x07 => Some(Self::GetServiceList),
            0x08 => Some(Self::DumpState),
            0x09 => Some(Self::Answer),
            0x0A => Some(Self::ServicesRegistered),
            0x0B => Some(Self::ServicesUnregistered),
            _ => None,
        }
    }
}

/// Return code carried in answer frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcReturnCode {
    Undefined = 0x00,
    Ok = 0x01,
    Error = 0x02,
}

impl IpcReturnCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => Self::Ok,
            0x02 => Self::Error,
            _ => Self::Undefined,
        }
    }
}

/// One local IPC frame.
#[derive(Debug, Clone)]
pub struct IpcMessage {
    pub request_id: u16,
    pub kind: IpcKind,
    pub return_code: IpcReturnCode,
    pub body: Bytes,
}

impl IpcMessage {
    pub fn new(kind: IpcKind, body: Bytes) -> Self {
        Self {
            request_id: 0,
            kind,
            return_code: IpcReturnCode::Undefined,
            body,
        }
    }

    /// Build the answer to a request frame.
    pub fn answer_to(request: &IpcMessage, return_code: IpcReturnCode, body: Bytes) -> Self {
        Self {
            request_id: request.request_id,
            kind: IpcKind::Answer,
            return_code,
            body,
        }
    }

    /// Encode the frame including its length prefix.
    pub fn encode(&self) -> Bytes {
        let body_len = HEADER_SIZE + self.body.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
        buf.put_u64_le(body_len as u64);
        buf.put_u16_le(self.request_id);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.return_code as u8);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }

    /// Decode a frame body (everything after the length prefix). Returns
    /// `None` for short bodies or unknown kinds.
    pub fn decode_body(mut body: &[u8]) -> Option<Self> {
        if body.len() < HEADER_SIZE {
            return None;
        }
        let request_id = body.get_u16_le();
        let kind = IpcKind::from_u8(body.get_u8())?;
        let return_code = IpcReturnCode::from_u8(body.get_u8());
        Some(Self {
            request_id,
            kind,
            return_code,
            body: Bytes::copy_from_slice(body),
        })
    }
}

// ============================================================================
// BODY CODECS
// ============================================================================

/// Encode a (service, instance) identity into a frame body.
pub fn put_identity(buf: &mut impl BufMut, identity: ServiceIdentity) {
    buf.put_u16_le(identity.service_id);
    buf.put_u16_le(identity.instance_id);
}

/// Decode a (service, instance) identity from a frame body.
pub fn get_identity(buf: &mut impl Buf) -> Option<ServiceIdentity> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(ServiceIdentity::new(buf.get_u16_le(), buf.get_u16_le()))
}

/// Body of RegisterService / UnregisterService.
pub fn encode_identity_body(identity: ServiceIdentity) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    put_identity(&mut buf, identity);
    buf.freeze()
}

/// Body of SubscribeNotification: identity + member id.
pub fn encode_subscription_body(identity: ServiceIdentity, member_id: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    put_identity(&mut buf, identity);
    buf.put_u16_le(member_id);
    buf.freeze()
}

pub fn decode_subscription_body(mut body: &[u8]) -> Option<(ServiceIdentity, u16)> {
    let identity = get_identity(&mut body)?;
    if body.remaining() < 2 {
        return None;
    }
    Some((identity, body.get_u16_le()))
}

/// Body of ServicesRegistered / ServicesUnregistered / GetServiceList
/// answers: a flat run of identities.
pub fn encode_identity_list(identities: &[ServiceIdentity]) -> Bytes {
    let mut buf = BytesMut::with_capacity(identities.len() * 4);
    for identity in identities {
        put_identity(&mut buf, *identity);
    }
    buf.freeze()
}

pub fn decode_identity_list(mut body: &[u8]) -> Vec<ServiceIdentity> {
    let mut identities = Vec::with_capacity(body.len() / 4);
    while let Some(identity) = get_identity(&mut body) {
        identities.push(identity);
    }
    identities
}

/// Sentinel client identifier in SendMessage bodies for a message with no
/// reply target. The dispatcher never assigns it to a client.
pub const NO_CLIENT: u16 = u16::MAX;

/// Body of SendMessage: instance id, the reply-routing client identifier
/// ([`NO_CLIENT`] when unset), then the embedded SOME/IP message in its
/// wire encoding. The identifier rides next to the message rather than in
/// its RequestID, so the embedded header crosses the socket untouched; a
/// client answering a request echoes it back alongside its reply.
pub fn encode_message_body(message: &Message) -> Bytes {
    let wire = message.serialize();
    let mut buf = BytesMut::with_capacity(4 + wire.len());
    buf.put_u16_le(message.instance_id);
    buf.put_u16_le(message.client_identifier.unwrap_or(NO_CLIENT));
    buf.extend_from_slice(&wire);
    buf.freeze()
}

pub fn decode_message_body(mut body: &[u8]) -> Option<Message> {
    if body.remaining() < 4 {
        return None;
    }
    let instance_id: InstanceId = body.get_u16_le();
    let client = body.get_u16_le();
    let mut message = Message::parse(&mut body)?;
    message.instance_id = instance_id;
    message.client_identifier = (client != NO_CLIENT).then_some(client);
    Some(message)
}

// ============================================================================
// FRAME READER
// ============================================================================

/// Result of pumping an [`IpcFrameReader`].
#[derive(Debug)]
pub enum IpcFrameProgress {
    /// A complete frame was assembled and decoded.
    Frame(IpcMessage),
    /// The socket ran dry mid-frame.
    NeedMore,
    /// The peer closed the stream.
    Closed,
}

enum IpcPhase {
    Length,
    Body,
}

/// Incremental reassembly of IPC frames: 8 length bytes, then the body.
pub struct IpcFrameReader {
    phase: IpcPhase,
    reader: BufferReader,
}

/// Upper bound on one frame; anything larger is treated as desync.
const MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

impl IpcFrameReader {
    pub fn new() -> Self {
        Self {
            phase: IpcPhase::Length,
            reader: BufferReader::new(LENGTH_PREFIX_SIZE),
        }
    }

    /// Advance as far as the socket allows; returns the first complete
    /// frame. Frames with unknown kinds are dropped with a warning.
    pub fn read<T: StreamSocket>(&mut self, io: &T) -> crate::Result<IpcFrameProgress> {
        loop {
            match self.reader.read(io)? {
                ReadProgress::Incomplete => return Ok(IpcFrameProgress::NeedMore),
                ReadProgress::Closed => return Ok(IpcFrameProgress::Closed),
                ReadProgress::Complete => {}
            }

            match self.phase {
                IpcPhase::Length => {
                    let raw = self.reader.bytes();
                    let length = u64::from_le_bytes([
                        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                    ]);
                    if length < HEADER_SIZE as u64 || length > MAX_FRAME_SIZE {
                        return Err(crate::Error::protocol(format!(
                            "implausible IPC frame length {length}"
                        )));
                    }
                    self.reader.take_and_reset(length as usize);
                    self.phase = IpcPhase::Body;
                }
                IpcPhase::Body => {
                    let body = self.reader.take_and_reset(LENGTH_PREFIX_SIZE);
                    self.phase = IpcPhase::Length;
                    match IpcMessage::decode_body(&body) {
                        Some(frame) => return Ok(IpcFrameProgress::Frame(frame)),
                        None => {
                            tracing::warn!("dropping IPC frame with unknown kind");
                        }
                    }
                }
            }
        }
    }
}

impl Default for IpcFrameReader {
    fn default() -> Self {
        Self::new()
    }
}

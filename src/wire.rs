//! SOME/IP wire format serialization and parsing.
//!
//! This module handles encoding and decoding of SOME/IP messages and
//! embedded service discovery payloads, plus the RequestID tagging used to
//! multiplex several local clients over one TCP connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::{ClientIdentifier, InstanceId, MemberId, ServiceId};

/// SOME/IP protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Interface version for SD
pub const SD_INTERFACE_VERSION: u8 = 0x01;

/// Return code: no error
pub const E_OK: u8 = 0x00;

/// Return code: the requested service is not known to the dispatcher
pub const E_UNKNOWN_SERVICE: u8 = 0x02;

/// SOME/IP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Request),
            0x01 => Some(Self::RequestNoReturn),
            0x02 => Some(Self::Notification),
            0x80 => Some(Self::Response),
            0x81 => Some(Self::Error),
            _ => None,
        }
    }
}

// ============================================================================
// MESSAGE ID PACKING
// ============================================================================

/// Pack a service and member identifier into a 32-bit MessageID.
pub fn message_id(service_id: ServiceId, member_id: MemberId) -> u32 {
    ((service_id as u32) << 16) | member_id as u32
}

/// Extract the service identifier (high 16 bits) from a MessageID.
pub fn service_id(message_id: u32) -> ServiceId {
    (message_id >> 16) as u16
}

/// Extract the member identifier (low 16 bits) from a MessageID.
pub fn member_id(message_id: u32) -> MemberId {
    (message_id & 0xFFFF) as u16
}

// ============================================================================
// REQUEST ID TAGGING
// ============================================================================

/// Overwrite the high 16 bits of a RequestID with a client identifier,
/// keeping the low 16 bits (the client's own request counter).
///
/// Used on requests sent over a shared TCP connection so the peer's reply
/// carries enough information to route it back to the right local client.
pub fn tag_client_identifier(request_id: u32, client: ClientIdentifier) -> u32 {
    ((client as u32) << 16) | (request_id & 0xFFFF)
}

/// Read the client identifier out of the high 16 bits of a RequestID.
pub fn extract_client_identifier(request_id: u32) -> ClientIdentifier {
    (request_id >> 16) as u16
}

/// Zero the high 16 bits of a RequestID, restoring the client's view of it.
pub fn clear_client_identifier(request_id: u32) -> u32 {
    request_id & 0xFFFF
}

// ============================================================================
// HEADER
// ============================================================================

/// SOME/IP header (16 bytes, network byte order)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Service ID (high half of the MessageID)
    pub service_id: ServiceId,
    /// Method ID or Event ID (low half of the MessageID)
    pub member_id: MemberId,
    /// Length of everything after the length field itself: 8 header bytes
    /// plus the payload
    pub length: u32,
    /// Request ID; the high 16 bits are repurposed for client-identifier
    /// tagging on shared TCP connections
    pub request_id: u32,
    /// Protocol version (always 0x01)
    pub protocol_version: u8,
    /// Interface version
    pub interface_version: u8,
    /// Message type
    pub message_type: MessageType,
    /// Return code
    pub return_code: u8,
}

impl Header {
    pub const SIZE: usize = 16;

    /// Build a header for the given payload length.
    pub fn new(
        service_id: ServiceId,
        member_id: MemberId,
        request_id: u32,
        message_type: MessageType,
        payload_len: usize,
    ) -> Self {
        Self {
            service_id,
            member_id,
            length: 8 + payload_len as u32,
            request_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: PROTOCOL_VERSION,
            message_type,
            return_code: E_OK,
        }
    }

    /// Parse a header from bytes. Returns `None` for short input or an
    /// unknown message type (a protocol fault; use [`peek_length`] when the
    /// frame must still be skipped).
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        let service_id = buf.get_u16();
        let member_id = buf.get_u16();
        let length = buf.get_u32();
        let request_id = buf.get_u32();
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type_raw = buf.get_u8();
        let return_code = buf.get_u8();

        let message_type = MessageType::from_u8(message_type_raw)?;

        Some(Self {
            service_id,
            member_id,
            length,
            request_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    /// Serialize the header to bytes
    pub fn serialize(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.service_id);
        buf.put_u16(self.member_id);
        buf.put_u32(self.length);
        buf.put_u32(self.request_id);
        buf.put_u8(self.protocol_version);
        buf.put_u8(self.interface_version);
        buf.put_u8(self.message_type as u8);
        buf.put_u8(self.return_code);
    }

    /// The packed 32-bit MessageID.
    pub fn message_id(&self) -> u32 {
        message_id(self.service_id, self.member_id)
    }

    /// Get the payload length (excluding the 8 header bytes counted in the
    /// length field)
    pub fn payload_length(&self) -> usize {
        self.length.saturating_sub(8) as usize
    }

    /// Response or Error: routed back via the out-of-band client identifier.
    pub fn is_reply(&self) -> bool {
        matches!(self.message_type, MessageType::Response | MessageType::Error)
    }

    pub fn is_notification(&self) -> bool {
        self.message_type == MessageType::Notification
    }

    /// A request the sender expects an answer to.
    pub fn is_request_with_return(&self) -> bool {
        self.message_type == MessageType::Request
    }

    /// Build the header of an Error reply to this request: same MessageID and
    /// RequestID, empty payload.
    pub fn error_reply(&self) -> Header {
        Header {
            service_id: self.service_id,
            member_id: self.member_id,
            length: 8,
            request_id: self.request_id,
            protocol_version: PROTOCOL_VERSION,
            interface_version: self.interface_version,
            message_type: MessageType::Error,
            return_code: E_UNKNOWN_SERVICE,
        }
    }
}

/// Read the length field out of a raw 16-byte header without interpreting
/// the rest. Lets framing skip a message whose type byte is unknown.
pub fn peek_length(raw_header: &[u8]) -> Option<u32> {
    if raw_header.len() < 8 {
        return None;
    }
    Some(u32::from_be_bytes([
        raw_header[4],
        raw_header[5],
        raw_header[6],
        raw_header[7],
    ]))
}

// ============================================================================
// MESSAGE
// ============================================================================

/// A complete SOME/IP message: header, opaque payload, and the two
/// out-of-band fields the dispatcher routes by.
///
/// The instance identifier is not part of the wire format; transports stamp
/// it (local clients pass it explicitly, TCP peers via their per-peer
/// service namespace). The client identifier is only meaningful for replies.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
    /// Which client the reply should be routed to. Set on requests by the
    /// dispatcher and set on inbound TCP replies by untagging the RequestID;
    /// crosses local IPC in the frame body, next to the message.
    pub client_identifier: Option<ClientIdentifier>,
    /// Instance the message addresses, stamped by the transport.
    pub instance_id: InstanceId,
}

impl Message {
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self {
            header,
            payload,
            client_identifier: None,
            instance_id: 0,
        }
    }

    /// Parse a message from bytes
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        let header = Header::parse(buf)?;
        let payload_len = header.payload_length();

        if buf.remaining() < payload_len {
            return None;
        }

        let payload = buf.copy_to_bytes(payload_len);

        Some(Self::new(header, payload))
    }

    /// Serialize the message to bytes. The length field is recomputed from
    /// the payload so a modified message cannot go out inconsistent.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Header::SIZE + self.payload.len());
        let mut header = self.header.clone();
        header.length = 8 + self.payload.len() as u32;
        header.serialize(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

// ============================================================================
// SERVICE DISCOVERY MESSAGES
// ============================================================================

/// SD message identifiers
pub const SD_SERVICE_ID: u16 = 0xFFFF;
pub const SD_MEMBER_ID: u16 = 0x8100;
pub const SD_MESSAGE_ID: u32 = 0xFFFF_8100;

/// L4 protocol carried in an endpoint option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportProtocol {
    Tcp = 0x06,
    Udp = 0x11,
}

impl TransportProtocol {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x06 => Some(Self::Tcp),
            0x11 => Some(Self::Udp),
            _ => None,
        }
    }
}

/// Kinds of service entries (type 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceEntryKind {
    FindService = 0x00,
    OfferService = 0x01,
}

/// Kinds of eventgroup entries (type 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventgroupEntryKind {
    Subscribe = 0x06,
    SubscribeAck = 0x07,
}

/// FindService / OfferService entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub kind: ServiceEntryKind,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    /// 24-bit; 0 withdraws an offer, 0xFFFFFF never expires
    pub ttl: u32,
    pub minor_version: u32,
    pub index_first_option: u8,
    pub option_count: u8,
}

/// Subscribe / SubscribeAck entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventgroupEntry {
    pub kind: EventgroupEntryKind,
    pub service_id: u16,
    pub instance_id: u16,
    pub major_version: u8,
    /// 24-bit; 0 unsubscribes (or, on an ack, rejects)
    pub ttl: u32,
    pub eventgroup_id: u16,
    pub index_first_option: u8,
    pub option_count: u8,
}

/// A parsed SD entry. The two wire layouts share their first 12 bytes and
/// diverge in the last 4, hence the sum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdEntry {
    Service(ServiceEntry),
    Eventgroup(EventgroupEntry),
}

impl SdEntry {
    pub const SIZE: usize = 16;

    /// Parse one entry, always consuming exactly 16 bytes. Returns `None`
    /// (bytes consumed) for unknown entry kinds so the caller can skip them.
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }

        let kind = buf.get_u8();
        let index_first_option = buf.get_u8();
        let _index_second_option = buf.get_u8();
        let option_count = (buf.get_u8() >> 4) & 0x0F;
        let service_id = buf.get_u16();
        let instance_id = buf.get_u16();
        let major_version = buf.get_u8();
        let ttl = u32::from_be_bytes([0, buf.get_u8(), buf.get_u8(), buf.get_u8()]);
        let tail = [buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8()];

        match kind {
            0x00 | 0x01 => Some(SdEntry::Service(ServiceEntry {
                kind: if kind == 0x00 {
                    ServiceEntryKind::FindService
                } else {
                    ServiceEntryKind::OfferService
                },
                service_id,
                instance_id,
                major_version,
                ttl,
                minor_version: u32::from_be_bytes(tail),
                index_first_option,
                option_count,
            })),
            0x06 | 0x07 => Some(SdEntry::Eventgroup(EventgroupEntry {
                kind: if kind == 0x06 {
                    EventgroupEntryKind::Subscribe
                } else {
                    EventgroupEntryKind::SubscribeAck
                },
                service_id,
                instance_id,
                major_version,
                ttl,
                eventgroup_id: u16::from_be_bytes([tail[2], tail[3]]),
                index_first_option,
                option_count,
            })),
            _ => None,
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        let (kind, index_first_option, option_count) = match self {
            SdEntry::Service(e) => (e.kind as u8, e.index_first_option, e.option_count),
            SdEntry::Eventgroup(e) => (e.kind as u8, e.index_first_option, e.option_count),
        };
        buf.put_u8(kind);
        buf.put_u8(index_first_option);
        buf.put_u8(0); // index of second option run (unused)
        buf.put_u8(option_count << 4);
        buf.put_u16(self.service_id());
        buf.put_u16(self.instance_id());
        buf.put_u8(self.major_version());
        let ttl = self.ttl();
        buf.put_u8((ttl >> 16) as u8);
        buf.put_u8((ttl >> 8) as u8);
        buf.put_u8(ttl as u8);
        match self {
            SdEntry::Service(e) => buf.put_u32(e.minor_version),
            SdEntry::Eventgroup(e) => {
                buf.put_u16(0); // reserved
                buf.put_u16(e.eventgroup_id);
            }
        }
    }

    pub fn service_id(&self) -> u16 {
        match self {
            SdEntry::Service(e) => e.service_id,
            SdEntry::Eventgroup(e) => e.service_id,
        }
    }

    pub fn instance_id(&self) -> u16 {
        match self {
            SdEntry::Service(e) => e.instance_id,
            SdEntry::Eventgroup(e) => e.instance_id,
        }
    }

    pub fn major_version(&self) -> u8 {
        match self {
            SdEntry::Service(e) => e.major_version,
            SdEntry::Eventgroup(e) => e.major_version,
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            SdEntry::Service(e) => e.ttl,
            SdEntry::Eventgroup(e) => e.ttl,
        }
    }

    /// Range of option indices this entry references.
    pub fn option_range(&self) -> std::ops::Range<usize> {
        let (first, count) = match self {
            SdEntry::Service(e) => (e.index_first_option, e.option_count),
            SdEntry::Eventgroup(e) => (e.index_first_option, e.option_count),
        };
        first as usize..first as usize + count as usize
    }

    /// Create an OfferService entry
    pub fn offer(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        ttl: u32,
        index_first_option: u8,
        option_count: u8,
    ) -> Self {
        SdEntry::Service(ServiceEntry {
            kind: ServiceEntryKind::OfferService,
            service_id,
            instance_id,
            major_version,
            ttl,
            minor_version: 0,
            index_first_option,
            option_count,
        })
    }

    /// Create a StopOfferService entry (OfferService with TTL=0)
    pub fn stop_offer(
        service_id: u16,
        instance_id: u16,
        major_version: u8,
        index_first_option: u8,
        option_count: u8,
    ) -> Self {
        Self::offer(service_id, instance_id, major_version, 0, index_first_option, option_count)
    }

    /// Create a FindService entry
    pub fn find(service_id: u16, instance_id: u16) -> Self {
        SdEntry::Service(ServiceEntry {
            kind: ServiceEntryKind::FindService,
            service_id,
            instance_id,
            major_version: 0xFF,
            ttl: TTL_FOREVER_ENTRY,
            minor_version: 0xFFFF_FFFF,
            index_first_option: 0,
            option_count: 0,
        })
    }

    /// Create a Subscribe entry
    pub fn subscribe(service_id: u16, instance_id: u16, eventgroup_id: u16, ttl: u32) -> Self {
        SdEntry::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryKind::Subscribe,
            service_id,
            instance_id,
            major_version: PROTOCOL_VERSION,
            ttl,
            eventgroup_id,
            index_first_option: 0,
            option_count: 0,
        })
    }

    /// Create a SubscribeAck entry
    pub fn subscribe_ack(service_id: u16, instance_id: u16, eventgroup_id: u16, ttl: u32) -> Self {
        SdEntry::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryKind::SubscribeAck,
            service_id,
            instance_id,
            major_version: PROTOCOL_VERSION,
            ttl,
            eventgroup_id,
            index_first_option: 0,
            option_count: 0,
        })
    }
}

const TTL_FOREVER_ENTRY: u32 = 0xFF_FFFF;

/// SD option (IPv4 endpoint, or anything we don't understand)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        addr: Ipv4Addr,
        port: u16,
        protocol: TransportProtocol,
    },
    Unknown {
        option_type: u8,
        data: Bytes,
    },
}

impl SdOption {
    const IPV4_ENDPOINT_TYPE: u8 = 0x04;

    /// Parse an option from bytes
    pub fn parse(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 3 {
            return None;
        }

        let length = buf.get_u16() as usize;
        let option_type = buf.get_u8();

        if buf.remaining() < length {
            return None;
        }

        match option_type {
            Self::IPV4_ENDPOINT_TYPE => {
                if length < 9 {
                    return None;
                }
                let _reserved = buf.get_u8();
                let a = buf.get_u8();
                let b = buf.get_u8();
                let c = buf.get_u8();
                let d = buf.get_u8();
                let _reserved2 = buf.get_u8();
                let protocol = TransportProtocol::from_u8(buf.get_u8())?;
                let port = buf.get_u16();
                Some(SdOption::Ipv4Endpoint {
                    addr: Ipv4Addr::new(a, b, c, d),
                    port,
                    protocol,
                })
            }
            _ => {
                // Unknown option - keep the raw bytes so indices stay valid
                let data = buf.copy_to_bytes(length);
                Some(SdOption::Unknown { option_type, data })
            }
        }
    }

    pub fn serialize(&self, buf: &mut impl BufMut) {
        match self {
            SdOption::Ipv4Endpoint {
                addr,
                port,
                protocol,
            } => {
                buf.put_u16(9); // length
                buf.put_u8(Self::IPV4_ENDPOINT_TYPE);
                buf.put_u8(0); // reserved
                buf.put_slice(&addr.octets());
                buf.put_u8(0); // reserved
                buf.put_u8(*protocol as u8);
                buf.put_u16(*port);
            }
            SdOption::Unknown { option_type, data } => {
                buf.put_u16(data.len() as u16);
                buf.put_u8(*option_type);
                buf.put_slice(data);
            }
        }
    }

    /// Size in bytes when serialized
    pub fn size(&self) -> usize {
        match self {
            SdOption::Ipv4Endpoint { .. } => 12, // 2 + 1 + 9
            SdOption::Unknown { data, .. } => 3 + data.len(),
        }
    }
}

/// A service discovery message: flags, session, entries and the options the
/// entries reference by run-start index.
#[derive(Debug, Clone)]
pub struct SdMessage {
    pub flags: u8,
    /// Session counter, carried in the low 16 bits of the RequestID.
    pub session_id: u16,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdMessage {
    /// Reboot flag
    pub const FLAG_REBOOT: u8 = 0x80;
    /// Unicast flag
    pub const FLAG_UNICAST: u8 = 0x40;

    /// Create a new SD message. Flags and session are stamped at send time.
    pub fn new() -> Self {
        Self {
            flags: 0,
            session_id: 0,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn has_reboot_flag(&self) -> bool {
        self.flags & Self::FLAG_REBOOT != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.flags & Self::FLAG_UNICAST != 0
    }

    /// Add an entry and return its index
    pub fn add_entry(&mut self, entry: SdEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Add an option and return its index
    pub fn add_option(&mut self, option: SdOption) -> u8 {
        self.options.push(option);
        (self.options.len() - 1) as u8
    }

    /// Parse a complete SD datagram (SOME/IP header + SD payload). Returns
    /// `None` when the datagram is not an SD message or is malformed.
    pub fn parse_datagram(data: &[u8]) -> Option<Self> {
        let mut buf = data;
        let header = Header::parse(&mut buf)?;
        if header.message_id() != SD_MESSAGE_ID {
            return None;
        }
        let session_id = (header.request_id & 0xFFFF) as u16;
        Self::parse_payload(&mut buf, session_id)
    }

    /// Parse the SD payload following a SOME/IP header.
    pub fn parse_payload(buf: &mut impl Buf, session_id: u16) -> Option<Self> {
        if buf.remaining() < 8 {
            return None;
        }

        let flags = buf.get_u8();
        let _reserved = [buf.get_u8(), buf.get_u8(), buf.get_u8()];

        let entries_len = buf.get_u32() as usize;
        if buf.remaining() < entries_len {
            return None;
        }

        let mut entries = Vec::new();
        let mut consumed = 0;
        while consumed + SdEntry::SIZE <= entries_len {
            match SdEntry::parse(buf) {
                Some(entry) => entries.push(entry),
                // Unknown entry kind: its 16 bytes were consumed, skip it
                None => tracing::warn!("skipping SD entry of unknown kind"),
            }
            consumed += SdEntry::SIZE;
        }
        if consumed < entries_len {
            buf.advance(entries_len - consumed);
        }

        if buf.remaining() < 4 {
            return None;
        }
        let options_len = buf.get_u32() as usize;
        if buf.remaining() < options_len {
            return None;
        }

        let mut options = Vec::new();
        let options_end = buf.remaining() - options_len;
        while buf.remaining() > options_end {
            match SdOption::parse(buf) {
                Some(option) => options.push(option),
                None => {
                    tracing::warn!("malformed SD option run, discarding the rest");
                    break;
                }
            }
        }

        Some(Self {
            flags,
            session_id,
            entries,
            options,
        })
    }

    /// Serialize just the SD payload (without the SOME/IP header)
    pub fn serialize_payload(&self) -> Bytes {
        let entries_len = self.entries.len() * SdEntry::SIZE;
        let options_len: usize = self.options.iter().map(|o| o.size()).sum();

        let mut buf = BytesMut::with_capacity(12 + entries_len + options_len);

        buf.put_u8(self.flags);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(0);

        buf.put_u32(entries_len as u32);
        for entry in &self.entries {
            entry.serialize(&mut buf);
        }

        buf.put_u32(options_len as u32);
        for option in &self.options {
            option.serialize(&mut buf);
        }

        buf.freeze()
    }

    /// Serialize as a complete SOME/IP message (for UDP datagrams and for
    /// embedding in a TCP stream alike)
    pub fn serialize(&self) -> Bytes {
        let payload = self.serialize_payload();

        let header = Header {
            service_id: SD_SERVICE_ID,
            member_id: SD_MEMBER_ID,
            length: 8 + payload.len() as u32,
            request_id: self.session_id as u32,
            protocol_version: PROTOCOL_VERSION,
            interface_version: SD_INTERFACE_VERSION,
            message_type: MessageType::Notification,
            return_code: E_OK,
        };

        let mut buf = BytesMut::with_capacity(Header::SIZE + payload.len());
        header.serialize(&mut buf);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Look up the endpoint option an entry references, for one protocol.
    pub fn endpoint_for(
        &self,
        entry: &SdEntry,
        wanted: TransportProtocol,
    ) -> Option<SocketAddrV4> {
        for i in entry.option_range() {
            if let Some(SdOption::Ipv4Endpoint {
                addr,
                port,
                protocol,
            }) = self.options.get(i)
            {
                if *protocol == wanted {
                    return Some(SocketAddrV4::new(*addr, *port));
                }
            }
        }
        None
    }

    /// The TCP endpoint an entry references, if any.
    pub fn tcp_endpoint_for(&self, entry: &SdEntry) -> Option<SocketAddrV4> {
        self.endpoint_for(entry, TransportProtocol::Tcp)
    }
}

impl Default for SdMessage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(0x1234, 0x5678, 0x0001_0042, MessageType::Request, 8);

        let mut buf = BytesMut::new();
        header.serialize(&mut buf);
        assert_eq!(buf.len(), Header::SIZE);

        let mut cursor = buf.freeze();
        let parsed = Header::parse(&mut cursor).unwrap();

        assert_eq!(header, parsed);
        assert_eq!(parsed.message_id(), 0x1234_5678);
        assert_eq!(parsed.payload_length(), 8);
    }

    #[test]
    fn header_rejects_short_input() {
        let mut empty = Bytes::new();
        assert!(Header::parse(&mut empty).is_none());

        let mut almost = Bytes::from_static(&[0u8; 15]);
        assert!(Header::parse(&mut almost).is_none());
    }

    #[test]
    fn header_rejects_unknown_message_type() {
        let mut buf = BytesMut::new();
        Header::new(1, 2, 3, MessageType::Request, 0).serialize(&mut buf);
        buf[14] = 0x55; // not a valid message type
        let frozen = buf.freeze();
        let mut cursor = frozen.clone();
        assert!(Header::parse(&mut cursor).is_none());
        // The length is still recoverable for frame skipping
        assert_eq!(peek_length(&frozen), Some(8));
    }

    #[test]
    fn message_id_packing() {
        let mid = message_id(0xABCD, 0x1234);
        assert_eq!(mid, 0xABCD_1234);
        assert_eq!(service_id(mid), 0xABCD);
        assert_eq!(member_id(mid), 0x1234);
    }

    #[test]
    fn client_identifier_tag_roundtrip() {
        let original = 0x0000_0042;
        let tagged = tag_client_identifier(original, 7);
        assert_eq!(tagged, 0x0007_0042);
        assert_eq!(extract_client_identifier(tagged), 7);
        assert_eq!(clear_client_identifier(tagged), original);
    }

    #[test]
    fn tagging_overwrites_previous_tag() {
        let tagged = tag_client_identifier(tag_client_identifier(0x0042, 7), 9);
        assert_eq!(extract_client_identifier(tagged), 9);
        assert_eq!(clear_client_identifier(tagged), 0x0042);
    }

    #[test]
    fn message_serialize_recomputes_length() {
        let mut msg = Message::new(
            Header::new(0x1234, 0x0001, 1, MessageType::Request, 0),
            Bytes::from_static(b"abcd"),
        );
        msg.header.length = 99; // stale
        let bytes = msg.serialize();
        let mut cursor = bytes.clone();
        let parsed = Message::parse(&mut cursor).unwrap();
        assert_eq!(parsed.header.length, 12);
        assert_eq!(parsed.payload.as_ref(), b"abcd");
    }

    #[test]
    fn error_reply_mirrors_request_ids() {
        let request = Header::new(0x1234, 0x0001, 0x0007_0042, MessageType::Request, 4);
        let reply = request.error_reply();
        assert_eq!(reply.message_id(), request.message_id());
        assert_eq!(reply.request_id, request.request_id);
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.return_code, E_UNKNOWN_SERVICE);
        assert_eq!(reply.payload_length(), 0);
    }

    #[test]
    fn sd_offer_roundtrip_preserves_identity_ttl_and_endpoint() {
        let mut msg = SdMessage::new();
        msg.flags = SdMessage::FLAG_REBOOT | SdMessage::FLAG_UNICAST;
        msg.session_id = 1;
        let opt = msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 168, 1, 100),
            port: 10032,
            protocol: TransportProtocol::Tcp,
        });
        msg.add_entry(SdEntry::offer(0x1234, 0x0001, 1, 3600, opt, 1));

        let bytes = msg.serialize();
        let parsed = SdMessage::parse_datagram(&bytes).unwrap();

        assert_eq!(parsed.flags, msg.flags);
        assert_eq!(parsed.session_id, 1);
        assert_eq!(parsed.entries.len(), 1);
        let entry = &parsed.entries[0];
        assert_eq!(entry.service_id(), 0x1234);
        assert_eq!(entry.instance_id(), 0x0001);
        assert_eq!(entry.ttl(), 3600);
        assert_eq!(
            parsed.tcp_endpoint_for(entry),
            Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 100), 10032))
        );
    }

    #[test]
    fn sd_subscribe_entry_roundtrip() {
        let entry = SdEntry::subscribe(0x1234, 0x0001, 0x00FF, 3000);
        let mut buf = BytesMut::new();
        entry.serialize(&mut buf);
        assert_eq!(buf.len(), SdEntry::SIZE);

        let mut cursor = buf.freeze();
        let parsed = SdEntry::parse(&mut cursor).unwrap();
        assert_eq!(parsed, entry);
        match parsed {
            SdEntry::Eventgroup(e) => assert_eq!(e.eventgroup_id, 0x00FF),
            SdEntry::Service(_) => panic!("expected eventgroup entry"),
        }
    }

    #[test]
    fn unknown_sd_entry_kind_is_skipped() {
        let mut payload = BytesMut::new();
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_u8(0);
        payload.put_u32(32); // two entries
        let mut bogus = [0u8; 16];
        bogus[0] = 0x7F; // unknown kind
        payload.put_slice(&bogus);
        let mut offer = BytesMut::new();
        SdEntry::offer(0x1111, 0x0001, 1, 10, 0, 0).serialize(&mut offer);
        payload.put_slice(&offer);
        payload.put_u32(0); // no options

        let mut cursor = payload.freeze();
        let parsed = SdMessage::parse_payload(&mut cursor, 1).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].service_id(), 0x1111);
    }

    #[test]
    fn unknown_option_kind_survives_roundtrip() {
        let mut msg = SdMessage::new();
        msg.add_option(SdOption::Unknown {
            option_type: 0x42,
            data: Bytes::from_static(&[1, 2, 3]),
        });
        let opt = msg.add_option(SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(10, 0, 0, 1),
            port: 80,
            protocol: TransportProtocol::Tcp,
        });
        msg.add_entry(SdEntry::offer(0x1234, 1, 1, 10, opt, 1));

        let bytes = msg.serialize();
        let parsed = SdMessage::parse_datagram(&bytes).unwrap();
        // The unknown option keeps its slot so the entry's index stays valid
        assert_eq!(parsed.options.len(), 2);
        assert_eq!(
            parsed.tcp_endpoint_for(&parsed.entries[0]),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80))
        );
    }

    proptest! {
        #[test]
        fn header_roundtrip_prop(
            service in any::<u16>(),
            member in any::<u16>(),
            request_id in any::<u32>(),
            payload_len in 0usize..4096,
        ) {
            let header = Header::new(service, member, request_id, MessageType::Notification, payload_len);
            let mut buf = BytesMut::new();
            header.serialize(&mut buf);
            let mut cursor = buf.freeze();
            let parsed = Header::parse(&mut cursor).unwrap();
            prop_assert_eq!(header, parsed);
        }

        #[test]
        fn tag_extract_clear_prop(request_id in any::<u32>(), client in any::<u16>()) {
            let tagged = tag_client_identifier(request_id, client);
            prop_assert_eq!(extract_client_identifier(tagged), client);
            prop_assert_eq!(clear_client_identifier(tagged), request_id & 0xFFFF);
        }
    }
}

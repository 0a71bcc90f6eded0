//! Congestion-aware non-blocking stream transport.
//!
//! Three pieces build on each other:
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`BufferReader`] | Accumulates a fixed number of bytes across partial reads |
//! | [`FrameReader`] | Header-then-payload state machine yielding SOME/IP frames |
//! | [`StreamConnection`] | Write side: direct sends with a FIFO pending buffer |
//!
//! The congestion model: a write that cannot complete queues its unsent
//! remainder and reports the transition. While congested, further writes
//! append to the queue (strict FIFO, nothing is ever dropped) and the owner
//! stops reading this connection's ingress, which propagates backpressure to
//! the sender. When the socket becomes writable again the owner drains the
//! queue with [`StreamConnection::write_pending`] and resumes reading on
//! [`FlushOutcome::CongestionFinished`].

use std::io;

use bytes::{Bytes, BytesMut};

use crate::net::StreamSocket;
use crate::wire::{self, Header, Message};

// ============================================================================
// BUFFER READER
// ============================================================================

/// Progress of an incremental read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    /// The target length has been reached.
    Complete,
    /// More bytes are needed; the socket has no more data right now.
    Incomplete,
    /// The peer closed the stream.
    Closed,
}

/// Accumulates exactly `target` bytes across arbitrarily fragmented
/// non-blocking reads.
#[derive(Debug)]
pub struct BufferReader {
    buf: Vec<u8>,
    filled: usize,
}

impl BufferReader {
    pub fn new(target: usize) -> Self {
        Self {
            buf: vec![0; target],
            filled: 0,
        }
    }

    /// Pull bytes from the socket until the target is reached or the socket
    /// runs dry. `WouldBlock` is zero progress, not an error; any other
    /// error means the connection is gone.
    pub fn read<T: StreamSocket>(&mut self, io: &T) -> io::Result<ReadProgress> {
        while self.filled < self.buf.len() {
            match io.try_read(&mut self.buf[self.filled..]) {
                Ok(0) => return Ok(ReadProgress::Closed),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadProgress::Incomplete)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ReadProgress::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.filled == self.buf.len()
    }

    /// The accumulated bytes. Only meaningful once complete.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Take the accumulated bytes and reset for a new target.
    pub fn take_and_reset(&mut self, next_target: usize) -> Vec<u8> {
        self.filled = 0;
        std::mem::replace(&mut self.buf, vec![0; next_target])
    }
}

// ============================================================================
// FRAME READER
// ============================================================================

/// Result of pumping a [`FrameReader`].
#[derive(Debug)]
pub enum FrameProgress {
    /// A complete SOME/IP message was assembled.
    Frame(Message),
    /// The socket ran dry mid-frame; call again when readable.
    NeedMore,
    /// The peer closed the stream.
    Closed,
}

enum FramePhase {
    Header,
    Payload(Header),
    /// Skipping the payload of a frame whose header could not be
    /// interpreted (unknown message type); length was still readable.
    Discard,
}

/// Incremental reassembly of SOME/IP frames from a TCP stream: 16 header
/// bytes, then `length - 8` payload bytes, repeated.
pub struct FrameReader {
    phase: FramePhase,
    reader: BufferReader,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            phase: FramePhase::Header,
            reader: BufferReader::new(Header::SIZE),
        }
    }

    /// Advance the state machine as far as the socket allows. Returns the
    /// first complete frame; call in a loop until [`FrameProgress::NeedMore`].
    pub fn read<T: StreamSocket>(&mut self, io: &T) -> crate::Result<FrameProgress> {
        loop {
            match self.reader.read(io)? {
                ReadProgress::Incomplete => return Ok(FrameProgress::NeedMore),
                ReadProgress::Closed => return Ok(FrameProgress::Closed),
                ReadProgress::Complete => {}
            }

            match std::mem::replace(&mut self.phase, FramePhase::Header) {
                FramePhase::Header => {
                    let raw = self.reader.bytes().to_vec();
                    match Header::parse(&mut raw.as_slice()) {
                        Some(header) => {
                            let payload_len = header.payload_length();
                            self.reader.take_and_reset(payload_len);
                            self.phase = FramePhase::Payload(header);
                        }
                        None => {
                            // Unknown message type; the length field tells us
                            // how much to discard so framing stays in sync
                            let length = wire::peek_length(&raw).ok_or_else(|| {
                                crate::Error::protocol("header shorter than length field")
                            })?;
                            tracing::warn!("dropping frame with unknown message type");
                            self.reader
                                .take_and_reset(length.saturating_sub(8) as usize);
                            self.phase = FramePhase::Discard;
                        }
                    }
                }
                FramePhase::Payload(header) => {
                    let payload = self.reader.take_and_reset(Header::SIZE);
                    self.phase = FramePhase::Header;
                    let message = Message::new(header, Bytes::from(payload));
                    return Ok(FrameProgress::Frame(message));
                }
                FramePhase::Discard => {
                    self.reader.take_and_reset(Header::SIZE);
                    self.phase = FramePhase::Header;
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// STREAM CONNECTION
// ============================================================================

/// Outcome of a non-blocking write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything went out directly.
    Written,
    /// This write filled the socket; the remainder was queued. The owner
    /// should stop reading this connection's ingress.
    CongestionStarted,
    /// Already congested; the bytes were appended to the queue.
    Congested,
}

/// Outcome of draining the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The queue is empty again; ingress can resume.
    CongestionFinished,
    /// The socket filled up again before the queue emptied.
    StillCongested,
}

/// One stream plus a FIFO buffer of bytes that could not be sent yet.
///
/// Byte order toward the peer is exactly the order of `write_non_blocking`
/// calls, congested or not.
pub struct StreamConnection<T> {
    stream: T,
    pending: BytesMut,
}

impl<T: StreamSocket> StreamConnection<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
        }
    }

    pub fn stream(&self) -> &T {
        &self.stream
    }

    pub fn is_congested(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Wait until the stream is readable.
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Wait until the stream is writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    /// Send bytes, queueing whatever the socket does not accept.
    pub fn write_non_blocking(&mut self, data: &[u8]) -> io::Result<WriteOutcome> {
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return Ok(WriteOutcome::Congested);
        }

        let mut offset = 0;
        while offset < data.len() {
            match self.stream.try_write(&data[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        if offset < data.len() {
            self.pending.extend_from_slice(&data[offset..]);
            Ok(WriteOutcome::CongestionStarted)
        } else {
            Ok(WriteOutcome::Written)
        }
    }

    /// Retry the queued bytes. Snapshot-and-clear first: a remainder is
    /// re-queued through the normal path, so writes racing in between keep
    /// their FIFO position.
    pub fn write_pending(&mut self) -> io::Result<FlushOutcome> {
        if self.pending.is_empty() {
            return Ok(FlushOutcome::CongestionFinished);
        }

        let snapshot: Bytes = self.pending.split().freeze();
        match self.write_non_blocking(&snapshot)? {
            WriteOutcome::Written => Ok(FlushOutcome::CongestionFinished),
            WriteOutcome::CongestionStarted | WriteOutcome::Congested => {
                Ok(FlushOutcome::StillCongested)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageType;
    use bytes::BufMut;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::future;
    use std::sync::Mutex;

    /// Scriptable fake stream: reads come from queued chunks, writes are
    /// captured with a byte budget per flush to simulate a full socket.
    struct FakeStream {
        read_chunks: Mutex<RefCell<VecDeque<Vec<u8>>>>,
        written: Mutex<RefCell<Vec<u8>>>,
        write_budget: Mutex<RefCell<usize>>,
        closed: bool,
    }

    impl FakeStream {
        fn new() -> Self {
            Self {
                read_chunks: Mutex::new(RefCell::new(VecDeque::new())),
                written: Mutex::new(RefCell::new(Vec::new())),
                write_budget: Mutex::new(RefCell::new(usize::MAX)),
                closed: false,
            }
        }

        fn push_read(&self, data: &[u8]) {
            self.read_chunks
                .lock()
                .unwrap()
                .borrow_mut()
                .push_back(data.to_vec());
        }

        fn set_write_budget(&self, budget: usize) {
            *self.write_budget.lock().unwrap().borrow_mut() = budget;
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().borrow().clone()
        }
    }

    impl StreamSocket for FakeStream {
        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            if self.closed {
                return Ok(0);
            }
            let chunks = self.read_chunks.lock().unwrap();
            let mut chunks = chunks.borrow_mut();
            match chunks.front_mut() {
                None => Err(io::ErrorKind::WouldBlock.into()),
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        chunks.pop_front();
                    }
                    Ok(n)
                }
            }
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let budget_cell = self.write_budget.lock().unwrap();
            let mut budget = budget_cell.borrow_mut();
            if *budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(*budget);
            *budget -= n;
            self.written.lock().unwrap().borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn readable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send {
            future::ready(Ok(()))
        }

        fn writable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send {
            future::ready(Ok(()))
        }
    }

    fn frame_bytes(service: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Header::new(service, 1, 1, MessageType::Request, payload.len()).serialize(&mut buf);
        buf.put_slice(payload);
        buf.to_vec()
    }

    #[test]
    fn buffer_reader_accumulates_across_fragments() {
        let stream = FakeStream::new();
        stream.push_read(&[1, 2]);
        let mut reader = BufferReader::new(4);

        assert_eq!(reader.read(&stream).unwrap(), ReadProgress::Incomplete);
        assert!(!reader.is_complete());

        stream.push_read(&[3, 4]);
        assert_eq!(reader.read(&stream).unwrap(), ReadProgress::Complete);
        assert_eq!(reader.bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn buffer_reader_reports_close() {
        let mut stream = FakeStream::new();
        stream.closed = true;
        let mut reader = BufferReader::new(4);
        assert_eq!(reader.read(&stream).unwrap(), ReadProgress::Closed);
    }

    #[test]
    fn frame_reader_reassembles_fragmented_frame() {
        let stream = FakeStream::new();
        let frame = frame_bytes(0x1234, b"hello");
        // Split mid-header and mid-payload
        stream.push_read(&frame[..7]);
        let mut reader = FrameReader::new();
        assert!(matches!(reader.read(&stream).unwrap(), FrameProgress::NeedMore));

        stream.push_read(&frame[7..19]);
        assert!(matches!(reader.read(&stream).unwrap(), FrameProgress::NeedMore));

        stream.push_read(&frame[19..]);
        match reader.read(&stream).unwrap() {
            FrameProgress::Frame(msg) => {
                assert_eq!(msg.header.service_id, 0x1234);
                assert_eq!(msg.payload.as_ref(), b"hello");
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn frame_reader_yields_back_to_back_frames() {
        let stream = FakeStream::new();
        let mut bytes = frame_bytes(0x0001, b"a");
        bytes.extend_from_slice(&frame_bytes(0x0002, b"bb"));
        stream.push_read(&bytes);

        let mut reader = FrameReader::new();
        let first = match reader.read(&stream).unwrap() {
            FrameProgress::Frame(msg) => msg,
            other => panic!("expected frame, got {other:?}"),
        };
        let second = match reader.read(&stream).unwrap() {
            FrameProgress::Frame(msg) => msg,
            other => panic!("expected frame, got {other:?}"),
        };
        assert_eq!(first.header.service_id, 0x0001);
        assert_eq!(second.header.service_id, 0x0002);
        assert!(matches!(reader.read(&stream).unwrap(), FrameProgress::NeedMore));
    }

    #[test]
    fn frame_reader_skips_unknown_message_type() {
        let stream = FakeStream::new();
        let mut bad = frame_bytes(0x0001, b"xyz");
        bad[14] = 0x55; // corrupt the message type
        bad.extend_from_slice(&frame_bytes(0x0002, b"ok"));
        stream.push_read(&bad);

        let mut reader = FrameReader::new();
        match reader.read(&stream).unwrap() {
            FrameProgress::Frame(msg) => assert_eq!(msg.header.service_id, 0x0002),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn uncongested_write_goes_straight_through() {
        let mut conn = StreamConnection::new(FakeStream::new());
        assert_eq!(
            conn.write_non_blocking(b"abc").unwrap(),
            WriteOutcome::Written
        );
        assert!(!conn.is_congested());
        assert_eq!(conn.stream().written(), b"abc");
    }

    #[test]
    fn partial_write_starts_congestion() {
        let mut conn = StreamConnection::new(FakeStream::new());
        conn.stream().set_write_budget(2);
        assert_eq!(
            conn.write_non_blocking(b"abcd").unwrap(),
            WriteOutcome::CongestionStarted
        );
        assert!(conn.is_congested());
        assert_eq!(conn.stream().written(), b"ab");
    }

    #[test]
    fn congested_fifo_drains_in_order() {
        let mut conn = StreamConnection::new(FakeStream::new());
        conn.stream().set_write_budget(0);

        assert_eq!(
            conn.write_non_blocking(b"W1").unwrap(),
            WriteOutcome::CongestionStarted
        );
        assert_eq!(conn.write_non_blocking(b"W2").unwrap(), WriteOutcome::Congested);
        assert_eq!(conn.write_non_blocking(b"W3").unwrap(), WriteOutcome::Congested);

        // Partial drain keeps the remainder queued, still in order
        conn.stream().set_write_budget(3);
        assert_eq!(conn.write_pending().unwrap(), FlushOutcome::StillCongested);

        conn.stream().set_write_budget(usize::MAX);
        assert_eq!(conn.write_pending().unwrap(), FlushOutcome::CongestionFinished);
        assert!(!conn.is_congested());
        assert_eq!(conn.stream().written(), b"W1W2W3");
    }

    #[test]
    fn write_during_drain_keeps_fifo_position() {
        let mut conn = StreamConnection::new(FakeStream::new());
        conn.stream().set_write_budget(0);
        conn.write_non_blocking(b"first").unwrap();

        conn.stream().set_write_budget(2);
        conn.write_pending().unwrap();
        conn.write_non_blocking(b"second").unwrap();

        conn.stream().set_write_budget(usize::MAX);
        assert_eq!(conn.write_pending().unwrap(), FlushOutcome::CongestionFinished);
        assert_eq!(conn.stream().written(), b"firstsecond");
    }

    #[test]
    fn hard_write_error_propagates() {
        struct BrokenStream;
        impl StreamSocket for BrokenStream {
            fn try_read(&self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::ConnectionReset.into())
            }
            fn try_write(&self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }
            fn readable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send {
                future::ready(Ok(()))
            }
            fn writable(&self) -> impl std::future::Future<Output = io::Result<()>> + Send {
                future::ready(Ok(()))
            }
        }

        let mut conn = StreamConnection::new(BrokenStream);
        assert!(conn.write_non_blocking(b"x").is_err());

        let mut reader = BufferReader::new(4);
        assert!(reader.read(&BrokenStream).is_err());
    }
}

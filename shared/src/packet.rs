//! Wire packet framing for the lock-step protocol
//!
//! A packet is a self-describing byte frame: a fixed 6-byte header (total
//! size, protocol version, command type id, all big-endian u16) followed by
//! the command payload. Packets are sent and received incrementally over
//! non-blocking stream sockets, so a single frame may need several event-loop
//! passes to complete. A packet is always in exactly one of three states:
//! in progress, ready (fully sent/received) or permanently failed.

use log::warn;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Fixed header: u16 total size, u16 protocol version, u16 command type id.
pub const HEADER_SIZE: usize = 6;

/// Upper bound on a whole frame, header included.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Version of the wire protocol spoken by this build. A received frame
/// declaring a newer version is rejected at the framing layer.
pub const PROTOCOL_VERSION: u16 = 1;

/// A single wire frame with incremental non-blocking I/O.
///
/// Outbound packets are created with [`Packet::new`], filled with the typed
/// `put_*` writers and flushed with [`Packet::send`] until `is_ready()`.
/// Inbound packets are created with [`Packet::for_receive`] and fed with
/// [`Packet::receive`] until ready, after which the typed `get_*` readers
/// walk the payload in the same order it was written.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    /// Total frame size; only meaningful once the header is committed/parsed.
    size: usize,
    version: u16,
    kind: u16,
    /// Bytes sent or received so far.
    count: usize,
    /// Payload read cursor for the typed getters.
    read_pos: usize,
    failed: bool,
    ready: bool,
    size_known: bool,
}

impl Packet {
    /// Creates an outbound packet for the given command type id.
    pub fn new(kind: u16) -> Self {
        Packet {
            buf: vec![0u8; HEADER_SIZE],
            size: 0,
            version: PROTOCOL_VERSION,
            kind,
            count: 0,
            read_pos: HEADER_SIZE,
            failed: false,
            ready: false,
            size_known: false,
        }
    }

    /// Creates an empty packet ready to accumulate an inbound frame.
    pub fn for_receive() -> Self {
        Packet {
            buf: vec![0u8; HEADER_SIZE],
            size: 0,
            version: 0,
            kind: 0,
            count: 0,
            read_pos: HEADER_SIZE,
            failed: false,
            ready: false,
            size_known: false,
        }
    }

    /// Command type id from the header.
    pub fn kind(&self) -> u16 {
        self.kind
    }

    /// Protocol version from the header.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// True once the frame is fully sent or received.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// True if the packet hit a permanent error; contents must not be trusted.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Marks the packet as permanently failed.
    pub fn set_failed(&mut self) {
        self.failed = true;
    }

    /// Total frame size (only meaningful once the header is known).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Payload bytes still unread by the typed getters.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.read_pos)
    }

    // --- typed writers ------------------------------------------------

    fn put_bytes(&mut self, bytes: &[u8]) {
        if self.failed {
            return;
        }
        if self.buf.len() + bytes.len() > MAX_PACKET_SIZE {
            warn!("packet payload would exceed {} bytes", MAX_PACKET_SIZE);
            self.failed = true;
            return;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    /// Length-prefixed (u16) UTF-8 string.
    pub fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        if bytes.len() > u16::MAX as usize {
            self.failed = true;
            return;
        }
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    /// Length-prefixed (u16) opaque byte blob.
    pub fn put_blob(&mut self, blob: &[u8]) {
        if blob.len() > u16::MAX as usize {
            self.failed = true;
            return;
        }
        self.put_u16(blob.len() as u16);
        self.put_bytes(blob);
    }

    /// Fixed-width byte run without a length prefix (e.g. checksums).
    pub fn put_exact(&mut self, bytes: &[u8]) {
        self.put_bytes(bytes);
    }

    // --- typed readers ------------------------------------------------

    fn get_bytes(&mut self, n: usize) -> &[u8] {
        if self.failed || self.read_pos + n > self.buf.len() {
            self.failed = true;
            return &[];
        }
        let start = self.read_pos;
        self.read_pos += n;
        &self.buf[start..start + n]
    }

    pub fn get_u8(&mut self) -> u8 {
        let b = self.get_bytes(1);
        if b.is_empty() {
            0
        } else {
            b[0]
        }
    }

    pub fn get_i8(&mut self) -> i8 {
        self.get_u8() as i8
    }

    pub fn get_u16(&mut self) -> u16 {
        let b = self.get_bytes(2);
        if b.len() == 2 {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            0
        }
    }

    pub fn get_i16(&mut self) -> i16 {
        self.get_u16() as i16
    }

    pub fn get_u32(&mut self) -> u32 {
        let b = self.get_bytes(4);
        if b.len() == 4 {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            0
        }
    }

    pub fn get_i32(&mut self) -> i32 {
        self.get_u32() as i32
    }

    pub fn get_bool(&mut self) -> bool {
        self.get_u8() != 0
    }

    pub fn get_str(&mut self) -> String {
        let len = self.get_u16() as usize;
        let bytes = self.get_bytes(len);
        String::from_utf8_lossy(bytes).into_owned()
    }

    pub fn get_blob(&mut self) -> Vec<u8> {
        let len = self.get_u16() as usize;
        self.get_bytes(len).to_vec()
    }

    pub fn get_exact(&mut self, n: usize) -> Vec<u8> {
        self.get_bytes(n).to_vec()
    }

    // --- framing ------------------------------------------------------

    /// Commits the header in front of the already-serialized payload. Called
    /// automatically on the first send attempt; subsequent partial sends must
    /// not rewrite the header.
    fn prepare(&mut self) {
        if self.failed {
            return;
        }
        let total = self.buf.len();
        if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&total) {
            self.failed = true;
            return;
        }
        self.size = total;
        self.buf[0..2].copy_from_slice(&(total as u16).to_be_bytes());
        self.buf[2..4].copy_from_slice(&self.version.to_be_bytes());
        self.buf[4..6].copy_from_slice(&self.kind.to_be_bytes());
        self.size_known = true;
    }

    /// Attempts to flush unsent bytes. A would-block condition returns
    /// without error; the caller retries on the next event-loop pass. Hard
    /// socket errors and a closed peer mark the packet failed permanently.
    pub fn send<W: Write>(&mut self, stream: &mut W) {
        if self.failed || self.ready {
            return;
        }
        if !self.size_known {
            self.prepare();
            if self.failed {
                return;
            }
        }
        while self.count < self.size {
            match stream.write(&self.buf[self.count..self.size]) {
                Ok(0) => {
                    self.failed = true;
                    return;
                }
                Ok(n) => self.count += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("packet send failed: {}", e);
                    self.failed = true;
                    return;
                }
            }
        }
        self.ready = true;
    }

    fn parse_header(&mut self) {
        self.size = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        self.version = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        self.kind = u16::from_be_bytes([self.buf[4], self.buf[5]]);
        if !(HEADER_SIZE..=MAX_PACKET_SIZE).contains(&self.size) {
            warn!("packet declares invalid size {}", self.size);
            self.failed = true;
            return;
        }
        if self.version > PROTOCOL_VERSION {
            warn!(
                "packet declares unsupported protocol version {} (supported: {})",
                self.version, PROTOCOL_VERSION
            );
            self.failed = true;
            return;
        }
        self.buf.resize(self.size, 0);
        self.size_known = true;
    }

    /// Accumulates inbound bytes: exactly the header first, then the declared
    /// payload length. A zero-byte read means the peer closed the connection
    /// and is a permanent failure, not a retry condition.
    pub fn receive<R: Read>(&mut self, stream: &mut R) {
        if self.failed || self.ready {
            return;
        }
        while self.count < HEADER_SIZE {
            match stream.read(&mut self.buf[self.count..HEADER_SIZE]) {
                Ok(0) => {
                    self.failed = true;
                    return;
                }
                Ok(n) => {
                    self.count += n;
                    if self.count == HEADER_SIZE {
                        self.parse_header();
                        if self.failed {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.failed = true;
                    return;
                }
            }
        }
        while self.count < self.size {
            match stream.read(&mut self.buf[self.count..self.size]) {
                Ok(0) => {
                    self.failed = true;
                    return;
                }
                Ok(n) => self.count += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.failed = true;
                    return;
                }
            }
        }
        self.ready = true;
        self.read_pos = HEADER_SIZE;
    }

    /// Drives `send` until the frame is flushed, the packet fails or the
    /// timeout elapses. Used on handshake paths where the socket is in
    /// blocking mode with short I/O timeouts.
    pub fn send_blocking<W: Write>(&mut self, stream: &mut W, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.send(stream);
            if self.ready {
                return true;
            }
            if self.failed || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Counterpart of [`Packet::send_blocking`] for the receive side.
    pub fn receive_blocking<R: Read>(&mut self, stream: &mut R, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.receive(stream);
            if self.ready {
                return true;
            }
            if self.failed || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Whole frame as bytes, committing the header if necessary.
    /// Returns `None` for failed packets.
    pub fn to_bytes(&mut self) -> Option<&[u8]> {
        if !self.size_known {
            self.prepare();
        }
        if self.failed {
            return None;
        }
        Some(&self.buf[..self.size])
    }

    /// Parses a complete frame from a byte buffer. Fails like `receive`
    /// would: truncated input counts as a closed peer.
    pub fn from_bytes(data: &[u8]) -> Packet {
        let mut pkt = Packet::for_receive();
        let mut reader = data;
        while !pkt.ready && !pkt.failed {
            pkt.receive(&mut reader);
        }
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let mut pkt = Packet::new(7);
        pkt.put_u32(0xDEAD_BEEF);
        pkt.put_u16(42);
        pkt.put_i16(-3);
        pkt.put_u8(200);
        pkt.put_bool(true);
        pkt.put_str("hello lock-step");
        pkt.put_blob(&[1, 2, 3, 4, 5]);
        pkt
    }

    fn assert_sample_fields(pkt: &mut Packet) {
        assert_eq!(pkt.get_u32(), 0xDEAD_BEEF);
        assert_eq!(pkt.get_u16(), 42);
        assert_eq!(pkt.get_i16(), -3);
        assert_eq!(pkt.get_u8(), 200);
        assert!(pkt.get_bool());
        assert_eq!(pkt.get_str(), "hello lock-step");
        assert_eq!(pkt.get_blob(), vec![1, 2, 3, 4, 5]);
        assert!(!pkt.has_failed());
    }

    #[test]
    fn test_roundtrip_all_field_types() {
        let mut pkt = sample_packet();
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut decoded = Packet::from_bytes(&bytes);
        assert!(decoded.is_ready());
        assert_eq!(decoded.kind(), 7);
        assert_eq!(decoded.version(), PROTOCOL_VERSION);
        assert_sample_fields(&mut decoded);
    }

    #[test]
    fn test_header_is_exactly_six_bytes() {
        let mut pkt = Packet::new(1);
        let bytes = pkt.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[0..2], &(HEADER_SIZE as u16).to_be_bytes());
    }

    /// Reads from a byte buffer up to `limit` but reports exhaustion as
    /// `WouldBlock`, modelling a non-blocking socket with no bytes available
    /// this tick (the read-side counterpart of the `Trickle` writer below).
    struct ChunkReader<'a> {
        data: &'a [u8],
        pos: usize,
        limit: usize,
    }
    impl Read for ChunkReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.limit {
                return Err(std::io::Error::new(ErrorKind::WouldBlock, "drained"));
            }
            let n = buf.len().min(self.limit - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_partial_receive_at_every_split_point() {
        let mut pkt = sample_packet();
        let bytes = pkt.to_bytes().unwrap().to_vec();

        for split in 1..bytes.len() {
            let mut decoded = Packet::for_receive();
            // First chunk, then the remainder, as if the socket trickled.
            let mut reader = ChunkReader {
                data: &bytes,
                pos: 0,
                limit: split,
            };
            while !decoded.is_ready() && !decoded.has_failed() && reader.pos < reader.limit {
                decoded.receive(&mut reader);
            }
            assert!(!decoded.has_failed(), "failed at split {}", split);
            reader.limit = bytes.len();
            while !decoded.is_ready() && !decoded.has_failed() {
                decoded.receive(&mut reader);
            }
            assert!(decoded.is_ready(), "not ready at split {}", split);
            assert_sample_fields(&mut decoded);
        }
    }

    #[test]
    fn test_byte_at_a_time_receive() {
        let mut pkt = sample_packet();
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut decoded = Packet::for_receive();
        let mut reader = ChunkReader {
            data: &bytes,
            pos: 0,
            limit: 0,
        };
        for i in 0..bytes.len() {
            reader.limit = i + 1;
            decoded.receive(&mut reader);
            assert!(!decoded.has_failed());
        }
        assert!(decoded.is_ready());
        assert_sample_fields(&mut decoded);
    }

    #[test]
    fn test_oversized_declared_length_fails_without_payload() {
        let mut header = Vec::new();
        header.extend_from_slice(&((MAX_PACKET_SIZE as u16) + 1).to_be_bytes());
        header.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        header.extend_from_slice(&1u16.to_be_bytes());
        let pkt = Packet::from_bytes(&header);
        assert!(pkt.has_failed());
        assert!(!pkt.is_ready());
    }

    #[test]
    fn test_undersized_declared_length_fails() {
        let mut header = Vec::new();
        header.extend_from_slice(&(HEADER_SIZE as u16 - 1).to_be_bytes());
        header.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        header.extend_from_slice(&1u16.to_be_bytes());
        let pkt = Packet::from_bytes(&header);
        assert!(pkt.has_failed());
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut pkt = Packet::new(3);
        pkt.put_u32(9);
        let mut bytes = pkt.to_bytes().unwrap().to_vec();
        let newer = (PROTOCOL_VERSION + 1).to_be_bytes();
        bytes[2] = newer[0];
        bytes[3] = newer[1];
        let decoded = Packet::from_bytes(&bytes);
        assert!(decoded.has_failed());
    }

    #[test]
    fn test_truncated_frame_is_peer_close() {
        let mut pkt = sample_packet();
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let decoded = Packet::from_bytes(&bytes[..bytes.len() - 1]);
        assert!(decoded.has_failed());
    }

    #[test]
    fn test_read_overrun_sets_failed() {
        let mut pkt = Packet::new(2);
        pkt.put_u8(1);
        let bytes = pkt.to_bytes().unwrap().to_vec();
        let mut decoded = Packet::from_bytes(&bytes);
        assert_eq!(decoded.get_u8(), 1);
        let _ = decoded.get_u32();
        assert!(decoded.has_failed());
    }

    #[test]
    fn test_put_overflow_sets_failed() {
        let mut pkt = Packet::new(2);
        let big = vec![0u8; MAX_PACKET_SIZE];
        pkt.put_exact(&big);
        assert!(pkt.has_failed());
        assert!(pkt.to_bytes().is_none());
    }

    #[test]
    fn test_partial_send_resumes_without_header_rewrite() {
        struct Trickle {
            out: Vec<u8>,
            budget: usize,
        }
        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                if self.budget == 0 {
                    return Err(std::io::Error::new(ErrorKind::WouldBlock, "full"));
                }
                let n = buf.len().min(self.budget);
                self.out.extend_from_slice(&buf[..n]);
                self.budget -= n;
                Ok(n)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut pkt = sample_packet();
        let expected = pkt.to_bytes().unwrap().to_vec();

        let mut pkt = sample_packet();
        let mut sink = Trickle {
            out: Vec::new(),
            budget: 3,
        };
        pkt.send(&mut sink);
        assert!(!pkt.is_ready());
        assert!(!pkt.has_failed());
        sink.budget = usize::MAX;
        pkt.send(&mut sink);
        assert!(pkt.is_ready());
        assert_eq!(sink.out, expected);
    }
}

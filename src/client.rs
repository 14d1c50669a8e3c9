//! Per-session state and inbox buffer management.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::error::Result;
use crate::packet::{self, Packet};

/// One complete raw frame split off an [`Inbox`].
///
/// Keeps the full wire bytes so raw-frame logging can dump exactly what
/// the client sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    bytes: Vec<u8>,
    header_len: usize,
}

impl Frame {
    /// The fixed header byte (type << 4 | flags).
    pub fn header(&self) -> u8 {
        self.bytes[0]
    }

    /// The 4-bit packet type.
    pub fn packet_type(&self) -> u8 {
        self.bytes[0] >> 4
    }

    /// Everything after the fixed header: exactly Remaining Length bytes.
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header_len..]
    }

    /// The complete frame as received.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode the frame body into a packet.
    pub fn decode(&self) -> Result<Packet> {
        packet::decode_body(self.header(), self.body())
    }
}

/// Per-session byte accumulator.
///
/// Network reads append arbitrary fragments; [`Inbox::next_frame`] splits
/// off complete frames until only a partial prefix remains. Incompleteness
/// never consumes bytes, so a packet split across any number of reads
/// decodes exactly like one contiguous write.
#[derive(Debug, Default)]
pub struct Inbox {
    buf: Vec<u8>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes from a network read.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[allow(dead_code)] // exercised by tests
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all buffered bytes. Used when a malformed Remaining Length
    /// makes resynchronization impossible.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Split off the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed; the buffer is untouched.
    /// `Err` means the Remaining Length encoding itself is malformed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let Some((remaining_len, len_bytes)) = packet::decode_remaining_length(&self.buf[1..])?
        else {
            return Ok(None);
        };

        let header_len = 1 + len_bytes;
        let total_len = header_len + remaining_len;
        if self.buf.len() < total_len {
            return Ok(None);
        }

        let rest = self.buf.split_off(total_len);
        let bytes = std::mem::replace(&mut self.buf, rest);
        Ok(Some(Frame { bytes, header_len }))
    }
}

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Socket accepted, no CONNECT seen yet.
    Connecting,
    /// CONNECT processed, CONNACK sent.
    Connected,
    /// Marked for removal; the server loop tears the session down in the
    /// same tick's cleanup pass.
    Disconnecting,
}

/// Broker-side state for one connected client.
pub struct Client {
    pub socket: TcpStream,
    pub state: ClientState,
    /// Stable identifier for log lines. Starts as a placeholder derived
    /// from the peer address; replaced by a non-empty CONNECT client id.
    pub client_id: String,
    pub inbox: Inbox,
    /// Exact-topic subscriptions, mirrored by the subscription index.
    pub subscriptions: HashSet<String>,
    /// Encoded bytes not yet accepted by the socket.
    pending_write: Vec<u8>,
}

impl Client {
    pub fn new(socket: TcpStream, addr: SocketAddr) -> Self {
        Self {
            socket,
            state: ClientState::Connecting,
            client_id: format!("client-{}", addr),
            inbox: Inbox::new(),
            subscriptions: HashSet::new(),
            pending_write: Vec::new(),
        }
    }

    /// Read from the socket until it would block, appending to the inbox.
    ///
    /// Returns `Ok(true)` if the peer closed its write side.
    pub fn read(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.socket.read(scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbox.extend(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Encode a packet and push it towards the socket.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let mut buf = Vec::new();
        packet::encode_packet(packet, &mut buf)?;
        self.send(&buf)?;
        Ok(())
    }

    /// Queue raw bytes and try to write them out immediately. Bytes the
    /// socket does not accept stay queued; the server enables WRITABLE
    /// interest and retries on the next readiness event.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.pending_write.extend_from_slice(bytes);
        self.flush()
    }

    /// Write queued bytes until drained or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.pending_write.is_empty() {
            match self.socket.write(&self.pending_write) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending_write.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn has_pending_write(&self) -> bool {
        !self.pending_write.is_empty()
    }
}

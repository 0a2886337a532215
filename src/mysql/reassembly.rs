//! Reassembly of binlog events from the replication byte stream.
//!
//! The dump stream is a sequence of MySQL packets: a 3 byte little-endian
//! length, a sequence number, then the payload. The first packet of each
//! logical packet starts with a status byte (`0x00` event, `0xFE` end of
//! stream, `0xFF` error). Payloads of exactly `0xFFFFFF` bytes are continued
//! by the next packet, which carries no status byte. Inside event packets the
//! 19 byte event header announces the total event length.
//!
//! [`PacketAssembler`] accepts the stream in arbitrarily sized chunks and
//! hands out every complete event exactly once, whatever the chunking.

use bytes::Bytes;
use tracing::trace;

use super::types::EventHeader;
use super::wire::parse_error_packet;
use crate::{Error, Result};

pub const PACKET_HEADER_LEN: usize = 4;

/// Payload length of a packet that is continued by the next one.
pub const MAX_PACKET_LEN: usize = 0xFF_FFFF;

/// Largest event accepted by default (the server's `max_allowed_packet`
/// ceiling).
pub const DEFAULT_MAX_EVENT_LEN: usize = 1 << 30;

const STATUS_OK: u8 = 0x00;
const STATUS_EOF: u8 = 0xFE;
const STATUS_ERR: u8 = 0xFF;

/// An EOF packet is shorter than this.
const EOF_PACKET_LIMIT: usize = 9;

/// What the assembler hands to its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete event: header, payload and checksum.
    Event(Bytes),
    /// The server ended the stream.
    EndOfStream,
    /// The server sent an error packet.
    ServerError { code: u16, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    /// First byte of a logical packet, not seen yet.
    Status,
    Event,
    Error,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetState {
    AwaitingNetHeader,
    AwaitingNetBody { remaining: usize },
}

/// Incremental state machine turning stream bytes into [`Frame`]s.
pub struct PacketAssembler {
    net: NetState,
    header: [u8; PACKET_HEADER_LEN],
    header_filled: usize,
    kind: BodyKind,
    /// The packet being read continues the previous one.
    continuation: bool,
    /// The packet being read is full and will be continued.
    packet_full: bool,
    status_buf: Vec<u8>,
    event_buf: Vec<u8>,
    /// Total length of the event being assembled, once its header is in.
    event_total: Option<usize>,
    max_event_len: usize,
}

impl Default for PacketAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::with_max_event_len(DEFAULT_MAX_EVENT_LEN)
    }

    /// Assembler rejecting events longer than `max_event_len` with
    /// [`Error::OutOfMemory`].
    pub fn with_max_event_len(max_event_len: usize) -> Self {
        Self {
            net: NetState::AwaitingNetHeader,
            header: [0; PACKET_HEADER_LEN],
            header_filled: 0,
            kind: BodyKind::Status,
            continuation: false,
            packet_full: false,
            status_buf: Vec::new(),
            event_buf: Vec::new(),
            event_total: None,
            max_event_len,
        }
    }

    /// Drops any partially assembled packet or event.
    pub fn reset(&mut self) {
        *self = Self::with_max_event_len(self.max_event_len);
    }

    /// Bytes needed to finish the current packet header or body.
    pub fn bytes_wanted(&self) -> usize {
        match self.net {
            NetState::AwaitingNetHeader => PACKET_HEADER_LEN - self.header_filled,
            NetState::AwaitingNetBody { remaining } => remaining,
        }
    }

    /// Whether the assembler sits between two logical packets.
    pub fn is_idle(&self) -> bool {
        self.net == NetState::AwaitingNetHeader
            && self.header_filled == 0
            && !self.continuation
            && self.event_buf.is_empty()
    }

    /// Consumes `chunk`, calling `sink` for every completed frame in stream
    /// order.
    ///
    /// An error from `sink` stops consumption and is returned as is.
    pub fn feed(
        &mut self,
        mut chunk: &[u8],
        sink: &mut dyn FnMut(Frame) -> Result<()>,
    ) -> Result<()> {
        while !chunk.is_empty() {
            match self.net {
                NetState::AwaitingNetHeader => {
                    let take = (PACKET_HEADER_LEN - self.header_filled).min(chunk.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_filled += take;
                    chunk = &chunk[take..];

                    if self.header_filled == PACKET_HEADER_LEN {
                        self.start_packet(sink)?;
                    }
                }
                NetState::AwaitingNetBody { remaining } => {
                    let take = remaining.min(chunk.len());
                    let consumed = self.consume_body(&chunk[..take], sink)?;
                    chunk = &chunk[consumed..];

                    let remaining = remaining - consumed;
                    self.net = NetState::AwaitingNetBody { remaining };
                    if remaining == 0 {
                        self.finish_packet(sink)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn start_packet(&mut self, sink: &mut dyn FnMut(Frame) -> Result<()>) -> Result<()> {
        let [b0, b1, b2, sequence] = self.header;
        let length = usize::from(b0) | usize::from(b1) << 8 | usize::from(b2) << 16;
        self.header_filled = 0;
        self.packet_full = length == MAX_PACKET_LEN;

        trace!(
            "Packet seq={} length={} continuation={}",
            sequence,
            length,
            self.continuation
        );

        if !self.continuation {
            self.kind = BodyKind::Status;
        }

        if length == 0 {
            if !self.continuation {
                return Err(Error::Protocol("empty packet in binlog stream".to_string()));
            }
            // An empty packet closes a payload that was a multiple of the
            // maximum packet length.
            self.net = NetState::AwaitingNetBody { remaining: 0 };
            return self.finish_packet(sink);
        }

        self.net = NetState::AwaitingNetBody { remaining: length };
        Ok(())
    }

    /// Consumes a prefix of `bytes`, which never extends past the current
    /// packet, and returns how much was taken.
    fn consume_body(
        &mut self,
        bytes: &[u8],
        sink: &mut dyn FnMut(Frame) -> Result<()>,
    ) -> Result<usize> {
        match self.kind {
            BodyKind::Status => {
                let status = bytes[0];
                let packet_len = match self.net {
                    NetState::AwaitingNetBody { remaining } => remaining,
                    NetState::AwaitingNetHeader => 0,
                };
                self.kind = match status {
                    STATUS_OK => BodyKind::Event,
                    STATUS_EOF if packet_len < EOF_PACKET_LIMIT => BodyKind::Eof,
                    STATUS_ERR => BodyKind::Error,
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected status byte {:#04x} in binlog stream",
                            other
                        )))
                    }
                };
                if self.kind != BodyKind::Event {
                    self.status_buf.clear();
                    self.status_buf.push(status);
                }
                Ok(1)
            }
            BodyKind::Event => {
                self.push_event_bytes(bytes, sink)?;
                Ok(bytes.len())
            }
            BodyKind::Error | BodyKind::Eof => {
                self.status_buf.extend_from_slice(bytes);
                Ok(bytes.len())
            }
        }
    }

    fn push_event_bytes(
        &mut self,
        mut bytes: &[u8],
        sink: &mut dyn FnMut(Frame) -> Result<()>,
    ) -> Result<()> {
        while !bytes.is_empty() {
            let wanted = match self.event_total {
                None => EventHeader::SIZE - self.event_buf.len(),
                Some(total) => total - self.event_buf.len(),
            };
            let take = wanted.min(bytes.len());
            self.event_buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.event_total.is_none() && self.event_buf.len() == EventHeader::SIZE {
                let total = EventHeader::parse(&self.event_buf)?.event_length as usize;
                if total < EventHeader::SIZE {
                    return Err(Error::Protocol(format!(
                        "event length {} is shorter than the event header",
                        total
                    )));
                }
                if total > self.max_event_len {
                    return Err(Error::OutOfMemory(total));
                }
                self.event_buf
                    .try_reserve_exact(total - EventHeader::SIZE)
                    .map_err(|_| Error::OutOfMemory(total))?;
                self.event_total = Some(total);
            }

            if let Some(total) = self.event_total {
                if self.event_buf.len() == total {
                    let event = std::mem::take(&mut self.event_buf);
                    self.event_total = None;
                    sink(Frame::Event(Bytes::from(event)))?;
                }
            }
        }
        Ok(())
    }

    fn finish_packet(&mut self, sink: &mut dyn FnMut(Frame) -> Result<()>) -> Result<()> {
        self.net = NetState::AwaitingNetHeader;
        if self.packet_full {
            self.continuation = true;
            return Ok(());
        }
        self.continuation = false;

        match self.kind {
            BodyKind::Event => {
                if !self.event_buf.is_empty() {
                    return Err(Error::Protocol(format!(
                        "packet ended inside an event ({} of {:?} bytes)",
                        self.event_buf.len(),
                        self.event_total
                    )));
                }
                Ok(())
            }
            BodyKind::Eof => {
                self.status_buf.clear();
                sink(Frame::EndOfStream)
            }
            BodyKind::Error => {
                let (code, message) = parse_error_packet(&self.status_buf);
                self.status_buf.clear();
                sink(Frame::ServerError { code, message })
            }
            BodyKind::Status => Err(Error::Protocol("packet without status byte".to_string())),
        }
    }
}

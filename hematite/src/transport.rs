//! The dispatcher between bytes and the connection state machine:
//! per-direction byte buffers, the protocol-header handshake, and the
//! frame pump, with trace hooks on both the byte and frame boundaries.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::connection::{Connection, ConnectionError};
use crate::frames::{self, Frame, FrameBody, FrameCodec};
use crate::trace::{Dir, Trace};

/// The 4-byte magic every protocol header starts with
const PROTOCOL_MAGIC: &[u8; 4] = b"AMQP";

/// Protocol header size in bytes, both directions
pub const PROTO_HEADER_SIZE: usize = 8;

/// Protocol ids carried in byte five of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// Plain AMQP
    Amqp = 0x00,

    /// SASL security layer
    Sasl = 0x03,
}

/// The 8-byte protocol header
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolHeader {
    /// AMQP or SASL
    pub id: ProtocolId,

    /// Major version
    pub major: u8,

    /// Minor version
    pub minor: u8,

    /// Revision
    pub revision: u8,
}

impl ProtocolHeader {
    /// The AMQP header `AMQP\x00\x01\x00\x00`
    pub fn amqp() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: hematite_types::definitions::MAJOR,
            minor: hematite_types::definitions::MINOR,
            revision: hematite_types::definitions::REVISION,
        }
    }

    /// The SASL header `AMQP\x03\x01\x00\x00`
    pub fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            ..Self::amqp()
        }
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(header: ProtocolHeader) -> Self {
        [
            PROTOCOL_MAGIC[0],
            PROTOCOL_MAGIC[1],
            PROTOCOL_MAGIC[2],
            PROTOCOL_MAGIC[3],
            header.id as u8,
            header.major,
            header.minor,
            header.revision,
        ]
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(bytes: [u8; 8]) -> Result<Self, Self::Error> {
        if &bytes[..4] != PROTOCOL_MAGIC {
            return Err(bytes);
        }
        let id = match bytes[4] {
            0x00 => ProtocolId::Amqp,
            0x03 => ProtocolId::Sasl,
            _ => return Err(bytes),
        };
        Ok(Self {
            id,
            major: bytes[5],
            minor: bytes[6],
            revision: bytes[7],
        })
    }
}

/// Transport-level failures; all fatal to the connection
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer's header is not the AMQP 1.0.0 header we expect
    #[error("bad protocol header {0:02x?}")]
    BadProtocolHeader([u8; 8]),

    /// Framing failure
    #[error(transparent)]
    Framing(#[from] frames::Error),

    /// Connection-fatal protocol failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Debug, PartialEq)]
enum Phase {
    Header,
    Framing,
}

/// Byte pipe <-> frame pipe <-> typed-body pipe for one peer
#[derive(Debug)]
pub struct Transport {
    id: String,
    expected: ProtocolHeader,
    phase: Phase,
    input: BytesMut,
    output: BytesMut,
    codec: FrameCodec,
    trace: Trace,
}

impl Transport {
    /// A transport expecting the plain AMQP header; our own header is
    /// already queued in the output buffer
    pub fn new(id: impl Into<String>, trace: Trace) -> Self {
        Self::with_header(id, trace, ProtocolHeader::amqp())
    }

    /// A transport for an explicit header (the SASL layer uses this)
    pub fn with_header(id: impl Into<String>, trace: Trace, header: ProtocolHeader) -> Self {
        let mut output = BytesMut::new();
        let bytes: [u8; 8] = header.clone().into();
        output.extend_from_slice(&bytes);
        Self {
            id: id.into(),
            expected: header,
            phase: Phase::Header,
            input: BytesMut::new(),
            output,
            codec: FrameCodec::new(),
            trace,
        }
    }

    /// Caps the size of frames we accept, from Open negotiation
    pub fn set_max_frame_size(&mut self, max: u32) {
        self.codec.max_frame_size = max;
    }

    /// The trace handle, shared with the owner
    pub fn trace(&self) -> Trace {
        self.trace
    }

    /// Feeds received bytes through header verification and framing,
    /// dispatching complete bodies into the connection
    pub fn feed(&mut self, bytes: &[u8], conn: &mut Connection) -> Result<(), TransportError> {
        self.trace.raw(&self.id, Dir::Recv, bytes);
        self.input.extend_from_slice(bytes);

        if self.phase == Phase::Header {
            if self.input.len() < PROTO_HEADER_SIZE {
                return Ok(());
            }
            let mut header = [0u8; 8];
            header.copy_from_slice(&self.input.split_to(PROTO_HEADER_SIZE));
            match ProtocolHeader::try_from(header) {
                Ok(parsed) if parsed == self.expected => {
                    self.phase = Phase::Framing;
                }
                _ => {
                    self.trace.err(&self.id, &"bad protocol header");
                    return Err(TransportError::BadProtocolHeader(header));
                }
            }
        }

        while let Some(frame) = self.codec.decode(&mut self.input)? {
            let body = FrameBody::decode(&frame.body)?;
            self.trace.frm(&self.id, Dir::Recv, frame.channel, &body);
            conn.handle_frame(frame.channel, body)?;
            // Open may have tightened the negotiated maximum
            self.codec.max_frame_size = conn.max_frame_size();
        }
        Ok(())
    }

    /// Ticks the connection and serializes everything it queued;
    /// returns the bytes ready for the socket
    pub fn flush(&mut self, conn: &mut Connection) -> Bytes {
        conn.tick();
        for frame in conn.take_output() {
            if self.trace.frm {
                match FrameBody::decode(&frame.body) {
                    Ok(body) => self.trace.frm(&self.id, Dir::Sent, frame.channel, &body),
                    Err(_) => {}
                }
            }
            // encoding a well-formed frame cannot fail
            self.codec
                .encode(frame, &mut self.output)
                .expect("frame encoding is infallible");
        }
        let bytes = self.output.split().freeze();
        if !bytes.is_empty() {
            self.trace.raw(&self.id, Dir::Sent, &bytes);
        }
        bytes
    }

    /// Queues one raw frame (the SASL layer writes its own bodies)
    pub fn post_raw(&mut self, frame: Frame) {
        self.codec
            .encode(frame, &mut self.output)
            .expect("frame encoding is infallible");
    }

    /// Drains bytes queued for the socket without touching a connection
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// Hands back bytes that arrived beyond the current protocol layer
    /// (pipelined AMQP after a SASL outcome)
    pub fn take_remaining_input(&mut self) -> Bytes {
        self.input.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;

    #[test]
    fn header_round_trip() {
        let bytes: [u8; 8] = ProtocolHeader::amqp().into();
        assert_eq!(&bytes, b"AMQP\x00\x01\x00\x00");
        assert_eq!(ProtocolHeader::try_from(bytes).unwrap(), ProtocolHeader::amqp());

        let bytes: [u8; 8] = ProtocolHeader::sasl().into();
        assert_eq!(&bytes, b"AMQP\x03\x01\x00\x00");
    }

    #[test]
    fn bad_header_is_fatal() {
        let mut transport = Transport::new("t", Trace::from_categories(""));
        let mut conn = Connection::new(ConnectionOptions::new("a"));
        let err = transport.feed(b"HTTP/1.1 200 OK!", &mut conn).unwrap_err();
        assert!(matches!(err, TransportError::BadProtocolHeader(_)));
    }

    #[test]
    fn header_accumulates_across_reads() {
        let mut transport = Transport::new("t", Trace::from_categories(""));
        let mut conn = Connection::new(ConnectionOptions::new("a"));
        transport.feed(b"AMQP", &mut conn).unwrap();
        transport.feed(b"\x00\x01\x00\x00", &mut conn).unwrap();
        assert_eq!(transport.phase, Phase::Framing);
    }

    #[test]
    fn two_transports_handshake_through_buffers() {
        let mut ta = Transport::new("a", Trace::from_categories(""));
        let mut tb = Transport::new("b", Trace::from_categories(""));
        let mut a = Connection::new(ConnectionOptions::new("a"));
        let mut b = Connection::new(ConnectionOptions::new("b"));
        a.open().unwrap();
        b.open().unwrap();

        for _ in 0..4 {
            let bytes = ta.flush(&mut a);
            tb.feed(&bytes, &mut b).unwrap();
            let bytes = tb.flush(&mut b);
            ta.feed(&bytes, &mut a).unwrap();
        }
        assert!(a.opened() && b.opened());
    }
}

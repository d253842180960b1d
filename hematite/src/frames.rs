//! Frame encoder and decoder.
//!
//! Wire layout: `size (u32 BE) | doff (u8, 4-byte words) | type (u8) |
//! channel (u16 BE) | extended header (padded to 4) | body`. The codec
//! owns the whole header; the transport above it owns nothing but
//! buffers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hematite_types::performatives::Performative;
use hematite_types::sasl::SaslFrameBody;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::Payload;

/// Type byte of AMQP frames
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Type byte of SASL frames
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Fixed header length in bytes, and the minimum doff
const HEADER_SIZE: usize = 8;
const MIN_DOFF: u8 = 2;

/// Framing failures; all of them are fatal to the connection
#[derive(Debug, Error)]
pub enum Error {
    /// data-offset points inside the fixed header or past the frame
    #[error("malformed frame: doff {doff} for size {size}")]
    MalformedFrame {
        /// data-offset in 4-byte words
        doff: u8,
        /// total frame size
        size: u32,
    },

    /// The frame type byte is neither AMQP nor SASL
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// The frame exceeds the negotiated maximum
    #[error("frame of {size} bytes exceeds max-frame-size {max}")]
    FrameTooLarge {
        /// total frame size
        size: u32,
        /// negotiated maximum
        max: u32,
    },

    /// The body failed to decode or bind
    #[error(transparent)]
    Bind(#[from] hematite_types::BindError),

    /// Raw codec failure
    #[error(transparent)]
    Codec(#[from] hematite_codec::Error),

    /// Socket failure surfaced through the codec
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A raw frame: type, channel, extended header, body bytes
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// AMQP or SASL
    pub frame_type: u8,

    /// The channel the frame travels on
    pub channel: u16,

    /// Extended header bytes, rarely present
    pub extended: Bytes,

    /// Body bytes: a described performative, optionally followed by a
    /// transfer payload; empty for heartbeats
    pub body: Bytes,
}

impl Frame {
    /// An AMQP frame with no extended header
    pub fn amqp(channel: u16, body: Bytes) -> Self {
        Self {
            frame_type: FRAME_TYPE_AMQP,
            channel,
            extended: Bytes::new(),
            body,
        }
    }

    /// The empty frame used to reset the peer's idle timer
    pub fn empty() -> Self {
        Self::amqp(0, Bytes::new())
    }
}

/// Encoder/decoder for raw frames, including the size prefix
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Incoming frames larger than this fail the connection
    pub max_frame_size: u32,
}

impl FrameCodec {
    /// A codec enforcing no incoming size bound yet
    pub fn new() -> Self {
        Self {
            max_frame_size: u32::MAX,
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // extended header is padded to a 4-byte boundary
        let padding = (4 - item.extended.len() % 4) % 4;
        let doff = MIN_DOFF as usize + (item.extended.len() + padding) / 4;
        let size = HEADER_SIZE + item.extended.len() + padding + item.body.len();

        dst.put_u32(size as u32);
        dst.put_u8(doff as u8);
        dst.put_u8(item.frame_type);
        dst.put_u16(item.channel);
        dst.put_slice(&item.extended);
        dst.put_bytes(0, padding);
        dst.put_slice(&item.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let size = u32::from_be_bytes(src[0..4].try_into().unwrap());
        let doff = src[4];
        let frame_type = src[5];

        if (size as usize) < HEADER_SIZE || doff < MIN_DOFF || (doff as u32) * 4 > size {
            return Err(Error::MalformedFrame { doff, size });
        }
        if size > self.max_frame_size {
            return Err(Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if frame_type != FRAME_TYPE_AMQP && frame_type != FRAME_TYPE_SASL {
            return Err(Error::UnknownFrameType(frame_type));
        }
        if src.len() < size as usize {
            return Ok(None);
        }

        let mut frame = src.split_to(size as usize);
        frame.advance(4);
        let _doff = frame.get_u8();
        let frame_type = frame.get_u8();
        let channel = frame.get_u16();
        let extended = frame
            .split_to(doff as usize * 4 - HEADER_SIZE)
            .freeze();
        let body = frame.freeze();

        Ok(Some(Frame {
            frame_type,
            channel,
            extended,
            body,
        }))
    }
}

/// One AMQP frame body, fully typed
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A performative, with the transfer payload where one applies
    Performative {
        /// The typed body
        performative: Performative,
        /// Payload following a Transfer body
        payload: Payload,
    },

    /// The empty heartbeat frame
    Empty,
}

impl FrameBody {
    /// Wraps a payload-less performative
    pub fn from_performative(performative: impl Into<Performative>) -> Self {
        FrameBody::Performative {
            performative: performative.into(),
            payload: Bytes::new(),
        }
    }

    /// Serializes into frame body bytes
    pub fn encode(&self) -> Bytes {
        match self {
            FrameBody::Performative {
                performative,
                payload,
            } => {
                let mut buf = BytesMut::new();
                hematite_codec::encode_into(&performative.to_value(), &mut buf)
                    .expect("performative bodies are homogeneous");
                buf.put_slice(payload);
                buf.freeze()
            }
            FrameBody::Empty => Bytes::new(),
        }
    }

    /// Parses frame body bytes; anything after a Transfer body is its
    /// payload
    pub fn decode(body: &Bytes) -> Result<Self, Error> {
        if body.is_empty() {
            return Ok(FrameBody::Empty);
        }
        let (value, consumed) = hematite_codec::decode(body)?;
        let performative = Performative::from_value(value)?;
        let payload = body.slice(consumed..);
        if !payload.is_empty() && !matches!(performative, Performative::Transfer(_)) {
            return Err(hematite_codec::Error::TrailingBytes.into());
        }
        Ok(FrameBody::Performative {
            performative,
            payload,
        })
    }
}

/// Encodes a SASL body into a type-1 frame on channel 0
pub fn sasl_frame(body: &SaslFrameBody) -> Frame {
    let mut buf = BytesMut::new();
    hematite_codec::encode_into(&body.to_value(), &mut buf)
        .expect("sasl bodies are homogeneous");
    Frame {
        frame_type: FRAME_TYPE_SASL,
        channel: 0,
        extended: Bytes::new(),
        body: buf.freeze(),
    }
}

/// Decodes the body of a type-1 frame
pub fn decode_sasl(frame: &Frame) -> Result<SaslFrameBody, Error> {
    let value = hematite_codec::decode_exact(&frame.body)?;
    Ok(SaslFrameBody::from_value(value)?)
}

//! `silkport-codec` turns a raw byte stream into the frames of the Silkroad
//! Online wire format and back. Framing is only the first step: a frame is a
//! transport-level unit and does not itself carry a usable operation. The
//! layers above decrypt, validate and reassemble frames into messages.
//!
//! This crate provides two things: [WireFrame] and [FrameCodec]. The latter
//! is meant to be plugged into tokio's [tokio_util::codec::FramedRead] and
//! [tokio_util::codec::FramedWrite] and produces/consumes the former. The
//! frame type can just as well be used on its own through [WireFrame::parse]
//! and [WireFrame::serialize].

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// The opcode reserved for the fragmented-message envelope.
pub const MASSIVE_OPCODE: u16 = 0x600D;

/// The largest payload a single frame may declare. The size field could
/// technically express more, but existing peers reject anything above this.
pub const PAYLOAD_MAX: usize = 4089;

/// The bit of the size header marking an encrypted frame.
pub const ENCRYPTION_BIT: u16 = 0x8000;

const ENCRYPTED_ALIGNMENT: usize = 8;

/// Find the nearest block-aligned length.
///
/// Given the length of data to encrypt, calculates the length of the
/// encrypted region on the wire, which includes padding. Can at most grow by
/// `ENCRYPTED_ALIGNMENT - 1`, which is `7`.
pub fn aligned_length(given_length: usize) -> usize {
    let remainder = given_length % ENCRYPTED_ALIGNMENT;
    if remainder == 0 {
        return given_length;
    }

    given_length + (ENCRYPTED_ALIGNMENT - remainder)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// The size header declared a payload above [PAYLOAD_MAX].
    #[error("frame declares a {0} byte payload, above the {PAYLOAD_MAX} byte limit")]
    OversizedPayload(usize),
    /// The envelope ended before the declared content, which can only happen
    /// for decrypted envelopes handed to [WireFrame::read_envelope] directly;
    /// [WireFrame::parse] waits for the declared length instead.
    #[error("the frame envelope is truncated")]
    TruncatedEnvelope,
}

/// One atomic unit on the wire.
///
/// There are two categories of frames: packet frames and massive frames. A
/// packet frame carries a single operation under its opcode; it may travel
/// encrypted, in which case everything except the size header needs
/// decrypting before it is usable. Massive frames split one oversized
/// operation across the wire: a header frame announces the chunk count and
/// the contained opcode, and is followed by exactly that many chunk frames
/// carrying the actual bytes.
///
/// Every frame layout, including the encrypted one, reserves two extra bytes:
/// a checksum and a pseudo-random count. The former detects bit flips and
/// modifications, the latter replayed or dropped frames. Whether they are
/// filled in and validated depends on the negotiated protocol options.
///
/// Reading a frame from a byte stream is done with [WireFrame::parse]:
/// ```
/// # use bytes::Bytes;
/// # use silkport_codec::WireFrame;
/// let (_, frame) = WireFrame::parse(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x00])
///     .unwrap()
///     .unwrap();
/// assert_eq!(
///     frame,
///     WireFrame::Packet {
///         count: 0,
///         crc: 0,
///         opcode: 1,
///         data: Bytes::new(),
///     }
/// );
/// ```
///
/// Writing works in reverse through [WireFrame::serialize]:
/// ```
/// # use bytes::Bytes;
/// # use silkport_codec::WireFrame;
/// let bytes = WireFrame::Packet {
///     count: 0,
///     crc: 0,
///     opcode: 1,
///     data: Bytes::new(),
/// }
/// .serialize();
/// assert_eq!(bytes.as_ref(), &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
/// ```
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum WireFrame {
    /// A plain frame carrying exactly one operation.
    Packet {
        count: u8,
        crc: u8,
        opcode: u16,
        data: Bytes,
    },
    /// A frame whose envelope is still encrypted. `content_size` is the
    /// plaintext payload length from the size header; the cipher text is
    /// block-aligned and thus possibly longer.
    Encrypted {
        content_size: usize,
        cipher_text: Bytes,
    },
    /// The announcement of a fragmented operation: how many chunk frames
    /// follow and which opcode their combined bytes belong to.
    MassiveHeader {
        count: u8,
        crc: u8,
        inner_opcode: u16,
        chunk_count: u16,
    },
    /// One slice of a fragmented operation. Must follow a
    /// [WireFrame::MassiveHeader].
    MassiveChunk { count: u8, crc: u8, data: Bytes },
}

impl WireFrame {
    /// Tries to parse the first frame out of `data`.
    ///
    /// Returns the frame along with the number of bytes it consumed, or
    /// `Ok(None)` when `data` does not yet hold a complete frame. A size
    /// header violating the payload limit fails with
    /// [FrameError::OversizedPayload] straight away, without waiting for the
    /// rest of the bytes to arrive.
    pub fn parse(data: &[u8]) -> Result<Option<(usize, WireFrame)>, FrameError> {
        if data.len() < 2 {
            return Ok(None);
        }

        let size = LittleEndian::read_u16(&data[0..2]);
        let encrypted = size & ENCRYPTION_BIT != 0;
        let content_size = usize::from(size & !ENCRYPTION_BIT);
        if content_size > PAYLOAD_MAX {
            return Err(FrameError::OversizedPayload(content_size));
        }

        let envelope_size = if encrypted {
            aligned_length(content_size + 4)
        } else {
            content_size + 4
        };

        if data.len() < envelope_size + 2 {
            return Ok(None);
        }

        let envelope = &data[2..envelope_size + 2];
        let consumed = envelope_size + 2;
        if encrypted {
            return Ok(Some((
                consumed,
                WireFrame::Encrypted {
                    content_size,
                    cipher_text: Bytes::copy_from_slice(envelope),
                },
            )));
        }

        Ok(Some((
            consumed,
            Self::read_envelope(envelope, content_size)?,
        )))
    }

    /// Builds a frame from a plaintext envelope (`opcode | count | crc |
    /// payload`, possibly followed by padding).
    ///
    /// This is the second half of [WireFrame::parse] and is used on its own
    /// for envelopes that have just been decrypted: the cipher padding is
    /// sliced off using `content_size` from the size header. An envelope with
    /// the massive opcode must additionally contain a well-formed massive
    /// payload; anything short fails with [FrameError::TruncatedEnvelope].
    pub fn read_envelope(data: &[u8], content_size: usize) -> Result<WireFrame, FrameError> {
        if data.len() < content_size + 4 {
            return Err(FrameError::TruncatedEnvelope);
        }

        let opcode = LittleEndian::read_u16(&data[0..2]);
        let count = data[2];
        let crc = data[3];
        let payload = &data[4..content_size + 4];

        if opcode == MASSIVE_OPCODE {
            let Some((&mode, rest)) = payload.split_first() else {
                return Err(FrameError::TruncatedEnvelope);
            };
            if mode == 1 {
                if rest.len() < 4 {
                    return Err(FrameError::TruncatedEnvelope);
                }
                let chunk_count = LittleEndian::read_u16(&rest[0..2]);
                let inner_opcode = LittleEndian::read_u16(&rest[2..4]);
                return Ok(WireFrame::MassiveHeader {
                    count,
                    crc,
                    inner_opcode,
                    chunk_count,
                });
            }
            return Ok(WireFrame::MassiveChunk {
                count,
                crc,
                data: Bytes::copy_from_slice(rest),
            });
        }

        Ok(WireFrame::Packet {
            count,
            crc,
            opcode,
            data: Bytes::copy_from_slice(payload),
        })
    }

    /// The value of the size header field for this frame.
    ///
    /// Depending on the frame this is either the payload length (packet
    /// frame), the plaintext length before padding (encrypted frame), a
    /// fixed size (massive header) or the chunk length plus its mode byte
    /// (massive chunk).
    pub fn content_size(&self) -> usize {
        match self {
            WireFrame::Packet { data, .. } => data.len(),
            WireFrame::Encrypted { content_size, .. } => *content_size,
            // Mode byte, chunk count, contained opcode, reserved byte.
            WireFrame::MassiveHeader { .. } => 6,
            WireFrame::MassiveChunk { data, .. } => 1 + data.len(),
        }
    }

    /// The total number of bytes this frame occupies on the wire, including
    /// the size header and, for encrypted frames, the cipher padding.
    pub fn wire_size(&self) -> usize {
        match self {
            WireFrame::Encrypted { content_size, .. } => aligned_length(*content_size + 4) + 2,
            _ => 6 + self.content_size(),
        }
    }

    /// The opcode of this frame, unless it is still encrypted.
    pub fn opcode(&self) -> Option<u16> {
        match self {
            WireFrame::Packet { opcode, .. } => Some(*opcode),
            WireFrame::Encrypted { .. } => None,
            _ => Some(MASSIVE_OPCODE),
        }
    }

    /// Serializes this frame into a freshly allocated buffer of exactly
    /// [wire_size][Self::wire_size] bytes.
    pub fn serialize(&self) -> Bytes {
        let mut output = BytesMut::with_capacity(self.wire_size());

        match self {
            WireFrame::Packet {
                count,
                crc,
                opcode,
                data,
            } => {
                output.put_u16_le(self.content_size() as u16);
                output.put_u16_le(*opcode);
                output.put_u8(*count);
                output.put_u8(*crc);
                output.put_slice(data);
            }
            WireFrame::Encrypted {
                content_size,
                cipher_text,
            } => {
                output.put_u16_le(*content_size as u16 | ENCRYPTION_BIT);
                output.put_slice(cipher_text);
            }
            WireFrame::MassiveHeader {
                count,
                crc,
                inner_opcode,
                chunk_count,
            } => {
                output.put_u16_le(self.content_size() as u16);
                output.put_u16_le(MASSIVE_OPCODE);
                output.put_u8(*count);
                output.put_u8(*crc);
                output.put_u8(1);
                output.put_u16_le(*chunk_count);
                output.put_u16_le(*inner_opcode);
                output.put_u8(0);
            }
            WireFrame::MassiveChunk { count, crc, data } => {
                output.put_u16_le(self.content_size() as u16);
                output.put_u16_le(MASSIVE_OPCODE);
                output.put_u8(*count);
                output.put_u8(*crc);
                output.put_u8(0);
                output.put_slice(data);
            }
        }

        output.freeze()
    }
}

#[cfg(feature = "codec")]
pub use codec::*;

#[cfg(feature = "codec")]
mod codec {
    use super::*;
    use bytes::Buf;
    use std::io;
    use tokio_util::codec::{Decoder, Encoder};

    /// A codec reading and writing [WireFrame]s on a byte stream, for use
    /// with tokio's framed read/write halves. Wraps [WireFrame::parse] and
    /// [WireFrame::serialize]; malformed size headers surface as
    /// [io::ErrorKind::InvalidData].
    pub struct FrameCodec;

    impl Encoder<WireFrame> for FrameCodec {
        type Error = io::Error;

        fn encode(&mut self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
            dst.extend_from_slice(&item.serialize());
            Ok(())
        }
    }

    impl Decoder for FrameCodec {
        type Item = WireFrame;
        type Error = io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
            match WireFrame::parse(src) {
                Ok(Some((consumed, frame))) => {
                    src.advance(consumed);
                    Ok(Some(frame))
                }
                Ok(None) => Ok(None),
                Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            }
        }
    }
}

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use silkport_codec::{
    aligned_length, FrameCodec, FrameError, WireFrame, ENCRYPTION_BIT, MASSIVE_OPCODE, PAYLOAD_MAX,
};
use silkport_message::Message;
use silkport_security::{Checksum, ChecksumBuilder, CountGenerator, SessionEncryption};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};

/// The most payload bytes a massive chunk can carry; one byte of the frame
/// payload is taken by the mode marker.
pub const CHUNK_CAPACITY: usize = PAYLOAD_MAX - 1;

/// A violation of the wire protocol by the other side. Every variant is
/// fatal: the session that observes one closes the connection.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    /// The count byte disagreed with the local generator, meaning a frame was
    /// dropped, injected or replayed.
    #[error("the frame count byte was {received} but {expected} was expected")]
    CountMismatch { expected: u8, received: u8 },
    /// The checksum byte disagreed with the locally computed digest.
    #[error("the frame checksum was {received} but {expected} was expected")]
    ChecksumMismatch { expected: u8, received: u8 },
    /// An encrypted frame arrived although no encryption was negotiated.
    #[error("received an encrypted frame without negotiated encryption")]
    UnexpectedEncryptedFrame,
    /// A plain frame arrived although the session is encrypted.
    #[error("received a plain frame on an encrypted session")]
    UnexpectedPlainFrame,
    /// A fragment chunk arrived without a header, or after its header's
    /// chunks were already consumed.
    #[error("received a fragment chunk without a pending header")]
    StrayChunk,
    /// A fragment header arrived while a previous fragmented message was
    /// still incomplete.
    #[error("received a fragment header while another fragmented message was incomplete")]
    NestedHeader,
    /// A regular frame arrived in the middle of a fragmented message.
    #[error("received a non-fragment frame while a fragmented message was incomplete")]
    InterruptedFragment,
    /// A non-massive message too large for a single frame was handed to the
    /// sending side.
    #[error("a message of {0} bytes does not fit a single frame")]
    OversizedMessage(usize),
    /// The frame layer rejected the raw bytes.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Errors for possible problems writing messages.
#[derive(Debug, Error)]
pub enum OutStreamError {
    /// The underlying transport was disconnected or otherwise impaired.
    #[error("some IO level error occurred")]
    Io(#[from] io::Error),
    /// The message cannot be represented on the wire.
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
}

/// Errors encountered when reading messages. Unlike [OutStreamError] there
/// are many more possibilities here, as this deals with untrusted input.
#[derive(Debug, Error)]
pub enum InStreamError {
    /// The underlying transport was disconnected or otherwise impaired.
    #[error("some IO level error occurred")]
    Io(#[from] io::Error),
    /// The end of the stream was reached.
    #[error("reached the end of the stream")]
    EndOfStream,
    /// The other side violated the protocol.
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
}

/// The count generator and checksum of one transfer direction.
///
/// Each direction of a connection advances its own count sequence, one step
/// per frame; both directions are seeded with the same values, so the
/// sender's generator stays in lockstep with the receiver's regardless of how
/// the two directions interleave.
pub struct FrameChecks {
    counter: CountGenerator,
    checksum: Checksum,
}

impl FrameChecks {
    pub fn from_seeds(count_seed: u32, crc_seed: u32) -> Self {
        Self {
            counter: CountGenerator::new(count_seed),
            checksum: Checksum::new(crc_seed),
        }
    }
}

/// Computes the checksum a frame should carry: the digest over the size
/// header and the envelope, with the checksum position itself zeroed.
fn frame_checksum(checks: &FrameChecks, frame: &WireFrame, encrypted: bool) -> u8 {
    let size = frame.content_size() as u16 | if encrypted { ENCRYPTION_BIT } else { 0 };
    let mut builder = checks.checksum.builder();
    builder.update(&size.to_le_bytes());

    match frame {
        WireFrame::Packet {
            count,
            opcode,
            data,
            ..
        } => {
            builder.update(&opcode.to_le_bytes());
            builder.update_byte(*count);
            builder.update_byte(0);
            builder.update(data);
        }
        WireFrame::MassiveHeader {
            count,
            inner_opcode,
            chunk_count,
            ..
        } => {
            massive_prelude(&mut builder, *count, 1);
            // The reference peers fold the contained opcode in before the
            // chunk count, the reverse of the wire byte order.
            builder.update(&inner_opcode.to_le_bytes());
            builder.update(&chunk_count.to_le_bytes());
            builder.update_byte(0);
        }
        WireFrame::MassiveChunk { count, data, .. } => {
            massive_prelude(&mut builder, *count, 0);
            builder.update(data);
        }
        // Encrypted frames are digested in their plaintext form.
        WireFrame::Encrypted { .. } => unreachable!("checksums cover plaintext envelopes"),
    }

    builder.digest()
}

fn massive_prelude(builder: &mut ChecksumBuilder, count: u8, mode: u8) {
    builder.update(&MASSIVE_OPCODE.to_le_bytes());
    builder.update_byte(count);
    builder.update_byte(0);
    builder.update_byte(mode);
}

fn stamp_check_bytes(frame: &mut WireFrame, new_count: u8, new_crc: u8) {
    match frame {
        WireFrame::Packet { count, crc, .. }
        | WireFrame::MassiveHeader { count, crc, .. }
        | WireFrame::MassiveChunk { count, crc, .. } => {
            *count = new_count;
            *crc = new_crc;
        }
        WireFrame::Encrypted { .. } => {}
    }
}

fn check_bytes(frame: &WireFrame) -> (u8, u8) {
    match frame {
        WireFrame::Packet { count, crc, .. }
        | WireFrame::MassiveHeader { count, crc, .. }
        | WireFrame::MassiveChunk { count, crc, .. } => (*count, *crc),
        WireFrame::Encrypted { .. } => (0, 0),
    }
}

struct Assembly {
    opcode: u16,
    buffer: BytesMut,
    remaining: u16,
}

/// The reading half of a connection.
///
/// Wraps the frame codec and applies the negotiated security on everything
/// that arrives: encrypted envelopes are decrypted, count and checksum bytes
/// validated, and fragmented messages reassembled. What comes out of
/// [next_message][Self::next_message] is a complete, validated [Message].
pub struct FrameReader<R> {
    frames: FramedRead<R, FrameCodec>,
    encryption: Option<Arc<SessionEncryption>>,
    checks: Option<FrameChecks>,
    assembly: Option<Assembly>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(transport: R) -> Self {
        Self {
            frames: FramedRead::new(transport, FrameCodec),
            encryption: None,
            checks: None,
            assembly: None,
        }
    }

    /// Enables decryption for everything read from now on.
    ///
    /// A connection starts out unencrypted; the handshake installs the
    /// negotiated encryption once both sides have derived it. An [Arc] is
    /// expected because the writing half shares the same encryption.
    pub fn enable_encryption(&mut self, encryption: Arc<SessionEncryption>) {
        self.encryption = Some(encryption);
    }

    /// Enables count and checksum validation for everything read from now on.
    pub fn enable_checks(&mut self, checks: FrameChecks) {
        self.checks = Some(checks);
    }

    /// Drops all security state, along with any half-assembled message.
    pub fn clear(&mut self) {
        self.encryption = None;
        self.checks = None;
        self.assembly = None;
    }

    /// Reads and validates the next frame.
    ///
    /// Encrypted envelopes come out decrypted; the returned frame is always
    /// one of the plaintext variants. The encryption state of the frame must
    /// agree with the negotiated one, in both directions: the size header
    /// bit is authoritative, and a mismatch is a protocol violation.
    pub async fn next_frame(&mut self) -> Result<WireFrame, InStreamError> {
        let Some(result) = self.frames.next().await else {
            return Err(InStreamError::EndOfStream);
        };
        let frame = result.map_err(map_codec_error)?;

        match frame {
            WireFrame::Encrypted {
                content_size,
                cipher_text,
            } => {
                let Some(encryption) = self.encryption.as_ref() else {
                    return Err(ProtocolViolation::UnexpectedEncryptedFrame.into());
                };
                let plain = encryption
                    .decrypt(&cipher_text)
                    .expect("parsed cipher text is block aligned");
                let frame = WireFrame::read_envelope(&plain, content_size)
                    .map_err(ProtocolViolation::Frame)?;
                self.validate(&frame, true)?;
                Ok(frame)
            }
            frame => {
                if self.encryption.is_some() {
                    return Err(ProtocolViolation::UnexpectedPlainFrame.into());
                }
                self.validate(&frame, false)?;
                Ok(frame)
            }
        }
    }

    fn validate(&mut self, frame: &WireFrame, encrypted: bool) -> Result<(), ProtocolViolation> {
        let Some(checks) = self.checks.as_mut() else {
            return Ok(());
        };

        let (count, crc) = check_bytes(frame);
        let expected_count = checks.counter.next_byte();
        if count != expected_count {
            return Err(ProtocolViolation::CountMismatch {
                expected: expected_count,
                received: count,
            });
        }

        let expected_crc = frame_checksum(checks, frame, encrypted);
        if crc != expected_crc {
            return Err(ProtocolViolation::ChecksumMismatch {
                expected: expected_crc,
                received: crc,
            });
        }

        Ok(())
    }

    /// Reads the next complete message, reassembling fragmented ones.
    ///
    /// A regular frame yields a message immediately. A massive header frame
    /// opens an assembly; the announced number of chunk frames must follow
    /// back to back, and their combined payload is delivered as one message
    /// under the announced opcode. Any deviation from that sequence is a
    /// protocol violation.
    pub async fn next_message(&mut self) -> Result<Message, InStreamError> {
        loop {
            let frame = self.next_frame().await?;
            match frame {
                WireFrame::Packet { opcode, data, .. } => {
                    if self.assembly.is_some() {
                        return Err(ProtocolViolation::InterruptedFragment.into());
                    }
                    return Ok(Message::from_payload(opcode, &data));
                }
                WireFrame::MassiveHeader {
                    inner_opcode,
                    chunk_count,
                    ..
                } => {
                    if self.assembly.is_some() {
                        return Err(ProtocolViolation::NestedHeader.into());
                    }
                    self.assembly = Some(Assembly {
                        opcode: inner_opcode,
                        buffer: BytesMut::new(),
                        remaining: chunk_count,
                    });
                }
                WireFrame::MassiveChunk { data, .. } => {
                    let Some(assembly) = self.assembly.as_mut() else {
                        return Err(ProtocolViolation::StrayChunk.into());
                    };
                    if assembly.remaining == 0 {
                        return Err(ProtocolViolation::StrayChunk.into());
                    }
                    assembly.buffer.extend_from_slice(&data);
                    assembly.remaining -= 1;
                    if assembly.remaining == 0 {
                        let assembly = self.assembly.take().expect("assembly was just observed");
                        let mut message =
                            Message::from_payload(assembly.opcode, &assembly.buffer);
                        message.set_massive(true);
                        return Ok(message);
                    }
                }
                WireFrame::Encrypted { .. } => {
                    unreachable!("next_frame only returns plaintext frames")
                }
            }
        }
    }
}

fn map_codec_error(error: io::Error) -> InStreamError {
    if error.kind() == io::ErrorKind::InvalidData {
        if let Some(inner) = error.into_inner() {
            return match inner.downcast::<FrameError>() {
                Ok(frame_error) => ProtocolViolation::Frame(*frame_error).into(),
                Err(other) => io::Error::new(io::ErrorKind::InvalidData, other).into(),
            };
        }
        return io::Error::from(io::ErrorKind::InvalidData).into();
    }
    error.into()
}

/// The writing half of a connection.
///
/// The counterpart to [FrameReader]: stamps count and checksum bytes,
/// encrypts envelopes once encryption is enabled, and splits messages marked
/// massive across a header frame and as many chunk frames as needed.
pub struct FrameWriter<W> {
    frames: FramedWrite<W, FrameCodec>,
    encryption: Option<Arc<SessionEncryption>>,
    checks: Option<FrameChecks>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(transport: W) -> Self {
        Self {
            frames: FramedWrite::new(transport, FrameCodec),
            encryption: None,
            checks: None,
        }
    }

    /// Enables encryption for everything written from now on. The [Arc] is
    /// shared with the reading half.
    pub fn enable_encryption(&mut self, encryption: Arc<SessionEncryption>) {
        self.encryption = Some(encryption);
    }

    /// Enables count and checksum stamping for everything written from now
    /// on.
    pub fn enable_checks(&mut self, checks: FrameChecks) {
        self.checks = Some(checks);
    }

    /// Sends one message, splitting it into massive frames when requested.
    ///
    /// A message without the massive flag must fit a single frame; one with
    /// it is split into a header frame and chunks of up to [CHUNK_CAPACITY]
    /// payload bytes each, in order.
    pub async fn send_message(&mut self, message: &Message) -> Result<(), OutStreamError> {
        let data = message.as_data();

        if !message.is_massive() {
            if data.len() > PAYLOAD_MAX {
                return Err(ProtocolViolation::OversizedMessage(data.len()).into());
            }
            return self
                .send_frame(WireFrame::Packet {
                    count: 0,
                    crc: 0,
                    opcode: message.opcode(),
                    data: Bytes::copy_from_slice(data),
                })
                .await;
        }

        let mut chunks: Vec<&[u8]> = data.chunks(CHUNK_CAPACITY).collect();
        if chunks.is_empty() {
            // An empty massive message still transfers one (empty) chunk.
            chunks.push(&[]);
        }

        self.send_frame(WireFrame::MassiveHeader {
            count: 0,
            crc: 0,
            inner_opcode: message.opcode(),
            chunk_count: chunks.len() as u16,
        })
        .await?;

        for chunk in chunks {
            self.send_frame(WireFrame::MassiveChunk {
                count: 0,
                crc: 0,
                data: Bytes::copy_from_slice(chunk),
            })
            .await?;
        }

        Ok(())
    }

    async fn send_frame(&mut self, mut frame: WireFrame) -> Result<(), OutStreamError> {
        let encrypt = self.encryption.is_some();
        if let Some(checks) = self.checks.as_mut() {
            let count = checks.counter.next_byte();
            stamp_check_bytes(&mut frame, count, 0);
            let crc = frame_checksum(checks, &frame, encrypt);
            stamp_check_bytes(&mut frame, count, crc);
        }

        if let Some(encryption) = self.encryption.as_ref() {
            let content_size = frame.content_size();
            let serialized = frame.serialize();
            let mut envelope = BytesMut::with_capacity(aligned_length(content_size + 4));
            envelope.extend_from_slice(&serialized[2..]);
            envelope.resize(aligned_length(content_size + 4), 0);
            encryption
                .encrypt_mut(&mut envelope)
                .expect("envelope is block aligned");
            frame = WireFrame::Encrypted {
                content_size,
                cipher_text: envelope.freeze(),
            };
        }

        self.frames.send(frame).await?;
        Ok(())
    }

    /// Flushes pending frames and shuts the transport down. All key material
    /// is dropped in the process.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.encryption = None;
        self.checks = None;
        self.frames.flush().await?;
        self.frames.get_mut().shutdown().await
    }
}

//! The setup exchange that takes a freshly connected transport to a ready
//! session.
//!
//! The exchange consists of four frames. The active side opens with a setup
//! frame declaring the selected [ProtocolOptions] and, depending on those,
//! the check seeds and the public key exchange values. The passive side
//! answers with its own public value and a proof of the derived secret, the
//! active side responds with the reverse proof as a challenge, and the
//! passive side acknowledges. When the active side requests no features at
//! all, the exchange collapses to the opening frame and the acknowledgment.
//!
//! The cryptography lives in [silkport_security::handshake]; this module owns
//! the wire representation of the setup frames and drives the exchange over
//! the stream halves, installing the negotiated encryption and check seeds
//! into both once the exchange completes.

use crate::session::ProtocolState;
use crate::stream::{FrameChecks, FrameReader, FrameWriter, InStreamError, OutStreamError};
use silkport_codec::WireFrame;
use silkport_message::{Message, MessageError};
use silkport_security::handshake::{CheckSeeds, ExchangeSeeds, HandshakeInit};
use silkport_security::{
    ActiveHandshake, PassiveHandshake, ProtocolOptions, SecurityError, SessionEncryption,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// The opcode every setup frame travels under.
pub const SETUP_OPCODE: u16 = 0x5000;

/// The opcode of the final acknowledgment sent by the passive side.
pub const SETUP_ACCEPT_OPCODE: u16 = 0x9000;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("a stream level error occurred while reading")]
    Input(#[from] InStreamError),
    #[error("a stream level error occurred while writing")]
    Output(#[from] OutStreamError),
    #[error("a security level error occurred")]
    Security(#[from] SecurityError),
    /// Nothing but setup frames may travel before the handshake completes.
    #[error("received opcode {0:#06x} before the handshake completed")]
    UnexpectedOpcode(u16),
    /// A setup frame was shorter than its option selection requires.
    #[error("a setup frame ended prematurely")]
    MalformedSetup(#[from] MessageError),
    /// The opening frame carried option bits we don't know.
    #[error("a setup frame declared unsupported options {0:#04x}")]
    InvalidOptions(u8),
    /// Something other than the key challenge arrived where the challenge was
    /// expected.
    #[error("expected the key challenge but received a different setup frame")]
    MissingChallenge,
}

/// Drives the active side of the exchange and installs the outcome into the
/// given stream halves. Returns the negotiated options.
pub async fn perform_active<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    options: ProtocolOptions,
    state: &mut ProtocolState,
) -> Result<ProtocolOptions, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut handshake = ActiveHandshake::default();
    let init = handshake.initialize(options)?;
    writer.send_message(&encode_init(&init)).await?;
    *state = ProtocolState::HandshakeChallenge;

    if init.exchange.is_some() {
        let (opcode, mut response) = next_setup(reader).await?;
        if opcode != SETUP_OPCODE {
            return Err(HandshakeError::UnexpectedOpcode(opcode));
        }
        let public = response.read_u32()?;
        let proof = response.read_u64()?;
        let challenge = handshake.start_challenge(public, proof)?;

        let mut message = Message::new(SETUP_OPCODE);
        message.write_u8(ProtocolOptions::KEY_CHALLENGE.bits());
        message.write_u64(challenge);
        writer.send_message(&message).await?;
    }

    let (opcode, _) = next_setup(reader).await?;
    if opcode != SETUP_ACCEPT_OPCODE {
        return Err(HandshakeError::UnexpectedOpcode(opcode));
    }

    install(reader, writer, handshake.finish()?, init.checks);
    debug!(options = ?options, "handshake completed as active side");
    Ok(options)
}

/// Drives the passive side of the exchange and installs the outcome into the
/// given stream halves. Returns the options the active side selected.
pub async fn perform_passive<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    state: &mut ProtocolState,
) -> Result<ProtocolOptions, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (opcode, mut opening) = next_setup(reader).await?;
    if opcode != SETUP_OPCODE {
        return Err(HandshakeError::UnexpectedOpcode(opcode));
    }
    let init = decode_init(&mut opening)?;
    *state = ProtocolState::HandshakeChallenge;

    let mut handshake = PassiveHandshake::default();
    if let Some((proof, public)) = handshake.initialize(init.exchange)? {
        let mut message = Message::new(SETUP_OPCODE);
        message.write_u32(public);
        message.write_u64(proof);
        writer.send_message(&message).await?;

        let (opcode, mut frame) = next_setup(reader).await?;
        if opcode != SETUP_OPCODE {
            return Err(HandshakeError::UnexpectedOpcode(opcode));
        }
        if frame.read_u8()? != ProtocolOptions::KEY_CHALLENGE.bits() {
            return Err(HandshakeError::MissingChallenge);
        }
        handshake.finish(frame.read_u64()?)?;
    }

    writer.send_message(&Message::new(SETUP_ACCEPT_OPCODE)).await?;

    install(reader, writer, handshake.done()?, init.checks);
    debug!(options = ?init.options, "handshake completed as passive side");
    Ok(init.options)
}

fn install<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    encryption: Option<SessionEncryption>,
    checks: Option<CheckSeeds>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(encryption) = encryption {
        let encryption = Arc::new(encryption);
        reader.enable_encryption(Arc::clone(&encryption));
        writer.enable_encryption(encryption);
    }
    if let Some(seeds) = checks {
        reader.enable_checks(FrameChecks::from_seeds(seeds.count_seed, seeds.crc_seed));
        writer.enable_checks(FrameChecks::from_seeds(seeds.count_seed, seeds.crc_seed));
    }
}

async fn next_setup<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<(u16, Message), HandshakeError> {
    match reader.next_frame().await? {
        WireFrame::Packet { opcode, data, .. } => {
            Ok((opcode, Message::from_payload(opcode, &data)))
        }
        frame => Err(HandshakeError::UnexpectedOpcode(
            frame.opcode().unwrap_or_default(),
        )),
    }
}

fn encode_init(init: &HandshakeInit) -> Message {
    let mut message = Message::new(SETUP_OPCODE);
    message.write_u8(init.options.bits());
    if let Some(checks) = init.checks {
        message.write_u32(checks.count_seed);
        message.write_u32(checks.crc_seed);
    }
    if let Some(exchange) = init.exchange {
        message.write_u64(exchange.seed);
        message.write_u64(exchange.handshake_seed);
        message.write_u32(exchange.generator);
        message.write_u32(exchange.prime);
        message.write_u32(exchange.public);
    }
    message
}

fn decode_init(message: &mut Message) -> Result<HandshakeInit, HandshakeError> {
    let bits = message.read_u8()?;
    let options =
        ProtocolOptions::from_bits(bits).ok_or(HandshakeError::InvalidOptions(bits))?;
    if options.contains(ProtocolOptions::KEY_CHALLENGE) {
        return Err(HandshakeError::InvalidOptions(bits));
    }
    // Encryption and the key exchange only come as a pair.
    let exchange_bits = ProtocolOptions::ENCRYPTION | ProtocolOptions::KEY_EXCHANGE;
    if options.intersects(exchange_bits) && !options.contains(exchange_bits) {
        return Err(HandshakeError::InvalidOptions(bits));
    }

    let checks = if options.contains(ProtocolOptions::ERROR_DETECTION) {
        Some(CheckSeeds {
            count_seed: message.read_u32()?,
            crc_seed: message.read_u32()?,
        })
    } else {
        None
    };
    let exchange = if options.contains(exchange_bits) {
        Some(ExchangeSeeds {
            seed: message.read_u64()?,
            handshake_seed: message.read_u64()?,
            generator: message.read_u32()?,
            prime: message.read_u32()?,
            public: message.read_u32()?,
        })
    } else {
        None
    };

    Ok(HandshakeInit {
        options,
        checks,
        exchange,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    fn halves(
        transport: DuplexStream,
    ) -> (
        FrameReader<ReadHalf<DuplexStream>>,
        FrameWriter<WriteHalf<DuplexStream>>,
    ) {
        let (read, write) = split(transport);
        (FrameReader::new(read), FrameWriter::new(write))
    }

    #[tokio::test]
    async fn four_frame_exchange_reaches_ready_on_both_sides() {
        let (active_transport, passive_transport) = duplex(4096);
        let (mut active_reader, mut active_writer) = halves(active_transport);

        let passive = tokio::spawn(async move {
            let (mut reader, mut writer) = halves(passive_transport);
            let mut state = ProtocolState::WaitSetup;
            let options = perform_passive(&mut reader, &mut writer, &mut state)
                .await
                .expect("passive handshake should succeed");
            (reader, writer, options)
        });

        let mut state = ProtocolState::HandshakeBegin;
        let options = perform_active(
            &mut active_reader,
            &mut active_writer,
            ProtocolOptions::default(),
            &mut state,
        )
        .await
        .expect("active handshake should succeed");
        assert_eq!(ProtocolOptions::default(), options);

        let (mut passive_reader, mut passive_writer, passive_options) =
            passive.await.expect("passive task should not panic");
        assert_eq!(ProtocolOptions::default(), passive_options);

        // Both directions now run encrypted with matching check seeds.
        let mut ping = Message::new(0x2001);
        ping.write_string("from active");
        active_writer.send_message(&ping).await.unwrap();
        let mut received = passive_reader.next_message().await.unwrap();
        assert_eq!(0x2001, received.opcode());
        assert_eq!("from active", received.read_string().unwrap());

        let mut pong = Message::new(0x2002);
        pong.write_string("from passive");
        passive_writer.send_message(&pong).await.unwrap();
        let mut received = active_reader.next_message().await.unwrap();
        assert_eq!(0x2002, received.opcode());
        assert_eq!("from passive", received.read_string().unwrap());
    }

    #[tokio::test]
    async fn empty_options_finish_without_encryption() {
        let (active_transport, passive_transport) = duplex(4096);
        let (mut active_reader, mut active_writer) = halves(active_transport);

        let passive = tokio::spawn(async move {
            let (mut reader, mut writer) = halves(passive_transport);
            let mut state = ProtocolState::WaitSetup;
            let options = perform_passive(&mut reader, &mut writer, &mut state)
                .await
                .expect("passive handshake should succeed");
            (reader, writer, options)
        });

        let mut state = ProtocolState::HandshakeBegin;
        let options = perform_active(
            &mut active_reader,
            &mut active_writer,
            ProtocolOptions::empty(),
            &mut state,
        )
        .await
        .expect("active handshake should succeed");
        assert!(options.is_empty());

        let (mut passive_reader, _passive_writer, passive_options) =
            passive.await.expect("passive task should not panic");
        assert!(passive_options.is_empty());

        // Frames stay plain afterwards.
        active_writer.send_message(&Message::new(0x2001)).await.unwrap();
        let received = passive_reader.next_message().await.unwrap();
        assert_eq!(0x2001, received.opcode());
    }

    #[tokio::test]
    async fn checks_without_encryption_are_installed() {
        let (active_transport, passive_transport) = duplex(4096);
        let (mut active_reader, mut active_writer) = halves(active_transport);

        let passive = tokio::spawn(async move {
            let (mut reader, mut writer) = halves(passive_transport);
            let mut state = ProtocolState::WaitSetup;
            perform_passive(&mut reader, &mut writer, &mut state)
                .await
                .expect("passive handshake should succeed");
            (reader, writer)
        });

        let mut state = ProtocolState::HandshakeBegin;
        perform_active(
            &mut active_reader,
            &mut active_writer,
            ProtocolOptions::ERROR_DETECTION,
            &mut state,
        )
        .await
        .expect("active handshake should succeed");

        let (mut passive_reader, _passive_writer) = passive.await.unwrap();

        let mut message = Message::new(0x2002);
        message.write_bytes(b"hi");
        active_writer.send_message(&message).await.unwrap();
        let received = passive_reader.next_message().await.unwrap();
        assert_eq!(b"hi", received.as_data());
    }

    #[tokio::test]
    async fn split_encryption_bits_are_rejected() {
        let (active_transport, passive_transport) = duplex(4096);
        let (_active_reader, mut active_writer) = halves(active_transport);
        let (mut passive_reader, mut passive_writer) = halves(passive_transport);

        // A hand-built opening frame selecting encryption without the key
        // exchange, which no conforming active side produces.
        let mut opening = Message::new(SETUP_OPCODE);
        opening.write_u8(ProtocolOptions::ENCRYPTION.bits());
        active_writer.send_message(&opening).await.unwrap();

        let mut state = ProtocolState::WaitSetup;
        let result = perform_passive(&mut passive_reader, &mut passive_writer, &mut state).await;
        assert!(matches!(
            result,
            Err(HandshakeError::InvalidOptions(bits)) if bits == ProtocolOptions::ENCRYPTION.bits()
        ));
    }

    #[tokio::test]
    async fn non_setup_opcode_fails_the_handshake() {
        let (active_transport, passive_transport) = duplex(4096);
        let (mut active_reader, mut active_writer) = halves(active_transport);

        let rogue = tokio::spawn(async move {
            let (_reader, mut writer) = halves(passive_transport);
            writer.send_message(&Message::new(0x2001)).await.unwrap();
        });

        let mut state = ProtocolState::HandshakeBegin;
        let result = perform_active(
            &mut active_reader,
            &mut active_writer,
            ProtocolOptions::default(),
            &mut state,
        )
        .await;
        assert!(matches!(
            result,
            Err(HandshakeError::UnexpectedOpcode(0x2001))
        ));
        rogue.await.unwrap();
    }
}

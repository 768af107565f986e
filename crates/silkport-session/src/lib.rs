//! Session runtime for connections speaking the Silkroad Online wire
//! protocol.
//!
//! While the lower level crates of the stack can be used on their own —
//! [silkport_codec] for framing, [silkport_security] for the cryptography —
//! wiring them together correctly takes care: frames need their security
//! bytes stamped and validated, envelopes encrypted and decrypted, oversized
//! messages fragmented and reassembled, and the whole thing bootstrapped by
//! the setup exchange. This crate owns that wiring.
//!
//! The entry point is [Session]: construct the [active][Session::active] or
//! [passive][Session::passive] end over any connected transport (a
//! [tokio::net::TcpStream], usually), register handlers for the opcodes you
//! care about, and call [Session::run]. The session performs the handshake
//! for its role and then dispatches every inbound message to its handlers
//! until the connection ends or a protocol fault closes it.
//!
//! ```no_run
//! # use silkport_session::{Session, Message};
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = tokio::net::TcpStream::connect("127.0.0.1:15779").await?;
//! let mut session = Session::passive(transport);
//! session.register(0x2002, |_session, mut message| async move {
//!     println!("echo said: {}", message.read_string()?);
//!     Ok(())
//! });
//! session.run().await;
//! # Ok(())
//! # }
//! ```
//!
//! For finer control the stream layer is public as well:
//! [stream::FrameReader] and [stream::FrameWriter] turn a transport half
//! into validated messages without the session loop on top, and
//! [handshake::perform_active] / [handshake::perform_passive] run the setup
//! exchange over such halves directly.

pub mod handshake;
pub mod registry;
pub mod session;
pub mod stream;

pub mod message {
    pub use silkport_message::*;
}

pub mod security {
    pub use silkport_security::*;
}

pub use registry::{
    boxed_handler, HandlerError, HandlerFuture, HandlerRegistry, HandlerResult, MessageHandler,
    Service,
};
pub use session::{ProtocolState, Session, SessionError, SessionHandle};
pub use silkport_message::Message;
pub use stream::{
    FrameChecks, FrameReader, FrameWriter, InStreamError, OutStreamError, ProtocolViolation,
};

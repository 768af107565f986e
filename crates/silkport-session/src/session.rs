//! The session: one end of a connection, from the raw transport up to
//! handler dispatch.
//!
//! A [Session] owns the transport, the protocol state and the handler
//! registry. [Session::run] first drives the handshake for the configured
//! role and then settles into the receive loop, delivering each complete
//! message to the registered handlers. Anything that goes wrong — a transport
//! failure, a protocol violation, a failed handshake, a failing handler —
//! closes the session; `run` itself always returns normally.
//!
//! Sending happens through [SessionHandle], which can be cloned freely and
//! handed to handlers. Sends are serialized by an internal lock, so frames of
//! concurrent sends never interleave on the wire.

use crate::handshake::{perform_active, perform_passive, HandshakeError};
use crate::registry::{HandlerError, HandlerRegistry, HandlerResult, Service};
use crate::stream::{FrameReader, FrameWriter, InStreamError, OutStreamError, ProtocolViolation};
use silkport_message::Message;
use silkport_security::ProtocolOptions;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ReadTransport = Box<dyn AsyncRead + Send + Sync + Unpin>;
type WriteTransport = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// Where in its lifecycle a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Passive side, waiting for the opening setup frame.
    WaitSetup,
    /// Active side, about to open the exchange.
    HandshakeBegin,
    /// The setup exchange is in flight.
    HandshakeChallenge,
    /// The handshake completed; application messages flow.
    Ready,
    /// The session is closed and the transport released.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionRole {
    Active,
    Passive,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport failed or ended unexpectedly.
    #[error("the transport failed")]
    Transport(#[from] io::Error),
    /// The other side violated the wire protocol.
    #[error("the other side violated the protocol")]
    Malformed(#[from] ProtocolViolation),
    /// The setup exchange could not be completed.
    #[error("the handshake failed")]
    Handshake(#[from] HandshakeError),
    /// A registered handler failed while processing a message.
    #[error("a handler failed")]
    Handler(#[source] HandlerError),
}

impl From<InStreamError> for SessionError {
    fn from(error: InStreamError) -> Self {
        match error {
            InStreamError::Io(err) => SessionError::Transport(err),
            InStreamError::EndOfStream => {
                SessionError::Transport(io::ErrorKind::UnexpectedEof.into())
            }
            InStreamError::Violation(violation) => SessionError::Malformed(violation),
        }
    }
}

/// A cloneable handle for interacting with a running session.
///
/// Handlers receive one with every invocation; the owner of the session can
/// grab one through [Session::handle] before starting the loop.
#[derive(Clone)]
pub struct SessionHandle {
    writer: Arc<Mutex<FrameWriter<WriteTransport>>>,
    ready: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Sends one message, splitting it into massive frames when the message
    /// requests it.
    ///
    /// Waits until the session is ready, then serializes with every other
    /// send on this session. Fails once the session is closed.
    pub async fn send(&self, message: &Message) -> Result<(), OutStreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutStreamError::Io(io::ErrorKind::NotConnected.into()));
        }

        let mut ready = self.ready.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return Err(OutStreamError::Io(io::ErrorKind::NotConnected.into()));
            }
        }

        let mut writer = self.writer.lock().await;
        writer.send_message(message).await
    }

    /// Closes the session: cancels the receive loop and shuts the transport
    /// down. Calling it more than once is harmless.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(error) = writer.shutdown().await {
            debug!(%error, "transport shutdown reported an error");
        }
    }

    /// Whether [disconnect][Self::disconnect] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One end of a connection: transport, protocol state and handler registry.
pub struct Session {
    reader: FrameReader<ReadTransport>,
    handle: SessionHandle,
    ready: watch::Sender<bool>,
    registry: HandlerRegistry,
    role: SessionRole,
    options: ProtocolOptions,
    state: ProtocolState,
}

impl Session {
    /// Creates the active (listening, feature-selecting) end of a session.
    /// For the official game this is the server role.
    pub fn active<T>(transport: T, options: ProtocolOptions) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Self::build(transport, SessionRole::Active, options)
    }

    /// Creates the passive (dialing) end of a session. The feature selection
    /// is dictated by the other side.
    pub fn passive<T>(transport: T) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Self::build(transport, SessionRole::Passive, ProtocolOptions::empty())
    }

    fn build<T>(transport: T, role: SessionRole, options: ProtocolOptions) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let (read, write) = split(transport);
        let reader = FrameReader::new(Box::new(read) as ReadTransport);
        let writer = FrameWriter::new(Box::new(write) as WriteTransport);
        let (ready_sender, ready_receiver) = watch::channel(false);

        Session {
            reader,
            handle: SessionHandle {
                writer: Arc::new(Mutex::new(writer)),
                ready: ready_receiver,
                closed: Arc::new(AtomicBool::new(false)),
                cancel: CancellationToken::new(),
            },
            ready: ready_sender,
            registry: HandlerRegistry::default(),
            role,
            options,
            state: match role {
                SessionRole::Active => ProtocolState::HandshakeBegin,
                SessionRole::Passive => ProtocolState::WaitSetup,
            },
        }
    }

    /// A handle for sending on and disconnecting this session.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// The negotiated options; meaningful once the session is ready.
    pub fn options(&self) -> ProtocolOptions {
        self.options
    }

    /// Appends a handler for `opcode`; see [HandlerRegistry::register].
    /// Registration must happen before [run][Self::run].
    pub fn register<H, F>(&mut self, opcode: u16, handler: H)
    where
        H: Fn(SessionHandle, Message) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(opcode, handler);
    }

    /// Registers a whole [Service]; see [HandlerRegistry::register_service].
    pub fn register_service<S: Service>(&mut self, service: &S) -> bool {
        self.registry.register_service(service)
    }

    /// Runs the session to completion: handshake, then receive → dispatch
    /// until the stream ends, the session is disconnected, or a fault closes
    /// it. All faults are handled here; the call always returns normally.
    pub async fn run(mut self) {
        match self.drive().await {
            Ok(()) => debug!("session finished"),
            Err(SessionError::Transport(error)) => {
                debug!(%error, "session ended on a transport failure")
            }
            Err(SessionError::Malformed(violation)) => {
                warn!(%violation, "closing session after a protocol violation")
            }
            Err(SessionError::Handshake(error)) => {
                warn!(%error, "closing session after a failed handshake")
            }
            Err(SessionError::Handler(error)) => {
                warn!(%error, "closing session after a handler failure")
            }
        }

        self.state = ProtocolState::Closed;
        self.reader.clear();
        self.handle.disconnect().await;
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let cancel = self.handle.cancel.clone();

        let negotiated = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = async {
                let mut writer = self.handle.writer.lock().await;
                match self.role {
                    SessionRole::Active => {
                        perform_active(&mut self.reader, &mut writer, self.options, &mut self.state)
                            .await
                    }
                    SessionRole::Passive => {
                        perform_passive(&mut self.reader, &mut writer, &mut self.state).await
                    }
                }
            } => result?,
        };

        self.options = negotiated;
        self.state = ProtocolState::Ready;
        let _ = self.ready.send(true);
        debug!(options = ?negotiated, "session ready");

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.reader.next_message() => match received {
                    Ok(message) => message,
                    Err(InStreamError::EndOfStream) => return Ok(()),
                    Err(error) => return Err(error.into()),
                },
            };
            self.dispatch(message).await?;
        }
    }

    async fn dispatch(&self, message: Message) -> Result<(), SessionError> {
        let handlers = self.registry.handlers_for(message.opcode());
        if handlers.is_empty() {
            debug!(opcode = message.opcode(), "no handler registered for opcode");
            return Ok(());
        }

        for handler in handlers {
            handler(self.handle.clone(), message.clone())
                .await
                .map_err(SessionError::Handler)?;
        }
        Ok(())
    }
}

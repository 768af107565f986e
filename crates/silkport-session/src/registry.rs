//! The handler registry mapping opcodes to the callbacks that process them.
//!
//! Handlers are registered before a session starts its receive loop, either
//! one by one through [HandlerRegistry::register] or grouped in a [Service].
//! During dispatch the handlers of an opcode run sequentially, in
//! registration order; the registry itself is never mutated once dispatch has
//! begun.

use crate::session::SessionHandle;
use futures::future::BoxFuture;
use silkport_message::Message;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::future::Future;

/// The error a handler may fail with. Any failure closes the session.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler invocation resolves to.
pub type HandlerResult = Result<(), HandlerError>;

/// The boxed future a stored handler produces.
pub type HandlerFuture = BoxFuture<'static, HandlerResult>;

/// A stored handler: a callable receiving the session handle and the message
/// to process.
pub type MessageHandler = Box<dyn Fn(SessionHandle, Message) -> HandlerFuture + Send + Sync>;

/// Boxes an async closure into a storable [MessageHandler].
pub fn boxed_handler<H, F>(handler: H) -> MessageHandler
where
    H: Fn(SessionHandle, Message) -> F + Send + Sync + 'static,
    F: Future<Output = HandlerResult> + Send + 'static,
{
    Box::new(move |session, message| Box::pin(handler(session, message)))
}

/// A group of handlers belonging together, registered as one unit.
///
/// Implementing [Service] is the ergonomic way to wire up everything one
/// subsystem cares about. Each concrete service type registers at most once
/// per session; registering it again is a no-op.
pub trait Service: 'static {
    /// The table of `(opcode, handler)` pairs this service contributes.
    fn handlers(&self) -> Vec<(u16, MessageHandler)>;
}

/// Maps opcodes to the ordered list of handlers to run for them.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<u16, Vec<MessageHandler>>,
    services: HashSet<TypeId>,
}

impl HandlerRegistry {
    /// Appends a handler for `opcode`. Handlers run in registration order.
    pub fn register<H, F>(&mut self, opcode: u16, handler: H)
    where
        H: Fn(SessionHandle, Message) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .entry(opcode)
            .or_default()
            .push(boxed_handler(handler));
    }

    /// Registers every handler of `service`, unless a service of the same
    /// type was registered before. Returns whether anything was added.
    pub fn register_service<S: Service>(&mut self, service: &S) -> bool {
        if !self.services.insert(TypeId::of::<S>()) {
            return false;
        }
        for (opcode, handler) in service.handlers() {
            self.handlers.entry(opcode).or_default().push(handler);
        }
        true
    }

    /// The handlers registered for `opcode`, in registration order.
    pub fn handlers_for(&self, opcode: u16) -> &[MessageHandler] {
        self.handlers
            .get(&opcode)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct PingService;

    impl Service for PingService {
        fn handlers(&self) -> Vec<(u16, MessageHandler)> {
            vec![
                (0x2001, boxed_handler(|_session, _message| async { Ok(()) })),
                (0x2002, boxed_handler(|_session, _message| async { Ok(()) })),
            ]
        }
    }

    #[test]
    fn registration_accumulates_in_order() {
        let mut registry = HandlerRegistry::default();
        registry.register(0x2001, |_session, _message| async { Ok(()) });
        registry.register(0x2001, |_session, _message| async { Ok(()) });
        assert_eq!(2, registry.handlers_for(0x2001).len());
        assert!(registry.handlers_for(0x9999).is_empty());
    }

    #[test]
    fn services_register_once() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.register_service(&PingService));
        assert!(!registry.register_service(&PingService));
        assert_eq!(1, registry.handlers_for(0x2001).len());
        assert_eq!(1, registry.handlers_for(0x2002).len());
    }
}

//! Data handler registry: which callbacks run for which message type.
//!
//! Handlers are plain `Fn(&Message, Origin) -> HandlerResult` closures.
//! The `Send + Sync + 'static` bounds are there because a networked bus
//! calls them from whichever connection's receive loop got the message,
//! possibly several at once.
//!
//! A handler that returns `Err` or panics fails only the message it was
//! handling. Dispatch catches the panic and turns it into an error like any
//! other, so the receive loop keeps going and the requester still gets its
//! one `RequestFail`.

use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use lanbus_protocol::{Message, MessageType};

/// Where a dispatched message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Sent on this process's own [`LocalMessageBus`](crate::LocalMessageBus).
    Local,
    /// Received over the connection to this address.
    Peer(SocketAddr),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Peer(addr) => write!(f, "{addr}"),
        }
    }
}

/// What a handler returns. The error text is sent back to the requester as
/// `RequestFail.error`.
pub type HandlerResult = Result<(), String>;

/// A registered callback.
pub type DataHandler = Arc<dyn Fn(&Message, Origin) -> HandlerResult + Send + Sync>;

/// Handlers keyed by concrete (leaf) message type.
///
/// Registering for an abstract type stores the handler under every leaf
/// beneath it, so dispatch is a single lookup by the message's own type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<MessageType, Vec<DataHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Message, Origin) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: DataHandler = Arc::new(handler);
        let leaves = message_type.leaves();
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for leaf in &leaves {
            handlers.entry(*leaf).or_default().push(Arc::clone(&handler));
        }
        tracing::debug!(%message_type, leaves = leaves.len(), "data handler registered");
    }

    /// Handlers that would run for a message of this leaf type.
    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message_type)
            .map_or(0, Vec::len)
    }

    /// Runs every handler for the message's type, in registration order.
    ///
    /// A failing or panicking handler doesn't stop the rest; the first
    /// failure is returned.
    pub fn dispatch(&self, message: &Message, origin: Origin) -> HandlerResult {
        // Handlers may register more handlers; don't hold the lock while
        // calling them.
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.message_type())
            .cloned()
            .unwrap_or_default();

        let mut first_error = None;
        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler(message, origin)))
                .unwrap_or_else(|payload| {
                    let error = format!("handler panicked: {}", panic_text(payload.as_ref()));
                    tracing::error!(id = %message.id, %origin, %error, "data handler panicked");
                    Err(error)
                });
            if let Err(error) = result {
                tracing::debug!(id = %message.id, %origin, %error, "data handler failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else {
        "unknown panic"
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut counts: Vec<_> = handlers.iter().map(|(ty, list)| (*ty, list.len())).collect();
        counts.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use lanbus_protocol::{GameRequest, MessageId, PrintRequest, RequestSuccess};

    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> impl Fn(&Message, Origin) -> HandlerResult + use<> {
        let log = Arc::clone(log);
        move |message, _origin| {
            log.lock().unwrap().push(format!("{name}:{}", message.message_type()));
            Ok(())
        }
    }

    #[test]
    fn test_register_supertype_covers_every_leaf() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Message, |_, _| Ok(()));

        for leaf in MessageType::Message.leaves() {
            assert_eq!(registry.handler_count(leaf), 1, "{leaf}");
        }
    }

    #[test]
    fn test_register_request_skips_responses() {
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Request, |_, _| Ok(()));

        assert_eq!(registry.handler_count(MessageType::PrintRequest), 1);
        assert_eq!(registry.handler_count(MessageType::GameRequest), 1);
        assert_eq!(registry.handler_count(MessageType::RequestSuccess), 0);
    }

    #[test]
    fn test_dispatch_runs_supertype_and_subtype_handlers_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        registry.register(MessageType::Message, recorder(&log, "any"));
        registry.register(MessageType::PrintRequest, recorder(&log, "print"));

        registry
            .dispatch(&Message::from(PrintRequest::new("hi")), Origin::Local)
            .unwrap();
        registry
            .dispatch(&Message::from(GameRequest::new("start_game", vec![])), Origin::Local)
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["any:PrintRequest", "print:PrintRequest", "any:GameRequest"]
        );
    }

    #[test]
    fn test_dispatch_without_handlers_is_ok() {
        let registry = HandlerRegistry::new();
        let ack = Message::from(RequestSuccess {
            request_id: MessageId::random(),
        });
        assert!(registry.dispatch(&ack, Origin::Local).is_ok());
    }

    #[test]
    fn test_dispatch_runs_all_and_returns_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        registry.register(MessageType::PrintRequest, |_, _| Err("first".into()));
        registry.register(MessageType::PrintRequest, |_, _| Err("second".into()));
        registry.register(MessageType::PrintRequest, recorder(&log, "after"));

        let result = registry.dispatch(&Message::from(PrintRequest::new("x")), Origin::Local);
        assert_eq!(result, Err("first".to_string()));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_panicking_handler_is_an_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        registry.register(MessageType::PrintRequest, |_, _| panic!("handler bug"));
        registry.register(MessageType::PrintRequest, recorder(&log, "after"));

        let result = registry.dispatch(&Message::from(PrintRequest::new("x")), Origin::Local);
        assert_eq!(result, Err("handler panicked: handler bug".to_string()));
        assert_eq!(log.lock().unwrap().len(), 1);

        // Formatted panics carry a `String` payload.
        let registry = HandlerRegistry::new();
        registry.register(MessageType::GameRequest, |message, _| {
            panic!("cannot handle {}", message.message_type())
        });
        let result = registry.dispatch(&Message::from(GameRequest::new("start_game", vec![])), Origin::Local);
        assert_eq!(result, Err("handler panicked: cannot handle GameRequest".to_string()));
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let registry = Arc::new(HandlerRegistry::new());
        let inner = Arc::clone(&registry);
        registry.register(MessageType::PrintRequest, move |_, _| {
            inner.register(MessageType::GameRequest, |_, _| Ok(()));
            Ok(())
        });

        registry
            .dispatch(&Message::from(PrintRequest::new("x")), Origin::Local)
            .unwrap();
        assert_eq!(registry.handler_count(MessageType::GameRequest), 1);
    }

    #[test]
    fn test_origin_display() {
        assert_eq!(Origin::Local.to_string(), "local");
        let addr: SocketAddr = "192.168.0.4:40000".parse().unwrap();
        assert_eq!(Origin::Peer(addr).to_string(), "192.168.0.4:40000");
    }
}

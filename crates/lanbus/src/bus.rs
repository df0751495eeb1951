//! The [`MessageBus`] trait: the one API every bus variant exposes.
//!
//! Game code is written against this trait, so switching between
//! single-player ([`LocalMessageBus`](crate::LocalMessageBus)) and LAN play
//! ([`ClientMessageBus`](crate::ClientMessageBus) /
//! [`HostMessageBus`](crate::HostMessageBus)) changes one constructor.
//!
//! ## Why `async fn` in a trait
//!
//! `start`, `stop` and `send` are declared as plain `async fn`s. The
//! returned futures are not boxed and the trait is not object safe; callers
//! are generic over `B: MessageBus` instead of holding a `dyn MessageBus`.
//! That is also why the crate allows `async_fn_in_trait`: the futures carry
//! no `Send` bound in the signature, but every bus here is built from
//! `Send + Sync` parts, so they are `Send` in practice.
//!
//! ## `Endpoint`
//!
//! The one thing the variants disagree on is what `start` needs. The
//! associated type keeps that typed: a client takes the host's
//! `SocketAddr`, the host and the local bus take `()`.

use std::net::SocketAddr;

use lanbus_protocol::{Message, MessageType};

use crate::{BusError, DeliveryReport, HandlerResult, Origin};

/// Typed messaging between this process and its peers.
///
/// All methods take `&self`, so a bus shared behind an `Arc` can be
/// stopped while other tasks are blocked in [`send`](Self::send).
pub trait MessageBus: Send + Sync {
    /// What `start` needs: the host's address for a client, nothing for a
    /// host or a local bus.
    type Endpoint;

    /// Brings the bus up. When this returns `Ok`, `send` is ready to use.
    async fn start(&self, endpoint: Self::Endpoint) -> Result<(), BusError>;

    /// Shuts the bus down: every blocked `send` returns, every connection
    /// closes, every worker is joined. Safe to call more than once.
    async fn stop(&self);

    /// Sends `message` to one peer (`target`) or to every identified peer
    /// (`None`).
    ///
    /// With `blocking` set and a request message, waits until every target
    /// has answered or disconnected and reports which did what. Otherwise
    /// returns an empty report as soon as the message is queued.
    ///
    /// # Errors
    /// - [`BusError::NotRunning`] before `start` or after `stop`.
    /// - [`BusError::PeerNotFound`] if `target` has no identified
    ///   connection (yet).
    async fn send(
        &self,
        message: Message,
        target: Option<SocketAddr>,
        blocking: bool,
    ) -> Result<DeliveryReport, BusError>;

    /// Registers `handler` for `message_type` and, if it is abstract, for
    /// every concrete type beneath it.
    fn register_data_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Message, Origin) -> HandlerResult + Send + Sync + 'static;
}

//! # lanbus
//!
//! Typed, acknowledged messaging between a LAN game host and its clients.
//!
//! One host process and any number of client processes exchange
//! [`Message`](lanbus_protocol::Message)s over TCP. Requests are always
//! answered with exactly one `RequestSuccess` or `RequestFail`, and a
//! blocking send waits until every target has answered or gone away.
//!
//! Three buses share the [`MessageBus`] API:
//!
//! - [`HostMessageBus`] listens and keeps one connection per client.
//! - [`ClientMessageBus`] keeps a single connection to the host.
//! - [`LocalMessageBus`] dispatches in-process, for single-player mode.
//!
//! ```rust,no_run
//! use lanbus::prelude::*;
//!
//! # async fn run() -> Result<(), BusError> {
//! let host = HostMessageBus::new(PeerId::random(), BusConfig::with_port(0));
//! host.register_data_handler(MessageType::PrintRequest, |message, origin| {
//!     println!("{origin}: {message:?}");
//!     Ok(())
//! });
//! host.start(()).await?;
//! # Ok(())
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod bus;
mod client;
mod config;
mod connections;
mod error;
mod host;
mod local;
mod networked;
mod registry;
mod requests;

pub use bus::MessageBus;
pub use client::ClientMessageBus;
pub use config::{BusConfig, DEFAULT_PORT};
pub use connections::{ConnectionManager, Endpoint};
pub use error::BusError;
pub use host::HostMessageBus;
pub use local::LocalMessageBus;
pub use registry::{DataHandler, HandlerRegistry, HandlerResult, Origin};
pub use requests::{DeliveryReport, RequestManager, RequestTicket};

pub mod prelude {
    pub use crate::{
        BusConfig, BusError, ClientMessageBus, DeliveryReport, HostMessageBus, LocalMessageBus,
        MessageBus, Origin,
    };
    pub use lanbus_protocol::{
        GameRequest, Message, MessageType, Payload, PeerId, PrintRequest,
    };
}

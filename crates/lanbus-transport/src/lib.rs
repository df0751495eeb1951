//! TCP transport for the lanbus message bus.
//!
//! - [`Connection`] owns one socket to one peer and runs a send loop and a
//!   receive loop, each as a [`Worker`].
//! - [`Listener`] accepts inbound sockets with a bounded wait.
//! - [`can_read`] / [`can_write`] are the bounded readiness checks every
//!   loop polls with.
//!
//! Socket failures and peer EOF never surface as errors from a running
//! connection. They close it, and the owner hears about it once through
//! [`ConnectionHandler::on_closed`].

mod connection;
mod error;
mod listener;
mod poll;
mod worker;

pub use connection::{Connection, ConnectionConfig, ConnectionHandler, ConnectionState};
pub use error::TransportError;
pub use listener::Listener;
pub use poll::{Readiness, can_read, can_write};
pub use worker::{ReadySignal, StartingWorker, Worker};

//! Wire protocol for the lanbus message bus.
//!
//! This crate defines what host and client buses say to each other:
//!
//! - **Types** ([`Message`], [`Payload`], [`MessageType`], ...): the
//!   message taxonomy and the concrete requests and responses.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how one message becomes
//!   bytes and back.
//! - **Framing** ([`frame`]): the fixed-size length header that lets a
//!   stream reader find where each message ends.
//! - **Errors** ([`ProtocolError`]).
//!
//! It knows nothing about sockets or threads:
//!
//! ```text
//! Transport (sockets, loops) → Protocol (frames, messages) → Bus (dispatch)
//! ```

mod codec;
mod error;
pub mod frame;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use frame::{HEADER_SIZE, IncomingRequest};
pub use types::{
    GameRequest, IdentifyRequest, Message, MessageId, MessageType, Payload, PeerId,
    PrintRequest, RequestFail, RequestSuccess,
};

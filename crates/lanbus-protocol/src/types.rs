//! Core protocol types: identifiers, the message taxonomy, and the
//! concrete request/response payloads that travel on the wire.
//!
//! The taxonomy is a closed tree:
//!
//! ```text
//! Message
//! ├── Request            (requires a response)
//! │   ├── IdentifyRequest
//! │   ├── PrintRequest
//! │   └── GameRequest
//! └── Response
//!     ├── RequestSuccess
//!     └── RequestFail
//! ```
//!
//! Concrete messages are [`Payload`] variants. [`MessageType`] names every
//! node of the tree, abstract or not, so handlers can be registered for a
//! whole family at once.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// The identity a bus announces to its peers during the handshake.
///
/// Connections are addressable by network address from the moment they
/// open, and by `PeerId` only once the peer has identified itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Generates a fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0.simple())
    }
}

/// Globally unique message identifier.
///
/// Responses carry the id of the request they answer, which is how a
/// blocking sender correlates acknowledgements across many peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0.simple())
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Sent by each side of a new connection to bind its network address to
/// its identity on the receiving bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyRequest {
    /// Identity of the sending bus.
    pub client_id: PeerId,
    /// The sender's local end of the socket, as the sender sees it.
    pub source_address: SocketAddr,
}

/// Asks the receiver to log a line of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintRequest {
    pub text: String,
}

impl PrintRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A request owned by the game layer (create game, start game, ...).
///
/// The bus acknowledges it like any other request but never looks inside
/// `data`; only the game layer knows how to interpret those bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRequest {
    /// What the game layer should do, e.g. `"create_game"`.
    pub action: String,
    /// Opaque, game-encoded arguments.
    pub data: Vec<u8>,
}

impl GameRequest {
    pub fn new(action: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            action: action.into(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// The request with this id was handled without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSuccess {
    pub request_id: MessageId,
}

/// A handler failed while processing the request with this id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFail {
    pub request_id: MessageId,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Payload and Message
// ---------------------------------------------------------------------------

/// Every concrete message kind. Each variant is a leaf of the taxonomy.
///
/// Adjacently tagged, so a print request encodes as
/// `{ "type": "Print", "data": { "text": "hi" } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    Identify(IdentifyRequest),
    Print(PrintRequest),
    Game(GameRequest),
    Success(RequestSuccess),
    Fail(RequestFail),
}

impl Payload {
    /// The leaf [`MessageType`] of this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Identify(_) => MessageType::IdentifyRequest,
            Self::Print(_) => MessageType::PrintRequest,
            Self::Game(_) => MessageType::GameRequest,
            Self::Success(_) => MessageType::RequestSuccess,
            Self::Fail(_) => MessageType::RequestFail,
        }
    }
}

macro_rules! impl_into_payload {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Payload {
                fn from(value: $ty) -> Self {
                    Payload::$variant(value)
                }
            }

            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Message::new(Payload::$variant(value))
                }
            }
        )*
    };
}

impl_into_payload! {
    IdentifyRequest => Identify,
    PrintRequest => Print,
    GameRequest => Game,
    RequestSuccess => Success,
    RequestFail => Fail,
}

/// The envelope every payload travels in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique per message; copies sent to several peers share it.
    pub id: MessageId,
    pub payload: Payload,
}

impl Message {
    /// Wraps a payload with a fresh id.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            id: MessageId::random(),
            payload: payload.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// `true` for every request: the receiver must answer with exactly one
    /// [`RequestSuccess`] or [`RequestFail`].
    pub fn requires_response(&self) -> bool {
        self.message_type().is_a(MessageType::Request)
    }

    /// For responses, the id of the request being answered.
    pub fn request_id(&self) -> Option<MessageId> {
        match &self.payload {
            Payload::Success(success) => Some(success.request_id),
            Payload::Fail(fail) => Some(fail.request_id),
            _ => None,
        }
    }

    /// Builds the single response owed for this message, given the outcome
    /// of handling it. Returns `None` for messages that need no response.
    pub fn response(&self, outcome: Result<(), String>) -> Option<Message> {
        if !self.requires_response() {
            return None;
        }
        let payload = match outcome {
            Ok(()) => Payload::Success(RequestSuccess {
                request_id: self.id,
            }),
            Err(error) => Payload::Fail(RequestFail {
                request_id: self.id,
                error,
            }),
        };
        Some(Message::new(payload))
    }

    /// Rejects messages that decoded but can't be meaningfully handled.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match &self.payload {
            Payload::Identify(identify) if identify.client_id.0.is_nil() => {
                Err(ProtocolError::InvalidMessage(
                    "identify request with nil client id".into(),
                ))
            }
            Payload::Game(game) if game.action.is_empty() => Err(
                ProtocolError::InvalidMessage("game request without an action".into()),
            ),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MessageType: the taxonomy as data
// ---------------------------------------------------------------------------

/// A node of the message taxonomy.
///
/// The tree is declared here, at compile time, through [`parent`] and
/// [`children`]. Registering a handler for an abstract node registers it for
/// every leaf beneath it.
///
/// [`parent`]: MessageType::parent
/// [`children`]: MessageType::children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    /// Root of the tree: every message.
    Message,
    /// Every message that requires a response.
    Request,
    /// Every acknowledgement of a request.
    Response,
    IdentifyRequest,
    PrintRequest,
    GameRequest,
    RequestSuccess,
    RequestFail,
}

impl MessageType {
    /// Every node, root first.
    pub const ALL: [MessageType; 8] = [
        Self::Message,
        Self::Request,
        Self::Response,
        Self::IdentifyRequest,
        Self::PrintRequest,
        Self::GameRequest,
        Self::RequestSuccess,
        Self::RequestFail,
    ];

    pub const fn parent(self) -> Option<MessageType> {
        match self {
            Self::Message => None,
            Self::Request | Self::Response => Some(Self::Message),
            Self::IdentifyRequest | Self::PrintRequest | Self::GameRequest => {
                Some(Self::Request)
            }
            Self::RequestSuccess | Self::RequestFail => Some(Self::Response),
        }
    }

    /// Direct subtypes. Empty for concrete (leaf) types.
    pub const fn children(self) -> &'static [MessageType] {
        match self {
            Self::Message => &[Self::Request, Self::Response],
            Self::Request => &[
                Self::IdentifyRequest,
                Self::PrintRequest,
                Self::GameRequest,
            ],
            Self::Response => &[Self::RequestSuccess, Self::RequestFail],
            _ => &[],
        }
    }

    pub const fn is_leaf(self) -> bool {
        self.children().is_empty()
    }

    /// Every concrete type at or below this node, in declaration order.
    pub fn leaves(self) -> Vec<MessageType> {
        let mut leaves = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if node.is_leaf() {
                leaves.push(node);
            } else {
                // Reversed so the leftmost child is visited first.
                stack.extend(node.children().iter().rev());
            }
        }
        leaves
    }

    /// `true` if `self` is `ancestor` or descends from it.
    pub fn is_a(self, ancestor: MessageType) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current == ancestor {
                return true;
            }
            node = current.parent();
        }
        false
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_parent_and_children_tables_agree() {
        for node in MessageType::ALL {
            for child in node.children() {
                assert_eq!(child.parent(), Some(node), "{child} under {node}");
            }
            if let Some(parent) = node.parent() {
                assert!(parent.children().contains(&node), "{node} missing from {parent}");
            }
        }
    }

    #[test]
    fn test_every_payload_maps_to_a_leaf() {
        let payloads = [
            Payload::Identify(IdentifyRequest {
                client_id: PeerId::random(),
                source_address: addr(),
            }),
            Payload::Print(PrintRequest::new("hi")),
            Payload::Game(GameRequest::new("start_game", vec![])),
            Payload::Success(RequestSuccess {
                request_id: MessageId::random(),
            }),
            Payload::Fail(RequestFail {
                request_id: MessageId::random(),
                error: "boom".into(),
            }),
        ];
        for payload in payloads {
            assert!(payload.message_type().is_leaf());
        }
    }

    #[test]
    fn test_leaves_of_root_lists_every_concrete_type_once() {
        let leaves = MessageType::Message.leaves();
        assert_eq!(
            leaves,
            vec![
                MessageType::IdentifyRequest,
                MessageType::PrintRequest,
                MessageType::GameRequest,
                MessageType::RequestSuccess,
                MessageType::RequestFail,
            ]
        );
    }

    #[test]
    fn test_leaves_of_leaf_is_itself() {
        assert_eq!(
            MessageType::PrintRequest.leaves(),
            vec![MessageType::PrintRequest]
        );
    }

    #[test]
    fn test_is_a_follows_parent_chain() {
        assert!(MessageType::PrintRequest.is_a(MessageType::Request));
        assert!(MessageType::PrintRequest.is_a(MessageType::Message));
        assert!(!MessageType::PrintRequest.is_a(MessageType::Response));
        assert!(!MessageType::Request.is_a(MessageType::PrintRequest));
    }

    #[test]
    fn test_requires_response_only_for_requests() {
        let request = Message::from(PrintRequest::new("hi"));
        assert!(request.requires_response());

        let response = Message::from(RequestSuccess {
            request_id: request.id,
        });
        assert!(!response.requires_response());
    }

    #[test]
    fn test_response_success_correlates_to_request() {
        let request = Message::from(PrintRequest::new("hi"));
        let response = request.response(Ok(())).expect("requests get a response");
        assert_eq!(response.request_id(), Some(request.id));
        assert_eq!(response.message_type(), MessageType::RequestSuccess);
        assert_ne!(response.id, request.id);
    }

    #[test]
    fn test_response_failure_carries_error_text() {
        let request = Message::from(GameRequest::new("create_game", vec![1, 2]));
        let response = request.response(Err("map not found".into())).unwrap();
        match response.payload {
            Payload::Fail(fail) => {
                assert_eq!(fail.request_id, request.id);
                assert_eq!(fail.error, "map not found");
            }
            other => panic!("expected RequestFail, got {other:?}"),
        }
    }

    #[test]
    fn test_response_to_response_is_none() {
        let ack = Message::from(RequestSuccess {
            request_id: MessageId::random(),
        });
        assert!(ack.response(Ok(())).is_none());
    }

    #[test]
    fn test_validate_rejects_nil_client_id() {
        let msg = Message::from(IdentifyRequest {
            client_id: PeerId(Uuid::nil()),
            source_address: addr(),
        });
        assert!(matches!(msg.validate(), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_validate_rejects_game_request_without_action() {
        let msg = Message::from(GameRequest::new("", vec![]));
        assert!(msg.validate().is_err());
        let msg = Message::from(GameRequest::new("start_game", vec![]));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_peer_id_display() {
        let id = PeerId(Uuid::nil());
        assert_eq!(id.to_string(), "peer-00000000000000000000000000000000");
    }
}

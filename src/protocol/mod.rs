//! Hub protocol data model.
//!
//! A hub message is one RPC unit exchanged over a connection:
//!
//! ```text
//! HubMessage
//!     ├── Invocation  { invocation_id?, target, nonblocking, arguments }
//!     ├── StreamItem  { invocation_id, item }
//!     └── Completion  { invocation_id, outcome: Result | Error }
//! ```
//!
//! Arguments, stream items and results are dynamically typed [`Value`]s that
//! mirror the MessagePack type universe (integer, float, bool, string,
//! binary, nil, array, map). The binary encoding lives in [`messagepack`].

pub mod messagepack;

pub use messagepack::{HubProtocolRole, MessagePackHubProtocol};

/// Dynamically typed argument/result value.
pub type Value = rmpv::Value;

/// Message kind tag. The discriminant is the first element of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Call a method on the other side.
    Invocation = 1,
    /// One item of a streamed result.
    StreamItem = 2,
    /// Terminal result (or error) of an invocation.
    Completion = 3,
}

impl MessageType {
    /// Map a wire tag back to a message kind.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            _ => None,
        }
    }

    /// The wire tag for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invocation => write!(f, "Invocation"),
            Self::StreamItem => write!(f, "StreamItem"),
            Self::Completion => write!(f, "Completion"),
        }
    }
}

/// Outcome carried by a [`HubMessage::Completion`].
///
/// Exactly one of result or error is present, so the two cannot be set at
/// the same time by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// The invocation produced a value (`Nil` for void methods).
    Result(Value),
    /// The invocation failed with an error message.
    Error(String),
}

/// One hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Method call.
    Invocation {
        /// Caller-assigned id. `None` for server-initiated non-blocking calls.
        invocation_id: Option<String>,
        /// Method name on the receiving side.
        target: String,
        /// When true no completion is expected.
        nonblocking: bool,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Streamed result item.
    StreamItem {
        /// Invocation this item belongs to.
        invocation_id: String,
        /// The item.
        item: Value,
    },
    /// Final result of an invocation.
    Completion {
        /// Invocation being completed.
        invocation_id: String,
        /// Result or error.
        outcome: CompletionOutcome,
    },
}

impl HubMessage {
    /// Kind of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation { .. } => MessageType::Invocation,
            Self::StreamItem { .. } => MessageType::StreamItem,
            Self::Completion { .. } => MessageType::Completion,
        }
    }

    /// Invocation id, if the message carries one.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation { invocation_id, .. } => invocation_id.as_deref(),
            Self::StreamItem { invocation_id, .. } | Self::Completion { invocation_id, .. } => {
                Some(invocation_id)
            }
        }
    }

    /// Build a blocking invocation.
    pub fn invocation(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self::Invocation {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            nonblocking: false,
            arguments,
        }
    }

    /// Build a fire-and-forget invocation without an id.
    pub fn nonblocking_invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self::Invocation {
            invocation_id: None,
            target: target.into(),
            nonblocking: true,
            arguments,
        }
    }

    /// Build a successful completion.
    pub fn completion(invocation_id: impl Into<String>, result: Value) -> Self {
        Self::Completion {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Result(result),
        }
    }

    /// Build a failed completion.
    pub fn completion_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Completion {
            invocation_id: invocation_id.into(),
            outcome: CompletionOutcome::Error(error.into()),
        }
    }
}

/// Errors raised by framing and message encoding/decoding.
///
/// These are local to the codec: always returned to the caller, never
/// retried internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A length prefix declared more bytes than the configured maximum.
    FrameTooLarge {
        /// Declared payload length.
        length: u64,
        /// Configured maximum.
        max: usize,
    },
    /// Payload is not a well-formed hub message.
    MalformedMessage(String),
    /// The record's type tag is not a known message kind.
    UnknownMessageKind(u64),
    /// This protocol instance cannot write the given message kind.
    UnsupportedDirection(MessageType),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge { length, max } => {
                write!(f, "Frame too large: {length} bytes (max {max})")
            }
            Self::MalformedMessage(msg) => write!(f, "Malformed message: {msg}"),
            Self::UnknownMessageKind(tag) => write!(f, "Unknown message kind: {tag}"),
            Self::UnsupportedDirection(kind) => {
                write!(f, "Writing messages of type '{kind}' is not supported")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        assert_eq!(MessageType::from_tag(1), Some(MessageType::Invocation));
        assert_eq!(MessageType::from_tag(2), Some(MessageType::StreamItem));
        assert_eq!(MessageType::from_tag(3), Some(MessageType::Completion));
        assert_eq!(MessageType::from_tag(0), None);
        assert_eq!(MessageType::from_tag(4), None);
        assert_eq!(MessageType::Completion.tag(), 3);
    }

    #[test]
    fn test_invocation_id_accessor() {
        let msg = HubMessage::nonblocking_invocation("notify", vec![]);
        assert_eq!(msg.invocation_id(), None);
        assert_eq!(msg.message_type(), MessageType::Invocation);

        let msg = HubMessage::completion_error("7", "boom");
        assert_eq!(msg.invocation_id(), Some("7"));
        assert_eq!(msg.message_type(), MessageType::Completion);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooLarge { length: 20, max: 10 };
        assert_eq!(err.to_string(), "Frame too large: 20 bytes (max 10)");

        let err = ProtocolError::UnsupportedDirection(MessageType::StreamItem);
        assert_eq!(
            err.to_string(),
            "Writing messages of type 'StreamItem' is not supported"
        );
    }
}

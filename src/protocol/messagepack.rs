//! MessagePack encoding of hub messages.
//!
//! Every message is a positional record: the [`MessageType`] tag as a
//! MessagePack positive fixint, followed by the fields as consecutive
//! MessagePack values. There is no array header, so the tag is always byte 0
//! and can be inspected before anything else is decoded.
//!
//! ```text
//! Invocation  1 | invocationId or nil | nonblocking | target | [arguments...]
//! StreamItem  2 | invocationId | item
//! Completion  3 | invocationId | 1 | error        error
//!             3 | invocationId | 3 | result       result
//!             3 | invocationId | 2                void result (read only)
//! ```
//!
//! Encoded records are wrapped with [`BinaryFramer`] so several messages can
//! share one buffer.
//!
//! A protocol instance is created for one side of the connection. The client
//! side only writes invocations; stream items and completions flow from the
//! server, so writing them fails with [`ProtocolError::UnsupportedDirection`].

use rmpv::Value;

use super::{CompletionOutcome, HubMessage, MessageType, ProtocolError};
use crate::framing::BinaryFramer;

/// Completion result-kind flags.
mod result_kind {
    pub const ERROR: u64 = 1;
    pub const VOID: u64 = 2;
    pub const NON_VOID: u64 = 3;
}

/// Which side of the connection a protocol instance encodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubProtocolRole {
    /// Writes invocations only.
    Client,
    /// Writes every message kind.
    Server,
}

impl HubProtocolRole {
    fn can_write(self, kind: MessageType) -> bool {
        match self {
            Self::Client => kind == MessageType::Invocation,
            Self::Server => true,
        }
    }
}

/// Binary hub protocol built on MessagePack.
#[derive(Debug, Clone)]
pub struct MessagePackHubProtocol {
    role: HubProtocolRole,
    framer: BinaryFramer,
}

impl MessagePackHubProtocol {
    /// Protocol name advertised during negotiation.
    pub const NAME: &'static str = "messagepack";

    /// Create a protocol for `role` using `framer` for message boundaries.
    pub fn new(role: HubProtocolRole, framer: BinaryFramer) -> Self {
        Self { role, framer }
    }

    /// Client-side protocol with default framing limits.
    pub fn client() -> Self {
        Self::new(HubProtocolRole::Client, BinaryFramer::default())
    }

    /// Server-side protocol with default framing limits.
    pub fn server() -> Self {
        Self::new(HubProtocolRole::Server, BinaryFramer::default())
    }

    /// Role this instance encodes for.
    pub fn role(&self) -> HubProtocolRole {
        self.role
    }

    /// Encode `message` into a framed record.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnsupportedDirection`] if this role may not write the
    /// message kind, [`ProtocolError::MalformedMessage`] if the message breaks
    /// a protocol invariant (empty invocation id).
    pub fn encode(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let payload = self.encode_payload(message)?;
        Ok(self.framer.write(&payload))
    }

    /// Encode `message` without the length prefix.
    pub fn encode_payload(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let kind = message.message_type();
        if !self.role.can_write(kind) {
            return Err(ProtocolError::UnsupportedDirection(kind));
        }

        let mut payload = vec![kind.tag()];
        for field in to_fields(message)? {
            rmpv::encode::write_value(&mut payload, &field)
                .map_err(|e| ProtocolError::MalformedMessage(format!("encode failed: {e}")))?;
        }
        Ok(payload)
    }

    /// Decode one unframed record.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnknownMessageKind`] for an unrecognized tag,
    /// [`ProtocolError::MalformedMessage`] for anything else that does not
    /// match the record layout.
    pub fn decode(&self, payload: &[u8]) -> Result<HubMessage, ProtocolError> {
        let (tag, mut rest) = peek_tag(payload)?;
        let kind = MessageType::from_tag(tag).ok_or(ProtocolError::UnknownMessageKind(tag))?;

        let mut fields = Vec::new();
        while !rest.is_empty() {
            let value = rmpv::decode::read_value(&mut rest).map_err(|e| {
                ProtocolError::MalformedMessage(format!("invalid MessagePack: {e}"))
            })?;
            fields.push(value);
        }

        match kind {
            MessageType::Invocation => decode_invocation(fields),
            MessageType::StreamItem => decode_stream_item(fields),
            MessageType::Completion => decode_completion(fields),
        }
    }

    /// Split `input` into frames and decode each one.
    ///
    /// A payload that fails to decode yields an `Err` in its slot; sibling
    /// messages are still returned.
    ///
    /// # Errors
    ///
    /// Returns the framing error if not even the first frame is usable.
    pub fn decode_all(
        &self,
        input: &[u8],
    ) -> Result<Vec<Result<HubMessage, ProtocolError>>, ProtocolError> {
        let parsed = self.framer.parse(input)?;
        if parsed.consumed < input.len() {
            log::debug!(
                "[Protocol] {} bytes of incomplete frame left after {} messages",
                input.len() - parsed.consumed,
                parsed.payloads.len()
            );
        }

        Ok(parsed.payloads.into_iter().map(|p| self.decode(p)).collect())
    }
}

fn malformed(msg: &str) -> ProtocolError {
    ProtocolError::MalformedMessage(msg.to_string())
}

/// Read the type tag without decoding the record. Returns the tag and the
/// bytes of the remaining fields.
fn peek_tag(payload: &[u8]) -> Result<(u64, &[u8]), ProtocolError> {
    match payload {
        [] => Err(malformed("empty payload")),
        // positive fixint
        [tag @ 0x00..=0x7f, rest @ ..] => Ok((u64::from(*tag), rest)),
        _ => {
            let mut rest = payload;
            let first = rmpv::decode::read_value(&mut rest)
                .map_err(|e| ProtocolError::MalformedMessage(format!("invalid type tag: {e}")))?;
            let tag = first
                .as_u64()
                .ok_or_else(|| malformed("type tag is not an integer"))?;
            Ok((tag, rest))
        }
    }
}

/// Fields following the tag, in wire order.
fn to_fields(message: &HubMessage) -> Result<Vec<Value>, ProtocolError> {
    let fields = match message {
        HubMessage::Invocation {
            invocation_id,
            target,
            nonblocking,
            arguments,
        } => vec![
            invocation_id.as_deref().map_or(Value::Nil, Value::from),
            Value::from(*nonblocking),
            Value::from(target.as_str()),
            Value::Array(arguments.clone()),
        ],
        HubMessage::StreamItem { invocation_id, item } => {
            require_id(invocation_id)?;
            vec![Value::from(invocation_id.as_str()), item.clone()]
        }
        HubMessage::Completion {
            invocation_id,
            outcome,
        } => {
            require_id(invocation_id)?;
            let (flag, body) = match outcome {
                CompletionOutcome::Error(error) => (result_kind::ERROR, Value::from(error.as_str())),
                CompletionOutcome::Result(value) => (result_kind::NON_VOID, value.clone()),
            };
            vec![Value::from(invocation_id.as_str()), Value::from(flag), body]
        }
    };

    Ok(fields)
}

fn require_id(invocation_id: &str) -> Result<(), ProtocolError> {
    if invocation_id.is_empty() {
        return Err(malformed("invocation id must not be empty"));
    }
    Ok(())
}

fn expect_arity(fields: &[Value], arity: usize, kind: MessageType) -> Result<(), ProtocolError> {
    if fields.len() != arity {
        return Err(ProtocolError::MalformedMessage(format!(
            "{kind} record has {} fields, expected {arity}",
            fields.len()
        )));
    }
    Ok(())
}

fn string_field(value: Value, name: &str) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| ProtocolError::MalformedMessage(format!("{name} is not valid UTF-8"))),
        other => Err(ProtocolError::MalformedMessage(format!(
            "{name} must be a string, got {other}"
        ))),
    }
}

fn invocation_id_field(value: Value) -> Result<String, ProtocolError> {
    let id = string_field(value, "invocation id")?;
    require_id(&id)?;
    Ok(id)
}

fn decode_invocation(fields: Vec<Value>) -> Result<HubMessage, ProtocolError> {
    expect_arity(&fields, 4, MessageType::Invocation)?;
    let mut fields = fields.into_iter();
    let mut next = || fields.next().unwrap_or(Value::Nil);

    let invocation_id = match next() {
        Value::Nil => None,
        other => Some(string_field(other, "invocation id")?),
    };
    let nonblocking = match next() {
        Value::Boolean(b) => b,
        other => {
            return Err(ProtocolError::MalformedMessage(format!(
                "nonblocking must be a bool, got {other}"
            )))
        }
    };
    let target = string_field(next(), "target")?;
    let arguments = match next() {
        Value::Array(args) => args,
        other => {
            return Err(ProtocolError::MalformedMessage(format!(
                "arguments must be an array, got {other}"
            )))
        }
    };

    Ok(HubMessage::Invocation {
        invocation_id,
        target,
        nonblocking,
        arguments,
    })
}

fn decode_stream_item(fields: Vec<Value>) -> Result<HubMessage, ProtocolError> {
    expect_arity(&fields, 2, MessageType::StreamItem)?;
    let mut fields = fields.into_iter();
    let invocation_id = invocation_id_field(fields.next().unwrap_or(Value::Nil))?;
    let item = fields.next().unwrap_or(Value::Nil);

    Ok(HubMessage::StreamItem {
        invocation_id,
        item,
    })
}

fn decode_completion(fields: Vec<Value>) -> Result<HubMessage, ProtocolError> {
    let arity = fields.len();
    if !(2..=3).contains(&arity) {
        return Err(ProtocolError::MalformedMessage(format!(
            "Completion record has {arity} fields, expected 2 or 3"
        )));
    }

    let mut fields = fields.into_iter();
    let invocation_id = invocation_id_field(fields.next().unwrap_or(Value::Nil))?;
    let flag = fields
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| malformed("completion result kind must be an integer"))?;

    let outcome = match flag {
        result_kind::ERROR if arity == 3 => {
            CompletionOutcome::Error(string_field(fields.next().unwrap_or(Value::Nil), "error")?)
        }
        result_kind::NON_VOID if arity == 3 => {
            CompletionOutcome::Result(fields.next().unwrap_or(Value::Nil))
        }
        result_kind::VOID if arity == 2 => CompletionOutcome::Result(Value::Nil),
        _ => {
            return Err(ProtocolError::MalformedMessage(format!(
                "invalid completion result kind {flag} for {arity} fields"
            )))
        }
    };

    Ok(HubMessage::Completion {
        invocation_id,
        outcome,
    })
}

//! Message envelope.
//!
//! A [`Message`] is built once from a [`MessageDraft`], validated at that
//! point, and never mutated afterwards. Its serialized form is the audit
//! log line format, so field names are load-bearing.

use crate::error::ValidationError;
use forge_env::BROADCAST_RECEIVER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The five kinds of message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Event,
    Query,
    Response,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Event => "event",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Error => "error",
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Event
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(MessageType::Command),
            "event" => Ok(MessageType::Event),
            "query" => Ok(MessageType::Query),
            "response" => Ok(MessageType::Response),
            "error" => Ok(MessageType::Error),
            other => Err(ValidationError::new(
                "message_type",
                format!("`{}` is not one of command, event, query, response, error", other),
            )),
        }
    }
}

/// Immutable envelope routed by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    topic: String,
    sender: String,
    payload: Value,
    message_type: MessageType,
    receiver: Option<String>,
    trace_id: Uuid,
    /// Thread id of the message being answered (not a per-message id)
    parent_id: Option<Uuid>,
    /// Unix epoch seconds
    timestamp: f64,
}

impl Message {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// True if the message is unaddressed, broadcast, or addressed to `agent_id`.
    pub fn is_addressed_to(&self, agent_id: &str) -> bool {
        match self.receiver.as_deref() {
            None => true,
            Some(r) => r == BROADCAST_RECEIVER || r == agent_id,
        }
    }

    /// Starts a reply on the same topic, addressed to this message's sender.
    ///
    /// The reply stays in this message's thread: both `trace_id` and
    /// `parent_id` carry this message's trace id, so replies can be grouped
    /// by thread but not attributed to one specific parent message.
    pub fn reply(&self, sender: impl Into<String>, payload: Value) -> MessageDraft {
        MessageDraft::new(self.topic.clone(), sender, payload)
            .message_type(MessageType::Response)
            .receiver(self.sender.clone())
            .trace_id(self.trace_id.to_string())
            .parent_id(self.trace_id.to_string())
    }

    /// Serializes to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Unvalidated message fields, as a caller supplies them to `publish`.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    topic: String,
    sender: String,
    payload: Value,
    message_type: MessageType,
    receiver: Option<String>,
    trace_id: Option<String>,
    parent_id: Option<String>,
}

impl MessageDraft {
    pub fn new(topic: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            sender: sender.into(),
            payload,
            message_type: MessageType::default(),
            receiver: None,
            trace_id: None,
            parent_id: None,
        }
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Sets the type from its wire name, failing on anything but the five kinds.
    pub fn message_type_str(mut self, message_type: &str) -> Result<Self, ValidationError> {
        self.message_type = message_type.parse()?;
        Ok(self)
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Validates the draft and stamps it with `timestamp`.
    ///
    /// A missing trace id is generated; a present one must parse as a UUID.
    pub fn build(self, timestamp: f64) -> Result<Message, ValidationError> {
        if self.topic.is_empty() {
            return Err(ValidationError::new("topic", "must not be empty"));
        }
        let trace_id = match self.trace_id.as_deref() {
            Some(raw) => parse_uuid("trace_id", raw)?,
            None => Uuid::new_v4(),
        };
        let parent_id = self
            .parent_id
            .as_deref()
            .map(|raw| parse_uuid("parent_id", raw))
            .transpose()?;

        Ok(Message {
            topic: self.topic,
            sender: self.sender,
            payload: self.payload,
            message_type: self.message_type,
            receiver: self.receiver,
            trace_id,
            parent_id,
            timestamp,
        })
    }
}

fn parse_uuid(field: &'static str, raw: &str) -> Result<Uuid, ValidationError> {
    Uuid::parse_str(raw).map_err(|e| ValidationError::new(field, format!("`{}` is not a UUID: {}", raw, e)))
}

/// Wire form used when reading audit lines back.
#[derive(Deserialize)]
struct RawMessage {
    topic: String,
    sender: String,
    payload: Value,
    message_type: String,
    receiver: Option<String>,
    trace_id: String,
    parent_id: Option<String>,
    timestamp: f64,
}

impl TryFrom<RawMessage> for Message {
    type Error = ValidationError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let mut draft = MessageDraft::new(raw.topic, raw.sender, raw.payload)
            .message_type_str(&raw.message_type)?
            .trace_id(raw.trace_id);
        if let Some(receiver) = raw.receiver {
            draft = draft.receiver(receiver);
        }
        if let Some(parent) = raw.parent_id {
            draft = draft.parent_id(parent);
        }
        draft.build(raw.timestamp)
    }
}

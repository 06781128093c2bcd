//! Event types for the conversation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A unique identifier for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// The type tag of an event, as stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    User,
    Think,
    Call,
    Execute,
    Result,
    Respond,
    End,
    Metric,
    Error,
    Interrupt,
}

impl EventType {
    pub const ALL: [EventType; 10] = [
        Self::User,
        Self::Think,
        Self::Call,
        Self::Execute,
        Self::Result,
        Self::Respond,
        Self::End,
        Self::Metric,
        Self::Error,
        Self::Interrupt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Think => "think",
            Self::Call => "call",
            Self::Execute => "execute",
            Self::Result => "result",
            Self::Respond => "respond",
            Self::End => "end",
            Self::Metric => "metric",
            Self::Error => "error",
            Self::Interrupt => "interrupt",
        }
    }

    /// Whether events of this type belong in the persisted log.
    pub fn is_durable(self) -> bool {
        matches!(
            self,
            Self::User | Self::Think | Self::Call | Self::Result | Self::Respond
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {s}"))
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Outcome of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Failure,
}

/// The result of a tool call, fed back to the model.
///
/// `content` holds the tool output on success and a human-readable message
/// on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub status: ToolStatus,
    pub content: Value,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, output: Value) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Success,
            content: output,
        }
    }

    pub fn failure(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            status: ToolStatus::Failure,
            content: Value::String(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

/// Token and duration counters for one model pass or a running total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.duration_ms += rhs.duration_ms;
    }
}

/// Payload of a `metric` event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    pub step: Usage,
    pub total: Usage,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum EventKind {
    /// Input from the user.
    User(String),
    /// Model reasoning.
    Think(String),
    /// A tool call requested by the model.
    Call(ToolCall),
    /// Boundary after which buffered calls run.
    Execute,
    /// Outcome of an executed call.
    Result(ToolResult),
    /// User-facing model text.
    Respond(String),
    /// The model signalled end of turn.
    End,
    Metric(Metrics),
    Error(String),
    Interrupt,
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::User(_) => EventType::User,
            Self::Think(_) => EventType::Think,
            Self::Call(_) => EventType::Call,
            Self::Execute => EventType::Execute,
            Self::Result(_) => EventType::Result,
            Self::Respond(_) => EventType::Respond,
            Self::End => EventType::End,
            Self::Metric(_) => EventType::Metric,
            Self::Error(_) => EventType::Error,
            Self::Interrupt => EventType::Interrupt,
        }
    }
}

/// An event in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(EventKind::User(content.into()))
    }

    pub fn think(content: impl Into<String>) -> Self {
        Self::new(EventKind::Think(content.into()))
    }

    pub fn respond(content: impl Into<String>) -> Self {
        Self::new(EventKind::Respond(content.into()))
    }

    pub fn call(call: ToolCall) -> Self {
        Self::new(EventKind::Call(call))
    }

    pub fn result(result: ToolResult) -> Self {
        Self::new(EventKind::Result(result))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error(message.into()))
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn is_durable(&self) -> bool {
        self.event_type().is_durable()
    }

    /// Text payload for user, think and respond events.
    pub fn text(&self) -> Option<&str> {
        match &self.kind {
            EventKind::User(s) | EventKind::Think(s) | EventKind::Respond(s) => Some(s),
            _ => None,
        }
    }

    /// Encode the `content` column: plain text for text events, JSON for
    /// calls and results.
    pub(crate) fn encode_content(&self) -> crate::Result<String> {
        match &self.kind {
            EventKind::User(s) | EventKind::Think(s) | EventKind::Respond(s) => Ok(s.clone()),
            EventKind::Call(call) => Ok(serde_json::to_string(call)?),
            EventKind::Result(result) => Ok(serde_json::to_string(result)?),
            other => Err(crate::Error::NotDurable(other.event_type().as_str())),
        }
    }

    pub(crate) fn decode(
        event_type: &str,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> std::result::Result<Self, String> {
        let kind = match event_type.parse::<EventType>()? {
            EventType::User => EventKind::User(content),
            EventType::Think => EventKind::Think(content),
            EventType::Respond => EventKind::Respond(content),
            EventType::Call => {
                EventKind::Call(serde_json::from_str(&content).map_err(|e| e.to_string())?)
            }
            EventType::Result => {
                EventKind::Result(serde_json::from_str(&content).map_err(|e| e.to_string())?)
            }
            other => return Err(format!("{other} events are not stored")),
        };
        Ok(Self { kind, timestamp })
    }
}

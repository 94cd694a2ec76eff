use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Recipient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name")]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    /// A single agent's mailbox.
    Agent(String),
    /// Every existing mailbox except the sender's own.
    Broadcast,
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Step-completion report published by a running agent.
    Progress,
    /// Cancellation request; honored at the next step boundary.
    Stop,
    /// Application-defined payload.
    Data,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MessageKind::Progress => "progress",
            MessageKind::Stop => "stop",
            MessageKind::Data => "data",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

/// A unit of inter-agent communication.
///
/// Messages are immutable once published; the queue preserves per-sender
/// order for each recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

impl AgentMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            recipient,
            kind,
            payload,
            sent_at: Utc::now(),
        }
    }

    /// A data message addressed to a single agent.
    pub fn data(sender: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self::new(sender, Recipient::Agent(to.into()), MessageKind::Data, payload)
    }

    /// A step-progress report addressed to a single agent.
    pub fn progress(sender: impl Into<String>, to: impl Into<String>, payload: Value) -> Self {
        Self::new(
            sender,
            Recipient::Agent(to.into()),
            MessageKind::Progress,
            payload,
        )
    }

    /// A stop request addressed to a single agent.
    pub fn stop(sender: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            sender,
            Recipient::Agent(to.into()),
            MessageKind::Stop,
            Value::Null,
        )
    }

    /// A broadcast data message.
    pub fn broadcast(sender: impl Into<String>, kind: MessageKind, payload: Value) -> Self {
        Self::new(sender, Recipient::Broadcast, kind, payload)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

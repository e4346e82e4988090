//! Inter-agent messages.
//!
//! A [`Message`] is immutable once built: it has no setters, and the only way
//! to "answer" or "amend" one is to build a new message on the same thread
//! ([`Message::reply`], [`Message::error_reply`]).
//!
//! The serialized field names (`from_agent`, `to_agent`, `type`, `timestamp`)
//! are the on-disk wire format read by external inspection tooling.

use chrono::{DateTime, Duration, DurationRound, Utc};
use parking_lot::{Mutex, const_mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::msgid;

/// Reserved destination for messages written to the shared broadcast area.
pub const BROADCAST: &str = "broadcast";

/// What a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
    Escalation,
}

impl MessageKind {
    /// Whether this kind closes a request thread.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Response => write!(f, "response"),
            MessageKind::Notification => write!(f, "notification"),
            MessageKind::Error => write!(f, "error"),
            MessageKind::Escalation => write!(f, "escalation"),
        }
    }
}

/// Advisory priority. Recorded and shown to the model; delivery order is
/// always FIFO by creation time regardless of priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A unit of inter-agent communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    #[serde(rename = "timestamp")]
    created_at: DateTime<Utc>,
    #[serde(rename = "from_agent")]
    from: String,
    #[serde(rename = "to_agent")]
    to: String,
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    priority: Priority,
    payload: Value,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    requires_response: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    context: Option<Value>,
}

impl Message {
    /// Start building a message. Identity and timestamp are assigned by
    /// [`MessageBuilder::build`].
    pub fn builder(from: &str, to: &str, kind: MessageKind) -> MessageBuilder {
        MessageBuilder {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            priority: Priority::default(),
            payload: Value::Object(Default::default()),
            thread_id: None,
            requires_response: false,
            context: None,
        }
    }

    /// A high-priority request that must be answered.
    pub fn request(from: &str, to: &str, payload: Value) -> Message {
        Message::builder(from, to, MessageKind::Request)
            .priority(Priority::High)
            .payload(payload)
            .requires_response(true)
            .build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn requires_response(&self) -> bool {
        self.requires_response
    }

    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    /// The thread this message belongs to: its explicit `thread_id`, or its
    /// own id when it starts a thread.
    pub fn correlation_id(&self) -> &str {
        self.thread_id.as_deref().unwrap_or(&self.id)
    }

    /// Whether this message was addressed to the broadcast area.
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Build the response to this message, sent by `from` back to the sender.
    pub fn reply(&self, from: &str, text: &str) -> Message {
        Message::builder(from, &self.from, MessageKind::Response)
            .priority(self.priority)
            .payload(serde_json::json!({ "response": text }))
            .thread(self.correlation_id())
            .build()
    }

    /// Build the error reply to this message. Errors are always high priority.
    pub fn error_reply(&self, from: &str, error: &str) -> Message {
        Message::builder(from, &self.from, MessageKind::Error)
            .priority(Priority::High)
            .payload(serde_json::json!({ "error": error }))
            .thread(self.correlation_id())
            .build()
    }

    /// Text carried by a response or error payload, if any.
    pub fn reply_text(&self) -> Option<&str> {
        let key = match self.kind {
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            _ => return None,
        };
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Mailbox filename: sortable creation timestamp, then the id.
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}.json",
            self.created_at.format("%Y-%m-%dT%H:%M:%S%.6f"),
            self.id
        )
    }
}

/// Builder for [`Message`].
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    from: String,
    to: String,
    kind: MessageKind,
    priority: Priority,
    payload: Value,
    thread_id: Option<String>,
    requires_response: bool,
    context: Option<Value>,
}

impl MessageBuilder {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn thread(mut self, thread_id: &str) -> Self {
        self.thread_id = Some(thread_id.to_string());
        self
    }

    pub fn requires_response(mut self, requires: bool) -> Self {
        self.requires_response = requires;
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Stamp identity and creation time.
    pub fn build(self) -> Message {
        let created_at = next_timestamp();
        Message {
            id: msgid::generate_at(created_at),
            created_at,
            from: self.from,
            to: self.to,
            kind: self.kind,
            priority: self.priority,
            payload: self.payload,
            thread_id: self.thread_id,
            requires_response: self.requires_response,
            context: self.context,
        }
    }
}

static LAST_TIMESTAMP: Mutex<Option<DateTime<Utc>>> = const_mutex(None);

/// Strictly increasing creation timestamps at microsecond resolution (the
/// resolution of the mailbox filename), so one writer's messages never tie.
fn next_timestamp() -> DateTime<Utc> {
    let now = Utc::now();
    let now = now
        .duration_trunc(Duration::microseconds(1))
        .unwrap_or(now);
    let mut last = LAST_TIMESTAMP.lock();
    let stamp = match *last {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    };
    *last = Some(stamp);
    stamp
}

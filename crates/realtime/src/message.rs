use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const PHX_JOIN: &str = "phx_join";
pub(crate) const PHX_LEAVE: &str = "phx_leave";
pub(crate) const PHX_REPLY: &str = "phx_reply";
pub(crate) const PHX_ERROR: &str = "phx_error";
pub(crate) const PHX_CLOSE: &str = "phx_close";
pub(crate) const HEARTBEAT: &str = "heartbeat";
pub(crate) const ACCESS_TOKEN: &str = "access_token";
pub(crate) const POSTGRES_CHANGES: &str = "postgres_changes";
pub(crate) const PHOENIX_TOPIC: &str = "phoenix";

/// One frame on the socket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    /// String, number or null depending on the sender
    #[serde(rename = "ref", default)]
    pub message_ref: Value,
}

impl RealtimeMessage {
    pub fn new(topic: &str, event: &str, payload: Value, message_ref: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            message_ref: message_ref.map(Value::String).unwrap_or(Value::Null),
        }
    }

    pub fn ref_string(&self) -> Option<String> {
        match &self.message_ref {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Which row operations a subscription asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeEvent {
    #[default]
    All,
    Insert,
    Update,
    Delete,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::All => "*",
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
        }
    }

    pub fn matches(&self, kind: ChangeKind) -> bool {
        matches!(
            (self, kind),
            (ChangeEvent::All, _)
                | (ChangeEvent::Insert, ChangeKind::Insert)
                | (ChangeEvent::Update, ChangeKind::Update)
                | (ChangeEvent::Delete, ChangeKind::Delete)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub schema: String,
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    /// New row image; `null` for deletes
    #[serde(default)]
    pub record: Value,
    /// Previous row image; often only the primary key
    #[serde(default)]
    pub old_record: Value,
}

impl Change {
    /// Extract the change from a `postgres_changes` payload. Newer servers wrap
    /// it in `data`, older ones send it flat.
    pub fn from_payload(payload: &Value) -> Option<Change> {
        let body = payload.get("data").filter(|d| d.is_object()).unwrap_or(payload);
        serde_json::from_value(body.clone()).ok()
    }

    /// Value of the `id` column from whichever row image carries it
    pub fn row_id(&self) -> Option<&str> {
        self.record
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| self.old_record.get("id").and_then(Value::as_str))
    }
}

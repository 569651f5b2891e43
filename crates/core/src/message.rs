use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bus-assigned message identifier. Drawn from a monotonically increasing
/// counter, so ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{:06}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Direct,
    Publish,
    Broadcast,
    System,
    CoordinationRequest,
    Response,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Direct => "direct",
            MessageKind::Publish => "publish",
            MessageKind::Broadcast => "broadcast",
            MessageKind::System => "system",
            MessageKind::CoordinationRequest => "coordination_request",
            MessageKind::Response => "response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

/// Where a message is headed: a single agent inbox or a pub/sub topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Recipient {
    Agent(String),
    Topic(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    /// Application-level message type, e.g. "ping" or "audit.completed".
    pub message_type: String,
    pub from: String,
    /// The agent this copy was delivered to.
    pub to: String,
    /// Set when the message reached `to` through a topic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub requires_response: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordination_id: Option<String>,
}

impl Message {
    pub fn new(
        id: MessageId,
        kind: MessageKind,
        message_type: &str,
        from: &str,
        to: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id,
            kind,
            message_type: message_type.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            topic: None,
            payload,
            created_at: Utc::now(),
            delivered_at: None,
            status: DeliveryStatus::Pending,
            requires_response: false,
            timeout_ms: None,
            in_reply_to: None,
            coordination_id: None,
        }
    }

    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn in_reply_to(mut self, original: MessageId) -> Self {
        self.in_reply_to = Some(original);
        self
    }

    pub fn with_coordination(mut self, coordination_id: &str) -> Self {
        self.coordination_id = Some(coordination_id.to_string());
        self
    }

    pub fn recipient(&self) -> Recipient {
        match &self.topic {
            Some(topic) => Recipient::Topic(topic.clone()),
            None => Recipient::Agent(self.to.clone()),
        }
    }

    /// Move out of `Pending`. Returns false (and changes nothing) when the
    /// message already settled.
    pub fn settle(&mut self, status: DeliveryStatus) -> bool {
        if self.status != DeliveryStatus::Pending || status == DeliveryStatus::Pending {
            return false;
        }
        self.status = status;
        if status == DeliveryStatus::Delivered {
            self.delivered_at = Some(Utc::now());
        }
        true
    }
}

/// Per-send options for `MessageBus::send_message`.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub requires_response: bool,
    /// Falls back to the bus default when `None`.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn request() -> Self {
        Self {
            requires_response: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_happens_once() {
        let mut msg = Message::new(
            MessageId(1),
            MessageKind::Direct,
            "ping",
            "a",
            "b",
            serde_json::json!({}),
        );
        assert!(msg.settle(DeliveryStatus::Delivered));
        assert!(msg.delivered_at.is_some());
        assert!(!msg.settle(DeliveryStatus::Failed));
        assert_eq!(msg.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_message_id_display_and_order() {
        assert_eq!(MessageId(42).to_string(), "msg-000042");
        assert!(MessageId(2) > MessageId(1));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let v = serde_json::to_value(MessageKind::CoordinationRequest).unwrap();
        assert_eq!(v, serde_json::json!("coordination_request"));
        assert_eq!(MessageKind::CoordinationRequest.to_string(), "coordination_request");
    }
}

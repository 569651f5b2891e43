use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Builds the key that deduplicates concurrent activations.
pub fn lock_key(agent_type: &str, operation_type: &str) -> String {
    format!("{}:{}", agent_type, operation_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Active,
    Deactivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    /// The per-agent-type idle window elapsed.
    IdleTimeout,
    /// Released explicitly after the dispatched operation settled.
    Released,
}

/// Bookkeeping record marking a logical agent engaged for an operation type.
/// Deactivating it releases the lock key; it tears nothing down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub id: String,
    pub agent_type: String,
    pub operation_type: String,
    pub lock_key: String,
    pub status: ActivationStatus,
    pub event_data: serde_json::Value,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<DeactivationReason>,
}

impl Activation {
    pub fn new(agent_type: &str, operation_type: &str, event_data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_type: agent_type.to_string(),
            operation_type: operation_type.to_string(),
            lock_key: lock_key(agent_type, operation_type),
            status: ActivationStatus::Active,
            event_data,
            started_at: Utc::now(),
            ended_at: None,
            deactivation_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ActivationStatus::Active
    }

    /// Guarded `active -> deactivated` transition; false when already deactivated.
    pub fn deactivate(&mut self, reason: DeactivationReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = ActivationStatus::Deactivated;
        self.ended_at = Some(Utc::now());
        self.deactivation_reason = Some(reason);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStatus {
    Requesting,
    Coordinated,
    Failed,
}

/// A fan-out request from one coordinator to several participants.
/// `Coordinated` and `Failed` are terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordination {
    pub id: String,
    pub coordinator: String,
    pub operation_type: String,
    pub participants: Vec<String>,
    /// One slot per participant, filled as responses arrive.
    pub responses: BTreeMap<String, Option<serde_json::Value>>,
    pub status: CoordinationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Coordination {
    pub fn new(coordinator: &str, operation_type: &str, participants: &[String]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            coordinator: coordinator.to_string(),
            operation_type: operation_type.to_string(),
            participants: participants.to_vec(),
            responses: participants.iter().map(|p| (p.clone(), None)).collect(),
            status: CoordinationStatus::Requesting,
            created_at: Utc::now(),
            completed_at: None,
            failure: None,
        }
    }

    /// Move to a terminal state. No-op once terminal.
    pub fn finish(&mut self, status: CoordinationStatus, failure: Option<String>) -> bool {
        if self.status != CoordinationStatus::Requesting || status == CoordinationStatus::Requesting {
            return false;
        }
        self.status = status;
        self.failure = failure;
        self.completed_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Processing,
    Completed,
    Failed,
    NoHandler,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::NoHandler => "no_handler",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub status: EventStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn summarize(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    format!("{}... (truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_deactivates_once() {
        let mut activation = Activation::new("audit", "initial_audit", serde_json::Value::Null);
        assert_eq!(activation.lock_key, "audit:initial_audit");
        assert!(activation.deactivate(DeactivationReason::Released));
        let ended = activation.ended_at;
        assert!(!activation.deactivate(DeactivationReason::IdleTimeout));
        assert_eq!(activation.ended_at, ended);
        assert_eq!(activation.deactivation_reason, Some(DeactivationReason::Released));
    }

    #[test]
    fn test_coordination_terminal_states_are_final() {
        let participants = vec!["a".to_string(), "b".to_string()];
        let mut coordination = Coordination::new("lead", "sync", &participants);
        assert_eq!(coordination.responses.len(), 2);
        assert!(coordination.finish(CoordinationStatus::Failed, Some("b timed out".to_string())));
        assert!(!coordination.finish(CoordinationStatus::Coordinated, None));
        assert_eq!(coordination.status, CoordinationStatus::Failed);
    }

    #[test]
    fn test_summarize_respects_char_boundaries() {
        assert_eq!(summarize("short", 10), "short");
        assert_eq!(summarize("héllo wörld", 5), "héllo... (truncated)");
    }
}

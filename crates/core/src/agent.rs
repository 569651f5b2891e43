use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Operational status of an agent, as last reported by the dispatcher or a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Health classification produced by the registry health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl AgentHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentHealth::Healthy => "healthy",
            AgentHealth::Degraded => "degraded",
            AgentHealth::Unhealthy => "unhealthy",
            AgentHealth::Unknown => "unknown",
        }
    }
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One settled operation on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub operation: String,
    pub duration_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    /// Truncated rendering of the result or error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Registration input for `AgentRegistry::register_agent`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_type: String,
    /// Name of the orchestrator that owns this agent's operations.
    pub orchestrator: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentInfo {
    pub fn new(agent_type: &str, orchestrator: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            orchestrator: orchestrator.to_string(),
            ..Default::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub agent_type: String,
    pub orchestrator: String,
    pub capabilities: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub description: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub status: AgentStatus,
    pub health: AgentHealth,
    pub history: VecDeque<ExecutionRecord>,
    pub execution_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(name: &str, info: AgentInfo) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            agent_type: info.agent_type,
            orchestrator: info.orchestrator,
            capabilities: info.capabilities.into_iter().collect(),
            tags: info.tags.into_iter().collect(),
            description: info.description,
            metadata: info.metadata,
            status: AgentStatus::Available,
            health: AgentHealth::Unknown,
            history: VecDeque::new(),
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            total_duration_ms: 0,
            last_error: None,
            registered_at: now,
            last_activity: now,
            last_health_check: None,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Append to the bounded history, evicting the oldest record past `limit`.
    pub fn push_execution(&mut self, record: ExecutionRecord, limit: usize) {
        self.execution_count += 1;
        self.total_duration_ms += record.duration_ms;
        if record.success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.last_activity = record.timestamp;
        self.history.push_back(record);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Success ratio over the `window` most recent executions, `None` when
    /// nothing has run yet.
    pub fn recent_success_rate(&self, window: usize) -> Option<f64> {
        let recent: Vec<&ExecutionRecord> = self.history.iter().rev().take(window).collect();
        if recent.is_empty() {
            return None;
        }
        let ok = recent.iter().filter(|r| r.success).count();
        Some(ok as f64 / recent.len() as f64)
    }

    pub fn average_duration_ms(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.execution_count as f64
        }
    }
}

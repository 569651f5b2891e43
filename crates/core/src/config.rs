use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Messages kept per agent inbox; the oldest are evicted beyond this.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Applied to response-required sends that don't set their own timeout.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_inbox_capacity() -> usize {
    100
}

fn default_history_capacity() -> usize {
    1000
}

fn default_response_timeout_ms() -> u64 {
    30_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: default_inbox_capacity(),
            history_capacity: default_history_capacity(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl BusConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(default = "default_execution_history_limit")]
    pub execution_history_limit: usize,
    /// Number of most recent executions the success-rate check looks at.
    #[serde(default = "default_success_rate_window")]
    pub success_rate_window: usize,
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_top_agents")]
    pub top_agents: usize,
}

fn default_execution_history_limit() -> usize {
    100
}

fn default_success_rate_window() -> usize {
    10
}

fn default_activity_window_secs() -> u64 {
    3600
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_top_agents() -> usize {
    5
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            execution_history_limit: default_execution_history_limit(),
            success_rate_window: default_success_rate_window(),
            activity_window_secs: default_activity_window_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            top_agents: default_top_agents(),
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationConfig {
    /// Idle window for agent types missing from `idle_delays_ms`.
    #[serde(default = "default_idle_delay_ms")]
    pub default_idle_delay_ms: u64,
    /// Per agent type idle window before an activation is soft-deactivated.
    #[serde(default = "default_idle_delays")]
    pub idle_delays_ms: HashMap<String, u64>,
    #[serde(default = "default_event_history_capacity")]
    pub event_history_capacity: usize,
}

fn default_idle_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_idle_delays() -> HashMap<String, u64> {
    let mut delays = HashMap::new();
    // Lightweight coordination agents go idle quickly
    delays.insert("coordinator".to_string(), 60 * 1000);
    delays.insert("notification".to_string(), 60 * 1000);
    // Analytical agents stay engaged longer
    delays.insert("audit".to_string(), 10 * 60 * 1000);
    delays.insert("optimization".to_string(), 10 * 60 * 1000);
    delays.insert("customer_value".to_string(), 10 * 60 * 1000);
    delays.insert("backup".to_string(), 5 * 60 * 1000);
    delays.insert("consolidation".to_string(), 5 * 60 * 1000);
    delays
}

fn default_event_history_capacity() -> usize {
    100
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            default_idle_delay_ms: default_idle_delay_ms(),
            idle_delays_ms: default_idle_delays(),
            event_history_capacity: default_event_history_capacity(),
        }
    }
}

impl ActivationConfig {
    pub fn idle_delay_for(&self, agent_type: &str) -> Duration {
        let ms = self
            .idle_delays_ms
            .get(agent_type)
            .copied()
            .unwrap_or(self.default_idle_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Upper bound on waiting for an orchestrator to report ready.
    #[serde(default = "default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
    #[serde(default = "default_activation_history_capacity")]
    pub activation_history_capacity: usize,
    /// When set, every settled operation is published on this bus topic.
    #[serde(default)]
    pub notify_topic: Option<String>,
}

fn default_readiness_timeout_ms() -> u64 {
    30_000
}

fn default_activation_history_capacity() -> usize {
    100
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: default_readiness_timeout_ms(),
            activation_history_capacity: default_activation_history_capacity(),
            notify_topic: None,
        }
    }
}

impl DispatcherConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub activation: ActivationConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would make a bounded structure unbounded or a loop spin.
    pub fn validate(&self) -> Result<()> {
        if self.bus.inbox_capacity == 0 {
            return Err(Error::Config("bus.inboxCapacity must be at least 1".to_string()));
        }
        if self.bus.history_capacity == 0 {
            return Err(Error::Config("bus.historyCapacity must be at least 1".to_string()));
        }
        if self.registry.execution_history_limit == 0 {
            return Err(Error::Config(
                "registry.executionHistoryLimit must be at least 1".to_string(),
            ));
        }
        if self.registry.success_rate_window == 0 {
            return Err(Error::Config(
                "registry.successRateWindow must be at least 1".to_string(),
            ));
        }
        if self.registry.health_check_interval_secs == 0 {
            return Err(Error::Config(
                "registry.healthCheckIntervalSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

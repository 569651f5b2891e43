use chrono::{DateTime, Utc};
use conductor_core::{
    summarize, Agent, AgentHealth, AgentInfo, AgentStatus, Error, ExecutionRecord,
    RegistryConfig, Result,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::health::{HealthAssessment, HealthChecker};

const RESULT_SUMMARY_CHARS: usize = 200;

/// Criteria for `find_agents`. Every set field must match (logical AND);
/// capabilities and tags match when the agent holds a superset.
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    pub agent_type: Option<String>,
    pub orchestrator: Option<String>,
    pub capabilities: Vec<String>,
    pub tags: Vec<String>,
    pub status: Option<AgentStatus>,
    pub health: Option<AgentHealth>,
}

impl AgentQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent_type(mut self, agent_type: &str) -> Self {
        self.agent_type = Some(agent_type.to_string());
        self
    }

    pub fn orchestrator(mut self, orchestrator: &str) -> Self {
        self.orchestrator = Some(orchestrator.to_string());
        self
    }

    pub fn capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn health(mut self, health: AgentHealth) -> Self {
        self.health = Some(health);
        self
    }

    fn matches(&self, agent: &Agent) -> bool {
        self.agent_type.as_ref().map_or(true, |t| &agent.agent_type == t)
            && self.orchestrator.as_ref().map_or(true, |o| &agent.orchestrator == o)
            && self.capabilities.iter().all(|c| agent.has_capability(c))
            && self.tags.iter().all(|t| agent.tags.contains(t))
            && self.status.map_or(true, |s| agent.status == s)
            && self.health.map_or(true, |h| agent.health == h)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub agents: BTreeMap<String, HealthAssessment>,
}

impl HealthReport {
    pub fn count(&self, health: AgentHealth) -> usize {
        self.agents.values().filter(|a| a.health == health).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub agent_type: String,
    pub executions: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStatistics {
    pub total_agents: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_orchestrator: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub by_health: BTreeMap<String, usize>,
    pub top_agents: Vec<AgentSummary>,
    pub capabilities: usize,
    pub tags: usize,
    pub total_executions: u64,
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, Agent>,
    capability_index: HashMap<String, BTreeSet<String>>,
    tag_index: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn index(&mut self, agent: &Agent) {
        for cap in &agent.capabilities {
            self.capability_index
                .entry(cap.clone())
                .or_default()
                .insert(agent.name.clone());
        }
        for tag in &agent.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(agent.name.clone());
        }
    }

    fn unindex(&mut self, agent: &Agent) {
        for cap in &agent.capabilities {
            if let Some(names) = self.capability_index.get_mut(cap) {
                names.remove(&agent.name);
                if names.is_empty() {
                    self.capability_index.remove(cap);
                }
            }
        }
        for tag in &agent.tags {
            if let Some(names) = self.tag_index.get_mut(tag) {
                names.remove(&agent.name);
                if names.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn agent_mut(&mut self, name: &str) -> Result<&mut Agent> {
        self.agents
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", name)))
    }
}

/// Capability-indexed directory of agents with execution history and health.
#[derive(Clone)]
pub struct AgentRegistry {
    config: RegistryConfig,
    checker: HealthChecker,
    state: Arc<RwLock<RegistryState>>,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            checker: HealthChecker::new(&config),
            config,
            state: Arc::new(RwLock::new(RegistryState::default())),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register `name`, replacing any existing agent of the same name
    /// together with its history.
    pub async fn register_agent(&self, name: &str, info: AgentInfo) -> Agent {
        let agent = Agent::new(name, info);
        let mut state = self.state.write().await;
        if let Some(previous) = state.agents.remove(name) {
            state.unindex(&previous);
            debug!(agent = %name, "Replacing existing registration");
        }
        state.index(&agent);
        state.agents.insert(name.to_string(), agent.clone());
        info!(
            agent = %name,
            agent_type = %agent.agent_type,
            orchestrator = %agent.orchestrator,
            capabilities = agent.capabilities.len(),
            "Agent registered"
        );
        agent
    }

    pub async fn unregister_agent(&self, name: &str) -> Result<Agent> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", name)))?;
        state.unindex(&agent);
        info!(agent = %name, "Agent unregistered");
        Ok(agent)
    }

    pub async fn get_agent(&self, name: &str) -> Option<Agent> {
        self.state.read().await.agents.get(name).cloned()
    }

    pub async fn list_agents(&self) -> Vec<Agent> {
        self.find_agents(&AgentQuery::default()).await
    }

    /// Agents matching `query`, sorted by name.
    pub async fn find_agents(&self, query: &AgentQuery) -> Vec<Agent> {
        let guard = self.state.read().await;
        let state = &*guard;

        // Narrow through the capability index before the full filter.
        let candidates: Box<dyn Iterator<Item = &Agent> + '_> = match query.capabilities.first() {
            Some(cap) => match state.capability_index.get(cap) {
                Some(names) => Box::new(names.iter().filter_map(|n| state.agents.get(n))),
                None => return Vec::new(),
            },
            None => Box::new(state.agents.values()),
        };

        let mut found: Vec<Agent> = candidates.filter(|a| query.matches(a)).cloned().collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Append one settled operation to the agent's bounded history.
    pub async fn record_execution(
        &self,
        name: &str,
        operation: &str,
        duration_ms: u64,
        success: bool,
        result: Option<&Value>,
    ) -> Result<()> {
        let limit = self.config.execution_history_limit;
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        let summary = result.map(|r| match r {
            Value::String(s) => summarize(s, RESULT_SUMMARY_CHARS),
            other => summarize(&other.to_string(), RESULT_SUMMARY_CHARS),
        });
        if !success {
            agent.last_error = summary.clone();
        }
        agent.push_execution(
            ExecutionRecord {
                operation: operation.to_string(),
                duration_ms,
                success,
                timestamp: Utc::now(),
                summary,
            },
            limit,
        );
        debug!(agent = %name, operation = %operation, duration_ms, success, "Execution recorded");
        Ok(())
    }

    /// Overwrite status, merge `metadata` into the agent's metadata and
    /// touch last activity.
    pub async fn update_agent_status(
        &self,
        name: &str,
        status: AgentStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let agent = state.agent_mut(name)?;
        let previous = agent.status;
        agent.status = status;
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                agent.metadata.insert(k, v);
            }
        }
        agent.last_activity = Utc::now();
        if previous != status {
            debug!(agent = %name, from = %previous, to = %status, "Agent status changed");
        }
        Ok(())
    }

    /// Score every agent and store the resulting health on it.
    pub async fn perform_health_check(&self) -> HealthReport {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut agents = BTreeMap::new();
        for agent in state.agents.values_mut() {
            let assessment = self.checker.assess(agent, now);
            if agent.health != assessment.health {
                info!(
                    agent = %agent.name,
                    from = %agent.health,
                    to = %assessment.health,
                    score = assessment.score,
                    "Agent health changed"
                );
            }
            agent.health = assessment.health;
            agent.last_health_check = Some(now);
            agents.insert(agent.name.clone(), assessment);
        }
        HealthReport {
            checked_at: now,
            agents,
        }
    }

    pub async fn get_statistics(&self) -> RegistryStatistics {
        let state = self.state.read().await;
        let mut stats = RegistryStatistics {
            total_agents: state.agents.len(),
            capabilities: state.capability_index.len(),
            tags: state.tag_index.len(),
            ..Default::default()
        };

        for agent in state.agents.values() {
            *stats.by_type.entry(agent.agent_type.clone()).or_default() += 1;
            *stats.by_orchestrator.entry(agent.orchestrator.clone()).or_default() += 1;
            *stats.by_status.entry(agent.status.to_string()).or_default() += 1;
            *stats.by_health.entry(agent.health.to_string()).or_default() += 1;
            stats.total_executions += agent.execution_count;
        }

        let mut ranked: Vec<&Agent> = state.agents.values().collect();
        ranked.sort_by(|a, b| {
            b.execution_count
                .cmp(&a.execution_count)
                .then_with(|| a.name.cmp(&b.name))
        });
        stats.top_agents = ranked
            .into_iter()
            .take(self.config.top_agents)
            .map(|a| AgentSummary {
                name: a.name.clone(),
                agent_type: a.agent_type.clone(),
                executions: a.execution_count,
                success_rate: if a.execution_count == 0 {
                    0.0
                } else {
                    a.success_count as f64 / a.execution_count as f64
                },
                average_duration_ms: a.average_duration_ms(),
            })
            .collect();
        stats
    }

    pub async fn export_state(&self) -> Value {
        let statistics = self.get_statistics().await;
        let agents = self.list_agents().await;
        json!({
            "statistics": statistics,
            "agents": agents,
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> AgentRegistry {
        let registry = AgentRegistry::default();
        registry
            .register_agent(
                "site-auditor",
                AgentInfo::new("audit", "audit")
                    .with_capabilities(&["crawl", "score", "report"])
                    .with_tags(&["seo"]),
            )
            .await;
        registry
            .register_agent(
                "link-checker",
                AgentInfo::new("audit", "audit").with_capabilities(&["crawl"]),
            )
            .await;
        registry
            .register_agent(
                "notifier",
                AgentInfo::new("notification", "coordinator")
                    .with_capabilities(&["email", "report"])
                    .with_tags(&["seo", "outbound"]),
            )
            .await;
        registry
    }

    fn names(agents: &[Agent]) -> Vec<&str> {
        agents.iter().map(|a| a.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_find_by_capability_superset() {
        let registry = seeded().await;
        let found = registry.find_agents(&AgentQuery::new().capabilities(&["crawl"])).await;
        assert_eq!(names(&found), vec!["link-checker", "site-auditor"]);

        let found = registry
            .find_agents(&AgentQuery::new().capabilities(&["crawl", "report"]))
            .await;
        assert_eq!(names(&found), vec!["site-auditor"]);

        let found = registry
            .find_agents(&AgentQuery::new().capabilities(&["teleport"]))
            .await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_find_combines_criteria() {
        let registry = seeded().await;
        let found = registry
            .find_agents(&AgentQuery::new().tags(&["seo"]).agent_type("audit"))
            .await;
        assert_eq!(names(&found), vec!["site-auditor"]);

        let found = registry
            .find_agents(&AgentQuery::new().orchestrator("coordinator").status(AgentStatus::Available))
            .await;
        assert_eq!(names(&found), vec!["notifier"]);
        assert_eq!(registry.list_agents().await.len(), 3);
    }

    #[tokio::test]
    async fn test_reregistration_overwrites_and_reindexes() {
        let registry = seeded().await;
        registry
            .record_execution("link-checker", "crawl", 10, true, None)
            .await
            .unwrap();
        registry
            .register_agent(
                "link-checker",
                AgentInfo::new("audit", "audit").with_capabilities(&["validate"]),
            )
            .await;

        let agent = registry.get_agent("link-checker").await.unwrap();
        assert_eq!(agent.execution_count, 0);
        let crawlers = registry.find_agents(&AgentQuery::new().capabilities(&["crawl"])).await;
        assert_eq!(names(&crawlers), vec!["site-auditor"]);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_not_found() {
        let registry = seeded().await;
        registry.unregister_agent("notifier").await.unwrap();
        assert!(registry.unregister_agent("notifier").await.unwrap_err().is_not_found());
        assert_eq!(registry.get_statistics().await.tags, 1);
    }

    #[tokio::test]
    async fn test_record_execution_bounds_history() {
        let registry = AgentRegistry::new(RegistryConfig {
            execution_history_limit: 3,
            ..RegistryConfig::default()
        });
        registry.register_agent("a", AgentInfo::new("audit", "audit")).await;
        let long = Value::String("x".repeat(500));
        for _ in 0..5 {
            registry.record_execution("a", "scan", 7, true, Some(&long)).await.unwrap();
        }
        let agent = registry.get_agent("a").await.unwrap();
        assert_eq!(agent.history.len(), 3);
        assert_eq!(agent.execution_count, 5);
        assert!(agent.history[0].summary.as_ref().unwrap().ends_with("(truncated)"));

        let err = registry
            .record_execution("ghost", "scan", 1, true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_status_merges_metadata() {
        let registry = seeded().await;
        let mut meta = Map::new();
        meta.insert("last_error".to_string(), json!("disk full"));
        registry
            .update_agent_status("notifier", AgentStatus::Error, Some(meta))
            .await
            .unwrap();
        let mut meta = Map::new();
        meta.insert("region".to_string(), json!("eu"));
        registry
            .update_agent_status("notifier", AgentStatus::Error, Some(meta))
            .await
            .unwrap();

        let agent = registry.get_agent("notifier").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Error);
        assert_eq!(agent.metadata["last_error"], "disk full");
        assert_eq!(agent.metadata["region"], "eu");
    }

    #[tokio::test]
    async fn test_health_check_applies_boundaries() {
        let registry = AgentRegistry::default();
        registry.register_agent("steady", AgentInfo::new("audit", "audit")).await;
        registry.register_agent("flaky", AgentInfo::new("audit", "audit")).await;
        for i in 0..10 {
            registry.record_execution("steady", "scan", 1, i < 8, None).await.unwrap();
            registry.record_execution("flaky", "scan", 1, i < 4, None).await.unwrap();
        }

        let report = registry.perform_health_check().await;
        assert_eq!(report.agents["steady"].health, AgentHealth::Healthy);
        assert_eq!(report.agents["flaky"].health, AgentHealth::Unhealthy);
        assert_eq!(report.count(AgentHealth::Unhealthy), 1);

        let healthy = registry
            .find_agents(&AgentQuery::new().health(AgentHealth::Healthy))
            .await;
        assert_eq!(names(&healthy), vec!["steady"]);
        assert!(registry.get_agent("flaky").await.unwrap().last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_statistics_rank_top_agents() {
        let registry = seeded().await;
        for _ in 0..3 {
            registry.record_execution("notifier", "send", 4, true, None).await.unwrap();
        }
        registry.record_execution("site-auditor", "crawl", 8, false, None).await.unwrap();

        let stats = registry.get_statistics().await;
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.by_type["audit"], 2);
        assert_eq!(stats.by_orchestrator["coordinator"], 1);
        assert_eq!(stats.by_health["unknown"], 3);
        assert_eq!(stats.total_executions, 4);
        assert_eq!(stats.capabilities, 4);
        assert_eq!(stats.top_agents[0].name, "notifier");
        assert_eq!(stats.top_agents[1].success_rate, 0.0);
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{AgentStatus, DispatcherConfig, Error, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::registry::AgentRegistry;

/// Sender name used for operation notifications published on the bus.
pub const DISPATCHER_SENDER: &str = "dispatcher";

/// A business engine behind an orchestrator.
#[async_trait]
pub trait DomainEngine: Send + Sync {
    async fn run(&self, params: Value) -> Result<Value>;
}

struct FnEngine<F>(F);

#[async_trait]
impl<F, Fut> DomainEngine for FnEngine<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn run(&self, params: Value) -> Result<Value> {
        (self.0)(params).await
    }
}

/// Wrap an async closure as a [`DomainEngine`].
pub fn engine_fn<F, Fut>(f: F) -> Arc<dyn DomainEngine>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnEngine(f))
}

/// Routes operations for the agents it owns to domain engines.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    fn name(&self) -> &str;

    /// The operation id that serves `agent`, if this orchestrator maps it.
    fn operation_for(&self, agent: &str) -> Option<String>;

    /// Resolve once the orchestrator can take work, or fail with
    /// `Error::Timeout` after `timeout`.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;

    async fn execute(&self, operation_id: &str, operation: &str, params: Value) -> Result<Value>;
}

/// Orchestrator backed by an agent → operation id table and an
/// operation id → engine table. Starts not ready.
pub struct EngineOrchestrator {
    name: String,
    agent_operations: HashMap<String, String>,
    engines: HashMap<String, Arc<dyn DomainEngine>>,
    ready: watch::Sender<bool>,
}

impl EngineOrchestrator {
    pub fn new(name: &str) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            name: name.to_string(),
            agent_operations: HashMap::new(),
            engines: HashMap::new(),
            ready,
        }
    }

    pub fn map_agent(mut self, agent: &str, operation_id: &str) -> Self {
        self.agent_operations
            .insert(agent.to_string(), operation_id.to_string());
        self
    }

    pub fn with_engine(mut self, operation_id: &str, engine: Arc<dyn DomainEngine>) -> Self {
        self.engines.insert(operation_id.to_string(), engine);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
        debug!(orchestrator = %self.name, ready, "Readiness changed");
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

#[async_trait]
impl Orchestrator for EngineOrchestrator {
    fn name(&self) -> &str {
        &self.name
    }

    fn operation_for(&self, agent: &str) -> Option<String> {
        self.agent_operations.get(agent).cloned()
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let signal = async { rx.wait_for(|ready| *ready).await.map(|_| ()) };
        match tokio::time::timeout(timeout, signal).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Other(format!(
                "orchestrator '{}' readiness signal closed",
                self.name
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "orchestrator '{}' not ready after {}ms",
                self.name,
                timeout.as_millis()
            ))),
        }
    }

    async fn execute(&self, operation_id: &str, operation: &str, params: Value) -> Result<Value> {
        let engine = self.engines.get(operation_id).ok_or_else(|| {
            Error::Config(format!(
                "orchestrator '{}' has no engine for operation id '{}'",
                self.name, operation_id
            ))
        })?;
        debug!(orchestrator = %self.name, operation_id = %operation_id, operation = %operation, "Running engine");
        engine.run(params).await
    }
}

/// One `execute_operation` call, kept in a bounded log.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationHistoryEntry {
    pub call_id: u64,
    pub agent: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Unset while the call is still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorCounters {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStatistics {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Calls rejected before reaching an engine.
    pub rejected: u64,
    pub mean_latency_ms: f64,
    pub by_orchestrator: BTreeMap<String, OrchestratorCounters>,
    pub in_flight: usize,
}

#[derive(Default)]
struct DispatchState {
    history: VecDeque<ActivationHistoryEntry>,
    stats: DispatchStatistics,
}

impl DispatchState {
    fn entry_mut(&mut self, call_id: u64) -> Option<&mut ActivationHistoryEntry> {
        self.history.iter_mut().rev().find(|e| e.call_id == call_id)
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    registry: AgentRegistry,
    bus: Option<MessageBus>,
    orchestrators: RwLock<HashMap<String, Arc<dyn Orchestrator>>>,
    state: Mutex<DispatchState>,
    in_flight: AtomicUsize,
    next_call: AtomicU64,
}

/// Marks the dispatcher busy for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Single entry point for running a named operation on a registered agent.
#[derive(Clone)]
pub struct UnifiedDispatcher {
    inner: Arc<DispatcherInner>,
}

impl UnifiedDispatcher {
    pub fn new(config: DispatcherConfig, registry: AgentRegistry) -> Self {
        Self::build(config, registry, None)
    }

    /// Dispatcher that publishes settled operations on `config.notify_topic`.
    pub fn with_bus(config: DispatcherConfig, registry: AgentRegistry, bus: MessageBus) -> Self {
        Self::build(config, registry, Some(bus))
    }

    fn build(config: DispatcherConfig, registry: AgentRegistry, bus: Option<MessageBus>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                registry,
                bus,
                orchestrators: RwLock::new(HashMap::new()),
                state: Mutex::new(DispatchState::default()),
                in_flight: AtomicUsize::new(0),
                next_call: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    /// Register under the orchestrator's own name, replacing any previous one.
    pub async fn register_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) {
        let name = orchestrator.name().to_string();
        let replaced = self
            .inner
            .orchestrators
            .write()
            .await
            .insert(name.clone(), orchestrator)
            .is_some();
        info!(orchestrator = %name, replaced, "Orchestrator registered");
    }

    pub async fn orchestrators(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.orchestrators.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_active(&self) -> bool {
        self.inner.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Run `operation` on `agent_name` through its orchestrator.
    ///
    /// Lookup, routing and readiness failures come back as `NotFound`,
    /// `Config` and `Timeout`. Engine failures are recorded against the
    /// agent and surface as `Error::Operation`.
    pub async fn execute_operation(
        &self,
        agent_name: &str,
        operation: &str,
        params: Value,
    ) -> Result<Value> {
        let _in_flight = InFlight::enter(&self.inner.in_flight);
        let call_id = self.inner.next_call.fetch_add(1, Ordering::SeqCst);
        let started_at = Utc::now();
        self.open_entry(call_id, agent_name, operation, started_at).await;

        let (orchestrator, operation_id) = match self.route(agent_name).await {
            Ok(route) => route,
            Err(e) => {
                self.reject(call_id, &e).await;
                return Err(e);
            }
        };
        let orchestrator_name = orchestrator.name().to_string();

        if let Err(e) = orchestrator
            .wait_ready(self.inner.config.readiness_timeout())
            .await
        {
            warn!(agent = %agent_name, orchestrator = %orchestrator_name, error = %e, "Orchestrator not ready");
            self.reject(call_id, &e).await;
            return Err(e);
        }

        let registry = &self.inner.registry;
        if let Err(e) = registry
            .update_agent_status(agent_name, AgentStatus::Busy, None)
            .await
        {
            self.reject(call_id, &e).await;
            return Err(e);
        }
        debug!(call_id, agent = %agent_name, operation = %operation, orchestrator = %orchestrator_name, "Executing operation");

        let timer = tokio::time::Instant::now();
        let outcome = orchestrator.execute(&operation_id, operation, params).await;
        let duration_ms = timer.elapsed().as_millis() as u64;

        self.settle(call_id, &orchestrator_name, duration_ms, outcome.as_ref().err())
            .await;

        match outcome {
            Ok(result) => {
                if let Err(e) = registry
                    .record_execution(agent_name, operation, duration_ms, true, Some(&result))
                    .await
                {
                    warn!(call_id, agent = %agent_name, error = %e, "Failed to record execution");
                }
                if let Err(e) = registry
                    .update_agent_status(agent_name, AgentStatus::Available, None)
                    .await
                {
                    warn!(call_id, agent = %agent_name, error = %e, "Failed to update agent status");
                }
                info!(call_id, agent = %agent_name, operation = %operation, duration_ms, "Operation completed");
                self.notify(agent_name, operation, duration_ms, None).await;
                Ok(result)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(e) = registry
                    .record_execution(
                        agent_name,
                        operation,
                        duration_ms,
                        false,
                        Some(&Value::String(message.clone())),
                    )
                    .await
                {
                    warn!(call_id, agent = %agent_name, error = %e, "Failed to record execution");
                }
                let mut metadata = Map::new();
                metadata.insert("last_error".to_string(), json!(message));
                metadata.insert("last_error_at".to_string(), json!(Utc::now()));
                if let Err(e) = registry
                    .update_agent_status(agent_name, AgentStatus::Error, Some(metadata))
                    .await
                {
                    warn!(call_id, agent = %agent_name, error = %e, "Failed to update agent status");
                }
                warn!(call_id, agent = %agent_name, operation = %operation, duration_ms, error = %message, "Operation failed");
                self.notify(agent_name, operation, duration_ms, Some(&message)).await;
                Err(Error::operation(agent_name, operation, message))
            }
        }
    }

    async fn route(&self, agent_name: &str) -> Result<(Arc<dyn Orchestrator>, String)> {
        let agent = self
            .inner
            .registry
            .get_agent(agent_name)
            .await
            .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent_name)))?;

        let orchestrator = self
            .inner
            .orchestrators
            .read()
            .await
            .get(&agent.orchestrator)
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!(
                    "agent '{}' names unknown orchestrator '{}'",
                    agent_name, agent.orchestrator
                ))
            })?;

        let operation_id = orchestrator.operation_for(agent_name).ok_or_else(|| {
            Error::Config(format!(
                "orchestrator '{}' has no operation mapped for agent '{}'",
                agent.orchestrator, agent_name
            ))
        })?;
        Ok((orchestrator, operation_id))
    }

    async fn open_entry(&self, call_id: u64, agent: &str, operation: &str, started_at: DateTime<Utc>) {
        let mut state = self.inner.state.lock().await;
        state.history.push_back(ActivationHistoryEntry {
            call_id,
            agent: agent.to_string(),
            operation: operation.to_string(),
            orchestrator: None,
            started_at,
            duration_ms: None,
            success: None,
            error: None,
        });
        while state.history.len() > self.inner.config.activation_history_capacity {
            state.history.pop_front();
        }
    }

    async fn reject(&self, call_id: u64, error: &Error) {
        let mut state = self.inner.state.lock().await;
        state.stats.rejected += 1;
        if let Some(entry) = state.entry_mut(call_id) {
            entry.success = Some(false);
            entry.error = Some(error.to_string());
        }
    }

    async fn settle(&self, call_id: u64, orchestrator: &str, duration_ms: u64, error: Option<&Error>) {
        let mut state = self.inner.state.lock().await;
        let success = error.is_none();

        let stats = &mut state.stats;
        stats.total += 1;
        if success {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
        stats.mean_latency_ms += (duration_ms as f64 - stats.mean_latency_ms) / stats.total as f64;
        let counters = stats.by_orchestrator.entry(orchestrator.to_string()).or_default();
        counters.total += 1;
        if success {
            counters.succeeded += 1;
        } else {
            counters.failed += 1;
        }

        if let Some(entry) = state.entry_mut(call_id) {
            entry.orchestrator = Some(orchestrator.to_string());
            entry.duration_ms = Some(duration_ms);
            entry.success = Some(success);
            entry.error = error.map(|e| e.to_string());
        }
    }

    async fn notify(&self, agent: &str, operation: &str, duration_ms: u64, error: Option<&str>) {
        let (bus, topic) = match (&self.inner.bus, &self.inner.config.notify_topic) {
            (Some(bus), Some(topic)) => (bus, topic),
            _ => return,
        };
        let message_type = if error.is_some() {
            "operation.failed"
        } else {
            "operation.completed"
        };
        let payload = json!({
            "agent": agent,
            "operation": operation,
            "duration_ms": duration_ms,
            "error": error,
        });
        if let Err(e) = bus
            .publish_message(DISPATCHER_SENDER, topic, message_type, payload)
            .await
        {
            warn!(topic = %topic, error = %e, "Failed to publish operation notification");
        }
    }

    pub async fn statistics(&self) -> DispatchStatistics {
        let mut stats = self.inner.state.lock().await.stats.clone();
        stats.in_flight = self.inner.in_flight.load(Ordering::SeqCst);
        stats
    }

    pub async fn activation_history(&self) -> Vec<ActivationHistoryEntry> {
        self.inner.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn export_state(&self) -> Value {
        json!({
            "active": self.is_active(),
            "orchestrators": self.orchestrators().await,
            "statistics": self.statistics().await,
            "history": self.activation_history().await,
        })
    }
}

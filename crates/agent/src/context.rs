use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{Config, DeactivationReason, Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activation::{ActivationHook, ActivationManager, EventHandler};
use crate::bus::MessageBus;
use crate::dispatcher::UnifiedDispatcher;
use crate::health::HealthMonitor;
use crate::registry::AgentRegistry;

/// Where an event routed through the dispatcher ends up.
#[derive(Debug, Clone)]
pub struct EventRoute {
    pub agent_type: String,
    pub operation_type: String,
    /// Registered agent that runs the operation.
    pub agent: String,
    pub operation: String,
}

impl EventRoute {
    pub fn new(agent_type: &str, operation_type: &str, agent: &str, operation: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            operation_type: operation_type.to_string(),
            agent: agent.to_string(),
            operation: operation.to_string(),
        }
    }
}

type SharedDispatch = Shared<BoxFuture<'static, std::result::Result<Value, Arc<Error>>>>;

/// Event handler that activates the routed agent type, dispatches the
/// operation with the event data as params, then releases the activation
/// whatever the outcome.
///
/// Callers coalesced onto one activation share a single dispatch and its
/// result; the activation is released once, after that dispatch settles.
pub struct DispatchEventHandler {
    dispatcher: UnifiedDispatcher,
    route: Arc<EventRoute>,
    in_flight: Arc<Mutex<HashMap<String, SharedDispatch>>>,
}

impl DispatchEventHandler {
    pub fn new(dispatcher: UnifiedDispatcher, route: EventRoute) -> Self {
        Self {
            dispatcher,
            route: Arc::new(route),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs on its own task so the activation is released even if every
    /// caller goes away.
    fn spawn_dispatch(&self, manager: &ActivationManager, activation_id: &str, data: Value) -> SharedDispatch {
        let dispatcher = self.dispatcher.clone();
        let route = self.route.clone();
        let manager = manager.clone();
        let in_flight = self.in_flight.clone();
        let activation_id = activation_id.to_string();

        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.execute_operation(&route.agent, &route.operation, data))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Other(format!("operation '{}' panicked", route.operation))));

            // Release before forgetting the dispatch, so a caller still holding
            // this activation joins the settled result instead of dispatching again.
            if let Err(e) = manager
                .deactivate(&activation_id, DeactivationReason::Released)
                .await
            {
                warn!(activation_id = %activation_id, error = %e, "Failed to release activation");
            }
            in_flight.lock().await.remove(&activation_id);

            outcome.map(|result| {
                json!({
                    "activation_id": activation_id,
                    "agent": route.agent,
                    "operation": route.operation,
                    "result": result,
                })
            })
        });
        async move {
            match handle.await {
                Ok(outcome) => outcome.map_err(Arc::new),
                Err(e) => Err(Arc::new(Error::Other(format!("dispatch task failed: {}", e)))),
            }
        }
        .boxed()
        .shared()
    }
}

#[async_trait]
impl EventHandler for DispatchEventHandler {
    async fn handle(
        &self,
        manager: &ActivationManager,
        event_type: &str,
        data: &Value,
    ) -> Result<Value> {
        let route = &self.route;
        let activation = manager
            .activate_agent(&route.agent_type, &route.operation_type, data.clone())
            .await?;

        let pending = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&activation.id) {
                Some(fut) => {
                    debug!(event_type = %event_type, activation_id = %activation.id, "Joined in-flight dispatch");
                    fut.clone()
                }
                None => {
                    debug!(
                        event_type = %event_type,
                        activation_id = %activation.id,
                        agent = %route.agent,
                        "Dispatching event"
                    );
                    let fut = self.spawn_dispatch(manager, &activation.id, data.clone());
                    in_flight.insert(activation.id.clone(), fut.clone());
                    fut
                }
            }
        };
        pending.await.map_err(Error::Shared)
    }
}

struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

pub struct CoordinationContextBuilder {
    config: Config,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    routes: Vec<(String, EventRoute)>,
    hook: Option<Arc<dyn ActivationHook>>,
}

impl CoordinationContextBuilder {
    pub fn on_event(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    /// Handle `event_type` with a [`DispatchEventHandler`] for `route`.
    pub fn dispatch_event(mut self, event_type: &str, route: EventRoute) -> Self {
        self.routes.push((event_type.to_string(), route));
        self
    }

    pub fn with_activation_hook(mut self, hook: Arc<dyn ActivationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Fails with `Error::Config` when the configuration does not validate.
    pub fn build(self) -> Result<CoordinationContext> {
        let config = self.config;
        config.validate()?;
        let bus = MessageBus::new(config.bus.clone());
        let registry = AgentRegistry::new(config.registry.clone());
        let dispatcher =
            UnifiedDispatcher::with_bus(config.dispatcher.clone(), registry.clone(), bus.clone());

        let mut activation = ActivationManager::builder(config.activation.clone());
        for (event_type, handler) in self.handlers {
            activation = activation.on_event(&event_type, handler);
        }
        for (event_type, route) in self.routes {
            let handler = DispatchEventHandler::new(dispatcher.clone(), route);
            activation = activation.on_event(&event_type, Arc::new(handler));
        }
        if let Some(hook) = self.hook {
            activation = activation.with_hook(hook);
        }

        Ok(CoordinationContext {
            config,
            bus,
            registry,
            activation: activation.build(),
            dispatcher,
            monitor: Mutex::new(None),
        })
    }
}

/// Owns the bus, registry, activation manager and dispatcher for one
/// process, plus the background health monitor.
pub struct CoordinationContext {
    config: Config,
    bus: MessageBus,
    registry: AgentRegistry,
    activation: ActivationManager,
    dispatcher: UnifiedDispatcher,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl CoordinationContext {
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> CoordinationContextBuilder {
        CoordinationContextBuilder {
            config,
            handlers: HashMap::new(),
            routes: Vec::new(),
            hook: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn activation(&self) -> &ActivationManager {
        &self.activation
    }

    pub fn dispatcher(&self) -> &UnifiedDispatcher {
        &self.dispatcher
    }

    /// Spawn the health monitor. No-op when already running.
    pub async fn start(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            debug!("Coordination context already started");
            return;
        }
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let health = Arc::new(HealthMonitor::new(
            self.registry.clone(),
            self.config.registry.health_check_interval(),
        ));
        let task = tokio::spawn(health.run_loop(shutdown_rx));
        *monitor = Some(MonitorHandle { shutdown, task });
        info!("Coordination context started");
    }

    /// Stop the health monitor and wait for it to exit. No-op when stopped.
    pub async fn stop(&self) {
        let handle = self.monitor.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.shutdown.send(());
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
        info!("Coordination context stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Full diagnostic snapshot of every component.
    pub async fn export_state(&self) -> Value {
        let history_limit = self.config.bus.history_capacity;
        json!({
            "exported_at": Utc::now(),
            "running": self.is_running().await,
            "config": self.config,
            "bus": self.bus.export_state(history_limit).await,
            "registry": self.registry.export_state().await,
            "activation": self.activation.export_state().await,
            "dispatcher": self.dispatcher.export_state().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{engine_fn, EngineOrchestrator};
    use conductor_core::{AgentHealth, AgentInfo, EventStatus};
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn context_with_audit(fail: bool) -> CoordinationContext {
        let context = CoordinationContext::builder(Config::default())
            .dispatch_event(
                "site.created",
                EventRoute::new("audit", "initial_audit", "site-auditor", "initial_audit"),
            )
            .build()
            .unwrap();
        context
            .registry()
            .register_agent("site-auditor", AgentInfo::new("audit", "audit"))
            .await;
        let engine = engine_fn(move |params: Value| async move {
            if fail {
                return Err(Error::Other("site unreachable".to_string()));
            }
            Ok(json!({ "site": params["site"], "score": 91 }))
        });
        let orchestrator = Arc::new(
            EngineOrchestrator::new("audit")
                .map_agent("site-auditor", "seo_audit")
                .with_engine("seo_audit", engine),
        );
        orchestrator.set_ready(true);
        context.dispatcher().register_orchestrator(orchestrator).await;
        context
    }

    #[tokio::test]
    async fn test_event_activates_dispatches_and_releases() {
        let context = context_with_audit(false).await;
        let outcome = context
            .activation()
            .trigger_event("site.created", json!({ "site": "example.org" }))
            .await
            .unwrap();
        assert_eq!(outcome.status, EventStatus::Completed);
        let result = outcome.result.unwrap();
        assert_eq!(result["result"]["score"], 91);

        let activation_id = result["activation_id"].as_str().unwrap();
        let activation = context.activation().activation(activation_id).await.unwrap();
        assert_eq!(activation.deactivation_reason, Some(DeactivationReason::Released));
        assert!(context.activation().active_activations().await.is_empty());

        let agent = context.registry().get_agent("site-auditor").await.unwrap();
        assert_eq!(agent.execution_count, 1);
    }

    #[tokio::test]
    async fn test_failed_dispatch_still_releases() {
        let context = context_with_audit(true).await;
        let err = context
            .activation()
            .trigger_event("site.created", json!({ "site": "example.org" }))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::Operation { .. }));
        assert!(context.activation().active_activations().await.is_empty());
        assert_eq!(context.activation().statistics().await.deactivated, 1);
        assert_eq!(context.activation().event_history().await[0].status, EventStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_events_share_one_dispatch() {
        let context = CoordinationContext::builder(Config::default())
            .dispatch_event(
                "site.created",
                EventRoute::new("audit", "initial_audit", "site-auditor", "initial_audit"),
            )
            .build()
            .unwrap();
        context
            .registry()
            .register_agent("site-auditor", AgentInfo::new("audit", "audit"))
            .await;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let engine = engine_fn(move |params: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!({ "site": params["site"], "score": 88 }))
            }
        });
        let orchestrator = Arc::new(
            EngineOrchestrator::new("audit")
                .map_agent("site-auditor", "seo_audit")
                .with_engine("seo_audit", engine),
        );
        orchestrator.set_ready(true);
        context.dispatcher().register_orchestrator(orchestrator).await;

        let events = (0..3).map(|_| {
            context
                .activation()
                .trigger_event("site.created", json!({ "site": "example.org" }))
        });
        let outcomes: Vec<_> = join_all(events)
            .await
            .into_iter()
            .map(|o| o.unwrap())
            .collect();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let agent = context.registry().get_agent("site-auditor").await.unwrap();
        assert_eq!(agent.execution_count, 1);
        assert_eq!(context.dispatcher().statistics().await.total, 1);

        let ids: Vec<&str> = outcomes
            .iter()
            .map(|o| {
                assert_eq!(o.status, EventStatus::Completed);
                o.result.as_ref().unwrap()["activation_id"].as_str().unwrap()
            })
            .collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(outcomes[2].result.as_ref().unwrap()["result"]["score"], 88);

        let activation = context.activation().activation(ids[0]).await.unwrap();
        assert_eq!(activation.deactivation_reason, Some(DeactivationReason::Released));
        let stats = context.activation().statistics().await;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.deactivated, 1);
        assert!(context.activation().active_activations().await.is_empty());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = Config::default();
        config.registry.health_check_interval_secs = 0;
        let err = CoordinationContext::builder(config).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let mut config = Config::default();
        config.bus.inbox_capacity = 0;
        assert!(CoordinationContext::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let context = CoordinationContext::new(Config::default()).unwrap();
        assert!(!context.is_running().await);
        context.start().await;
        context.start().await;
        assert!(context.is_running().await);
        context.stop().await;
        context.stop().await;
        assert!(!context.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_scores_agents() {
        let context = CoordinationContext::new(Config::default()).unwrap();
        context
            .registry()
            .register_agent("flaky", AgentInfo::new("audit", "audit"))
            .await;
        for i in 0..10 {
            context
                .registry()
                .record_execution("flaky", "scan", 1, i < 3, None)
                .await
                .unwrap();
        }
        context.start().await;
        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        let agent = context.registry().get_agent("flaky").await.unwrap();
        assert_eq!(agent.health, AgentHealth::Unhealthy);
        context.stop().await;
    }

    #[tokio::test]
    async fn test_export_state_covers_every_component() {
        let context = context_with_audit(false).await;
        context
            .activation()
            .trigger_event("site.created", json!({ "site": "a.example" }))
            .await
            .unwrap();
        let state = context.export_state().await;
        for key in ["bus", "registry", "activation", "dispatcher", "config"] {
            assert!(state.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(state["dispatcher"]["statistics"]["succeeded"], 1);
        assert_eq!(state["registry"]["statistics"]["total_agents"], 1);
        assert_eq!(state["running"], false);
    }
}

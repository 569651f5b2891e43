use async_trait::async_trait;
use chrono::Utc;
use conductor_core::{
    lock_key, Activation, ActivationConfig, DeactivationReason, Error, EventRecord, EventStatus,
    Result,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::panic::AssertUnwindSafe;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Reacts to a named event. Gets the manager so it can activate and
/// release agents itself.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        manager: &ActivationManager,
        event_type: &str,
        data: &Value,
    ) -> Result<Value>;
}

/// Runs once per new activation, before any caller sees it. Coalesced
/// callers share the hook's outcome.
#[async_trait]
pub trait ActivationHook: Send + Sync {
    async fn on_activate(&self, activation: &Activation) -> Result<()>;
}

type SharedActivation =
    Shared<BoxFuture<'static, std::result::Result<Activation, Arc<Error>>>>;

enum KeySlot {
    /// Activation in flight; late callers await the same future.
    Starting(SharedActivation),
    Active(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivationStatistics {
    pub created: u64,
    pub coalesced: u64,
    pub deactivated: u64,
    pub failed: u64,
    pub active: usize,
    pub events_by_status: BTreeMap<String, u64>,
    pub registered_events: Vec<String>,
}

#[derive(Default)]
struct ActivationState {
    by_key: HashMap<String, KeySlot>,
    active: HashMap<String, Activation>,
    idle_timers: HashMap<String, AbortHandle>,
    ended: VecDeque<Activation>,
    events: VecDeque<EventRecord>,
    created: u64,
    coalesced: u64,
    deactivated: u64,
    failed: u64,
    events_by_status: BTreeMap<EventStatus, u64>,
}

impl ActivationState {
    fn push_event(&mut self, record: EventRecord, capacity: usize) {
        self.events.push_back(record);
        while self.events.len() > capacity {
            self.events.pop_front();
        }
    }

    fn settle_event(&mut self, id: &str, status: EventStatus, error: Option<String>) {
        *self.events_by_status.entry(status).or_default() += 1;
        if let Some(record) = self.events.iter_mut().rev().find(|r| r.id == id) {
            record.status = status;
            record.completed_at = Some(Utc::now());
            record.error = error;
        }
    }
}

struct ActivationInner {
    config: ActivationConfig,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    hook: Option<Arc<dyn ActivationHook>>,
    state: Mutex<ActivationState>,
}

pub struct ActivationManagerBuilder {
    config: ActivationConfig,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    hook: Option<Arc<dyn ActivationHook>>,
}

impl ActivationManagerBuilder {
    pub fn on_event(mut self, event_type: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ActivationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> ActivationManager {
        ActivationManager {
            inner: Arc::new(ActivationInner {
                config: self.config,
                handlers: self.handlers,
                hook: self.hook,
                state: Mutex::new(ActivationState::default()),
            }),
        }
    }
}

/// Event-driven activation of logical agents.
///
/// An activation is bookkeeping only: it marks an agent type engaged for an
/// operation type under the lock key `"{agent_type}:{operation_type}"`.
/// Concurrent requests for the same key coalesce onto one activation, which
/// ends after the agent type's idle delay or when released explicitly.
#[derive(Clone)]
pub struct ActivationManager {
    inner: Arc<ActivationInner>,
}

impl ActivationManager {
    pub fn new(config: ActivationConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ActivationConfig) -> ActivationManagerBuilder {
        ActivationManagerBuilder {
            config,
            handlers: HashMap::new(),
            hook: None,
        }
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.inner.config
    }

    pub fn registered_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.inner.handlers.keys().cloned().collect();
        events.sort();
        events
    }

    /// Run the handler registered for `event_type`. Events without a handler
    /// are recorded as `no_handler` and are not an error.
    pub async fn trigger_event(&self, event_type: &str, data: Value) -> Result<EventOutcome> {
        let event_id = uuid::Uuid::new_v4().to_string();
        let capacity = self.inner.config.event_history_capacity;
        let handler = self.inner.handlers.get(event_type).cloned();

        {
            let mut state = self.inner.state.lock().await;
            state.push_event(
                EventRecord {
                    id: event_id.clone(),
                    event_type: event_type.to_string(),
                    status: EventStatus::Processing,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                },
                capacity,
            );
            if handler.is_none() {
                state.settle_event(&event_id, EventStatus::NoHandler, None);
            }
        }

        let handler = match handler {
            Some(h) => h,
            None => {
                info!(event_type = %event_type, "No handler registered for event");
                return Ok(EventOutcome {
                    event_id,
                    status: EventStatus::NoHandler,
                    result: None,
                });
            }
        };

        debug!(event_id = %event_id, event_type = %event_type, "Processing event");
        let outcome = handler.handle(self, event_type, &data).await;

        let mut state = self.inner.state.lock().await;
        match outcome {
            Ok(result) => {
                state.settle_event(&event_id, EventStatus::Completed, None);
                Ok(EventOutcome {
                    event_id,
                    status: EventStatus::Completed,
                    result: Some(result),
                })
            }
            Err(e) => {
                state.settle_event(&event_id, EventStatus::Failed, Some(e.to_string()));
                warn!(event_id = %event_id, event_type = %event_type, error = %e, "Event handler failed");
                Err(e)
            }
        }
    }

    /// Activate `agent_type` for `operation_type`, or join the activation
    /// already holding that lock key.
    pub async fn activate_agent(
        &self,
        agent_type: &str,
        operation_type: &str,
        event_data: Value,
    ) -> Result<Activation> {
        let key = lock_key(agent_type, operation_type);
        let pending = {
            let mut state = self.inner.state.lock().await;
            let existing = match state.by_key.get(&key) {
                Some(KeySlot::Active(id)) => state.active.get(id).cloned().map(Ok),
                Some(KeySlot::Starting(fut)) => Some(Err(fut.clone())),
                None => None,
            };
            match existing {
                Some(Ok(activation)) => {
                    state.coalesced += 1;
                    debug!(lock_key = %key, activation_id = %activation.id, "Joined active activation");
                    return Ok(activation);
                }
                Some(Err(fut)) => {
                    state.coalesced += 1;
                    debug!(lock_key = %key, "Joined in-flight activation");
                    fut
                }
                None => {
                    let activation = Activation::new(agent_type, operation_type, event_data);
                    let fut = self.spawn_activation(activation);
                    state.by_key.insert(key.clone(), KeySlot::Starting(fut.clone()));
                    fut
                }
            }
        };
        pending.await.map_err(Error::Shared)
    }

    /// The activation runs on its own task so that it completes even if
    /// every caller awaiting it goes away.
    fn spawn_activation(&self, activation: Activation) -> SharedActivation {
        let manager = self.clone();
        let key = activation.lock_key.clone();
        let handle = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start_activation(activation).await }
        });
        async move {
            match handle.await {
                Ok(outcome) => outcome.map_err(Arc::new),
                Err(e) => {
                    let e = Error::Other(format!("activation task failed: {}", e));
                    manager.abandon_start(&key, &e).await;
                    Err(Arc::new(e))
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn start_activation(&self, activation: Activation) -> Result<Activation> {
        if let Some(hook) = &self.inner.hook {
            let outcome = AssertUnwindSafe(hook.on_activate(&activation))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Other("activation hook panicked".to_string())));
            if let Err(e) = outcome {
                self.abandon_start(&activation.lock_key, &e).await;
                return Err(e);
            }
        }

        let delay = self.inner.config.idle_delay_for(&activation.agent_type);
        let mut state = self.inner.state.lock().await;
        state.by_key.insert(
            activation.lock_key.clone(),
            KeySlot::Active(activation.id.clone()),
        );
        state.active.insert(activation.id.clone(), activation.clone());
        state.created += 1;

        // Spawned only once the activation is visible, so a zero delay cannot miss it.
        let manager = self.clone();
        let id = activation.id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(true) = manager.deactivate(&id, DeactivationReason::IdleTimeout).await {
                debug!(activation_id = %id, "Activation went idle");
            }
        });
        state.idle_timers.insert(activation.id.clone(), timer.abort_handle());
        info!(
            activation_id = %activation.id,
            lock_key = %activation.lock_key,
            idle_delay_ms = delay.as_millis() as u64,
            "Agent activated"
        );
        Ok(activation)
    }

    /// Free a lock key whose activation never came up, so the next caller
    /// starts over instead of joining the failed attempt.
    async fn abandon_start(&self, key: &str, error: &Error) {
        let mut state = self.inner.state.lock().await;
        if matches!(state.by_key.get(key), Some(KeySlot::Starting(_))) {
            state.by_key.remove(key);
            state.failed += 1;
            warn!(lock_key = %key, error = %error, "Activation failed to start");
        }
    }

    /// End an activation. Returns false when it had already ended; the lock
    /// key is released only while it still belongs to this activation.
    pub async fn deactivate(&self, activation_id: &str, reason: DeactivationReason) -> Result<bool> {
        let mut state = self.inner.state.lock().await;
        let mut activation = match state.active.remove(activation_id) {
            Some(a) => a,
            None => {
                if state.ended.iter().any(|a| a.id == activation_id) {
                    return Ok(false);
                }
                return Err(Error::NotFound(format!("activation '{}'", activation_id)));
            }
        };

        activation.deactivate(reason);
        let owns_key = matches!(
            state.by_key.get(&activation.lock_key),
            Some(KeySlot::Active(id)) if id == activation_id
        );
        if owns_key {
            state.by_key.remove(&activation.lock_key);
        }
        if let Some(timer) = state.idle_timers.remove(activation_id) {
            // The idle timer is the caller in that case and must run to completion.
            if reason != DeactivationReason::IdleTimeout {
                timer.abort();
            }
        }
        state.deactivated += 1;
        info!(
            activation_id = %activation_id,
            lock_key = %activation.lock_key,
            reason = ?reason,
            "Agent deactivated"
        );

        state.ended.push_back(activation);
        while state.ended.len() > self.inner.config.event_history_capacity {
            state.ended.pop_front();
        }
        Ok(true)
    }

    pub async fn activation(&self, activation_id: &str) -> Option<Activation> {
        let state = self.inner.state.lock().await;
        state
            .active
            .get(activation_id)
            .or_else(|| state.ended.iter().find(|a| a.id == activation_id))
            .cloned()
    }

    pub async fn active_activations(&self) -> Vec<Activation> {
        let state = self.inner.state.lock().await;
        let mut active: Vec<Activation> = state.active.values().cloned().collect();
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    pub async fn event_history(&self) -> Vec<EventRecord> {
        self.inner.state.lock().await.events.iter().cloned().collect()
    }

    pub async fn statistics(&self) -> ActivationStatistics {
        let state = self.inner.state.lock().await;
        ActivationStatistics {
            created: state.created,
            coalesced: state.coalesced,
            deactivated: state.deactivated,
            failed: state.failed,
            active: state.active.len(),
            events_by_status: state
                .events_by_status
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            registered_events: self.registered_events(),
        }
    }

    pub async fn export_state(&self) -> Value {
        let statistics = self.statistics().await;
        let active = self.active_activations().await;
        let state = self.inner.state.lock().await;
        json!({
            "statistics": statistics,
            "active": active,
            "recently_ended": state.ended.iter().collect::<Vec<_>>(),
            "events": state.events.iter().collect::<Vec<_>>(),
        })
    }
}

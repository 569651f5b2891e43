use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conductor_core::{
    BusConfig, Coordination, CoordinationStatus, DeliveryStatus, Error, Message, MessageId,
    MessageKind, Result, SendOptions,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

/// Reserved topic that `broadcast_message` publishes to.
pub const BROADCAST_TOPIC: &str = "__all_agents__";

/// Sender name used for system notifications.
pub const SYSTEM_SENDER: &str = "system";

const MAX_COORDINATIONS: usize = 100;

/// Receives messages on behalf of an agent.
///
/// For a message with `requires_response`, returning `Ok(Some(payload))`
/// answers it and returning `Err` rejects the waiting sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Option<Value>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    async fn handle(&self, message: &Message) -> Result<Option<Value>> {
        (self.0)(message.clone()).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Predicate deciding whether a published message reaches a subscriber.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct Subscription {
    pub agent: String,
    pub topic: String,
    pub subscribed_at: DateTime<Utc>,
    handler: Option<Arc<dyn MessageHandler>>,
    filter: Option<MessageFilter>,
}

impl Subscription {
    fn accepts(&self, message: &Message) -> bool {
        self.filter.as_ref().map_or(true, |f| f(message))
    }
}

/// What `send_message` hands back once the send settled.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// The response, for sends that required one.
    pub response: Option<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub topic: String,
    pub message_type: String,
    /// (recipient, message id) for every successful delivery.
    pub delivered: Vec<(String, MessageId)>,
    /// Subscribers whose filter rejected the message.
    pub filtered: usize,
}

impl PublishReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinationResult {
    pub coordination_id: String,
    pub responses: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStatistics {
    pub messages_by_kind: BTreeMap<String, u64>,
    pub delivered: u64,
    pub failed: u64,
    pub responses_timed_out: u64,
    pub late_responses: u64,
    pub inboxes: usize,
    pub topics: usize,
    pub subscriptions: usize,
    pub pending_responses: usize,
    pub history_len: usize,
    pub coordinations_by_status: BTreeMap<String, u64>,
}

struct PendingResponse {
    /// The agent that sent the original request.
    requester: String,
    tx: oneshot::Sender<Result<Message>>,
}

#[derive(Default)]
struct BusState {
    inboxes: HashMap<String, VecDeque<Message>>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    topics: HashMap<String, HashMap<String, Subscription>>,
    history: VecDeque<Message>,
    pending: HashMap<MessageId, PendingResponse>,
    coordinations: HashMap<String, Coordination>,
    coordination_order: VecDeque<String>,
    messages_by_kind: BTreeMap<MessageKind, u64>,
    delivered: u64,
    failed: u64,
    responses_timed_out: u64,
    late_responses: u64,
}

impl BusState {
    fn record(&mut self, message: &Message, capacity: usize) {
        *self.messages_by_kind.entry(message.kind).or_default() += 1;
        match message.status {
            DeliveryStatus::Delivered => self.delivered += 1,
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Pending => {}
        }
        self.history.push_back(message.clone());
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// Append to the recipient inbox (created on first use) and log it.
    fn deliver(&mut self, message: &mut Message, config: &BusConfig) {
        message.settle(DeliveryStatus::Delivered);
        let inbox = self.inboxes.entry(message.to.clone()).or_default();
        inbox.push_back(message.clone());
        while inbox.len() > config.inbox_capacity {
            inbox.pop_front();
        }
        self.record(message, config.history_capacity);
    }

    fn fail(&mut self, message: &mut Message, config: &BusConfig) {
        message.settle(DeliveryStatus::Failed);
        self.record(message, config.history_capacity);
    }

    fn is_known(&self, agent: &str) -> bool {
        self.inboxes.contains_key(agent) || self.handlers.contains_key(agent)
    }

    fn store_coordination(&mut self, coordination: Coordination) {
        self.coordination_order.push_back(coordination.id.clone());
        self.coordinations.insert(coordination.id.clone(), coordination);
        while self.coordination_order.len() > MAX_COORDINATIONS {
            if let Some(old) = self.coordination_order.pop_front() {
                self.coordinations.remove(&old);
            }
        }
    }
}

struct BusInner {
    config: BusConfig,
    next_id: AtomicU64,
    state: Mutex<BusState>,
}

/// In-process message bus: direct messages, pub/sub, broadcast,
/// request/response and coordination fan-out.
///
/// Cloning is cheap and every clone talks to the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                next_id: AtomicU64::new(1),
                state: Mutex::new(BusState::default()),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    fn next_id(&self) -> MessageId {
        MessageId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register the handler invoked for direct, system and coordination
    /// messages addressed to `agent`. Replaces any previous handler.
    pub async fn register_handler(&self, agent: &str, handler: Arc<dyn MessageHandler>) {
        let mut state = self.inner.state.lock().await;
        state.inboxes.entry(agent.to_string()).or_default();
        state.handlers.insert(agent.to_string(), handler);
        debug!(agent = %agent, "Registered direct message handler");
    }

    pub async fn unregister_handler(&self, agent: &str) -> bool {
        self.inner.state.lock().await.handlers.remove(agent).is_some()
    }

    /// Deliver a direct message. With `opts.requires_response` this resolves
    /// only once the recipient answers, or fails with `Error::Timeout`.
    pub async fn send_message(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
        opts: SendOptions,
    ) -> Result<SendReceipt> {
        self.send_internal(MessageKind::Direct, from, to, message_type, payload, opts, None)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_internal(
        &self,
        kind: MessageKind,
        from: &str,
        to: &str,
        message_type: &str,
        payload: Value,
        opts: SendOptions,
        coordination_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let id = self.next_id();
        let mut message = Message::new(id, kind, message_type, from, to, payload);
        if let Some(cid) = coordination_id {
            message = message.with_coordination(cid);
        }
        let timeout = opts.timeout.unwrap_or_else(|| self.inner.config.response_timeout());
        message.requires_response = opts.requires_response;
        if opts.requires_response {
            message.timeout_ms = Some(timeout.as_millis() as u64);
        }

        let mut waiter = None;
        let handler = {
            let mut state = self.inner.state.lock().await;
            if opts.requires_response {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(
                    id,
                    PendingResponse {
                        requester: from.to_string(),
                        tx,
                    },
                );
                waiter = Some(rx);
            }
            state.deliver(&mut message, &self.inner.config);
            state.handlers.get(to).cloned()
        };
        debug!(id = %id, kind = %kind, from = %from, to = %to, message_type = %message_type, "Message delivered");

        if let Some(handler) = handler {
            self.spawn_handler(handler, message);
        }

        let response = match waiter {
            Some(rx) => Some(self.await_response(id, to, rx, timeout).await?),
            None => None,
        };
        Ok(SendReceipt {
            message_id: id,
            response,
        })
    }

    /// Wait for the response to `id`. The timeout and the response race;
    /// whichever removes the pending entry first decides the outcome.
    async fn await_response(
        &self,
        id: MessageId,
        to: &str,
        mut rx: oneshot::Receiver<Result<Message>>,
        timeout: Duration,
    ) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Delivery(format!(
                "response channel for {} closed",
                id
            ))),
            Err(_) => {
                let removed = {
                    let mut state = self.inner.state.lock().await;
                    let removed = state.pending.remove(&id).is_some();
                    if removed {
                        state.responses_timed_out += 1;
                    }
                    removed
                };
                if removed {
                    warn!(id = %id, to = %to, timeout_ms = timeout.as_millis() as u64, "Response timed out");
                    return Err(Error::Timeout(format!(
                        "no response from '{}' to {} within {}ms",
                        to,
                        id,
                        timeout.as_millis()
                    )));
                }
                // A response settled between the timer firing and us taking the lock.
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Delivery(format!(
                        "response channel for {} closed",
                        id
                    ))),
                }
            }
        }
    }

    fn spawn_handler(&self, handler: Arc<dyn MessageHandler>, message: Message) {
        let bus = self.clone();
        tokio::spawn(async move {
            match handler.handle(&message).await {
                Ok(Some(reply)) if message.requires_response => {
                    if let Err(e) = bus.send_response(message.id, &message.to, reply).await {
                        warn!(id = %message.id, error = %e, "Failed to deliver handler response");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        id = %message.id,
                        agent = %message.to,
                        error = %e,
                        "Message handler failed"
                    );
                    if message.requires_response {
                        bus.settle_pending(message.id, Err(e)).await;
                    }
                }
            }
        });
    }

    /// Remove and resolve the waiter for `id`. False when it already settled.
    async fn settle_pending(&self, id: MessageId, outcome: Result<Message>) -> bool {
        let pending = self.inner.state.lock().await.pending.remove(&id);
        match pending {
            Some(p) => {
                // The receiver may be gone if the sender was cancelled; nothing to do then.
                let _ = p.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Answer message `original_id`. The response lands in the original
    /// sender's inbox and resolves its waiter if one is still pending.
    pub async fn send_response(
        &self,
        original_id: MessageId,
        from: &str,
        payload: Value,
    ) -> Result<MessageId> {
        let (response, waiter) = {
            let mut state = self.inner.state.lock().await;
            let requester = match state.pending.get(&original_id) {
                Some(p) => Some(p.requester.clone()),
                None => state
                    .history
                    .iter()
                    .find(|m| m.id == original_id)
                    .map(|m| m.from.clone()),
            };
            let requester = requester
                .ok_or_else(|| Error::NotFound(format!("message {} is unknown", original_id)))?;

            let mut response = Message::new(
                self.next_id(),
                MessageKind::Response,
                "response",
                from,
                &requester,
                payload,
            )
            .in_reply_to(original_id);
            state.deliver(&mut response, &self.inner.config);

            let waiter = state.pending.remove(&original_id);
            if waiter.is_none() {
                state.late_responses += 1;
            }
            (response, waiter)
        };

        match waiter {
            Some(p) => {
                let _ = p.tx.send(Ok(response.clone()));
            }
            None => debug!(original = %original_id, "No waiter for response, dropping"),
        }
        Ok(response.id)
    }

    pub async fn subscribe(
        &self,
        agent: &str,
        topic: &str,
        handler: Option<Arc<dyn MessageHandler>>,
        filter: Option<MessageFilter>,
    ) {
        let mut state = self.inner.state.lock().await;
        state.inboxes.entry(agent.to_string()).or_default();
        state.topics.entry(topic.to_string()).or_default().insert(
            agent.to_string(),
            Subscription {
                agent: agent.to_string(),
                topic: topic.to_string(),
                subscribed_at: Utc::now(),
                handler,
                filter,
            },
        );
        debug!(agent = %agent, topic = %topic, "Subscribed");
    }

    pub async fn unsubscribe(&self, agent: &str, topic: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let subscribers = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::NotFound(format!("topic '{}'", topic)))?;
        if subscribers.remove(agent).is_none() {
            return Err(Error::NotFound(format!(
                "subscription of '{}' to topic '{}'",
                agent, topic
            )));
        }
        if subscribers.is_empty() {
            state.topics.remove(topic);
            debug!(topic = %topic, "Pruned empty topic");
        }
        Ok(())
    }

    pub async fn subscribers(&self, topic: &str) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut agents: Vec<String> = state
            .topics
            .get(topic)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        agents.sort();
        agents
    }

    /// Fan a message out to every subscriber of `topic` except the publisher.
    /// Fails as a whole if any single delivery fails.
    pub async fn publish_message(
        &self,
        from: &str,
        topic: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<PublishReport> {
        self.publish_internal(MessageKind::Publish, from, topic, message_type, payload)
            .await
    }

    pub async fn broadcast_message(
        &self,
        from: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<PublishReport> {
        self.publish_internal(MessageKind::Broadcast, from, BROADCAST_TOPIC, message_type, payload)
            .await
    }

    async fn publish_internal(
        &self,
        kind: MessageKind,
        from: &str,
        topic: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<PublishReport> {
        let subscribers: Vec<Subscription> = {
            let state = self.inner.state.lock().await;
            state
                .topics
                .get(topic)
                .map(|subs| subs.values().filter(|s| s.agent != from).cloned().collect())
                .unwrap_or_default()
        };

        let mut report = PublishReport {
            topic: topic.to_string(),
            message_type: message_type.to_string(),
            delivered: Vec::new(),
            filtered: 0,
        };
        if subscribers.is_empty() {
            debug!(topic = %topic, "Publish with no subscribers");
            return Ok(report);
        }

        let mut deliveries = Vec::with_capacity(subscribers.len());
        for sub in subscribers {
            let message = Message::new(self.next_id(), kind, message_type, from, &sub.agent, payload.clone())
                .with_topic(topic);
            if !sub.accepts(&message) {
                report.filtered += 1;
                continue;
            }
            deliveries.push(self.deliver_to_subscriber(sub, message));
        }

        let total = deliveries.len();
        let mut failures = Vec::new();
        for (agent, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(id) => report.delivered.push((agent, id)),
                Err(e) => failures.push(format!("{}: {}", agent, e)),
            }
        }

        if !failures.is_empty() {
            warn!(topic = %topic, failed = failures.len(), total, "Publish failed");
            return Err(Error::Delivery(format!(
                "{} of {} deliveries on topic '{}' failed: {}",
                failures.len(),
                total,
                topic,
                failures.join("; ")
            )));
        }
        debug!(topic = %topic, delivered = report.delivered.len(), "Published");
        Ok(report)
    }

    /// A subscriber delivery succeeds once its handler (if any) accepted the
    /// message; only then does it land in the inbox.
    async fn deliver_to_subscriber(
        &self,
        sub: Subscription,
        mut message: Message,
    ) -> (String, Result<MessageId>) {
        let handled = match &sub.handler {
            Some(handler) => handler.handle(&message).await.map(|_| ()),
            None => Ok(()),
        };
        let mut state = self.inner.state.lock().await;
        match handled {
            Ok(()) => {
                state.deliver(&mut message, &self.inner.config);
                (sub.agent, Ok(message.id))
            }
            Err(e) => {
                state.fail(&mut message, &self.inner.config);
                (sub.agent, Err(e))
            }
        }
    }

    /// Deliver a system message to `targets`, or to every agent with an inbox.
    pub async fn send_system_notification(
        &self,
        message_type: &str,
        payload: Value,
        targets: Option<&[String]>,
    ) -> Result<Vec<MessageId>> {
        let targets: Vec<String> = match targets {
            Some(t) => t.to_vec(),
            None => {
                let state = self.inner.state.lock().await;
                let mut all: Vec<String> = state.inboxes.keys().cloned().collect();
                all.sort();
                all
            }
        };

        let sends = targets.iter().map(|target| {
            self.send_internal(
                MessageKind::System,
                SYSTEM_SENDER,
                target,
                message_type,
                payload.clone(),
                SendOptions::default(),
                None,
            )
        });
        let mut ids = Vec::with_capacity(targets.len());
        for outcome in join_all(sends).await {
            ids.push(outcome?.message_id);
        }
        info!(message_type = %message_type, recipients = ids.len(), "System notification sent");
        Ok(ids)
    }

    /// Ask every participant for a response in parallel and collect them.
    /// One failing or silent participant fails the whole coordination.
    pub async fn request_coordination(
        &self,
        coordinator: &str,
        participants: &[String],
        operation_type: &str,
        data: Value,
    ) -> Result<CoordinationResult> {
        let coordination = Coordination::new(coordinator, operation_type, participants);
        let coordination_id = coordination.id.clone();
        {
            let mut state = self.inner.state.lock().await;
            if let Some(unknown) = participants.iter().find(|p| !state.is_known(p)) {
                return Err(Error::NotFound(format!(
                    "coordination participant '{}'",
                    unknown
                )));
            }
            state.store_coordination(coordination);
        }
        info!(
            coordination_id = %coordination_id,
            coordinator = %coordinator,
            participants = participants.len(),
            operation_type = %operation_type,
            "Coordination requested"
        );

        let requests = participants.iter().map(|participant| {
            let payload = json!({
                "coordination_id": coordination_id,
                "coordinator": coordinator,
                "operation_type": operation_type,
                "data": data,
            });
            let cid = coordination_id.clone();
            async move {
                let outcome = self
                    .send_internal(
                        MessageKind::CoordinationRequest,
                        coordinator,
                        participant,
                        operation_type,
                        payload,
                        SendOptions::request(),
                        Some(&cid),
                    )
                    .await;
                (participant.clone(), outcome)
            }
        });
        let results = join_all(requests).await;

        let mut responses = BTreeMap::new();
        let mut first_error: Option<(String, Error)> = None;
        for (participant, outcome) in results {
            match outcome {
                Ok(receipt) => {
                    let payload = receipt.response.map(|r| r.payload).unwrap_or(Value::Null);
                    responses.insert(participant, payload);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some((participant, e));
                    }
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        let record = state.coordinations.get_mut(&coordination_id);
        match first_error {
            Some((participant, e)) => {
                if let Some(record) = record {
                    for (p, v) in &responses {
                        record.responses.insert(p.clone(), Some(v.clone()));
                    }
                    record.finish(
                        CoordinationStatus::Failed,
                        Some(format!("participant '{}': {}", participant, e)),
                    );
                }
                warn!(
                    coordination_id = %coordination_id,
                    participant = %participant,
                    error = %e,
                    "Coordination failed"
                );
                Err(e)
            }
            None => {
                if let Some(record) = record {
                    for (p, v) in &responses {
                        record.responses.insert(p.clone(), Some(v.clone()));
                    }
                    record.finish(CoordinationStatus::Coordinated, None);
                }
                info!(coordination_id = %coordination_id, "Coordination completed");
                Ok(CoordinationResult {
                    coordination_id,
                    responses,
                })
            }
        }
    }

    pub async fn coordination(&self, id: &str) -> Option<Coordination> {
        self.inner.state.lock().await.coordinations.get(id).cloned()
    }

    /// Snapshot of an agent's inbox, oldest first.
    pub async fn inbox(&self, agent: &str) -> Vec<Message> {
        let state = self.inner.state.lock().await;
        state
            .inboxes
            .get(agent)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Take every message out of an agent's inbox, oldest first.
    pub async fn drain_inbox(&self, agent: &str) -> Vec<Message> {
        let mut state = self.inner.state.lock().await;
        state
            .inboxes
            .get_mut(agent)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// The most recent `limit` entries of the global history, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<Message> {
        let state = self.inner.state.lock().await;
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub async fn statistics(&self) -> BusStatistics {
        let state = self.inner.state.lock().await;
        let mut coordinations_by_status = BTreeMap::new();
        for c in state.coordinations.values() {
            let key = match c.status {
                CoordinationStatus::Requesting => "requesting",
                CoordinationStatus::Coordinated => "coordinated",
                CoordinationStatus::Failed => "failed",
            };
            *coordinations_by_status.entry(key.to_string()).or_default() += 1;
        }
        BusStatistics {
            messages_by_kind: state
                .messages_by_kind
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            delivered: state.delivered,
            failed: state.failed,
            responses_timed_out: state.responses_timed_out,
            late_responses: state.late_responses,
            inboxes: state.inboxes.len(),
            topics: state.topics.len(),
            subscriptions: state.topics.values().map(|s| s.len()).sum(),
            pending_responses: state.pending.len(),
            history_len: state.history.len(),
            coordinations_by_status,
        }
    }

    pub async fn export_state(&self, history_limit: usize) -> Value {
        let statistics = self.statistics().await;
        let history = self.history(history_limit).await;
        let state = self.inner.state.lock().await;
        let inboxes: BTreeMap<&String, usize> =
            state.inboxes.iter().map(|(k, v)| (k, v.len())).collect();
        let topics: BTreeMap<&String, Vec<&String>> = state
            .topics
            .iter()
            .map(|(topic, subs)| {
                let mut agents: Vec<&String> = subs.keys().collect();
                agents.sort();
                (topic, agents)
            })
            .collect();
        let coordinations: Vec<&Coordination> = state
            .coordination_order
            .iter()
            .filter_map(|id| state.coordinations.get(id))
            .collect();
        json!({
            "statistics": statistics,
            "inboxes": inboxes,
            "topics": topics,
            "coordinations": coordinations,
            "history": history,
        })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> MessageBus {
        MessageBus::new(BusConfig::default())
    }

    fn responder(reply: Value) -> Arc<dyn MessageHandler> {
        handler_fn(move |_msg| {
            let reply = reply.clone();
            async move { Ok(Some(reply)) }
        })
    }

    #[tokio::test]
    async fn test_inbox_preserves_send_order() {
        let bus = bus();
        for i in 0..20 {
            bus.send_message("a", "b", "seq", json!({ "n": i }), SendOptions::default())
                .await
                .unwrap();
        }
        let inbox = bus.inbox("b").await;
        let order: Vec<i64> = inbox.iter().map(|m| m.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(order, (0..20).collect::<Vec<i64>>());
        assert!(inbox.windows(2).all(|w| w[0].id < w[1].id));
        assert!(inbox.iter().all(|m| m.status == DeliveryStatus::Delivered));
        assert_eq!(inbox[0].recipient(), conductor_core::Recipient::Agent("b".to_string()));

        let drained = bus.drain_inbox("b").await;
        assert_eq!(drained.len(), 20);
        assert_eq!(drained[0].payload["n"], 0);
        assert!(bus.inbox("b").await.is_empty());
        assert!(bus.drain_inbox("nobody").await.is_empty());
    }

    #[tokio::test]
    async fn test_inbox_evicts_oldest() {
        let bus = MessageBus::new(BusConfig {
            inbox_capacity: 3,
            ..BusConfig::default()
        });
        for i in 0..5 {
            bus.send_message("a", "b", "seq", json!(i), SendOptions::default())
                .await
                .unwrap();
        }
        let payloads: Vec<Value> = bus.inbox("b").await.into_iter().map(|m| m.payload).collect();
        assert_eq!(payloads, vec![json!(2), json!(3), json!(4)]);
        assert_eq!(bus.statistics().await.history_len, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let bus = bus();
        let started = tokio::time::Instant::now();
        let err = bus
            .send_message(
                "a",
                "b",
                "ping",
                json!({}),
                SendOptions::request().with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(100));

        let stats = bus.statistics().await;
        assert_eq!(stats.pending_responses, 0);
        assert_eq!(stats.responses_timed_out, 1);
    }

    #[tokio::test]
    async fn test_handler_reply_resolves_request() {
        let bus = bus();
        bus.register_handler("b", responder(json!({ "pong": true }))).await;
        let receipt = bus
            .send_message("a", "b", "ping", json!({}), SendOptions::request())
            .await
            .unwrap();
        let response = receipt.response.unwrap();
        assert_eq!(response.kind, MessageKind::Response);
        assert_eq!(response.in_reply_to, Some(receipt.message_id));
        assert_eq!(response.payload["pong"], true);
        // The response also lands in the requester's inbox
        assert_eq!(bus.inbox("a").await.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_rejects_request() {
        let bus = bus();
        bus.register_handler(
            "b",
            handler_fn(|_msg| async { Err(Error::Other("cannot comply".to_string())) }),
        )
        .await;
        let err = bus
            .send_message("a", "b", "ping", json!({}), SendOptions::request())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot comply");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_handler_stops_answering() {
        let bus = bus();
        bus.register_handler("b", responder(json!("pong"))).await;
        assert!(bus.unregister_handler("b").await);
        assert!(!bus.unregister_handler("b").await);

        let err = bus
            .send_message(
                "a",
                "b",
                "ping",
                json!({}),
                SendOptions::request().with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // Without a handler the request still reaches the inbox
        assert_eq!(bus.inbox("b").await.len(), 1);
    }

    #[tokio::test]
    async fn test_manual_response_from_another_task() {
        let bus = bus();
        let sender = bus.clone();
        let request = tokio::spawn(async move {
            sender
                .send_message("a", "b", "ping", json!({}), SendOptions::request())
                .await
        });
        // Wait until the request is sitting in b's inbox
        let original = loop {
            if let Some(m) = bus.inbox("b").await.first().cloned() {
                break m;
            }
            tokio::task::yield_now().await;
        };
        bus.send_response(original.id, "b", json!("pong")).await.unwrap();
        let receipt = request.await.unwrap().unwrap();
        assert_eq!(receipt.response.unwrap().payload, json!("pong"));
    }

    #[tokio::test]
    async fn test_response_to_unknown_message_is_not_found() {
        let bus = bus();
        let err = bus.send_response(MessageId(999), "b", json!({})).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_is_dropped() {
        let bus = bus();
        let err = bus
            .send_message(
                "a",
                "b",
                "ping",
                json!({}),
                SendOptions::request().with_timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let original = bus.inbox("b").await[0].clone();
        // Delivered, but nobody is waiting any more
        bus.send_response(original.id, "b", json!("too late")).await.unwrap();
        let stats = bus.statistics().await;
        assert_eq!(stats.late_responses, 1);
        assert_eq!(stats.pending_responses, 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = bus();
        let report = bus
            .publish_message("a", "nobody-listens", "news", json!({}))
            .await
            .unwrap();
        assert_eq!(report.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_skips_publisher_and_applies_filter() {
        let bus = bus();
        bus.subscribe("a", "reports", None, None).await;
        bus.subscribe("b", "reports", None, None).await;
        let only_urgent: MessageFilter = Arc::new(|m: &Message| m.payload["urgent"] == true);
        bus.subscribe("c", "reports", None, Some(only_urgent)).await;

        let report = bus
            .publish_message("a", "reports", "report.ready", json!({ "urgent": false }))
            .await
            .unwrap();
        assert_eq!(report.delivered_count(), 1);
        assert_eq!(report.delivered[0].0, "b");
        assert_eq!(report.filtered, 1);
        assert!(bus.inbox("a").await.is_empty());
        assert_eq!(bus.inbox("b").await[0].topic.as_deref(), Some("reports"));
        assert_eq!(
            bus.inbox("b").await[0].recipient(),
            conductor_core::Recipient::Topic("reports".to_string())
        );
    }

    #[tokio::test]
    async fn test_publish_fails_when_one_subscriber_fails() {
        let bus = bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.subscribe(
            "good",
            "jobs",
            Some(handler_fn(move |_m| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })),
            None,
        )
        .await;
        bus.subscribe(
            "bad",
            "jobs",
            Some(handler_fn(|_m| async { Err(Error::Other("boom".to_string())) })),
            None,
        )
        .await;

        let err = bus.publish_message("x", "jobs", "job", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Delivery(_)));
        // The healthy subscriber still got its copy
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.inbox("good").await.len(), 1);
        assert!(bus.inbox("bad").await.is_empty());
        assert_eq!(bus.statistics().await.failed, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_prunes_empty_topic() {
        let bus = bus();
        bus.subscribe("a", "t", None, None).await;
        assert_eq!(bus.statistics().await.topics, 1);
        bus.unsubscribe("a", "t").await.unwrap();
        assert_eq!(bus.statistics().await.topics, 0);
        assert!(bus.unsubscribe("a", "t").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_agents_topic() {
        let bus = bus();
        bus.subscribe("a", BROADCAST_TOPIC, None, None).await;
        bus.subscribe("b", BROADCAST_TOPIC, None, None).await;
        let report = bus.broadcast_message("a", "maintenance", json!({})).await.unwrap();
        assert_eq!(report.delivered_count(), 1);
        assert_eq!(bus.inbox("b").await[0].kind, MessageKind::Broadcast);
    }

    #[tokio::test]
    async fn test_system_notification_defaults_to_every_inbox() {
        let bus = bus();
        bus.send_message("x", "a", "hello", json!({}), SendOptions::default()).await.unwrap();
        bus.subscribe("b", "t", None, None).await;

        let ids = bus.send_system_notification("shutdown", json!({}), None).await.unwrap();
        assert_eq!(ids.len(), 2);
        let a_last = bus.inbox("a").await.pop().unwrap();
        assert_eq!(a_last.kind, MessageKind::System);
        assert_eq!(a_last.from, SYSTEM_SENDER);

        let targets = vec!["c".to_string()];
        bus.send_system_notification("hi", json!({}), Some(&targets)).await.unwrap();
        assert_eq!(bus.inbox("c").await.len(), 1);
    }

    #[tokio::test]
    async fn test_coordination_collects_every_response() {
        let bus = bus();
        bus.register_handler("p1", responder(json!("ok-1"))).await;
        bus.register_handler("p2", responder(json!("ok-2"))).await;
        bus.register_handler("p3", responder(json!("ok-3"))).await;
        let participants: Vec<String> = vec!["p1".into(), "p2".into(), "p3".into()];

        let result = bus
            .request_coordination("lead", &participants, "sync", json!({ "k": 1 }))
            .await
            .unwrap();
        assert_eq!(result.responses.len(), 3);
        assert_eq!(result.responses["p2"], json!("ok-2"));
        let record = bus.coordination(&result.coordination_id).await.unwrap();
        assert_eq!(record.status, CoordinationStatus::Coordinated);
        assert!(record.responses.values().all(|v| v.is_some()));
    }

    #[tokio::test]
    async fn test_coordination_fails_when_one_participant_fails() {
        let bus = bus();
        bus.register_handler("p1", responder(json!("ok"))).await;
        bus.register_handler(
            "p2",
            handler_fn(|_m| async { Err(Error::Other("refused".to_string())) }),
        )
        .await;
        let participants: Vec<String> = vec!["p1".into(), "p2".into()];

        let err = bus
            .request_coordination("lead", &participants, "sync", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "refused");
        let stats = bus.statistics().await;
        assert_eq!(stats.coordinations_by_status.get("failed"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordination_fails_on_silent_participant() {
        let bus = MessageBus::new(BusConfig {
            response_timeout_ms: 25,
            ..BusConfig::default()
        });
        bus.register_handler("p1", responder(json!("ok"))).await;
        // p2 has an inbox but never answers
        bus.send_message("x", "p2", "hello", json!({}), SendOptions::default()).await.unwrap();
        let participants: Vec<String> = vec!["p1".into(), "p2".into()];

        let err = bus
            .request_coordination("lead", &participants, "sync", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_coordination_rejects_unknown_participant() {
        let bus = bus();
        let participants: Vec<String> = vec!["ghost".into()];
        let err = bus
            .request_coordination("lead", &participants, "sync", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}

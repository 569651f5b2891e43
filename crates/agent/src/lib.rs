pub mod activation;
pub mod bus;
pub mod context;
pub mod dispatcher;
pub mod health;
pub mod registry;

pub use activation::{
    ActivationHook, ActivationManager, ActivationManagerBuilder, ActivationStatistics,
    EventHandler, EventOutcome,
};
pub use bus::{
    handler_fn, BusStatistics, CoordinationResult, MessageBus, MessageFilter, MessageHandler,
    PublishReport, SendReceipt, BROADCAST_TOPIC, SYSTEM_SENDER,
};
pub use context::{CoordinationContext, CoordinationContextBuilder, DispatchEventHandler, EventRoute};
pub use dispatcher::{
    engine_fn, ActivationHistoryEntry, DispatchStatistics, DomainEngine, EngineOrchestrator,
    Orchestrator, UnifiedDispatcher, DISPATCHER_SENDER,
};
pub use health::{HealthAssessment, HealthChecker, HealthMonitor};
pub use registry::{AgentQuery, AgentRegistry, HealthReport, RegistryStatistics};

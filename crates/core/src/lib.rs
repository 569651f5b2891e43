pub mod agent;
pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use agent::{Agent, AgentHealth, AgentInfo, AgentStatus, ExecutionRecord};
pub use config::{ActivationConfig, BusConfig, Config, DispatcherConfig, RegistryConfig};
pub use error::{Error, Result};
pub use message::{DeliveryStatus, Message, MessageId, MessageKind, Recipient, SendOptions};
pub use paths::Paths;
pub use types::{
    lock_key, summarize, Activation, ActivationStatus, Coordination, CoordinationStatus,
    DeactivationReason, EventRecord, EventStatus,
};

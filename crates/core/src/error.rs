use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A failure surfaced from a domain engine, annotated with where it ran.
    #[error("Operation '{operation}' on agent '{agent}' failed: {message}")]
    Operation {
        agent: String,
        operation: String,
        message: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    /// An error observed by more than one waiter (coalesced activations).
    #[error("{0}")]
    Shared(Arc<Error>),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn operation(agent: &str, operation: &str, message: impl std::fmt::Display) -> Self {
        Error::Operation {
            agent: agent.to_string(),
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Look through `Shared` wrappers to the error that actually happened.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout(_))
    }

    /// Short machine-friendly tag, used in statistics and exported state.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::Delivery(_) => "delivery",
            Error::Operation { .. } => "operation",
            Error::Validation(_) => "validation",
            Error::Shared(_) | Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

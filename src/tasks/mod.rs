//! # Task Management
//!
//! Background job lifecycle: submission, status tracking, progress updates,
//! cancellation, and cleanup. Jobs are dispatched through the shared broker
//! when one is reachable and fall back to in-process execution otherwise, so
//! a missing broker degrades deployment topology, not functionality.

pub mod broker;
pub mod manager;
pub mod store;
pub mod types;

pub use broker::{BrokerClient, JobMessage};
pub use manager::{JobContext, JobHandler, ProgressHandle, TaskManager};
pub use store::{MemoryTaskStore, RedisTaskStore, TaskStore};
pub use types::{TaskInfo, TaskPriority, TaskStats, TaskStatus};

use crate::resilience::CircuitBreakerError;

/// Errors surfaced by task submission, tracking, and execution.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: uuid::Uuid },

    #[error("Broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    #[error("Task store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("No handler registered for job type: {job_type}")]
    HandlerNotFound { job_type: String },

    #[error("Circuit breaker open for component: {component}")]
    CircuitOpen { component: String },

    #[error("Task serialization failed: {message}")]
    Serialization { message: String },
}

impl TaskError {
    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: error.to_string(),
        }
    }
}

impl From<::redis::RedisError> for TaskError {
    fn from(error: ::redis::RedisError) -> Self {
        Self::StoreUnavailable {
            message: error.to_string(),
        }
    }
}

impl From<CircuitBreakerError<TaskError>> for TaskError {
    fn from(error: CircuitBreakerError<TaskError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { component } => Self::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

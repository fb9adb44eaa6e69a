//! # Worker Supervision
//!
//! Manages the external worker process: launch, liveness monitoring, bounded
//! restarts, and graceful-then-forced shutdown. Shutdown is an explicit
//! operation driven by the host's lifecycle code, not process-global signal
//! handlers, so multiple supervised components compose cleanly.

pub mod consumer;
pub mod supervisor;
pub mod types;

pub use consumer::QueueConsumer;
pub use supervisor::{WorkerLaunchOptions, WorkerSupervisor};
pub use types::{WorkerInfo, WorkerSnapshot, WorkerStatus};

/// Errors surfaced by worker process management.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker failed to start: {message}")]
    StartFailure { message: String },

    #[error("Worker process died (pid {pid})")]
    Crashed { pid: u32 },

    #[error("Restart budget exhausted after {attempts} attempts")]
    RestartBudgetExhausted { attempts: u32 },

    #[error("Worker process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn start_failure(message: impl Into<String>) -> Self {
        Self::StartFailure {
            message: message.into(),
        }
    }
}

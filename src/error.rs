//! # Top-Level Error Types
//!
//! Crate-wide error type and `Result` alias. Subsystems carry their own
//! structured errors (`CacheError`, `TaskError`, `WorkerError`) and convert
//! into `CoreError` at the crate boundary.

use thiserror::Error;

use crate::cache::CacheError;
use crate::tasks::TaskError;
use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl CoreError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

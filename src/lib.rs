#![allow(clippy::doc_markdown)] // Allow technical terms like Redis, JSON in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Cardmaker Core
//!
//! Resilient background-execution subsystem for the card-maker application:
//! result caching, asynchronous task management, and worker process
//! supervision, built to degrade gracefully when the shared backend is
//! unavailable.
//!
//! ## Architecture
//!
//! Three cooperating components share one design rule: infrastructure
//! failures cost performance, never correctness.
//!
//! - [`cache`] - Content-addressed result cache with a networked backend and
//!   an in-process fallback, selected once at construction
//! - [`tasks`] - Task lifecycle management with broker dispatch and a
//!   local-execution fallback
//! - [`worker`] - Worker process supervision with bounded restarts and
//!   graceful-then-forced shutdown
//! - [`resilience`] - The circuit breaker wrapping every backend call
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging initialization
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cardmaker_core::config::CoreConfig;
//! use cardmaker_core::tasks::{MemoryTaskStore, TaskManager};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::from_env()?;
//! let cache = cardmaker_core::cache::connect(
//!     &config.backend,
//!     &config.cache,
//!     &config.circuit_breaker,
//! )
//! .await;
//!
//! let manager = TaskManager::new(Arc::new(MemoryTaskStore::new()), None, config.tasks);
//! let task_id = manager
//!     .create_task("pdf_generation", Default::default())
//!     .await?;
//! let status = manager.get_status(task_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;
pub mod tasks;
pub mod worker;

pub use cache::{CacheEntry, CacheError, CacheKey, CacheStats, JobParams, ResultCache};
pub use config::CoreConfig;
pub use error::{CoreError, Result};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use tasks::{TaskError, TaskInfo, TaskManager, TaskStatus};
pub use worker::{WorkerError, WorkerLaunchOptions, WorkerStatus, WorkerSupervisor};

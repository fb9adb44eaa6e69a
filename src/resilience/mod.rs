//! # Resilience Module
//!
//! Circuit breaker fault isolation for operations against the shared
//! cache/broker backend. Prevents cascade failures by failing fast while a
//! dependency is struggling and periodically probing for recovery.

pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    CircuitState,
};

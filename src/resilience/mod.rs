//! Resilience primitives
//!
//! - `circuit_breaker` -- per-server fail-fast guard
//! - `retry`           -- backoff strategies and a retrying combinator
//!
//! Neither knows about the other. The client manager composes them around
//! each tool call.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitPermit, CircuitSnapshot,
    CircuitState,
};
pub use retry::{RetryConfig, RetryOutcome, RetryPolicies, RetryPolicy, RetryStrategy};

//! Resilience primitives wrapping upstream peer calls and summarizing
//! shard health: a three-state circuit breaker and a periodic health
//! monitor.

mod circuit_breaker;
mod health;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use health::{HealthDetails, HealthMonitor, HealthSnapshot, HealthSource, HEALTH_CHECK_INTERVAL};

pub mod breaker;
pub mod client;
pub mod config;
pub mod conversions;
pub mod error;
pub mod http;
pub mod memory;
pub mod rate_limit;

pub use client::{BatchCheckResult, HealthStatus, PolicyClient};
pub use config::{CircuitBreakerOptions, ClientOptions, RateLimitOptions, RetryPolicy};
pub use error::ClientError;
pub use http::{HttpEngineOptions, HttpPolicyEngine};
pub use memory::InMemoryPolicyEngine;

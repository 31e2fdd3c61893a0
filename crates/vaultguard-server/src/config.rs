use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use vaultguard_client::{
    CircuitBreakerOptions, ClientOptions, HttpEngineOptions, RateLimitOptions, RetryPolicy,
};

use crate::audit::AuditLevel;
use crate::cache::{CacheConfig, MAX_TTL};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub cache: CacheSection,
    pub audit: AuditConfig,
    pub concurrency: ConcurrencyConfig,
    pub health_check: HealthCheckConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub database: DatabaseConfig,
    pub log: LogConfig,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub endpoint: String,
    pub store_id: String,
    pub model_id: Option<String>,
    pub api_token: Option<String>,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl fmt::Debug for PolicyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyConfig")
            .field("endpoint", &self.endpoint)
            .field("store_id", &self.store_id)
            .field("model_id", &self.model_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout_ms", &self.timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_size: usize,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub level: AuditLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL for audit and plan-override storage. In-memory stores
    /// are used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            store_id: "vaultguard".to_string(),
            model_id: None,
            api_token: None,
            timeout_ms: 5_000,
            connect_timeout_ms: 2_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_size: 10_000,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: AuditLevel::Standard,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_requests: 100,
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_ms: 2_000,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 100.0,
            burst: 200,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            timeout_ms: 30_000,
            reset_timeout_ms: 60_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::Validation(msg.to_string())
}

impl AppConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VAULTGUARD_POLICY_ENDPOINT") {
            self.policy.endpoint = v;
        }
        if let Ok(v) = std::env::var("VAULTGUARD_POLICY_STORE_ID") {
            self.policy.store_id = v;
        }
        if let Ok(v) = std::env::var("VAULTGUARD_POLICY_MODEL_ID") {
            self.policy.model_id = Some(v);
        }
        if let Ok(v) = std::env::var("VAULTGUARD_POLICY_API_TOKEN") {
            self.policy.api_token = Some(v);
        }
        if let Some(n) = env_parse("VAULTGUARD_POLICY_TIMEOUT_MS") {
            self.policy.timeout_ms = n;
        }
        if let Some(n) = env_parse("VAULTGUARD_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = n;
        }
        if let Some(b) = env_parse("VAULTGUARD_CACHE_ENABLED") {
            self.cache.enabled = b;
        }
        if let Some(n) = env_parse("VAULTGUARD_CACHE_TTL_SECS") {
            self.cache.ttl_secs = n;
        }
        if let Some(n) = env_parse("VAULTGUARD_CACHE_MAX_SIZE") {
            self.cache.max_size = n;
        }
        if let Some(b) = env_parse("VAULTGUARD_AUDIT_ENABLED") {
            self.audit.enabled = b;
        }
        if let Some(level) = env_parse("VAULTGUARD_AUDIT_LEVEL") {
            self.audit.level = level;
        }
        if let Some(n) = env_parse("VAULTGUARD_BATCH_SIZE") {
            self.concurrency.batch_size = n;
        }
        if let Some(n) = env_parse("VAULTGUARD_MAX_CONCURRENT_REQUESTS") {
            self.concurrency.max_concurrent_requests = n;
        }
        if let Some(b) = env_parse("VAULTGUARD_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = b;
        }
        if let Some(n) = env_parse("VAULTGUARD_RATE_LIMIT_RPS") {
            self.rate_limit.requests_per_second = n;
        }
        if let Some(b) = env_parse("VAULTGUARD_CIRCUIT_BREAKER_ENABLED") {
            self.circuit_breaker.enabled = b;
        }
        if let Ok(v) = std::env::var("VAULTGUARD_DATABASE_URL") {
            self.database.url = Some(v);
        }
        if let Some(n) = env_parse("VAULTGUARD_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("VAULTGUARD_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = std::env::var("VAULTGUARD_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = &self.policy.endpoint;
        let scheme_ok = ["http://", "https://"]
            .iter()
            .any(|scheme| endpoint.strip_prefix(scheme).is_some_and(|host| !host.is_empty()));
        if !scheme_ok {
            return Err(invalid("policy.endpoint must be an http(s):// URL"));
        }
        if self.policy.store_id.trim().is_empty() {
            return Err(invalid("policy.store_id must not be empty"));
        }
        if self.policy.timeout_ms == 0 {
            return Err(invalid("policy.timeout_ms must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry.min_backoff_ms must not exceed retry.max_backoff_ms"));
        }
        if self.concurrency.batch_size == 0 {
            return Err(invalid("concurrency.batch_size must be non-zero"));
        }
        if self.concurrency.max_concurrent_requests < self.concurrency.batch_size {
            return Err(invalid(
                "concurrency.max_concurrent_requests must be at least concurrency.batch_size",
            ));
        }
        if self.cache.enabled
            && (self.cache.ttl_secs == 0
                || self.cache.max_size == 0
                || self.cache.cleanup_interval_secs == 0)
        {
            return Err(invalid(
                "cache.ttl_secs, cache.max_size and cache.cleanup_interval_secs must be non-zero when the cache is enabled",
            ));
        }
        if self.cache.ttl_secs > MAX_TTL.as_secs() {
            return Err(ConfigError::Validation(format!(
                "cache.ttl_secs must not exceed {}",
                MAX_TTL.as_secs()
            )));
        }
        if self.health_check.enabled
            && (self.health_check.interval_secs == 0 || self.health_check.timeout_ms == 0)
        {
            return Err(invalid(
                "health_check.interval_secs and health_check.timeout_ms must be non-zero when health checks are enabled",
            ));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_second <= 0.0 || self.rate_limit.burst == 0)
        {
            return Err(invalid(
                "rate_limit.requests_per_second must be positive and rate_limit.burst at least 1",
            ));
        }
        if self.circuit_breaker.enabled
            && (self.circuit_breaker.failure_threshold == 0
                || self.circuit_breaker.timeout_ms == 0
                || self.circuit_breaker.reset_timeout_ms == 0)
        {
            return Err(invalid(
                "circuit_breaker.failure_threshold, timeout_ms and reset_timeout_ms must be non-zero when the breaker is enabled",
            ));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be non-zero"));
        }
        Ok(())
    }

    pub fn to_client_options(&self) -> ClientOptions {
        ClientOptions {
            timeout: Duration::from_millis(self.policy.timeout_ms),
            batch_size: self.concurrency.batch_size,
            max_concurrent_requests: self.concurrency.max_concurrent_requests,
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                min_backoff: Duration::from_millis(self.retry.min_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            },
            circuit_breaker: self.circuit_breaker.enabled.then(|| CircuitBreakerOptions {
                failure_threshold: self.circuit_breaker.failure_threshold,
                open_timeout: Duration::from_millis(self.circuit_breaker.timeout_ms),
                reset_timeout: Duration::from_millis(self.circuit_breaker.reset_timeout_ms),
            }),
            rate_limit: self.rate_limit.enabled.then(|| RateLimitOptions {
                requests_per_second: self.rate_limit.requests_per_second,
                burst: self.rate_limit.burst,
            }),
        }
    }

    pub fn to_engine_options(&self) -> HttpEngineOptions {
        HttpEngineOptions {
            endpoint: self.policy.endpoint.trim_end_matches('/').to_string(),
            store_id: self.policy.store_id.clone(),
            model_id: self.policy.model_id.clone(),
            api_token: self.policy.api_token.clone(),
            connect_timeout: Duration::from_millis(self.policy.connect_timeout_ms),
        }
    }

    /// `None` when the check cache is disabled.
    pub fn to_cache_config(&self) -> Option<CacheConfig> {
        self.cache.enabled.then(|| CacheConfig {
            max_size: self.cache.max_size,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            cleanup_interval: Duration::from_secs(self.cache.cleanup_interval_secs),
        })
    }

    /// Sweep period for every cache, including the plan cache, which runs
    /// even when the check cache is disabled.
    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache.cleanup_interval_secs.max(1))
    }

    pub fn audit_level(&self) -> AuditLevel {
        self.audit.level
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        self.health_check
            .enabled
            .then(|| Duration::from_secs(self.health_check.interval_secs))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check.timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

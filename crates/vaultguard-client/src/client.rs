use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use vaultguard_core::engine::{
    CheckRequest, CheckResponse, EngineError, ListObjectsRequest, validate_tuples,
};
use vaultguard_core::{PolicyEngine, Tuple};

use crate::breaker::CircuitBreaker;
use crate::config::ClientOptions;
use crate::error::ClientError;
use crate::rate_limit::RateLimiter;

const HEALTH_CHECK_USER: &str = "user:health-check";
const HEALTH_CHECK_RELATION: &str = "viewer";
const HEALTH_CHECK_OBJECT: &str = "vault:health-check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub latency: Option<Duration>,
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: true,
            last_checked: None,
            latency: None,
            last_error: None,
        }
    }
}

/// Outcome of a batch check. `results[i]` answers `requests[i]` and is `None`
/// when that check failed; `error` holds the first failure observed.
#[derive(Debug, Clone)]
pub struct BatchCheckResult {
    pub results: Vec<Option<CheckResponse>>,
    /// `errors[i]` is why `results[i]` is empty.
    pub errors: Vec<Option<ClientError>>,
    /// First failure observed across the batch, in completion order.
    pub error: Option<ClientError>,
    pub duration: Duration,
}

/// Front door to the policy engine: validation, deadlines, retries,
/// concurrency limits and health tracking around a [`PolicyEngine`].
pub struct PolicyClient<E: PolicyEngine> {
    engine: Arc<E>,
    options: Arc<ClientOptions>,
    health: Arc<RwLock<HealthStatus>>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    in_flight: Arc<Semaphore>,
}

impl<E: PolicyEngine> Clone for PolicyClient<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            options: Arc::clone(&self.options),
            health: Arc::clone(&self.health),
            breaker: self.breaker.clone(),
            limiter: self.limiter.clone(),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<E: PolicyEngine> PolicyClient<E> {
    pub fn new(engine: Arc<E>, options: ClientOptions) -> Self {
        let breaker = options
            .circuit_breaker
            .clone()
            .map(|opts| Arc::new(CircuitBreaker::new(opts)));
        let limiter = options
            .rate_limit
            .as_ref()
            .map(|opts| Arc::new(RateLimiter::new(opts)));
        let in_flight = Arc::new(Semaphore::new(options.max_concurrent_requests.max(1)));

        Self {
            engine,
            options: Arc::new(options),
            health: Arc::new(RwLock::new(HealthStatus::default())),
            breaker,
            limiter,
            in_flight,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub async fn check(
        &self,
        ctx: &CancellationToken,
        request: &CheckRequest,
    ) -> Result<CheckResponse, ClientError> {
        request.validate()?;
        let engine = &self.engine;
        self.call(ctx, "check", move || engine.check(request)).await
    }

    /// Checks every request concurrently, at most `batch_size` at a time.
    ///
    /// Individual failures do not abort the batch.
    pub async fn batch_check(
        &self,
        ctx: &CancellationToken,
        requests: &[CheckRequest],
    ) -> BatchCheckResult {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.options.batch_size.max(1)));
        let mut results: Vec<Option<CheckResponse>> = vec![None; requests.len()];
        let mut errors: Vec<Option<ClientError>> = vec![None; requests.len()];
        let mut first_error = None;
        let mut task_slots = HashMap::new();
        let mut tasks = JoinSet::new();

        for (index, request) in requests.iter().cloned().enumerate() {
            let client = self.clone();
            let ctx = ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let handle = tasks.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => client.check(&ctx, &request).await,
                    Err(_) => Err(ClientError::Internal("batch semaphore closed".to_string())),
                }
            });
            task_slots.insert(handle.id(), index);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(join_err) => (
                    join_err.id(),
                    Err(ClientError::Internal(join_err.to_string())),
                ),
            };
            let Some(&index) = task_slots.get(&id) else {
                continue;
            };
            match outcome {
                Ok(response) => results[index] = Some(response),
                Err(err) => {
                    tracing::debug!(index, error = %err, "batch check item failed");
                    first_error.get_or_insert_with(|| err.clone());
                    errors[index] = Some(err);
                }
            }
        }

        let duration = started.elapsed();
        tracing::debug!(
            total = requests.len(),
            failed = results.iter().filter(|r| r.is_none()).count(),
            duration_ms = duration.as_millis() as u64,
            "batch check completed"
        );

        BatchCheckResult {
            results,
            errors,
            error: first_error,
            duration,
        }
    }

    pub async fn list_objects(
        &self,
        ctx: &CancellationToken,
        request: &ListObjectsRequest,
    ) -> Result<Vec<String>, ClientError> {
        request.validate()?;
        let engine = &self.engine;
        self.call(ctx, "list_objects", move || engine.list_objects(request))
            .await
    }

    pub async fn write_tuples(
        &self,
        ctx: &CancellationToken,
        tuples: &[Tuple],
    ) -> Result<(), ClientError> {
        validate_tuples(tuples)?;
        let engine = &self.engine;
        self.call(ctx, "write_tuples", move || engine.write_tuples(tuples))
            .await?;
        tracing::debug!(count = tuples.len(), "tuples written");
        Ok(())
    }

    pub async fn delete_tuples(
        &self,
        ctx: &CancellationToken,
        tuples: &[Tuple],
    ) -> Result<(), ClientError> {
        validate_tuples(tuples)?;
        let engine = &self.engine;
        self.call(ctx, "delete_tuples", move || engine.delete_tuples(tuples))
            .await?;
        tracing::debug!(count = tuples.len(), "tuples deleted");
        Ok(())
    }

    /// Sends the engine a synthetic check and returns the updated status.
    pub async fn health_check(&self, ctx: &CancellationToken) -> HealthStatus {
        let synthetic = CheckRequest::new(HEALTH_CHECK_USER, HEALTH_CHECK_RELATION, HEALTH_CHECK_OBJECT);
        if let Err(err) = self.check(ctx, &synthetic).await {
            tracing::warn!(error = %err, "policy engine health check failed");
            if !err.is_remote_failure() && err != ClientError::Cancelled {
                self.mark_unhealthy(&err);
            }
        }
        self.health()
    }

    pub fn health(&self) -> HealthStatus {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.health().healthy
    }

    /// Runs [`Self::health_check`] every `interval` until `shutdown` fires.
    pub fn spawn_health_monitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = client.health_check(&shutdown).await;
                        tracing::debug!(healthy = status.healthy, "policy engine health check");
                    }
                }
            }
        })
    }

    async fn call<T, F, Fut>(
        &self,
        ctx: &CancellationToken,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if ctx.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if let Some(limiter) = &self.limiter
            && !limiter.try_acquire()
        {
            tracing::warn!(operation, "policy engine call rate limited");
            return Err(ClientError::RateLimited);
        }
        if let Some(breaker) = &self.breaker
            && !breaker.allow_request()
        {
            tracing::warn!(operation, "policy engine call refused by open circuit");
            return Err(ClientError::CircuitOpen);
        }

        let _permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ClientError::Cancelled),
            permit = self.in_flight.acquire() => permit
                .map_err(|_| ClientError::Internal("policy client is closed".to_string()))?,
        };

        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(ClientError::Cancelled),
                result = tokio::time::timeout(self.options.timeout, op()) => result,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    self.mark_healthy(started.elapsed());
                    return Ok(value);
                }
                Ok(Err(err)) if err.is_transient() && attempt < self.options.retry.max_attempts => {
                    let backoff = self.options.retry.backoff(attempt);
                    tracing::debug!(
                        operation,
                        attempt,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying policy engine call"
                    );
                    tokio::select! {
                        biased;
                        _ = ctx.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                    continue;
                }
                Ok(Err(err)) => ClientError::from(err),
                Err(_) => ClientError::Timeout,
            };

            if err.is_remote_failure() {
                self.mark_unhealthy(&err);
            }
            tracing::debug!(operation, attempt, error = %err, "policy engine call failed");
            return Err(err);
        }
    }

    fn mark_healthy(&self, latency: Duration) {
        if let Some(breaker) = &self.breaker {
            breaker.record_success();
        }
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        *health = HealthStatus {
            healthy: true,
            last_checked: Some(Utc::now()),
            latency: Some(latency),
            last_error: None,
        };
    }

    fn mark_unhealthy(&self, err: &ClientError) {
        if let Some(breaker) = &self.breaker
            && err.is_remote_failure()
        {
            breaker.record_failure();
        }
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        health.healthy = false;
        health.last_checked = Some(Utc::now());
        health.last_error = Some(err.to_string());
    }
}

//! LLM resilience wrapper with retry, backoff, and circuit breaking.

use super::{CompletionRequest, LlmClient};
use crate::{Error, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Resilience configuration for LLM calls.
#[derive(Debug, Clone)]
pub struct LlmResilienceConfig {
    /// Maximum retries for transient failures.
    pub max_retries: u32,
    /// Initial backoff between retries in milliseconds; doubles per attempt.
    pub retry_backoff_ms: u64,
    /// Consecutive failures before opening the circuit.
    pub breaker_failure_threshold: u32,
    /// How long to keep the circuit open before half-open.
    pub breaker_reset_timeout_ms: u64,
    /// Maximum trial calls while half-open.
    pub breaker_half_open_max_calls: u32,
}

impl Default for LlmResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 250,
            breaker_failure_threshold: 5,
            breaker_reset_timeout_ms: 30_000,
            breaker_half_open_max_calls: 1,
        }
    }
}

impl LlmResilienceConfig {
    /// Loads resilience configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("ENGRAM_LLM_MAX_RETRIES") {
            if let Ok(parsed) = v.parse::<u32>() {
                config.max_retries = parsed;
            }
        }
        if let Ok(v) = std::env::var("ENGRAM_LLM_RETRY_BACKOFF_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                config.retry_backoff_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("ENGRAM_LLM_BREAKER_FAILURE_THRESHOLD") {
            if let Ok(parsed) = v.parse::<u32>() {
                config.breaker_failure_threshold = parsed.max(1);
            }
        }
        if let Ok(v) = std::env::var("ENGRAM_LLM_BREAKER_RESET_MS") {
            if let Ok(parsed) = v.parse::<u64>() {
                config.breaker_reset_timeout_ms = parsed;
            }
        }
        config
    }
}

/// Circuit breaker state machine.
#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { attempts: u32 },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: BreakerState,
    failure_threshold: u32,
    reset_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    fn new(config: &LlmResilienceConfig) -> Self {
        Self {
            state: BreakerState::Closed { failures: 0 },
            failure_threshold: config.breaker_failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            half_open_max_calls: config.breaker_half_open_max_calls.max(1),
        }
    }

    fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    self.state = BreakerState::HalfOpen { attempts: 0 };
                    true
                } else {
                    false
                }
            },
            BreakerState::HalfOpen { ref mut attempts } => {
                if *attempts >= self.half_open_max_calls {
                    false
                } else {
                    *attempts += 1;
                    true
                }
            },
        }
    }

    const fn on_success(&mut self) {
        self.state = BreakerState::Closed { failures: 0 };
    }

    fn on_failure(&mut self) -> bool {
        match self.state {
            BreakerState::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    self.state = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    return true;
                }
            },
            BreakerState::HalfOpen { .. } => {
                self.state = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                return true;
            },
            BreakerState::Open { .. } => {},
        }
        false
    }
}

/// LLM client wrapper with retry, exponential backoff, and a circuit
/// breaker.
///
/// Only [`Error::Transient`] failures are retried. [`Error::OutputTooLong`]
/// passes through untouched so the retain pipeline can react by splitting
/// the chunk. Exhausted retries escalate to [`Error::OperationFailed`].
pub struct ResilientLlmClient<C: LlmClient> {
    inner: C,
    config: LlmResilienceConfig,
    breaker: Mutex<CircuitBreaker>,
}

impl<C: LlmClient> ResilientLlmClient<C> {
    /// Creates a new resilient LLM client wrapper.
    #[must_use]
    pub fn new(inner: C, config: LlmResilienceConfig) -> Self {
        let breaker = CircuitBreaker::new(&config);
        Self {
            inner,
            config,
            breaker: Mutex::new(breaker),
        }
    }

    fn allow(&self) -> bool {
        self.breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allow()
    }

    fn record_success(&self) {
        self.breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .on_success();
    }

    fn record_failure(&self, provider: &'static str, scope: &'static str) {
        let tripped = self
            .breaker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .on_failure();
        if tripped {
            metrics::counter!("llm_circuit_breaker_trips_total", "provider" => provider)
                .increment(1);
            tracing::warn!("LLM circuit breaker opened for provider={provider} scope={scope}");
        }
    }
}

impl<C: LlmClient> LlmClient for ResilientLlmClient<C> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let provider = self.inner.name();
        let scope = request.scope;
        let span = tracing::info_span!("llm.request", provider, scope);
        let _enter = span.enter();

        if !self.allow() {
            metrics::counter!(
                "llm_requests_total",
                "provider" => provider, "scope" => scope, "status" => "circuit_open"
            )
            .increment(1);
            return Err(Error::op(
                format!("llm_{scope}"),
                "circuit breaker open",
            ));
        }

        let max_attempts = self.config.max_retries + 1;
        let mut last_cause = String::new();

        for attempt in 0..max_attempts {
            let start = Instant::now();
            let result = self.inner.complete(request);
            let elapsed = start.elapsed();

            let status = match &result {
                Ok(_) => "success",
                Err(Error::OutputTooLong) => "output_too_long",
                Err(Error::Transient { .. }) => "transient",
                Err(_) => "error",
            };
            metrics::counter!(
                "llm_requests_total",
                "provider" => provider, "scope" => scope, "status" => status
            )
            .increment(1);
            metrics::histogram!(
                "llm_request_duration_ms",
                "provider" => provider, "scope" => scope
            )
            .record(elapsed.as_secs_f64() * 1000.0);

            match result {
                Ok(text) => {
                    self.record_success();
                    return Ok(text);
                },
                // The cap was reached, not a provider fault. The breaker
                // stays untouched and the caller decides how to split.
                Err(Error::OutputTooLong) => return Err(Error::OutputTooLong),
                Err(Error::Transient { cause, .. }) => {
                    self.record_failure(provider, scope);
                    last_cause = cause;
                    if attempt + 1 < max_attempts {
                        let backoff = self.config.retry_backoff_ms << attempt;
                        metrics::counter!("llm_retries_total", "provider" => provider)
                            .increment(1);
                        tracing::warn!(
                            "Retrying LLM call provider={provider} scope={scope} \
                             attempt={attempt} backoff_ms={backoff}"
                        );
                        if backoff > 0 {
                            std::thread::sleep(Duration::from_millis(backoff));
                        }
                    }
                },
                Err(err) => {
                    self.record_failure(provider, scope);
                    return Err(err);
                },
            }
        }

        Err(Error::op(
            format!("llm_{scope}"),
            format!("exhausted retries: {last_cause}"),
        ))
    }
}

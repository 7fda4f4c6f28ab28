//! Provider routing. A model id is `provider/model`; the router strips the
//! prefix, retries transient failures with backoff, keeps a circuit breaker
//! per provider, and falls over to the configured fallback model.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::provider::{LlmProvider, LlmRequest, LlmResponse};
use rlm_core::{Result, RlmError};

/// Consecutive failures that trip a provider's breaker.
const TRIP_AFTER: u32 = 5;
/// How long a tripped provider is skipped before one probe is let through.
const COOL_DOWN: Duration = Duration::from_secs(60);

/// HTTP statuses worth another attempt.
const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 529];

/// How the router retries transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Failures surface on the first attempt.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Server-provided hint wins over exponential backoff.
    fn delay_for(&self, attempt: u32, err: &RlmError) -> Duration {
        match err {
            RlmError::RateLimited { retry_after_secs } => Duration::from_secs(*retry_after_secs),
            _ => self.base_delay * 2u32.pow(attempt),
        }
    }
}

fn is_transient(err: &RlmError) -> bool {
    match err {
        RlmError::RateLimited { .. } => true,
        RlmError::Backend(msg) => {
            let status = msg
                .strip_prefix("HTTP ")
                .and_then(|rest| rest.get(..3))
                .and_then(|code| code.parse::<u16>().ok());
            status.is_some_and(|s| TRANSIENT_STATUSES.contains(&s))
                || ["timed out", "connection reset", "connection closed", "overloaded"]
                    .iter()
                    .any(|needle| msg.contains(needle))
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed { failures: u32 },
    Tripped { at: Instant },
    /// Cool-down elapsed and one probe is in flight.
    Probing,
}

impl Breaker {
    fn admit(&mut self) -> bool {
        match *self {
            Breaker::Closed { .. } => true,
            Breaker::Tripped { at } if at.elapsed() >= COOL_DOWN => {
                *self = Breaker::Probing;
                true
            }
            Breaker::Tripped { .. } | Breaker::Probing => false,
        }
    }

    /// Returns true when this failure trips the breaker.
    fn fail(&mut self) -> bool {
        let next = match *self {
            Breaker::Closed { failures } if failures + 1 < TRIP_AFTER => Breaker::Closed {
                failures: failures + 1,
            },
            Breaker::Tripped { .. } => return false,
            _ => Breaker::Tripped { at: Instant::now() },
        };
        *self = next;
        matches!(next, Breaker::Tripped { .. })
    }
}

/// Routes model requests to registered providers.
#[derive(Clone)]
pub struct ModelRouter {
    providers: Vec<Arc<dyn LlmProvider>>,
    breakers: Arc<DashMap<String, Breaker>>,
    retry: RetryPolicy,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            breakers: Arc::new(DashMap::new()),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn LlmProvider>) {
        info!(provider = provider.name(), "registered LLM provider");
        self.breakers
            .entry(provider.name().to_string())
            .or_insert(Breaker::Closed { failures: 0 });
        self.providers.push(provider);
    }

    /// Names of registered providers, in registration order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Find the provider for `model` and the name that provider knows it by.
    /// Qualified ids (`openai/gpt-4o`) match on the prefix; bare ids match a
    /// provider's advertised model list.
    pub fn resolve(&self, model: &str) -> Option<(Arc<dyn LlmProvider>, String)> {
        let by_prefix = model.split_once('/').and_then(|(prefix, name)| {
            self.providers
                .iter()
                .find(|p| p.name().eq_ignore_ascii_case(prefix))
                .map(|p| (Arc::clone(p), name.to_string()))
        });
        by_prefix.or_else(|| {
            self.providers
                .iter()
                .find(|p| p.models().iter().any(|m| m == model))
                .map(|p| (Arc::clone(p), model.to_string()))
        })
    }

    /// Complete `request` on its own model, then on `fallback_model` if the
    /// first choice failed or is tripped.
    pub async fn complete(
        &self,
        request: &LlmRequest,
        fallback_model: Option<&str>,
    ) -> Result<LlmResponse> {
        let primary = match self.resolve(&request.model) {
            Some(target) => self.attempt(target, request).await,
            None => Err(RlmError::ModelNotFound(request.model.clone())),
        };
        let primary_err = match primary {
            Ok(resp) => return Ok(resp),
            Err(e) => e,
        };

        let Some(target) = fallback_model.and_then(|m| self.resolve(m)) else {
            return Err(primary_err);
        };
        warn!(
            model = %request.model,
            fallback = fallback_model.unwrap_or_default(),
            error = %primary_err,
            "primary model failed, trying fallback"
        );
        self.attempt(target, request).await
    }

    async fn attempt(
        &self,
        (provider, model_name): (Arc<dyn LlmProvider>, String),
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let name = provider.name().to_string();
        if !self.admit(&name) {
            return Err(RlmError::Backend(format!(
                "provider '{name}' is temporarily disabled"
            )));
        }

        let mut req = request.clone();
        req.model = model_name;
        let result = self.with_retry(&*provider, &req).await;

        if let Some(mut breaker) = self.breakers.get_mut(&name) {
            match result {
                Ok(_) => *breaker = Breaker::Closed { failures: 0 },
                Err(_) => {
                    if breaker.fail() {
                        warn!(
                            provider = %name,
                            cool_down_secs = COOL_DOWN.as_secs(),
                            "circuit breaker tripped"
                        );
                    }
                }
            }
        }
        result
    }

    fn admit(&self, provider: &str) -> bool {
        self.breakers
            .get_mut(provider)
            .map(|mut b| b.admit())
            .unwrap_or(true)
    }

    async fn with_retry(
        &self,
        provider: &dyn LlmProvider,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let mut attempt = 0;
        loop {
            let err = match provider.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };
            if attempt >= self.retry.max_retries || !is_transient(&err) {
                return Err(err);
            }
            let delay = self.retry.delay_for(attempt, &err);
            warn!(
                provider = provider.name(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider error, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

//! The single capability the engine uses to reach a model.
//!
//! `Gateway::send` is the whole contract: a prompt, a model id and an optional
//! timeout in, completion text out. [`RouterGateway`] implements it on top of
//! the provider router and owns the only shared mutable accounting in a call
//! tree: the per-model rate limiter, the global in-flight limit and the usage
//! counters.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::provider::{LlmRequest, LlmResponse, Usage};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::router::ModelRouter;
use rlm_core::{Message, Result, RlmError};

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a single prompt to `model_id` and return the completion text.
    async fn send(&self, prompt: &str, model_id: &str, timeout: Option<Duration>)
    -> Result<String>;

    /// Send a multi-turn conversation. Backends without native chat support
    /// receive the conversation flattened into one prompt.
    async fn send_conversation(
        &self,
        system: Option<&str>,
        messages: &[Message],
        model_id: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let prompt = render_conversation(system, messages);
        self.send(&prompt, model_id, timeout).await
    }
}

/// Flatten a conversation into a single role-prefixed prompt.
pub fn render_conversation(system: Option<&str>, messages: &[Message]) -> String {
    let mut out = String::new();
    if let Some(system) = system {
        out.push_str("[system]\n");
        out.push_str(system);
        out.push_str("\n\n");
    }
    for msg in messages {
        out.push('[');
        out.push_str(msg.role.as_str());
        out.push_str("]\n");
        out.push_str(&msg.content);
        out.push_str("\n\n");
    }
    out.truncate(out.trim_end().len());
    out
}

/// Request shaping and shared limits for a [`RouterGateway`].
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Tried when the requested model's provider fails or is disabled.
    pub fallback_model: Option<String>,
    /// Maximum backend requests in flight at once across all sessions.
    pub max_in_flight: usize,
    pub rate_limit: RateLimitConfig,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.0,
            fallback_model: None,
            max_in_flight: 16,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Counters accumulated over every request sent through a gateway.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub requests: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub usage: Usage,
}

/// [`Gateway`] backed by a [`ModelRouter`].
pub struct RouterGateway {
    router: ModelRouter,
    limiter: RateLimiter,
    in_flight: Arc<Semaphore>,
    options: GatewayOptions,
    stats: Mutex<GatewayStats>,
}

impl RouterGateway {
    pub fn new(router: ModelRouter, options: GatewayOptions) -> Self {
        Self {
            router,
            limiter: RateLimiter::new(options.rate_limit.clone()),
            in_flight: Arc::new(Semaphore::new(options.max_in_flight.max(1))),
            options,
            stats: Mutex::new(GatewayStats::default()),
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Snapshot of the counters so far.
    pub fn stats(&self) -> GatewayStats {
        self.stats.lock().clone()
    }

    async fn dispatch(&self, request: LlmRequest, timeout: Option<Duration>) -> Result<String> {
        let model = request.model.clone();
        debug!(model = %model, timeout_ms = timeout.map(|t| t.as_millis() as u64), "gateway send");

        let work = async {
            self.limiter.acquire(&model).await?;
            let _permit = self
                .in_flight
                .acquire()
                .await
                .map_err(|_| RlmError::Backend("gateway is shut down".into()))?;
            self.router
                .complete(&request, self.options.fallback_model.as_deref())
                .await
        };

        let result: Result<LlmResponse> = match timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(RlmError::BackendTimeout {
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => work.await,
        };

        let mut stats = self.stats.lock();
        stats.requests += 1;
        match result {
            Ok(resp) => {
                stats.usage.merge(&resp.usage);
                Ok(resp.text)
            }
            Err(e) => {
                stats.failures += 1;
                if matches!(e, RlmError::BackendTimeout { .. }) {
                    stats.timeouts += 1;
                }
                warn!(model = %model, error = %e, "backend request failed");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Gateway for RouterGateway {
    async fn send(
        &self,
        prompt: &str,
        model_id: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut request = LlmRequest::prompt(model_id, prompt);
        request.max_tokens = self.options.max_tokens;
        request.temperature = self.options.temperature;
        self.dispatch(request, timeout).await
    }

    async fn send_conversation(
        &self,
        system: Option<&str>,
        messages: &[Message],
        model_id: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let request = LlmRequest {
            model: model_id.to_string(),
            messages: messages.to_vec(),
            system: system.map(str::to_string),
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
        };
        self.dispatch(request, timeout).await
    }
}

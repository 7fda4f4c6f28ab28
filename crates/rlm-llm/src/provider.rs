use async_trait::async_trait;
use rlm_core::{Message, Result, RlmError};
use serde::{Deserialize, Serialize};

/// One completion request as a provider adapter sees it.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// `provider/model` going into the router, the bare name once it reaches an adapter.
    pub model: String,
    /// Turns in order. Adapters may lift `Role::System` turns out.
    pub messages: Vec<Message>,
    /// Opaque system prompt, passed through untouched.
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl LlmRequest {
    /// A single-turn request with the prompt as the only user message.
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user(prompt)],
            system: None,
            max_tokens: 4096,
            temperature: 0.0,
        }
    }

    /// All text in the request, system prompt included.
    pub fn full_text(&self) -> String {
        let mut out = self.system.clone().unwrap_or_default();
        for m in &self.messages {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&m.content);
        }
        out
    }
}

/// Completion text plus accounting.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ContentFilter,
}

/// Token counts for one call, or summed over many.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Adapter's estimate from its price table; 0 for local models.
    pub estimated_cost_usd: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

/// One backend family. The router owns retries, so adapters make exactly one
/// HTTP attempt per `complete`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Prefix that routes `prefix/model` ids here.
    fn name(&self) -> &str;

    /// Bare model ids this provider answers to without a prefix.
    fn models(&self) -> Vec<String>;

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Cheap readiness probe: credentials present or server reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Turn a non-success HTTP reply into a backend error. 429 becomes
/// [`RlmError::RateLimited`] so the router backs off instead of failing over.
pub(crate) async fn error_for_status(provider: &str, resp: reqwest::Response) -> RlmError {
    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(30);
        return RlmError::RateLimited { retry_after_secs };
    }
    let detail = resp.text().await.unwrap_or_default();
    RlmError::Backend(format!("HTTP {status}: {provider}: {detail}"))
}

/// USD for a call given per-million-token prices.
pub(crate) fn priced(input_tokens: u32, output_tokens: u32, (input_per_m, output_per_m): (f64, f64)) -> f64 {
    (input_tokens as f64 * input_per_m + output_tokens as f64 * output_per_m) / 1_000_000.0
}

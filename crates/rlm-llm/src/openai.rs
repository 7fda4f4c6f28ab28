use async_trait::async_trait;
use rlm_core::{Result, RlmError};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::provider::*;

/// Chat-completions adapter. Speaks to OpenAI itself or to any server that
/// mirrors its API (vLLM, Together, llama.cpp `--api`), under a custom
/// routing name.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            provider_name: "openai".into(),
        }
    }

    /// Point at a compatible server and route it under `name`.
    pub fn with_base_url(mut self, url: String, name: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self.provider_name = name;
        self
    }

    fn build_request_body(&self, request: &LlmRequest) -> Value {
        let turns = request
            .system
            .iter()
            .map(|s| json!({ "role": "system", "content": s }))
            .chain(
                request
                    .messages
                    .iter()
                    .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
            )
            .collect::<Vec<_>>();

        // Reasoning-era models reject `max_tokens`
        let limit_field = if uses_max_completion_tokens(&request.model) {
            "max_completion_tokens"
        } else {
            "max_tokens"
        };

        let mut body = json!({
            "model": request.model,
            "messages": turns,
            "temperature": request.temperature,
        });
        body[limit_field] = json!(request.max_tokens);
        body
    }

    fn into_response(model: &str, completion: Completion) -> Result<LlmResponse> {
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(RlmError::Backend("openai: completion had no choices".into()));
        };
        let (input_tokens, output_tokens) = completion
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        Ok(LlmResponse {
            text: choice.message.content.unwrap_or_default(),
            usage: Usage {
                input_tokens,
                output_tokens,
                estimated_cost_usd: priced(input_tokens, output_tokens, openai_prices(model)),
            },
            stop_reason: match choice.finish_reason.as_deref() {
                Some("length") => StopReason::MaxTokens,
                Some("content_filter") => StopReason::ContentFilter,
                _ => StopReason::EndTurn,
            },
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn models(&self) -> Vec<String> {
        ["gpt-4o", "gpt-4o-mini", "gpt-5", "gpt-5-mini", "o3", "o3-mini"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        debug!(provider = %self.provider_name, model = %request.model, "chat completion request");

        let mut call = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&self.build_request_body(request));
        // Self-hosted servers often run without auth
        if !self.api_key.is_empty() {
            call = call.bearer_auth(&self.api_key);
        }

        let resp = call
            .send()
            .await
            .map_err(|e| RlmError::Backend(format!("{}: {e}", self.provider_name)))?;
        if !resp.status().is_success() {
            return Err(error_for_status(&self.provider_name, resp).await);
        }

        let completion: Completion = resp
            .json()
            .await
            .map_err(|e| RlmError::Backend(format!("{}: malformed reply: {e}", self.provider_name)))?;
        Self::into_response(&request.model, completion)
    }

    async fn health_check(&self) -> Result<()> {
        info!(provider = %self.provider_name, "checking chat completion endpoint");
        if self.api_key.is_empty() && self.provider_name == "openai" {
            return Err(RlmError::Backend("OPENAI_API_KEY not set".into()));
        }
        Ok(())
    }
}

fn uses_max_completion_tokens(model: &str) -> bool {
    let m = model.to_lowercase();
    ["o1", "o3", "o4"].iter().any(|p| m.starts_with(p)) || m.contains("gpt-5") || m.contains("gpt5")
}

/// (input, output) USD per million tokens.
fn openai_prices(model: &str) -> (f64, f64) {
    match model {
        m if m.starts_with("gpt-4o-mini") => (0.15, 0.60),
        m if m.contains("gpt-5-mini") => (0.25, 2.00),
        m if m.contains("gpt-5") || m.contains("gpt5") => (1.25, 10.00),
        m if m.starts_with("o3-mini") => (1.10, 4.40),
        m if m.starts_with("o3") => (10.00, 40.00),
        _ => (2.50, 10.00),
    }
}

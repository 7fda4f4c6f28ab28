use async_trait::async_trait;
use reqwest::Client;
use rlm_core::{Result, RlmError, Role};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::provider::*;

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API adapter.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct MessagesReply {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ReplyUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Default)]
struct ReplyUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.anthropic.com/v1".into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// The Messages API takes system text as a top-level field, so inline
    /// system turns are folded into it after the request's own prompt.
    fn build_request_body(&self, request: &LlmRequest) -> Value {
        let (system_turns, turns): (Vec<_>, Vec<_>) =
            request.messages.iter().partition(|m| m.role == Role::System);

        let system = request
            .system
            .iter()
            .map(String::as_str)
            .chain(system_turns.iter().map(|m| m.content.as_str()))
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": turns
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                .collect::<Vec<_>>(),
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        body
    }

    fn into_response(model: &str, reply: MessagesReply) -> LlmResponse {
        let text = reply
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<String>();
        let ReplyUsage {
            input_tokens,
            output_tokens,
        } = reply.usage;

        LlmResponse {
            text,
            usage: Usage {
                input_tokens,
                output_tokens,
                estimated_cost_usd: priced(input_tokens, output_tokens, anthropic_prices(model)),
            },
            stop_reason: match reply.stop_reason.as_deref() {
                Some("max_tokens") => StopReason::MaxTokens,
                Some("stop_sequence") => StopReason::StopSequence,
                _ => StopReason::EndTurn,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "claude-opus-4-20250514".into(),
            "claude-sonnet-4-20250514".into(),
            "claude-haiku-3-5".into(),
        ]
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        debug!(model = %request.model, "messages request");

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&self.build_request_body(request))
            .send()
            .await
            .map_err(|e| RlmError::Backend(format!("anthropic: {e}")))?;
        if !resp.status().is_success() {
            return Err(error_for_status("anthropic", resp).await);
        }

        let reply: MessagesReply = resp
            .json()
            .await
            .map_err(|e| RlmError::Backend(format!("anthropic: malformed reply: {e}")))?;
        Ok(Self::into_response(&request.model, reply))
    }

    async fn health_check(&self) -> Result<()> {
        info!("checking Anthropic credentials");
        if self.api_key.is_empty() {
            return Err(RlmError::Backend("ANTHROPIC_API_KEY not set".into()));
        }
        Ok(())
    }
}

/// (input, output) USD per million tokens, by model family.
fn anthropic_prices(model: &str) -> (f64, f64) {
    if model.contains("opus") {
        (15.00, 75.00)
    } else if model.contains("haiku") {
        (0.80, 4.00)
    } else {
        (3.00, 15.00)
    }
}

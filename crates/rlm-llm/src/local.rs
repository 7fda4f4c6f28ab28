use async_trait::async_trait;
use rlm_core::{Result, RlmError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::provider::*;

/// Adapter for a local inference server speaking Ollama's `/api/chat`
/// protocol (Ollama itself, llama.cpp's server in Ollama mode, LM Studio).
pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatTurn<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatTurn<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize, Default)]
struct ChatReply {
    #[serde(default)]
    message: Option<ReplyMessage>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: String,
}

impl LocalProvider {
    pub fn new(base_url: String, model_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model_name,
        }
    }

    /// Ollama on its default port.
    pub fn ollama(model: &str) -> Self {
        Self::new("http://127.0.0.1:11434".into(), model.to_string())
    }

    fn body<'a>(request: &'a LlmRequest) -> ChatBody<'a> {
        let system = request.system.as_deref().map(|content| ChatTurn {
            role: "system",
            content,
        });
        let messages = system
            .into_iter()
            .chain(request.messages.iter().map(|m| ChatTurn {
                role: m.role.as_str(),
                content: &m.content,
            }))
            .collect();
        ChatBody {
            model: &request.model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }
}

impl From<ChatReply> for LlmResponse {
    fn from(reply: ChatReply) -> Self {
        let stop_reason = match reply.done_reason.as_deref() {
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };
        LlmResponse {
            text: reply.message.map(|m| m.content).unwrap_or_default(),
            usage: Usage {
                input_tokens: reply.prompt_eval_count,
                output_tokens: reply.eval_count,
                estimated_cost_usd: 0.0,
            },
            stop_reason,
        }
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn models(&self) -> Vec<String> {
        vec![self.model_name.clone()]
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!("{}/api/chat", self.base_url);
        debug!(%url, model = %request.model, "local chat request");

        let resp = self
            .client
            .post(&url)
            .json(&Self::body(request))
            .send()
            .await
            .map_err(|e| RlmError::Backend(format!("local: {e}")))?;

        if !resp.status().is_success() {
            return Err(error_for_status("local", resp).await);
        }

        let reply: ChatReply = resp
            .json()
            .await
            .map_err(|e| RlmError::Backend(format!("local: malformed reply: {e}")))?;
        Ok(reply.into())
    }

    async fn health_check(&self) -> Result<()> {
        info!(base_url = %self.base_url, "checking local model server");
        let status = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| RlmError::Backend(format!("local unreachable: {e}")))?
            .status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RlmError::Backend(format!("local server returned {status}")))
        }
    }
}

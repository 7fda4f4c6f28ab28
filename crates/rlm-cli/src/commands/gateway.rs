use std::sync::Arc;
use tracing::{info, warn};

use rlm_config::RlmConfig;
use rlm_llm::anthropic::AnthropicProvider;
use rlm_llm::local::LocalProvider;
use rlm_llm::openai::OpenAiProvider;
use rlm_llm::{GatewayOptions, ModelRouter, RateLimitConfig, RouterGateway};

const DEFAULT_LOCAL_URL: &str = "http://127.0.0.1:11434";

/// Register a provider for every configured backend and wrap the router in a
/// gateway carrying the configured limits.
pub(super) fn build_gateway(config: &RlmConfig) -> RouterGateway {
    let services = &config.services;
    let mut router = ModelRouter::new();

    // Config file keys take priority, env vars were applied as fallback by the loader
    if let Some(ref key) = services.anthropic_api_key {
        router.add_provider(Arc::new(AnthropicProvider::new(key.clone())));
    }
    if let Some(ref key) = services.openai_api_key {
        let mut provider = OpenAiProvider::new(key.clone());
        if let Some(ref url) = services.openai_base_url {
            provider = provider.with_base_url(url.clone(), "openai".into());
        }
        router.add_provider(Arc::new(provider));
    }
    if let Some(model) = local_model(config) {
        let base_url = services
            .local_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_URL.into());
        router.add_provider(Arc::new(LocalProvider::new(base_url, model)));
    }

    let providers = router.provider_names();
    if providers.is_empty() {
        warn!(
            model = %config.backend.model,
            "no LLM providers configured; add keys to [services] in rlm.toml or set ANTHROPIC_API_KEY / OPENAI_API_KEY"
        );
    } else {
        info!(?providers, "registered LLM providers");
    }

    let options = GatewayOptions {
        max_tokens: config.backend.max_tokens,
        temperature: config.backend.temperature,
        fallback_model: config.backend.fallback_model.clone(),
        max_in_flight: config.backend.max_in_flight,
        rate_limit: RateLimitConfig {
            burst: config.rate_limit.burst,
            refill_per_sec: config.rate_limit.refill_per_sec,
        },
    };
    RouterGateway::new(router, options)
}

/// The local model to serve: `services.local_model`, or the name after
/// `local/` in either configured model.
fn local_model(config: &RlmConfig) -> Option<String> {
    if let Some(ref model) = config.services.local_model {
        return Some(model.clone());
    }
    [config.backend.model.as_str(), config.backend.sub_model()]
        .into_iter()
        .find_map(|m| m.strip_prefix("local/"))
        .map(str::to_string)
}

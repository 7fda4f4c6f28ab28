//! # rlm-llm
//!
//! The backend gateway. Every model call the engine makes goes through the
//! single [`Gateway`] capability; provider adapters (Anthropic, OpenAI-compatible
//! servers, local Ollama) sit behind a [`ModelRouter`] with retry and failover,
//! and a per-model token bucket keeps the whole call tree under rate limits.

pub mod anthropic;
pub mod gateway;
pub mod local;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod ratelimit;
pub mod router;

pub use gateway::{Gateway, GatewayOptions, GatewayStats, RouterGateway};
pub use mock::{MockProvider, MockResponse};
pub use provider::{LlmProvider, LlmRequest, LlmResponse, StopReason, Usage};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use router::{ModelRouter, RetryPolicy};

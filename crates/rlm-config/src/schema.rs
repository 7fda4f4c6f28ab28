use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration — maps to `rlm.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RlmConfig {
    pub engine: EngineConfig,
    pub backend: BackendConfig,
    pub rate_limit: RateLimitConfig,
    pub prompts: PromptsConfig,
    pub services: ServicesConfig,
    pub logging: LoggingConfig,
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum recursion depth. 1 = sub-calls are plain completions.
    pub max_depth: u32,
    /// Controller rounds per session before the safety break fires.
    pub max_iterations: u32,
    /// Maximum sub-calls in flight per `llm_batch`.
    pub max_concurrency: usize,
    /// Per sub-call timeout. 0 = no timeout.
    pub call_timeout_secs: u64,
    /// Whole-batch deadline. 0 = no deadline.
    pub batch_timeout_secs: u64,
    /// Wall-clock limit for a root session. 0 = no limit.
    pub session_timeout_secs: u64,
    /// Operation outputs longer than this are truncated in the Controller transcript.
    pub output_max_chars: usize,
    /// Estimated token budget for the Controller transcript before compaction.
    pub controller_max_tokens: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 1,
            max_iterations: 20,
            max_concurrency: 8,
            call_timeout_secs: 120,
            batch_timeout_secs: 600,
            session_timeout_secs: 1800,
            output_max_chars: 4000,
            controller_max_tokens: 100_000,
        }
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

impl EngineConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        secs(self.call_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        secs(self.batch_timeout_secs)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        secs(self.session_timeout_secs)
    }
}

// ── Backend ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Controller model, e.g. "openai/gpt-4o".
    pub model: String,
    /// Model for sub-calls. Falls back to `model` when unset.
    pub sub_model: Option<String>,
    /// Fallback model when the primary provider is unavailable.
    pub fallback_model: Option<String>,
    /// Maximum tokens per completion.
    pub max_tokens: u32,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Maximum backend requests in flight across the whole call tree.
    pub max_in_flight: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".into(),
            sub_model: Some("openai/gpt-4o-mini".into()),
            fallback_model: None,
            max_tokens: 4096,
            temperature: 0.0,
            max_in_flight: 16,
        }
    }
}

impl BackendConfig {
    pub fn sub_model(&self) -> &str {
        self.sub_model.as_deref().unwrap_or(&self.model)
    }
}

// ── Rate limit ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum burst size (tokens in the bucket) per model.
    pub burst: u32,
    /// Tokens refilled per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 60,
            refill_per_sec: 10.0,
        }
    }
}

// ── Prompts ────────────────────────────────────────────────────

/// System prompt text is opaque to the engine; it is passed through as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Controller system prompt.
    pub system_prompt: Option<String>,
    /// Path to a file containing the Controller system prompt (overrides `system_prompt`).
    pub system_prompt_file: Option<PathBuf>,
    /// System prompt for nested sessions.
    pub sub_system_prompt: Option<String>,
}

// ── Services ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Anthropic API key. Can also be set via ANTHROPIC_API_KEY.
    /// Config file takes priority over environment variable.
    pub anthropic_api_key: Option<String>,
    /// OpenAI API key. Can also be set via OPENAI_API_KEY.
    pub openai_api_key: Option<String>,
    /// OpenAI-compatible base URL (vLLM, Together, Azure, ...).
    pub openai_base_url: Option<String>,
    /// Local inference server (Ollama), e.g. "http://127.0.0.1:11434".
    pub local_base_url: Option<String>,
    /// Model served by the local inference server.
    pub local_model: Option<String>,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "{tag}: {}: {}", self.field, self.message)?;
        match self.hint {
            Some(ref hint) => write!(f, " ({hint})"),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
struct Issues(Vec<ConfigWarning>);

impl Issues {
    fn push(
        &mut self,
        severity: WarningSeverity,
        field: &str,
        message: impl Into<String>,
        hint: Option<&str>,
    ) {
        self.0.push(ConfigWarning {
            field: field.to_string(),
            message: message.into(),
            severity,
            hint: hint.map(str::to_string),
        });
    }

    fn error(&mut self, field: &str, message: impl Into<String>, hint: Option<&str>) {
        self.push(WarningSeverity::Error, field, message, hint);
    }

    fn warn(&mut self, field: &str, message: impl Into<String>, hint: Option<&str>) {
        self.push(WarningSeverity::Warning, field, message, hint);
    }

    fn one_of(&mut self, field: &str, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            let hint = format!("one of: {}", allowed.join(", "));
            self.warn(field, format!("unknown value '{value}'"), Some(&hint));
        }
    }
}

impl RlmConfig {
    /// Check the config for values that would break or degrade a session.
    /// Hard errors are joined into the `Err` string; soft issues come back
    /// as warnings.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut issues = Issues::default();
        let (engine, backend) = (&self.engine, &self.backend);

        for (field, model) in [
            ("backend.model", Some(backend.model.as_str())),
            ("backend.sub_model", backend.sub_model.as_deref()),
        ] {
            match model {
                Some("") => issues.error(field, "model is empty", Some("e.g. 'openai/gpt-4o'")),
                Some(m) if !m.contains('/') => issues.warn(
                    field,
                    format!("'{m}' is not a provider/model id"),
                    Some("prefix with 'anthropic/', 'openai/' or 'local/'"),
                ),
                _ => {}
            }
        }

        if !(0.0..=2.0).contains(&backend.temperature) {
            issues.error(
                "backend.temperature",
                format!("{} is outside 0.0..=2.0", backend.temperature),
                None,
            );
        }
        if backend.max_tokens == 0 {
            issues.error("backend.max_tokens", "completions would be empty", Some("e.g. 4096"));
        }
        if backend.max_in_flight == 0 {
            issues.error("backend.max_in_flight", "no backend request could start", None);
        }
        if self.rate_limit.burst == 0 {
            issues.error("rate_limit.burst", "no backend request could start", Some("e.g. 60"));
        }

        if engine.max_concurrency == 0 {
            issues.error(
                "engine.max_concurrency",
                "llm_batch could never make progress",
                Some("e.g. 8"),
            );
        }
        if engine.max_iterations == 0 {
            issues.error("engine.max_iterations", "sessions would stop before the first round", None);
        }
        match engine.max_depth {
            0 => issues.warn(
                "engine.max_depth",
                "every sub-call will fail with depth exceeded",
                Some("1 for plain sub-calls, 2+ for nested sessions"),
            ),
            d if d > 4 => issues.warn(
                "engine.max_depth",
                format!("depth {d} allows a very large call tree"),
                None,
            ),
            _ => {}
        }
        if let (Some(call), Some(batch)) = (engine.call_timeout(), engine.batch_timeout())
            && batch < call
        {
            issues.warn(
                "engine.batch_timeout_secs",
                "shorter than the per-call timeout",
                None,
            );
        }

        issues.one_of("logging.format", &self.logging.format, &["pretty", "json", "compact"]);
        issues.one_of(
            "logging.level",
            &self.logging.level,
            &["trace", "debug", "info", "warn", "error"],
        );

        let (errors, warnings): (Vec<_>, Vec<_>) = issues
            .0
            .into_iter()
            .partition(|w| w.severity == WarningSeverity::Error);
        if errors.is_empty() {
            Ok(warnings)
        } else {
            let lines: Vec<String> = errors.iter().map(|w| format!("{}: {}", w.field, w.message)).collect();
            Err(format!("Configuration errors:\n  - {}", lines.join("\n  - ")))
        }
    }
}

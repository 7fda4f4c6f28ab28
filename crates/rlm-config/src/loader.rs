use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::RlmConfig;

/// Loads the RLM configuration from disk and the environment.
pub struct ConfigLoader {
    config: RlmConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > RLM_CONFIG env > ~/.rlm/rlm.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("RLM_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".rlm")
            .join("rlm.toml")
    }

    /// Load the config from disk, falling back to defaults.
    /// An explicit path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> rlm_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&raw, &config_path)?
        } else if path.is_some() {
            return Err(rlm_core::RlmError::Config(format!(
                "config file not found: {}",
                config_path.display()
            )));
        } else {
            warn!(?config_path, "config file not found, using defaults");
            RlmConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(rlm_core::RlmError::Config(e));
            }
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    fn parse(raw: &str, path: &Path) -> rlm_core::Result<RlmConfig> {
        toml::from_str::<RlmConfig>(raw).map_err(|e| {
            rlm_core::RlmError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Get a snapshot of the loaded config.
    pub fn get(&self) -> RlmConfig {
        self.config.clone()
    }

    /// Path the config was (or would have been) read from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Resolve the Controller system prompt: `system_prompt_file` wins over
    /// `system_prompt`. Relative files resolve against the config directory.
    pub fn system_prompt(&self) -> rlm_core::Result<Option<String>> {
        let prompts = &self.config.prompts;
        if let Some(ref file) = prompts.system_prompt_file {
            let full = if file.is_relative() {
                self.config_path
                    .parent()
                    .unwrap_or(Path::new("."))
                    .join(file)
            } else {
                file.clone()
            };
            let text = std::fs::read_to_string(&full).map_err(|e| {
                rlm_core::RlmError::Config(format!(
                    "failed to read system prompt {}: {}",
                    full.display(),
                    e
                ))
            })?;
            return Ok(Some(text));
        }
        Ok(prompts.system_prompt.clone())
    }

    /// Apply env var overrides (RLM_MODEL, RLM_MAX_DEPTH, etc.)
    fn apply_env_overrides(config: RlmConfig) -> RlmConfig {
        Self::apply_overrides_from(config, |key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from(
        mut config: RlmConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> RlmConfig {
        if let Some(v) = lookup("RLM_MODEL") {
            config.backend.model = v;
        }
        if let Some(v) = lookup("RLM_SUB_MODEL") {
            config.backend.sub_model = Some(v);
        }
        if let Some(v) = lookup("RLM_MAX_DEPTH") {
            if let Ok(depth) = v.parse::<u32>() {
                config.engine.max_depth = depth;
            } else {
                warn!(value = %v, "ignoring non-numeric RLM_MAX_DEPTH");
            }
        }
        if let Some(v) = lookup("RLM_LOG_LEVEL") {
            config.logging.level = v;
        }
        // API keys: config file takes priority, env is the fallback.
        if config.services.anthropic_api_key.is_none() {
            config.services.anthropic_api_key = lookup("ANTHROPIC_API_KEY");
        }
        if config.services.openai_api_key.is_none() {
            config.services.openai_api_key = lookup("OPENAI_API_KEY");
        }
        config
    }
}

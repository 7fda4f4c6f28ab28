#[cfg(test)]
mod tests {
    use rlm_config::ConfigLoader;
    use rlm_config::schema::*;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_rlm_config_defaults() {
        let config = RlmConfig::default();
        assert_eq!(config.backend.model, "openai/gpt-4o");
        assert_eq!(config.backend.sub_model(), "openai/gpt-4o-mini");
        assert_eq!(config.engine.max_depth, 1);
        assert_eq!(config.engine.max_iterations, 20);
        assert_eq!(config.engine.max_concurrency, 8);
    }

    #[test]
    fn test_engine_timeouts() {
        let mut engine = EngineConfig::default();
        assert_eq!(engine.call_timeout(), Some(Duration::from_secs(120)));
        engine.batch_timeout_secs = 0;
        assert_eq!(engine.batch_timeout(), None);
    }

    #[test]
    fn test_sub_model_falls_back_to_model() {
        let backend = BackendConfig {
            sub_model: None,
            ..Default::default()
        };
        assert_eq!(backend.sub_model(), "openai/gpt-4o");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = RlmConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: RlmConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.backend.model, config.backend.model);
        assert_eq!(restored.engine.max_depth, config.engine.max_depth);
        assert_eq!(restored.rate_limit.burst, config.rate_limit.burst);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[backend]
model = "anthropic/claude-sonnet-4-20250514"

[engine]
max_depth = 2
"#;
        let config: RlmConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.model, "anthropic/claude-sonnet-4-20250514");
        assert_eq!(config.engine.max_depth, 2);
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.backend.max_tokens, 4096);
    }

    // ── Validation ─────────────────────────────────────────────

    #[test]
    fn test_default_config_is_valid() {
        let warnings = RlmConfig::default().validate().unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_zero_concurrency_is_error() {
        let mut config = RlmConfig::default();
        config.engine.max_concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("engine.max_concurrency"));
    }

    #[test]
    fn test_zero_depth_is_warning() {
        let mut config = RlmConfig::default();
        config.engine.max_depth = 0;
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "engine.max_depth");
        assert_eq!(warnings[0].severity, WarningSeverity::Warning);
    }

    #[test]
    fn test_unqualified_model_warns() {
        let mut config = RlmConfig::default();
        config.backend.model = "gpt-4o".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "backend.model"));
    }

    // ── Overrides ──────────────────────────────────────────────

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("RLM_MODEL", "local/qwen2.5"),
            ("RLM_MAX_DEPTH", "3"),
            ("OPENAI_API_KEY", "sk-env"),
        ]
        .into_iter()
        .collect();
        let config = ConfigLoader::apply_overrides_from(RlmConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.backend.model, "local/qwen2.5");
        assert_eq!(config.engine.max_depth, 3);
        assert_eq!(config.services.openai_api_key.as_deref(), Some("sk-env"));
    }

    #[test]
    fn test_config_key_wins_over_env_key() {
        let mut base = RlmConfig::default();
        base.services.anthropic_api_key = Some("from-file".into());
        let config = ConfigLoader::apply_overrides_from(base, |k| {
            (k == "ANTHROPIC_API_KEY").then(|| "from-env".to_string())
        });
        assert_eq!(config.services.anthropic_api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_bad_depth_override_ignored() {
        let config = ConfigLoader::apply_overrides_from(RlmConfig::default(), |k| {
            (k == "RLM_MAX_DEPTH").then(|| "deep".to_string())
        });
        assert_eq!(config.engine.max_depth, 1);
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rlm.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[engine]
max_depth = 2
max_concurrency = 4

[backend]
model = "openai/gpt-4o"
sub_model = "openai/gpt-4o-mini"

[rate_limit]
burst = 5
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.engine.max_depth, 2);
        assert_eq!(config.engine.max_concurrency, 4);
        assert_eq!(config.rate_limit.burst, 5);
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_missing_explicit_file_fails() {
        let result = ConfigLoader::load(Some(std::path::Path::new("/nonexistent/rlm.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_config_loader_invalid_toml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rlm.toml");
        std::fs::write(&config_path, "[engine\nmax_depth = ").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_system_prompt_file_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("rlm.toml");
        std::fs::write(dir.path().join("weak_coder.txt"), "You are a careful coder.").unwrap();
        std::fs::write(
            &config_path,
            r#"
[prompts]
system_prompt = "ignored"
system_prompt_file = "weak_coder.txt"
"#,
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(
            loader.system_prompt().unwrap().as_deref(),
            Some("You are a careful coder.")
        );
    }
}

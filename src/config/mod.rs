//! Configuration for the ingestion and analysis pipeline

mod template;

use crate::analysis::AnalysisConfig;
use crate::ingest::buffer::BufferConfig;
use crate::ingest::prescreen::PreScreenConfig;
use crate::sources::scheduler::SchedulerConfig;
use crate::utils::error::{Error, Result};
use crate::utils::types::SourceConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;

pub use template::{generate_commented_config_template, DEFAULT_CONFIG_TOML};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub prescreen: PreScreenConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Model providers, tried in order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run analysis cycles. With this off the pipeline only ingests.
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder at startup
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    Openrouter,
}

impl ProviderKind {
    pub fn default_key_env(&self) -> &'static str {
        match self {
            | ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            | ProviderKind::Openrouter => "OPENROUTER_API_KEY",
        }
    }
}

/// One model provider in the fallback chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: ProviderKind,

    /// Environment variable holding the API key; defaults per provider type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Bound on one whole attempt, request plus streamed response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ProviderConfig {
    pub fn key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or_else(|| self.kind.default_key_env())
    }

    pub fn resolve_api_key(&self) -> Result<String> {
        env::var(self.key_env())
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::ConfigError(format!("provider {}: {} is not set", self.id, self.key_env())))
    }
}

impl Config {
    /// Read, parse and validate a config file. A `.env` next to the working
    /// directory is loaded first so API keys can live there.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenv::dotenv().ok();
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config file {:?}: {}", path, e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut cfg: Config = toml::from_str(content)?;
        for source in &mut cfg.sources {
            if source.name.trim().is_empty() {
                source.name = source.id.clone();
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// The commented template printed by `tickscope print-default-config`.
    pub fn default_toml() -> &'static str {
        DEFAULT_CONFIG_TOML
    }

    /// Save the configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigError(format!("Failed to create directory {:?}: {}", parent, e)))?;
        }
        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config file {:?}: {}", path, e)))?;
        Ok(())
    }

    /// Validate the configuration for required fields and reasonable values
    pub fn validate(&self) -> Result<()> {
        fn fail<T>(msg: impl Into<String>) -> Result<T> {
            Err(Error::ConfigError(msg.into()))
        }

        if self.buffer.flush_interval_ms == 0 {
            return fail("buffer.flush_interval_ms must be > 0");
        }
        if !(0.0..=1.0).contains(&self.buffer.urgent_threshold) {
            return fail("buffer.urgent_threshold must be within [0, 1]");
        }

        if self.scheduler.default_poll_interval_ms == 0 {
            return fail("scheduler.default_poll_interval_ms must be > 0");
        }
        if self.scheduler.backoff_multiplier < 1.0 {
            return fail("scheduler.backoff_multiplier must be >= 1");
        }
        if self.scheduler.max_backoff_ms == 0 {
            return fail("scheduler.max_backoff_ms must be > 0");
        }

        let p = &self.prescreen;
        if p.z_score_threshold <= 0.0 {
            return fail("prescreen.z_score_threshold must be > 0");
        }
        if !(0.0..=1.0).contains(&p.skip_threshold) || !(0.0..=1.0).contains(&p.urgent_threshold) {
            return fail("prescreen thresholds must be within [0, 1]");
        }
        if p.skip_threshold > p.urgent_threshold {
            return fail("prescreen.skip_threshold cannot exceed prescreen.urgent_threshold");
        }

        if self.analysis.model.trim().is_empty() {
            return fail("analysis.model must be set");
        }
        if self.analysis.max_tokens == 0 {
            return fail("analysis.max_tokens must be > 0");
        }
        if !(0.0..=2.0).contains(&self.analysis.temperature) {
            return fail("analysis.temperature must be within [0, 2]");
        }

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return fail("provider id must be set");
            }
            if !provider_ids.insert(provider.id.as_str()) {
                return fail(format!("duplicate provider id: {}", provider.id));
            }
            if provider.timeout_secs == Some(0) {
                return fail(format!("provider {}: timeout_secs must be > 0", provider.id));
            }
            if let Some(url) = &provider.base_url {
                url::Url::parse(url)?;
            }
        }
        if self.monitor.enabled && self.providers.is_empty() {
            return fail("at least one [[providers]] entry is required when the monitor is enabled");
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return fail("source id must be set");
            }
            if !source_ids.insert(source.id.as_str()) {
                return fail(format!("duplicate source id: {}", source.id));
            }
            if source.poll_interval_ms == Some(0) {
                return fail(format!("source {}: poll_interval_ms must be > 0", source.id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::SourceKind;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[[providers]]
id = "primary"
type = "anthropic"
"#;

    #[test]
    fn test_defaults_mirror_product() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.buffer.flush_interval_ms, 5_000);
        assert_eq!(config.buffer.urgent_threshold, 0.6);
        assert_eq!(config.scheduler.default_poll_interval_ms, 60_000);
        assert_eq!(config.scheduler.max_backoff_ms, 300_000);
        assert_eq!(config.prescreen.z_score_threshold, 3.0);
        assert_eq!(config.analysis.model, "claude-3-5-haiku-20241022");
        assert_eq!(config.analysis.max_tokens, 4096);
        assert!(config.analysis.enable_tools);
        assert_eq!(config.providers[0].key_env(), "ANTHROPIC_API_KEY");
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_default_template_is_valid() {
        let config = Config::from_toml(Config::default_toml()).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].kind, ProviderKind::Openrouter);
        let csv = &config.sources[0];
        assert_eq!(csv.kind, SourceKind::File);
        assert_eq!(csv.plugin_id, "csv-file");
        assert_eq!(csv.name, "csv");
        assert_eq!(csv.poll_interval_ms, Some(5_000));
        assert!(config.sources.iter().all(|s| !s.enabled || s.plugin_id == "csv-file"));
    }

    #[test]
    fn test_validation_failures() {
        let no_provider = "[monitor]\nenabled = true\n";
        assert_matches!(Config::from_toml(no_provider), Err(Error::ConfigError(m)) if m.contains("providers"));
        assert!(Config::from_toml("[monitor]\nenabled = false\n").is_ok());

        let dup = format!(
            "{}\n[[sources]]\nid = \"a\"\nkind = \"file\"\nplugin_id = \"csv-file\"\n\n[[sources]]\nid = \"a\"\nkind = \"file\"\nplugin_id = \"csv-file\"\n",
            MINIMAL
        );
        assert_matches!(Config::from_toml(&dup), Err(Error::ConfigError(m)) if m.contains("duplicate source"));

        let bad_screen = format!("{}\n[prescreen]\nskip_threshold = 0.9\nurgent_threshold = 0.5\n", MINIMAL);
        assert_matches!(Config::from_toml(&bad_screen), Err(Error::ConfigError(_)));

        assert_matches!(Config::from_toml("[buffer\n"), Err(Error::TomlError(_)));
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("tickscope.toml");

        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.buffer.flush_interval_ms = 750;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.buffer.flush_interval_ms, 750);
        assert_eq!(loaded.providers[0].id, "primary");
    }

    #[test]
    #[serial_test::serial]
    fn test_api_key_resolution() {
        let provider = ProviderConfig {
            id: "or".into(),
            kind: ProviderKind::Openrouter,
            api_key_env: Some("TICKSCOPE_TEST_OR_KEY".into()),
            base_url: None,
            timeout_secs: None,
        };
        env::remove_var("TICKSCOPE_TEST_OR_KEY");
        assert_matches!(provider.resolve_api_key(), Err(Error::ConfigError(m)) if m.contains("TICKSCOPE_TEST_OR_KEY"));
        env::set_var("TICKSCOPE_TEST_OR_KEY", "sk-or-1");
        assert_eq!(provider.resolve_api_key().unwrap(), "sk-or-1");
        env::remove_var("TICKSCOPE_TEST_OR_KEY");
    }
}

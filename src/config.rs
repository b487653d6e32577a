use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable overriding `[db].primary_url`.
pub const PRIMARY_URL_ENV: &str = "KA_PRIMARY_DATABASE_URL";
/// Environment variable overriding `[db].standby_url`.
pub const STANDBY_URL_ENV: &str = "KA_STANDBY_DATABASE_URL";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub standby_url: Option<String>,
    #[serde(default = "default_primary_probe_timeout")]
    pub primary_probe_timeout_secs: u64,
    #[serde(default = "default_standby_connect_timeout")]
    pub standby_connect_timeout_secs: u64,
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval_secs: u64,
}

fn default_primary_probe_timeout() -> u64 {
    3
}
fn default_standby_connect_timeout() -> u64 {
    5
}
fn default_recovery_interval() -> u64 {
    60
}

impl DbConfig {
    pub fn primary_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_probe_timeout_secs)
    }

    pub fn standby_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.standby_connect_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub index_url: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            index_url: None,
            namespace: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_classifier_model")]
    pub classifier_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            classifier_model: default_classifier_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o".to_string()
}
fn default_classifier_model() -> String {
    "gpt-3.5-turbo".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout() -> u64 {
    120
}
fn default_llm_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    /// Rewrite queries against the user's recent turns before retrieval.
    #[serde(default = "default_rewrite")]
    pub rewrite: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { rewrite: true }
    }
}

fn default_rewrite() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var(PRIMARY_URL_ENV) {
        if !url.trim().is_empty() {
            config.db.primary_url = Some(url);
        }
    }
    if let Ok(url) = std::env::var(STANDBY_URL_ENV) {
        if !url.trim().is_empty() {
            config.db.standby_url = Some(url);
        }
    }
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.primary_url.is_none() && config.db.standby_url.is_none() {
        anyhow::bail!(
            "at least one of db.primary_url or db.standby_url must be set (or {} / {})",
            PRIMARY_URL_ENV,
            STANDBY_URL_ENV
        );
    }

    if config.db.primary_probe_timeout_secs == 0 || config.db.standby_connect_timeout_secs == 0 {
        anyhow::bail!("db connect timeouts must be > 0");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }

    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

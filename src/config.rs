//! Configuration loading and validation.
//!
//! The TOML file is optional in every section; missing keys fall back to
//! defaults. A handful of environment variables override file values after
//! parsing and before validation:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `MONGODB_URI` | `database.uri` |
//! | `DATABASE_NAME` | `database.name` |
//! | `DEFAULT_LLM_PROVIDER` | `llm.provider` |
//! | `DEFAULT_LLM_MODEL` | `llm.model` |
//! | `MAX_QUERY_RESULTS` | `workflow.max_results` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Providers accepted by `llm.provider`.
pub const KNOWN_PROVIDERS: &[&str] = &["cohere", "openai"];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_excluded_prefixes")]
    pub excluded_prefixes: Vec<String>,
    #[serde(default = "default_redacted_fields")]
    pub redacted_fields: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            name: default_db_name(),
            sample_size: default_sample_size(),
            timeout_secs: default_timeout_secs(),
            excluded_prefixes: default_excluded_prefixes(),
            redacted_fields: default_redacted_fields(),
        }
    }
}

fn default_uri() -> String {
    "mongodb://localhost:27017".to_string()
}
fn default_db_name() -> String {
    "school_db".to_string()
}
fn default_sample_size() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_excluded_prefixes() -> Vec<String> {
    vec!["system.".to_string(), "checkpoint".to_string()]
}
fn default_redacted_fields() -> Vec<String> {
    vec!["vector_embedding".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Defaults per provider; see [`LlmConfig::model_name`].
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    /// Configured model, or the provider's default.
    pub fn model_name(&self) -> String {
        match &self.model {
            Some(model) => model.clone(),
            None => match self.provider.as_str() {
                "openai" => "gpt-4o".to_string(),
                _ => "command-r-plus".to_string(),
            },
        }
    }
}

fn default_provider() -> String {
    "cohere".to_string()
}
fn default_temperature() -> f64 {
    0.1
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: u32,
    #[serde(default = "default_max_selected")]
    pub max_selected_collections: usize,
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    /// Rows per collection returned by keyword search.
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_repair_attempts: default_max_repair_attempts(),
            max_selected_collections: default_max_selected(),
            preview_rows: default_preview_rows(),
            preview_chars: default_preview_chars(),
            search_limit: default_search_limit(),
        }
    }
}

fn default_max_results() -> usize {
    100
}
fn default_max_repair_attempts() -> u32 {
    2
}
fn default_max_selected() -> usize {
    4
}
fn default_preview_rows() -> usize {
    20
}
fn default_preview_chars() -> usize {
    4000
}
fn default_search_limit() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Read, override from the process environment, and validate.
///
/// A missing file is not an error: every section has defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        parse_config(&content)?
    } else {
        Config::default()
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(uri) = lookup("MONGODB_URI") {
        config.database.uri = uri;
    }
    if let Some(name) = lookup("DATABASE_NAME") {
        config.database.name = name;
    }
    if let Some(provider) = lookup("DEFAULT_LLM_PROVIDER") {
        config.llm.provider = provider.to_lowercase();
    }
    if let Some(model) = lookup("DEFAULT_LLM_MODEL") {
        config.llm.model = Some(model);
    }
    if let Some(max) = lookup("MAX_QUERY_RESULTS") {
        config.workflow.max_results = max
            .trim()
            .parse()
            .with_context(|| format!("MAX_QUERY_RESULTS must be an integer, got '{}'", max))?;
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    if config.workflow.max_results < 1 {
        anyhow::bail!("workflow.max_results must be >= 1");
    }
    if config.workflow.search_limit < 1 {
        anyhow::bail!("workflow.search_limit must be >= 1");
    }
    if config.workflow.max_selected_collections < 1 {
        anyhow::bail!("workflow.max_selected_collections must be >= 1");
    }
    if config.database.sample_size < 1 {
        anyhow::bail!("database.sample_size must be >= 1");
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        anyhow::bail!("llm.temperature must be in [0.0, 2.0]");
    }
    if !KNOWN_PROVIDERS.contains(&config.llm.provider.as_str()) {
        anyhow::bail!(
            "Unknown llm provider: '{}'. Must be one of: {}.",
            config.llm.provider,
            KNOWN_PROVIDERS.join(", ")
        );
    }
    Ok(())
}

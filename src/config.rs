use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{ModelConfig, ModelProvider};
use crate::stages::{AnonymizationMode, EnrichmentMode};

/// Errors encountered while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingVariable(String),

    #[error("invalid value for {0}")]
    InvalidValue(String),

    #[error("unknown model provider '{0}' (expected openai, anthropic or local)")]
    UnknownProvider(String),

    #[error("provider '{0}' requires MODEL_BASE_URL")]
    MissingBaseUrl(ModelProvider),

    #[error("unknown {variable} '{value}'")]
    UnknownMode { variable: &'static str, value: String },
}

/// Runtime configuration for the pipeline and its stores
#[derive(Debug, Clone)]
pub struct Config {
    pub model: ModelConfig,
    /// Attempts per model-backed step before the exhaustion policy applies
    pub max_attempts: usize,
    /// Deadline for a single model attempt
    pub attempt_timeout: Duration,
    /// Root directory of the filesystem object store
    pub storage_root: PathBuf,
    pub bronze_bucket: String,
    pub silver_bucket: String,
    /// SQLite metadata database
    pub db_path: PathBuf,
    pub anonymization_mode: AnonymizationMode,
    /// Scrub with regexes before the model rewrite
    pub anonymization_prefilter: bool,
    pub enrichment_mode: EnrichmentMode,
    /// Tesseract language used when a document carries no hint
    pub ocr_language: String,
}

impl Config {
    /// Load configuration from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider: ModelProvider = get("MODEL_PROVIDER")
            .unwrap_or_else(|| "openai".to_string())
            .parse()?;
        let model_name = get("MODEL_NAME").unwrap_or_else(|| "gpt-4o".to_string());
        let api_key = get("MODEL_API_KEY").or_else(|| match provider {
            ModelProvider::OpenAi => get("OPENAI_API_KEY"),
            ModelProvider::Anthropic => get("ANTHROPIC_API_KEY"),
            ModelProvider::Local => get("LLAMA_API_KEY").or_else(|| get("OLLAMA_API_KEY")),
        });

        let timeout_secs: u64 = parse_or(get("MODEL_TIMEOUT_SECS"), "MODEL_TIMEOUT_SECS", 120)?;
        let max_attempts: usize = parse_or(get("MODEL_MAX_ATTEMPTS"), "MODEL_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue("MODEL_MAX_ATTEMPTS".to_string()));
        }

        let model = ModelConfig::new(provider, model_name, api_key, get("MODEL_BASE_URL"))?
            .with_timeout(Duration::from_secs(timeout_secs));

        let anonymization_mode = match get("ANONYMIZATION_MODE") {
            Some(v) => v.parse()?,
            None => AnonymizationMode::default(),
        };
        let enrichment_mode = match get("ENRICHMENT_MODE") {
            Some(v) => v.parse()?,
            None => EnrichmentMode::default(),
        };

        Ok(Self {
            model,
            max_attempts,
            attempt_timeout: Duration::from_secs(timeout_secs),
            storage_root: get("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/objects")),
            bronze_bucket: get("BRONZE_BUCKET").unwrap_or_else(|| "bronze".to_string()),
            silver_bucket: get("SILVER_BUCKET").unwrap_or_else(|| "silver".to_string()),
            db_path: get("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./bronze.sqlite3")),
            anonymization_mode,
            anonymization_prefilter: parse_bool(get("ANONYMIZATION_PREFILTER"), "ANONYMIZATION_PREFILTER")?,
            enrichment_mode,
            ocr_language: get("OCR_LANGUAGE").unwrap_or_else(|| "eng".to_string()),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|v| v.unwrap_or(default))
}

fn parse_bool(value: Option<String>, key: &str) -> Result<bool, ConfigError> {
    match value.as_deref().map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ConfigError;

/// Wire protocol family of the completion backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelProvider {
    /// OpenAI or any OpenAI-compatible endpoint
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Self-hosted OpenAI-compatible server (Ollama, llama.cpp)
    Local,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::OpenAi => "openai",
            ModelProvider::Anthropic => "anthropic",
            ModelProvider::Local => "local",
        }
    }

    /// Base URL used when none is configured; `None` means one is required
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ModelProvider::OpenAi => Some("https://api.openai.com/v1"),
            ModelProvider::Anthropic => Some("https://api.anthropic.com/v1"),
            ModelProvider::Local => None,
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-compatible" => Ok(Self::OpenAi),
            "anthropic" | "anthropic-compatible" => Ok(Self::Anthropic),
            "local" | "ollama" | "llama" | "local-self-hosted" => Ok(Self::Local),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Configuration for the completion backend
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    /// Model to use (e.g., "gpt-4o", "claude-sonnet-4-20250514", "llama3.2-vision")
    pub model_name: String,
    pub api_key: Option<String>,
    /// Endpoint root including the version segment, e.g. "https://api.openai.com/v1"
    pub base_url: String,
    /// Temperature (0-1, lower = more deterministic)
    pub temperature: f64,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// HTTP timeout for a single request
    pub timeout: Duration,
}

impl ModelConfig {
    /// Build a validated configuration.
    ///
    /// The local provider has no public endpoint, so it requires an explicit
    /// base URL.
    pub fn new(
        provider: ModelProvider,
        model_name: impl Into<String>,
        api_key: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self, ConfigError> {
        let model_name = model_name.into();
        if model_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("MODEL_NAME".to_string()));
        }

        let base_url = match base_url.filter(|u| !u.trim().is_empty()) {
            Some(url) => url,
            None => provider
                .default_base_url()
                .map(str::to_string)
                .ok_or(ConfigError::MissingBaseUrl(provider))?,
        };

        Ok(Self {
            provider,
            model_name,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            timeout: Duration::from_secs(120),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Join the base URL with an endpoint path
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_aliases() {
        assert_eq!("OpenAI".parse::<ModelProvider>().unwrap(), ModelProvider::OpenAi);
        assert_eq!(
            "anthropic-compatible".parse::<ModelProvider>().unwrap(),
            ModelProvider::Anthropic
        );
        assert_eq!("ollama".parse::<ModelProvider>().unwrap(), ModelProvider::Local);
        assert!(matches!(
            "gemini".parse::<ModelProvider>(),
            Err(ConfigError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_local_requires_base_url() {
        let err = ModelConfig::new(ModelProvider::Local, "llama3.2-vision", None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBaseUrl(ModelProvider::Local)));

        let cfg = ModelConfig::new(
            ModelProvider::Local,
            "llama3.2-vision",
            None,
            Some("http://localhost:11434/v1/".to_string()),
        )
        .unwrap();
        assert_eq!(cfg.endpoint("/chat/completions"), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_hosted_providers_have_defaults() {
        let cfg = ModelConfig::new(ModelProvider::Anthropic, "claude", Some("k".into()), None).unwrap();
        assert_eq!(cfg.endpoint("messages"), "https://api.anthropic.com/v1/messages");
    }
}

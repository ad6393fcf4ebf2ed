use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use thiserror::Error;

use super::anthropic::AnthropicClient;
use super::config::{ModelConfig, ModelProvider};
use super::openai::OpenAiClient;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("request to model backend failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("model backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("model returned no usable content")]
    EmptyResponse,

    #[error("malformed model response: {0}")]
    Malformed(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),
}

/// A page image sent alongside the prompt
#[derive(Debug, Clone)]
pub struct ImageInput {
    /// e.g. "image/png"
    pub media_type: String,
    /// Base64-encoded image bytes
    pub data: String,
}

impl ImageInput {
    pub fn from_bytes(bytes: &[u8], media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// One completion request; `max_tokens` and `temperature` fall back to the client config
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    pub images: Vec<ImageInput>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Named JSON schema for structured output
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

impl StructuredSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
        }
    }
}

/// Provider-agnostic text/vision completion backend
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Plain text completion
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError>;

    /// Completion constrained to `schema`, returned as a JSON value.
    ///
    /// The value is best-effort: providers without native schema enforcement
    /// may return something that does not match.
    async fn complete_structured(
        &self,
        request: CompletionRequest,
        schema: &StructuredSchema,
    ) -> Result<Value, ModelError>;
}

/// Build the client for the configured provider
pub fn build_client(config: &ModelConfig) -> Result<Arc<dyn ModelClient>, ModelError> {
    let http = reqwest::Client::builder().timeout(config.timeout).build()?;
    Ok(match config.provider {
        ModelProvider::Anthropic => Arc::new(AnthropicClient::new(http, config.clone())),
        ModelProvider::OpenAi | ModelProvider::Local => {
            Arc::new(OpenAiClient::new(http, config.clone()))
        }
    })
}

/// Parse a JSON payload out of model text, tolerating markdown code fences
pub fn parse_json_payload(text: &str) -> Result<Value, ModelError> {
    let trimmed = strip_code_fence(text.trim());
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // Fall back to the outermost object in the text
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => serde_json::from_str(&trimmed[start..=end])
            .map_err(|e| ModelError::Malformed(format!("invalid JSON: {e}"))),
        _ => Err(ModelError::Malformed("no JSON object in response".to_string())),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fenced_json() {
        let text = "```json\n{\"tests\": []}\n```";
        assert_eq!(parse_json_payload(text).unwrap(), json!({"tests": []}));
    }

    #[test]
    fn test_parse_json_with_prose() {
        let text = "Here you go:\n{\"tests\": [{\"parameter\": \"RBC\"}]}\nDone.";
        assert_eq!(
            parse_json_payload(text).unwrap(),
            json!({"tests": [{"parameter": "RBC"}]})
        );
        assert!(parse_json_payload("no json here").is_err());
    }

    #[test]
    fn test_image_data_url() {
        let image = ImageInput::from_bytes(b"abc", "image/png");
        assert_eq!(image.data_url(), "data:image/png;base64,YWJj");
    }
}

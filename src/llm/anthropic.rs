use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::client::{CompletionRequest, ModelClient, ModelError, StructuredSchema};
use super::config::ModelConfig;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API client
pub struct AnthropicClient {
    client: Client,
    config: ModelConfig,
}

impl AnthropicClient {
    pub fn new(client: Client, config: ModelConfig) -> Self {
        Self { client, config }
    }

    fn build_request(
        &self,
        request: CompletionRequest,
        tools: Vec<Tool>,
        tool_choice: Option<ToolChoice>,
    ) -> AnthropicRequest {
        // Images precede the instruction text
        let mut content: Vec<ContentPart> = request
            .images
            .into_iter()
            .map(|image| ContentPart::Image {
                source: ImageSource {
                    source_type: "base64".to_string(),
                    media_type: image.media_type,
                    data: image.data,
                },
            })
            .collect();
        content.push(ContentPart::Text { text: request.user });

        AnthropicRequest {
            model: self.config.model_name.clone(),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
            system: request.system,
            messages: vec![Message {
                role: "user".to_string(),
                content,
            }],
            tools,
            tool_choice,
        }
    }

    async fn send(&self, request: &AnthropicRequest) -> Result<AnthropicResponse, ModelError> {
        let mut builder = self
            .client
            .post(self.config.endpoint("messages"))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");
        if let Some(key) = &self.config.api_key {
            builder = builder.header("x-api-key", key);
        }

        let response = builder.json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }

        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        debug!(
            "Anthropic response: {} content blocks, stop_reason={:?}",
            parsed.content.len(),
            parsed.stop_reason
        );
        Ok(parsed)
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let request = self.build_request(request, Vec::new(), None);
        let response = self.send(&request).await?;

        let text: String = response
            .content
            .iter()
            .filter(|c| c.content_type == "text")
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(text)
    }

    /// Structured output through a forced tool call whose input schema is `schema`
    async fn complete_structured(
        &self,
        request: CompletionRequest,
        schema: &StructuredSchema,
    ) -> Result<Value, ModelError> {
        let tool = Tool {
            name: schema.name.clone(),
            description: schema.description.clone(),
            input_schema: schema.schema.clone(),
        };
        let choice = ToolChoice {
            choice_type: "tool".to_string(),
            name: schema.name.clone(),
        };
        let request = self.build_request(request, vec![tool], Some(choice));
        let response = self.send(&request).await?;

        response
            .content
            .into_iter()
            .find(|c| c.content_type == "tool_use" && c.name.as_deref() == Some(schema.name.as_str()))
            .and_then(|c| c.input)
            .ok_or_else(|| ModelError::Malformed("no tool_use block in response".to_string()))
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ContentPart {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ToolChoice {
    #[serde(rename = "type")]
    choice_type: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

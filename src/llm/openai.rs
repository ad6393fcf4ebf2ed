use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::client::{
    CompletionRequest, ModelClient, ModelError, StructuredSchema, parse_json_payload,
};
use super::config::{ModelConfig, ModelProvider};

/// Chat-completions client for OpenAI and self-hosted OpenAI-compatible servers.
///
/// Hosted OpenAI gets native `json_schema` structured output. Local servers
/// only get `json_object` mode, so the schema is appended to the system prompt
/// and the reply is parsed leniently.
pub struct OpenAiClient {
    client: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(client: Client, config: ModelConfig) -> Self {
        Self { client, config }
    }

    fn build_request(&self, request: CompletionRequest, response_format: Option<Value>) -> ChatRequest {
        let mut messages = Vec::new();
        if let Some(system) = request.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system),
            });
        }

        let user = if request.images.is_empty() {
            MessageContent::Text(request.user)
        } else {
            let mut parts = vec![ContentPart::Text { text: request.user }];
            parts.extend(request.images.iter().map(|image| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image.data_url(),
                },
            }));
            MessageContent::Parts(parts)
        };
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user,
        });

        ChatRequest {
            model: self.config.model_name.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
            response_format,
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, ModelError> {
        let mut builder = self
            .client
            .post(self.config.endpoint("chat/completions"))
            .header("content-type", "application/json");
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;

        let choice = parsed.choices.into_iter().next().ok_or(ModelError::EmptyResponse)?;
        debug!("Chat completion finished: {:?}", choice.finish_reason);

        // Refusals come back as plain text
        match (choice.message.content, choice.message.refusal) {
            (Some(content), _) if !content.trim().is_empty() => Ok(content),
            (_, Some(refusal)) => Ok(refusal),
            _ => Err(ModelError::EmptyResponse),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn provider(&self) -> &str {
        self.config.provider.as_str()
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let request = self.build_request(request, None);
        self.send(&request).await
    }

    async fn complete_structured(
        &self,
        mut request: CompletionRequest,
        schema: &StructuredSchema,
    ) -> Result<Value, ModelError> {
        let response_format = match self.config.provider {
            ModelProvider::Local => {
                let instructions = format!(
                    "Respond with a single JSON object matching this JSON schema, and nothing else:\n{}",
                    schema.schema
                );
                request.system = Some(match request.system.take() {
                    Some(system) => format!("{system}\n\n{instructions}"),
                    None => instructions,
                });
                json!({"type": "json_object"})
            }
            _ => json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "description": schema.description,
                    "schema": schema.schema,
                }
            }),
        };

        let request = self.build_request(request, Some(response_format));
        let text = self.send(&request).await?;
        parse_json_payload(&text)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageInput;

    fn client(provider: ModelProvider) -> OpenAiClient {
        let base = (provider == ModelProvider::Local).then(|| "http://localhost:11434/v1".to_string());
        let config = ModelConfig::new(provider, "test-model", None, base).unwrap();
        OpenAiClient::new(Client::new(), config)
    }

    #[test]
    fn test_image_parts_use_data_urls() {
        let request = CompletionRequest::new("Transcribe")
            .with_image(ImageInput::from_bytes(b"abc", "image/png"));
        let body = serde_json::to_value(client(ModelProvider::OpenAi).build_request(request, None)).unwrap();

        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,YWJj");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn test_text_only_message_is_plain_string() {
        let request = CompletionRequest::new("hello").with_system("sys");
        let body = serde_json::to_value(client(ModelProvider::Local).build_request(request, None)).unwrap();
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["content"], "hello");
    }
}

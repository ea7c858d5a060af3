//! Anthropic Claude client.

use super::{build_http_client, CompletionRequest, LlmClient, LlmHttpConfig, MessageRole};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Anthropic Claude LLM client.
pub struct AnthropicClient {
    /// API key.
    api_key: Option<String>,
    /// API endpoint.
    endpoint: String,
    /// Model to use.
    model: String,
    /// HTTP client.
    client: reqwest::blocking::Client,
}

impl AnthropicClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.anthropic.com/v1";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "claude-3-5-haiku-20241022";

    /// Creates a new Anthropic client from the environment.
    #[must_use]
    pub fn new() -> Self {
        let api_key = std::env::var("ANTHROPIC_API_KEY").ok();
        Self {
            api_key,
            endpoint: Self::DEFAULT_ENDPOINT.to_string(),
            model: Self::DEFAULT_MODEL.to_string(),
            client: build_http_client(LlmHttpConfig::from_env()),
        }
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the API endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.api_key.is_none() {
            return Err(Error::op("anthropic_request", "ANTHROPIC_API_KEY not set"));
        }
        Ok(())
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.validate()?;
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::op("anthropic_request", "API key not configured"))?;

        // Anthropic takes the system prompt out-of-band.
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        let messages: Vec<WireMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| WireMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages,
        };

        let response = self
            .client
            .post(format!("{}/messages", self.endpoint))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .map_err(|e| Error::Transient {
                operation: "anthropic_request".to_string(),
                cause: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::Transient {
                operation: "anthropic_request".to_string(),
                cause: format!("API returned status: {status}"),
            });
        }
        if !status.is_success() {
            return Err(Error::op(
                "anthropic_request",
                format!("API returned status: {status}"),
            ));
        }

        let response: MessagesResponse = response
            .json()
            .map_err(|e| Error::op("anthropic_response", e))?;

        if response.stop_reason.as_deref() == Some("max_tokens") {
            return Err(Error::OutputTooLong);
        }

        response
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .map(|block| block.text)
            .ok_or_else(|| Error::op("anthropic_response", "No text content in response"))
    }
}

/// Request to the Messages API.
#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
}

/// A message in the conversation.
#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Response from the Messages API.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// A content block in the response.
#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = AnthropicClient::new();
        assert_eq!(client.name(), "anthropic");
        assert_eq!(client.model, AnthropicClient::DEFAULT_MODEL);
    }

    #[test]
    fn test_client_configuration() {
        let client = AnthropicClient::new()
            .with_api_key("test-key")
            .with_endpoint("https://custom.endpoint")
            .with_model("claude-sonnet-4-20250514");

        assert_eq!(client.api_key, Some("test-key".to_string()));
        assert_eq!(client.endpoint, "https://custom.endpoint");
        assert_eq!(client.model, "claude-sonnet-4-20250514");
    }

    #[test]
    fn test_validate_no_key() {
        let client = AnthropicClient {
            api_key: None,
            endpoint: AnthropicClient::DEFAULT_ENDPOINT.to_string(),
            model: AnthropicClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        assert!(client.validate().is_err());
    }
}

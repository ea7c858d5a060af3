//! `OpenAI`-compatible chat completion client.
//!
//! Works against the official API and any compatible endpoint (set
//! `OPENAI_BASE_URL`).

use super::{build_http_client, CompletionRequest, LlmClient, LlmHttpConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// `OpenAI`-compatible LLM client.
pub struct OpenAiClient {
    api_key: Option<String>,
    endpoint: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OpenAiClient {
    /// Default API endpoint.
    pub const DEFAULT_ENDPOINT: &'static str = "https://api.openai.com/v1";

    /// Default model.
    pub const DEFAULT_MODEL: &'static str = "gpt-4o-mini";

    /// Creates a new client from the environment.
    #[must_use]
    pub fn new() -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let endpoint = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| Self::DEFAULT_ENDPOINT.to_string());
        Self {
            api_key,
            endpoint,
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
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for OpenAiClient {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| Error::op("openai_request", "OPENAI_API_KEY not set"))?;

        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .map_err(|e| Error::Transient {
                operation: "openai_request".to_string(),
                cause: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::Transient {
                operation: "openai_request".to_string(),
                cause: format!("API returned status: {status}"),
            });
        }
        if !status.is_success() {
            return Err(Error::op(
                "openai_request",
                format!("API returned status: {status}"),
            ));
        }

        let response: ChatResponse = response
            .json()
            .map_err(|e| Error::op("openai_response", e))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::op("openai_response", "No choices in response"))?;

        if choice.finish_reason.as_deref() == Some("length") {
            return Err(Error::OutputTooLong);
        }

        Ok(choice.message.content)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
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
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = OpenAiClient::new().with_model("gpt-4o");
        assert_eq!(client.name(), "openai");
        assert_eq!(client.model, "gpt-4o");
    }

    #[test]
    fn test_missing_key_fails() {
        let client = OpenAiClient {
            api_key: None,
            endpoint: OpenAiClient::DEFAULT_ENDPOINT.to_string(),
            model: OpenAiClient::DEFAULT_MODEL.to_string(),
            client: reqwest::blocking::Client::new(),
        };
        let result = client.complete(&CompletionRequest::user("hi"));
        assert!(result.is_err());
    }
}

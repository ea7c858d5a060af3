//! LLM client abstraction.
//!
//! Provides a unified typed interface into an external chat/completion
//! provider. The engine uses it for fact extraction, entity disambiguation,
//! consolidation routing, and the reflect agent loop.
//!
//! # Supported Providers
//!
//! | Provider | Client | Environment Variables |
//! |----------|--------|----------------------|
//! | Anthropic | [`AnthropicClient`] | `ANTHROPIC_API_KEY` |
//! | `OpenAI`-compatible | [`OpenAiClient`] | `OPENAI_API_KEY`, `OPENAI_BASE_URL` |
//!
//! # Error contract
//!
//! - Hitting the provider's output-length cap maps to
//!   [`crate::Error::OutputTooLong`]; the retain pipeline reacts by halving
//!   the offending chunk. Never retried here.
//! - Rate limits and network failures map to [`crate::Error::Transient`]
//!   and are retried with exponential backoff by [`ResilientLlmClient`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use engram::llm::{AnthropicClient, CompletionRequest, LlmClient, ResilientLlmClient};
//!
//! let client = ResilientLlmClient::new(AnthropicClient::new(), Default::default());
//! let text = client.complete(&CompletionRequest::user("Summarize this.").with_scope("demo"))?;
//! ```

mod anthropic;
mod openai;
mod resilience;
pub mod schema;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use resilience::{LlmResilienceConfig, ResilientLlmClient};
pub use schema::{complete_structured, validate_against_schema};

use crate::Result;
use std::time::Duration;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// System instructions.
    System,
    /// User turn.
    User,
    /// Assistant turn.
    Assistant,
}

impl MessageRole {
    /// Wire label shared by the supported providers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Message role.
    pub role: MessageRole,
    /// Message content.
    pub content: String,
}

impl ChatMessage {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A typed completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation messages, system first.
    pub messages: Vec<ChatMessage>,
    /// Opaque label used for telemetry and per-scope defaults.
    pub scope: &'static str,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token cap.
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Creates a request with a single user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(content)],
            scope: "default",
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Creates a request from a full message list.
    #[must_use]
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            scope: "default",
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Sets the telemetry scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: &'static str) -> Self {
        self.scope = scope;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the output token cap.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Trait for LLM providers.
pub trait LlmClient: Send + Sync {
    /// The provider name.
    fn name(&self) -> &'static str;

    /// Generates a completion for the given request.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::OutputTooLong`] when the output cap was hit
    /// - [`crate::Error::Transient`] for retryable provider failures
    /// - [`crate::Error::OperationFailed`] otherwise
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

impl<T: LlmClient + ?Sized> LlmClient for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request)
    }
}

/// HTTP client configuration for LLM providers.
#[derive(Debug, Clone, Copy)]
pub struct LlmHttpConfig {
    /// Request timeout in milliseconds (0 to disable).
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds (0 to disable).
    pub connect_timeout_ms: u64,
}

impl Default for LlmHttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl LlmHttpConfig {
    /// Loads HTTP configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(timeout_ms) = std::env::var("ENGRAM_LLM_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.timeout_ms = timeout_ms;
        }
        if let Some(connect_timeout_ms) = std::env::var("ENGRAM_LLM_CONNECT_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.connect_timeout_ms = connect_timeout_ms;
        }
        config
    }
}

/// Builds a blocking HTTP client for LLM requests with configured timeouts.
#[must_use]
pub fn build_http_client(config: LlmHttpConfig) -> reqwest::blocking::Client {
    let mut builder = reqwest::blocking::Client::builder();
    if config.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(config.timeout_ms));
    }
    if config.connect_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }

    builder.build().unwrap_or_else(|err| {
        tracing::warn!("Failed to build LLM HTTP client: {err}");
        reqwest::blocking::Client::new()
    })
}

/// Extracts JSON from an LLM response, handling markdown code blocks.
///
/// # Handling
///
/// 1. Markdown code blocks with `json` language marker
/// 2. Markdown code blocks without language marker
/// 3. Raw JSON objects (first `{` to last `}`)
/// 4. JSON arrays (first `[` to last `]`)
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    // Handle ```json ... ``` blocks
    if let Some((json_start, end)) = trimmed.find("```json").and_then(|start| {
        let json_start = start + 7;
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    // Handle ``` ... ``` blocks (without json marker)
    if let Some((json_start, end)) = trimmed.find("```").and_then(|start| {
        let content_start = start + 3;
        let after_marker = &trimmed[content_start..];
        let json_start = after_marker
            .find(['{', '['])
            .map_or(content_start, |pos| content_start + pos);
        trimmed[json_start..]
            .find("```")
            .map(|end| (json_start, end))
    }) {
        return trimmed[json_start..json_start + end].trim();
    }

    // Handle raw JSON (find first { to last })
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        return &trimmed[start..=end];
    }

    // Handle JSON array
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        return &trimmed[start..=end];
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_raw() {
        let response = r#"{"key": "value"}"#;
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_markdown() {
        let response = "```json\n{\"key\": \"value\"}\n```";
        assert!(extract_json_from_response(response).contains("\"key\""));
    }

    #[test]
    fn test_extract_json_with_prefix() {
        let response = "Here is the result: {\"key\": \"value\"} hope this helps";
        assert_eq!(extract_json_from_response(response), r#"{"key": "value"}"#);
    }

    #[test]
    fn test_extract_json_array() {
        let response = r#"["a", "b"]"#;
        assert_eq!(extract_json_from_response(response), r#"["a", "b"]"#);
    }

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::user("hello")
            .with_scope("extraction")
            .with_max_tokens(128);
        assert_eq!(request.scope, "extraction");
        assert_eq!(request.max_tokens, 128);
        assert_eq!(request.messages.len(), 1);
    }
}

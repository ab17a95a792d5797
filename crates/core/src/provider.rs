//! Completion interface: the abstraction over model backends.
//!
//! The runtime hands a provider a token-budgeted payload plus the tool
//! schemas currently allowed, and gets back text and tool calls. Provider
//! identity never influences orchestration; only the capability descriptor
//! is consulted.

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A request for one completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The payload, system prompt first
    pub messages: Vec<Message>,

    /// Tools the model may call; empty for reasoning-only calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Only set when the provider advertises temperature support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// Build a request shaped by the provider's capability descriptor.
    pub fn shaped(
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        capabilities: &Capabilities,
        temperature: f32,
    ) -> Self {
        Self {
            messages,
            tools,
            temperature: capabilities.supports_temperature.then_some(temperature),
            max_tokens: capabilities.max_output_tokens,
        }
    }
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    /// Assistant text (may be empty when only tool calls are issued)
    pub text: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(text: impl Into<String>, tool_calls: Vec<MessageToolCall>) -> Self {
        Self {
            text: text.into(),
            tool_calls,
            usage: None,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// What a provider can do, as far as the orchestrator cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_temperature: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Free-form capability tags ("tools", "vision", "reasoning", ...)
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Capabilities {
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_temperature: true,
            max_output_tokens: None,
            capabilities: vec!["tools".to_string()],
        }
    }
}

/// A single chunk in a streaming completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Tool calls, delivered complete
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The completion interface every model backend implements.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// A human-readable name, used only for logging.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Send a request and get a complete response.
    async fn complete(&self, request: CompletionRequest) -> std::result::Result<Completion, ProviderError>;

    /// Send a request and get a stream of response chunks.
    ///
    /// Default implementation calls `complete()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let completion = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(completion.text),
                tool_calls: completion.tool_calls,
                done: true,
                usage: completion.usage,
            }))
            .await;
        Ok(rx)
    }
}

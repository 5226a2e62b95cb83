//! Streaming provider contract.
//!
//! A [`Provider`] adapts one language-model backend into a lazy sequence of
//! [`ProviderEvent`]s. Concrete adapters (Anthropic-style, OpenAI-style, …)
//! live outside the core; the turn loop only depends on this contract and on
//! the event ordering it guarantees:
//!
//! - each `ToolUseStart` is matched by exactly one `ToolUseStop`, with only
//!   `ToolUseDelta` fragments for that invocation in between; invocations
//!   are never interleaved;
//! - the stream terminates with either `Complete` or `Error`.

use crate::message::{Message, TokenUsage, ToolInvocation};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a provider stream (and therefore a run) finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Stop,
    Canceled,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Stop => "stop",
            Self::Canceled => "canceled",
            Self::Error => "error",
        }
    }
}

/// One event of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Partial internal reasoning text.
    ThinkingDelta { text: String },
    /// Partial user-visible text.
    ContentDelta { text: String },
    /// A new invocation opens.
    ToolUseStart { id: String, name: String },
    /// Appended input-JSON fragment for the currently open invocation.
    ToolUseDelta { input: String },
    /// Closes the currently open invocation.
    ToolUseStop,
    /// Terminal failure prior to `Complete`.
    Error { message: String },
    /// Final event: finish reason, the full invocation list, and usage.
    Complete {
        finish_reason: FinishReason,
        tool_calls: Vec<ToolInvocation>,
        usage: Option<TokenUsage>,
    },
}

/// Errors raised by provider adapters outside the event stream.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider stream failed: {0}")]
    Stream(String),

    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

/// Tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

/// Per-call options for [`Provider::stream`].
#[derive(Clone)]
pub struct StreamOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolSchema>,
    /// Cooperative cancellation; adapters should stop producing events once
    /// this is cancelled.
    pub cancellation: CancellationToken,
}

impl StreamOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            tools: Vec::new(),
            cancellation: CancellationToken::new(),
        }
    }
}

pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// A streaming source of partial model output.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn stream(
        &self,
        messages: Vec<Message>,
        options: StreamOptions,
    ) -> Result<ProviderStream, ProviderError>;
}

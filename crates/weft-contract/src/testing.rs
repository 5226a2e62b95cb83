//! Test doubles shared across the workspace's test suites.
//!
//! [`ScriptedProvider`] replays a fixed script of provider events per call,
//! which makes turn-loop behavior fully deterministic in tests.

use crate::message::Message;
use crate::provider::{
    FinishReason, Provider, ProviderError, ProviderEvent, ProviderStream, StreamOptions,
};
use crate::message::{TokenUsage, ToolInvocation};
use crate::tool::{Tool, ToolContext, ToolError, ToolOutput, ToolDescriptor};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A provider that replays one pre-scripted event sequence per `stream` call.
///
/// When the script runs out it completes immediately with `end_turn`, so a
/// loop under test can never spin.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<ProviderEvent>>>,
    /// Messages observed on each call, for assertions.
    pub calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new<I>(turns: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Vec<ProviderEvent>>,
    {
        Arc::new(Self {
            turns: Mutex::new(turns.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Script for a single plain text reply.
    pub fn text_reply(text: &str, usage: Option<TokenUsage>) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::ContentDelta {
                text: text.to_string(),
            },
            ProviderEvent::Complete {
                finish_reason: FinishReason::EndTurn,
                tool_calls: vec![],
                usage,
            },
        ]
    }

    /// Script for one streamed tool invocation (start/delta/stop/complete).
    pub fn tool_call_turn(id: &str, name: &str, input: &str) -> Vec<ProviderEvent> {
        vec![
            ProviderEvent::ToolUseStart {
                id: id.to_string(),
                name: name.to_string(),
            },
            ProviderEvent::ToolUseDelta {
                input: input.to_string(),
            },
            ProviderEvent::ToolUseStop,
            ProviderEvent::Complete {
                finish_reason: FinishReason::ToolUse,
                tool_calls: vec![ToolInvocation::new(id, name, input)],
                usage: Some(TokenUsage::new(10, 20)),
            },
        ]
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn stream(
        &self,
        messages: Vec<Message>,
        _options: StreamOptions,
    ) -> Result<ProviderStream, ProviderError> {
        self.calls.lock().expect("calls lock poisoned").push(messages);
        let events = self
            .turns
            .lock()
            .expect("turns lock poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                vec![ProviderEvent::Complete {
                    finish_reason: FinishReason::EndTurn,
                    tool_calls: vec![],
                    usage: None,
                }]
            });
        let events = events
            .into_iter()
            .map(Ok::<ProviderEvent, ProviderError>);
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// A provider that emits some events and then stalls until its cancellation
/// token fires, for cancellation-path tests.
pub struct StallingProvider {
    pub prefix: Vec<ProviderEvent>,
}

#[async_trait]
impl Provider for StallingProvider {
    async fn stream(
        &self,
        _messages: Vec<Message>,
        options: StreamOptions,
    ) -> Result<ProviderStream, ProviderError> {
        let prefix = self.prefix.clone();
        let token = options.cancellation.clone();
        Ok(Box::pin(async_stream::stream! {
            for event in prefix {
                yield Ok(event);
            }
            token.cancelled().await;
            yield Err(ProviderError::Stream("canceled upstream".to_string()));
        }))
    }
}

/// A provider whose stream fails after an optional prefix of events.
pub struct FailingProvider {
    pub prefix: Vec<ProviderEvent>,
    pub message: String,
}

#[async_trait]
impl Provider for FailingProvider {
    async fn stream(
        &self,
        _messages: Vec<Message>,
        _options: StreamOptions,
    ) -> Result<ProviderStream, ProviderError> {
        let prefix = self.prefix.clone();
        let message = self.message.clone();
        Ok(Box::pin(async_stream::stream! {
            for event in prefix {
                yield Ok(event);
            }
            yield Err(ProviderError::Stream(message));
        }))
    }
}

/// Tool that parses `{"text": …}` and echoes the text back.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echo the given text")
            .with_parameters(serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }))
            .with_required(["text"])
    }

    async fn execute(&self, input: &str, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let value: serde_json::Value = serde_json::from_str(input)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let text = value
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".to_string()))?;
        Ok(ToolOutput::success(text))
    }
}

//! Agent events emitted by the turn loop.

use crate::message::{Message, TokenUsage, ToolInvocation, ToolOutcome};
use crate::provider::FinishReason;
use serde::{Deserialize, Serialize};

/// One event of an agent run's stream.
///
/// Serializes as a `{"type": …, "data": …}` envelope for transport. Every
/// run's stream terminates with exactly one `Done`, including error and
/// cancellation paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial internal reasoning text.
    Thinking { text: String },
    /// Partial assistant text.
    Content { text: String },
    /// A tool invocation was fully reconstructed from the stream.
    ToolCall { invocation: ToolInvocation },
    /// One tool invocation finished (or was synthesized as an error).
    ToolResult { outcome: ToolOutcome },
    /// A complete message was appended to the session.
    Message { message: Message },
    /// A provider failure surfaced mid-run; followed by `Done`.
    Error { message: String },
    /// Terminal event.
    Done {
        reason: FinishReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Content { .. } => "content",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Message { .. } => "message",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Token usage carried by this event, if any.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            Self::Done { usage, .. } => *usage,
            Self::Message { message } => message.usage,
            _ => None,
        }
    }
}

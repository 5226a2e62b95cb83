//! Pure translation between the internal conversation model and the two
//! common provider wire shapes. No HTTP here — adapters own transport and
//! call into these codecs.
#![allow(missing_docs)]

pub mod anthropic;
pub mod openai;

use thiserror::Error;
use weft_contract::FinishReason;

#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("invalid wire message: {0}")]
    InvalidMessage(String),
}

/// Map a wire finish reason onto the internal taxonomy.
///
/// `stop`/`end_turn` → end turn, `tool_calls`/`tool_use` → tool use,
/// `length`/`max_tokens` → max tokens, anything else → end turn.
pub fn finish_reason_from_wire(reason: &str) -> FinishReason {
    match reason {
        "stop" | "end_turn" => FinishReason::EndTurn,
        "tool_calls" | "tool_use" => FinishReason::ToolUse,
        "length" | "max_tokens" => FinishReason::MaxTokens,
        _ => FinishReason::EndTurn,
    }
}

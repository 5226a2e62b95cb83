//! Reconstruction of complete assistant turns from interleaved provider
//! deltas.
//!
//! The collector accumulates text, the single currently-open tool invocation
//! (invocations are never interleaved on the wire), the ordered invocation
//! list, and the terminal finish reason + usage. `Complete` payloads are the
//! merge source for invocations a provider did not stream via the delta path
//! (dedupe by id).

use weft_contract::{FinishReason, ProviderEvent, TokenUsage, ToolInvocation};
use std::collections::HashSet;

/// Partial invocation being accumulated between start and stop.
#[derive(Debug, Clone)]
struct OpenInvocation {
    id: String,
    name: String,
    input: String,
}

/// What the loop should surface for one processed provider event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Thinking(String),
    Content(String),
    /// An invocation was finalized (stop seen, or merged from `Complete`).
    ToolCallReady(ToolInvocation),
    /// In-band provider failure; the turn is over.
    Errored(String),
    /// `Complete` was observed; no further events are expected.
    Completed,
}

/// Final state of one collected turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<TokenUsage>,
}

impl TurnResult {
    /// The loop re-enters tool execution only when invocations exist and the
    /// provider finished for that reason.
    pub fn needs_tools(&self) -> bool {
        !self.tool_calls.is_empty() && self.finish_reason == Some(FinishReason::ToolUse)
    }
}

#[derive(Debug, Default)]
pub struct StreamCollector {
    content: String,
    open: Option<OpenInvocation>,
    tool_calls: Vec<ToolInvocation>,
    seen_ids: HashSet<String>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    complete: bool,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one provider event into the turn; returns the signals the loop
    /// should emit for it (usually zero or one, several when a `Complete`
    /// payload carries unseen invocations).
    pub fn process(&mut self, event: ProviderEvent) -> Vec<StreamSignal> {
        match event {
            ProviderEvent::ThinkingDelta { text } => {
                if text.is_empty() {
                    vec![]
                } else {
                    vec![StreamSignal::Thinking(text)]
                }
            }
            ProviderEvent::ContentDelta { text } => {
                if text.is_empty() {
                    return vec![];
                }
                self.content.push_str(&text);
                vec![StreamSignal::Content(text)]
            }
            ProviderEvent::ToolUseStart { id, name } => {
                if let Some(dangling) = self.open.take() {
                    // Providers must stop before starting the next invocation;
                    // finalize the dangling one rather than lose it.
                    tracing::warn!(id = %dangling.id, "tool_use_start before matching stop");
                    self.finalize(dangling);
                }
                self.open = Some(OpenInvocation {
                    id,
                    name,
                    input: String::new(),
                });
                vec![]
            }
            ProviderEvent::ToolUseDelta { input } => {
                if let Some(open) = self.open.as_mut() {
                    open.input.push_str(&input);
                } else {
                    tracing::warn!("tool_use_delta with no open invocation");
                }
                vec![]
            }
            ProviderEvent::ToolUseStop => match self.open.take() {
                Some(open) => {
                    let invocation = self.finalize(open);
                    vec![StreamSignal::ToolCallReady(invocation)]
                }
                None => {
                    tracing::warn!("tool_use_stop with no open invocation");
                    vec![]
                }
            },
            ProviderEvent::Complete {
                finish_reason,
                tool_calls,
                usage,
            } => {
                self.finish_reason = Some(finish_reason);
                self.usage = usage;
                self.complete = true;
                let mut signals = Vec::new();
                for call in tool_calls {
                    if self.seen_ids.contains(&call.id) {
                        continue;
                    }
                    self.seen_ids.insert(call.id.clone());
                    self.tool_calls.push(call.clone());
                    signals.push(StreamSignal::ToolCallReady(call));
                }
                signals.push(StreamSignal::Completed);
                signals
            }
            ProviderEvent::Error { message } => vec![StreamSignal::Errored(message)],
        }
    }

    fn finalize(&mut self, open: OpenInvocation) -> ToolInvocation {
        let invocation = ToolInvocation::new(open.id, open.name, open.input);
        self.seen_ids.insert(invocation.id.clone());
        self.tool_calls.push(invocation.clone());
        invocation
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn finish(self) -> TurnResult {
        TurnResult {
            content: self.content,
            tool_calls: self.tool_calls,
            finish_reason: self.finish_reason,
            usage: self.usage,
        }
    }
}

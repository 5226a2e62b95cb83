//! The turn loop.
//!
//! [`Agent::run`] returns a cold, single-consumer event stream. One iteration
//! of the loop is a *turn*: stream the provider, reconstruct the assistant
//! message, then (when the model asked for tools) execute each invocation
//! sequentially and feed the outcomes back. The loop re-enters until the
//! provider stops asking for tools, the turn budget is exhausted, an error
//! surfaces, or the run is cancelled. Exactly one `Done` terminates every
//! stream.

use crate::runtime::run_context::{
    await_or_cancel, linked_token, CancelAware, RunCancellationToken,
};
use crate::runtime::streaming::{StreamCollector, StreamSignal};
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use weft_contract::{
    AgentEvent, FinishReason, ImageSource, Message, Provider, Session, StreamOptions, Tool,
    ToolContext, ToolOutcome,
};

/// Synchronous observer for every emitted event. Panics are swallowed.
pub type EventObserver = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

pub type AgentEventStream = Pin<Box<dyn Stream<Item = AgentEvent> + Send>>;

pub const DEFAULT_MAX_TURNS: usize = 50;

/// Static configuration of one agent.
#[derive(Clone)]
pub struct AgentConfig {
    pub name: String,
    pub model: String,
    pub provider: Arc<dyn Provider>,
    pub system_prompt: Option<String>,
    pub tools: HashMap<String, Arc<dyn Tool>>,
    pub max_turns: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub working_dir: Option<PathBuf>,
    /// Configuration-level observer, delivered every event of every run.
    pub observer: Option<EventObserver>,
}

impl AgentConfig {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            provider,
            system_prompt: None,
            tools: HashMap::new(),
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: None,
            temperature: None,
            working_dir: None,
            observer: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.descriptor().name, tool);
        self
    }

    pub fn with_tools<I>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Tool>>,
    {
        for tool in tools {
            self.tools.insert(tool.descriptor().name, tool);
        }
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Per-run input.
pub struct RunInput {
    pub prompt: String,
    pub images: Vec<ImageSource>,
    pub session: Option<Session>,
    pub cancellation: Option<RunCancellationToken>,
    /// Per-run observer, delivered alongside the configuration-level one.
    pub observer: Option<EventObserver>,
}

impl RunInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
            session: None,
            cancellation: None,
            observer: None,
        }
    }

    pub fn with_images(mut self, images: Vec<ImageSource>) -> Self {
        self.images = images;
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_cancellation(mut self, token: RunCancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_observer(mut self, observer: EventObserver) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// A configured unit driving turn loops against one provider and tool set.
pub struct Agent {
    config: AgentConfig,
    /// Internal cancellation tokens of in-flight runs, keyed by session id.
    active: Arc<Mutex<HashMap<String, RunCancellationToken>>>,
}

fn deliver(observers: &[EventObserver], event: &AgentEvent) {
    for observer in observers {
        if catch_unwind(AssertUnwindSafe(|| observer(event))).is_err() {
            tracing::warn!(kind = event.kind(), "event observer panicked; ignored");
        }
    }
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Trigger the internal cancellation token of the run bound to a session.
    pub fn cancel(&self, session_id: &str) -> bool {
        let active = self.active.lock().expect("active-run lock poisoned");
        match active.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drive one run. The returned stream is cold and single-consumer;
    /// dropping it early cancels the producer.
    pub fn run(&self, input: RunInput) -> AgentEventStream {
        let config = self.config.clone();
        let active = self.active.clone();

        Box::pin(stream! {
            let session = input.session.unwrap_or_default();
            let session_id = session.id();
            let internal = linked_token(input.cancellation.as_ref());
            active
                .lock()
                .expect("active-run lock poisoned")
                .insert(session_id.clone(), internal.clone());

            let mut observers: Vec<EventObserver> = Vec::new();
            if let Some(observer) = config.observer.clone() {
                observers.push(observer);
            }
            if let Some(observer) = input.observer {
                observers.push(observer);
            }

            macro_rules! emit {
                ($event:expr) => {{
                    let event = $event;
                    tracing::trace!(
                        agent = %config.name,
                        session = %session_id,
                        kind = event.kind(),
                        "emit agent event"
                    );
                    deliver(&observers, &event);
                    yield event;
                }};
            }

            macro_rules! finish_run {
                ($reason:expr, $usage:expr) => {{
                    active
                        .lock()
                        .expect("active-run lock poisoned")
                        .remove(&session_id);
                    emit!(AgentEvent::Done { reason: $reason, usage: $usage });
                    return;
                }};
            }

            session.add_message(Message::user(&input.prompt).with_images(input.images));
            tracing::debug!(agent = %config.name, session = %session_id, "run started");

            for _turn in 0..config.max_turns {
                if internal.is_cancelled() {
                    finish_run!(FinishReason::Canceled, None);
                }

                let schemas = config
                    .tools
                    .values()
                    .map(|t| t.descriptor().to_schema())
                    .collect();
                let options = StreamOptions {
                    model: config.model.clone(),
                    system_prompt: config.system_prompt.clone(),
                    max_tokens: config.max_tokens,
                    temperature: config.temperature,
                    tools: schemas,
                    cancellation: internal.clone(),
                };

                let mut provider_stream =
                    match await_or_cancel(&internal, config.provider.stream(session.messages(), options)).await {
                        CancelAware::Cancelled => finish_run!(FinishReason::Canceled, None),
                        CancelAware::Value(Ok(stream)) => stream,
                        CancelAware::Value(Err(e)) => {
                            if internal.is_cancelled() {
                                finish_run!(FinishReason::Canceled, None);
                            }
                            emit!(AgentEvent::Error { message: e.to_string() });
                            finish_run!(FinishReason::Error, None);
                        }
                    };

                let mut collector = StreamCollector::new();
                let mut stream_failed = false;
                loop {
                    let next = match await_or_cancel(&internal, provider_stream.next()).await {
                        CancelAware::Cancelled => finish_run!(FinishReason::Canceled, None),
                        CancelAware::Value(next) => next,
                    };
                    let Some(item) = next else { break };
                    match item {
                        Ok(event) => {
                            for signal in collector.process(event) {
                                match signal {
                                    StreamSignal::Thinking(text) => {
                                        emit!(AgentEvent::Thinking { text });
                                    }
                                    StreamSignal::Content(text) => {
                                        emit!(AgentEvent::Content { text });
                                    }
                                    StreamSignal::ToolCallReady(invocation) => {
                                        emit!(AgentEvent::ToolCall { invocation });
                                    }
                                    StreamSignal::Errored(message) => {
                                        if internal.is_cancelled() {
                                            finish_run!(FinishReason::Canceled, None);
                                        }
                                        emit!(AgentEvent::Error { message });
                                        stream_failed = true;
                                    }
                                    StreamSignal::Completed => {}
                                }
                            }
                            if stream_failed || collector.is_complete() {
                                break;
                            }
                        }
                        Err(e) => {
                            if internal.is_cancelled() {
                                finish_run!(FinishReason::Canceled, None);
                            }
                            emit!(AgentEvent::Error { message: e.to_string() });
                            stream_failed = true;
                            break;
                        }
                    }
                }

                if stream_failed {
                    finish_run!(FinishReason::Error, None);
                }

                let turn = collector.finish();
                let mut assistant = Message::assistant(&turn.content)
                    .with_model(&config.model)
                    .with_tool_calls(turn.tool_calls.clone());
                if let Some(usage) = turn.usage {
                    assistant = assistant.with_usage(usage);
                }
                session.add_message(assistant.clone());
                emit!(AgentEvent::Message { message: assistant });

                let finish_reason = turn.finish_reason.unwrap_or(FinishReason::EndTurn);
                if !turn.needs_tools() {
                    finish_run!(finish_reason, turn.usage);
                }

                // Sequential tool execution in source order.
                let mut outcomes = Vec::with_capacity(turn.tool_calls.len());
                for invocation in &turn.tool_calls {
                    let outcome = if internal.is_cancelled() {
                        ToolOutcome::error(&invocation.id, "Canceled")
                    } else {
                        match config.tools.get(&invocation.name) {
                            None => ToolOutcome::error(
                                &invocation.id,
                                format!("Unknown tool: {}", invocation.name),
                            ),
                            Some(tool) => {
                                let ctx = ToolContext {
                                    session_id: session_id.clone(),
                                    agent_name: config.name.clone(),
                                    cancellation: internal.clone(),
                                    working_dir: config.working_dir.clone(),
                                    call_id: invocation.id.clone(),
                                };
                                match tool.execute(&invocation.input, &ctx).await {
                                    Ok(output) => ToolOutcome {
                                        call_id: invocation.id.clone(),
                                        content: output.content,
                                        is_error: output.is_error,
                                        metadata: output.metadata,
                                    },
                                    Err(e) => ToolOutcome::error(&invocation.id, e.to_string()),
                                }
                            }
                        }
                    };
                    outcomes.push(outcome);
                }

                session.add_message(Message::tool(outcomes.clone()));
                for outcome in outcomes {
                    emit!(AgentEvent::ToolResult { outcome });
                }
            }

            finish_run!(FinishReason::MaxTokens, None);
        })
    }
}

#[cfg(test)]
mod tests;

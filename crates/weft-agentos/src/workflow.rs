//! Schema-driven workflow runner.
//!
//! A [`Workflow`] assembles the main agent from its schema (appending the
//! synthesized `delegate` tool when delegation is enabled), subscribes a
//! buffer to the run-scoped bus, and yields a multiplexed stream of
//! [`WorkflowEvent`]s: buffered sub-agent events are always drained before
//! the next main-agent event is yielded, so the merged stream approximates
//! firing order without reordering sub-agent events relative to each other.

use crate::delegation::{DelegateTool, DelegationConfig, DELEGATE_TOOL_NAME};
use crate::events::{
    usage_from_agent_event_value, WorkflowEmitter, WorkflowEvent, WorkflowEventKind,
    WorkflowResult, WorkflowStatus,
};
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use weft_agent_loop::{Agent, AgentConfig, RunCancellationToken, RunInput, DEFAULT_MAX_TURNS};
use weft_contract::{
    short_id, AgentEvent, EventBus, FinishReason, Provider, Role, Session, TokenUsage, Tool,
};
use weft_sandbox::{Sandbox, SandboxConfig};

const DELEGATION_GUIDANCE: &str = "\n\nYou can delegate work by calling the `delegate` tool \
with a sub-agent name and a task description. Delegated sub-agents run under your \
supervision and report their results back as the tool outcome.";

/// Main-agent portion of a workflow schema.
#[derive(Debug, Clone)]
pub struct MainAgentConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub temperature: Option<f32>,
}

impl MainAgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_turns: DEFAULT_MAX_TURNS,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
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
}

/// Admission request passed to the `on_spawn` hook.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub name: String,
    pub model: String,
    pub task: String,
}

/// Context handed to workflow lifecycle hooks.
#[derive(Clone)]
pub struct WorkflowContext {
    pub run_id: String,
    pub workflow_name: String,
    pub prompt: String,
    pub session: Session,
    pub bus: EventBus,
}

/// Lifecycle hooks. All methods default to no-ops; `on_spawn` defaults to
/// admitting every sub-agent.
#[async_trait]
pub trait WorkflowHooks: Send + Sync {
    async fn before_run(&self, _ctx: &WorkflowContext) {}

    async fn after_run(&self, _ctx: &WorkflowContext, _result: &WorkflowResult) {}

    async fn on_spawn(&self, _spawn: &SpawnRequest) -> bool {
        true
    }
}

/// Everything needed to run one workflow.
pub struct WorkflowSchema {
    pub name: String,
    pub description: String,
    pub agent: MainAgentConfig,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub default_provider: String,
    /// Shared tools handed to the main agent (and inherited by sub-agents
    /// unless delegation says otherwise).
    pub tools: Vec<Arc<dyn Tool>>,
    pub sandbox: Option<SandboxConfig>,
    pub delegation: DelegationConfig,
    pub hooks: Option<Arc<dyn WorkflowHooks>>,
}

impl WorkflowSchema {
    pub fn builder(name: impl Into<String>) -> WorkflowSchemaBuilder {
        WorkflowSchemaBuilder::new(name)
    }
}

pub struct WorkflowSchemaBuilder {
    name: String,
    description: String,
    agent: Option<MainAgentConfig>,
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: Option<String>,
    tools: Vec<Arc<dyn Tool>>,
    sandbox: Option<SandboxConfig>,
    delegation: DelegationConfig,
    hooks: Option<Arc<dyn WorkflowHooks>>,
}

impl WorkflowSchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agent: None,
            providers: HashMap::new(),
            default_provider: None,
            tools: Vec::new(),
            sandbox: None,
            delegation: DelegationConfig::default(),
            hooks: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn agent(mut self, agent: MainAgentConfig) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn provider(mut self, name: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        let name = name.into();
        if self.default_provider.is_none() {
            self.default_provider = Some(name.clone());
        }
        self.providers.insert(name, provider);
        self
    }

    pub fn default_provider(mut self, name: impl Into<String>) -> Self {
        self.default_provider = Some(name.into());
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn sandbox(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(config);
        self
    }

    pub fn delegation(mut self, config: DelegationConfig) -> Self {
        self.delegation = config;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn build(self) -> WorkflowSchema {
        WorkflowSchema {
            name: self.name,
            description: self.description,
            agent: self.agent.unwrap_or_else(|| MainAgentConfig::new("default")),
            providers: self.providers,
            default_provider: self.default_provider.unwrap_or_default(),
            tools: self.tools,
            sandbox: self.sandbox,
            delegation: self.delegation,
            hooks: self.hooks,
        }
    }
}

/// Per-run options.
#[derive(Default)]
pub struct WorkflowRunOptions {
    pub session: Option<Session>,
    pub cancellation: Option<RunCancellationToken>,
}

pub type WorkflowEventStream = Pin<Box<dyn Stream<Item = WorkflowEvent> + Send>>;

/// One workflow instance with its run-scoped bus and sandbox.
pub struct Workflow {
    run_id: String,
    schema: Arc<WorkflowSchema>,
    bus: EventBus,
    sandbox: Option<Arc<Sandbox>>,
}

fn bus_payload_to_event(
    emitter: &mut WorkflowEmitter,
    name: &str,
    data: Value,
) -> Option<WorkflowEvent> {
    let agent = data
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);
    match name {
        "agent:spawned" => Some(emitter.event(WorkflowEventKind::AgentSpawned, agent, data, None)),
        "agent:completed" => {
            Some(emitter.event(WorkflowEventKind::AgentCompleted, agent, data, None))
        }
        "agent:event" => {
            let event = data.get("event").cloned().unwrap_or(Value::Null);
            Some(emitter.event(WorkflowEventKind::AgentEvent, agent, event, None))
        }
        _ => None,
    }
}

impl Workflow {
    pub fn new(schema: Arc<WorkflowSchema>) -> Self {
        let sandbox = schema
            .sandbox
            .clone()
            .map(|config| Arc::new(Sandbox::new(config)));
        Self {
            run_id: short_id(),
            schema,
            bus: EventBus::new(),
            sandbox,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn schema(&self) -> &Arc<WorkflowSchema> {
        &self.schema
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn sandbox(&self) -> Option<&Arc<Sandbox>> {
        self.sandbox.as_ref()
    }

    /// Run the workflow. Yields a lazy event sequence whose final event
    /// carries the [`WorkflowResult`].
    pub fn run(
        &self,
        prompt: impl Into<String>,
        options: WorkflowRunOptions,
    ) -> WorkflowEventStream {
        let schema = self.schema.clone();
        let bus = self.bus.clone();
        let run_id = self.run_id.clone();
        let sandbox = self.sandbox.clone();
        let prompt: String = prompt.into();

        Box::pin(stream! {
            let started = std::time::Instant::now();
            let mut emitter = WorkflowEmitter::new(run_id.clone());
            let session = options.session.unwrap_or_default();

            tracing::debug!(run_id = %run_id, workflow = %schema.name, "workflow started");
            yield emitter.event(
                WorkflowEventKind::Started,
                None,
                json!({ "name": schema.name, "prompt": prompt }),
                None,
            );

            let ctx = WorkflowContext {
                run_id: run_id.clone(),
                workflow_name: schema.name.clone(),
                prompt: prompt.clone(),
                session: session.clone(),
                bus: bus.clone(),
            };
            if let Some(hooks) = schema.hooks.clone() {
                hooks.before_run(&ctx).await;
            }

            let Some(provider) = schema.providers.get(&schema.default_provider).cloned() else {
                let message = format!(
                    "Default provider '{}' not found",
                    schema.default_provider
                );
                tracing::warn!(run_id = %run_id, %message, "workflow configuration error");
                let result = WorkflowResult {
                    run_id: run_id.clone(),
                    status: WorkflowStatus::Error,
                    output: String::new(),
                    usage: TokenUsage::default(),
                    error: Some(message.clone()),
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                yield emitter.event(
                    WorkflowEventKind::Error,
                    None,
                    json!({ "message": message }),
                    Some(result),
                );
                return;
            };

            let mut tools: HashMap<String, Arc<dyn Tool>> = schema
                .tools
                .iter()
                .map(|tool| (tool.descriptor().name, tool.clone()))
                .collect();
            let mut system_prompt = schema.agent.system_prompt.clone().unwrap_or_default();
            if schema.delegation.enabled {
                let delegate = DelegateTool::new(schema.clone(), bus.clone(), tools.clone());
                tools.insert(DELEGATE_TOOL_NAME.to_string(), Arc::new(delegate));
                system_prompt.push_str(DELEGATION_GUIDANCE);
            }
            if let Some(sandbox) = &sandbox {
                system_prompt.push_str(&format!(
                    "\n\nYou operate inside a sandbox rooted at {}.",
                    sandbox.config().root_dir.display()
                ));
            }

            let main_name = format!("{}:main", schema.name);
            let mut agent_config =
                AgentConfig::new(&main_name, provider, schema.agent.model.clone())
                    .with_max_turns(schema.agent.max_turns);
            agent_config.tools = tools;
            agent_config.temperature = schema.agent.temperature;
            if !system_prompt.is_empty() {
                agent_config.system_prompt = Some(system_prompt);
            }
            let agent = Agent::new(agent_config);

            // Buffer sub-agent traffic from the bus; drained before each
            // main-agent event so merged order approximates firing order.
            let buffer: Arc<Mutex<VecDeque<(String, Value)>>> =
                Arc::new(Mutex::new(VecDeque::new()));
            let sink = buffer.clone();
            let _subscription = bus.on(
                "*",
                Arc::new(move |name: &str, data: &Value| {
                    if matches!(name, "agent:spawned" | "agent:event" | "agent:completed") {
                        sink.lock()
                            .expect("workflow buffer lock poisoned")
                            .push_back((name.to_string(), data.clone()));
                    }
                }),
            );

            let mut run_input = RunInput::new(prompt.clone()).with_session(session.clone());
            if let Some(token) = options.cancellation {
                run_input = run_input.with_cancellation(token);
            }
            let mut events = agent.run(run_input);

            let mut usage = TokenUsage::default();
            let mut output = String::new();

            macro_rules! drain_buffer {
                () => {{
                    let drained: Vec<(String, Value)> = buffer
                        .lock()
                        .expect("workflow buffer lock poisoned")
                        .drain(..)
                        .collect();
                    for (name, data) in drained {
                        if name == "agent:event" {
                            if let Some(event) = data.get("event") {
                                if let Some(u) = usage_from_agent_event_value(event) {
                                    usage = usage.merge(&u);
                                }
                            }
                        }
                        if let Some(event) = bus_payload_to_event(&mut emitter, &name, data) {
                            yield event;
                        }
                    }
                }};
            }

            while let Some(event) = events.next().await {
                drain_buffer!();

                if let AgentEvent::Message { message } = &event {
                    if message.role == Role::Assistant {
                        if let Some(u) = message.usage {
                            usage = usage.merge(&u);
                        }
                        if !message.content.is_empty() {
                            output = message.content.clone();
                        }
                    }
                }

                let done_reason = match &event {
                    AgentEvent::Done { reason, .. } => Some(*reason),
                    _ => None,
                };
                let data = serde_json::to_value(&event).unwrap_or(Value::Null);
                yield emitter.event(
                    WorkflowEventKind::AgentEvent,
                    Some(main_name.clone()),
                    data,
                    None,
                );

                if let Some(reason) = done_reason {
                    drain_buffer!();
                    let status = if reason == FinishReason::Canceled {
                        WorkflowStatus::Canceled
                    } else {
                        WorkflowStatus::Completed
                    };
                    let result = WorkflowResult {
                        run_id: run_id.clone(),
                        status,
                        output: output.clone(),
                        usage,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    };
                    if let Some(hooks) = schema.hooks.clone() {
                        hooks.after_run(&ctx, &result).await;
                    }
                    tracing::debug!(run_id = %run_id, status = ?status, "workflow finished");
                    yield emitter.event(
                        WorkflowEventKind::Completed,
                        None,
                        serde_json::to_value(&result).unwrap_or(Value::Null),
                        Some(result),
                    );
                    return;
                }
            }

            // The agent stream ended without its terminal event; surface it
            // as a workflow error rather than hanging the consumer.
            drain_buffer!();
            let message = "agent stream ended without a terminal event".to_string();
            let result = WorkflowResult {
                run_id: run_id.clone(),
                status: WorkflowStatus::Error,
                output: output.clone(),
                usage,
                error: Some(message.clone()),
                duration_ms: started.elapsed().as_millis() as u64,
            };
            yield emitter.event(
                WorkflowEventKind::Error,
                None,
                json!({ "message": message }),
                Some(result),
            );
        })
    }
}

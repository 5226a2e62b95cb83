//! Delegation tool factory.
//!
//! Each workflow synthesizes one `delegate` tool. Invoking it admits a
//! sub-agent through the concurrency cap, model allow list, provider map,
//! and `on_spawn` policy hook, then supervises its run while forwarding
//! every event onto the workflow bus. The sub-agent is a value owned by this
//! tool for the duration of the call; the bus reference flows parent →
//! child only.

use crate::workflow::{SpawnRequest, WorkflowSchema};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft_agent_loop::{Agent, AgentConfig, RunInput};
use weft_contract::{
    AgentEvent, EventBus, FinishReason, Role, Tool, ToolContext, ToolDescriptor, ToolError,
    ToolOutput,
};

pub const DELEGATE_TOOL_NAME: &str = "delegate";
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_MAX_TURNS_PER_AGENT: usize = 20;

/// How much sub-agent output the completion event carries.
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Delegation policy for one workflow schema.
#[derive(Clone)]
pub struct DelegationConfig {
    pub enabled: bool,
    /// Cap on concurrently active sub-agents.
    pub max_concurrent: usize,
    pub max_turns_per_agent: usize,
    /// When set, sub-agent models must appear here.
    pub allowed_models: Option<Vec<String>>,
    /// Hand the schema's shared tools to sub-agents.
    pub inherit_tools: bool,
    /// Extra tools only sub-agents receive.
    pub sub_agent_tools: Vec<Arc<dyn Tool>>,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_turns_per_agent: DEFAULT_MAX_TURNS_PER_AGENT,
            allowed_models: None,
            inherit_tools: true,
            sub_agent_tools: Vec::new(),
        }
    }
}

impl DelegationConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_turns_per_agent(mut self, max_turns: usize) -> Self {
        self.max_turns_per_agent = max_turns;
        self
    }

    pub fn with_allowed_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_inherit_tools(mut self, inherit: bool) -> Self {
        self.inherit_tools = inherit;
        self
    }

    pub fn with_sub_agent_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.sub_agent_tools.push(tool);
        self
    }
}

fn truncate_output(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn optional_string(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

enum SubAgentOutcome {
    Completed(String),
    Failed(String),
}

/// The synthesized `delegate` tool.
pub(crate) struct DelegateTool {
    schema: Arc<WorkflowSchema>,
    bus: EventBus,
    /// Tools sub-agents inherit (the schema's shared set, never `delegate`
    /// itself).
    inheritable: HashMap<String, Arc<dyn Tool>>,
    active: AtomicUsize,
}

impl DelegateTool {
    pub(crate) fn new(
        schema: Arc<WorkflowSchema>,
        bus: EventBus,
        inheritable: HashMap<String, Arc<dyn Tool>>,
    ) -> Self {
        Self {
            schema,
            bus,
            inheritable,
            active: AtomicUsize::new(0),
        }
    }

    async fn supervise(
        &self,
        name: &str,
        task: &str,
        model: String,
        provider: Arc<dyn weft_contract::Provider>,
        system_prompt: Option<String>,
        ctx: &ToolContext,
    ) -> SubAgentOutcome {
        let policy = &self.schema.delegation;
        let mut tools = if policy.inherit_tools {
            self.inheritable.clone()
        } else {
            HashMap::new()
        };
        for tool in &policy.sub_agent_tools {
            tools.insert(tool.descriptor().name, tool.clone());
        }

        let system_prompt = system_prompt.unwrap_or_else(|| {
            format!(
                "You are a focused sub-agent named '{name}'. Complete the assigned \
                 task and report the result concisely."
            )
        });
        let mut config = AgentConfig::new(name, provider, model)
            .with_system_prompt(system_prompt)
            .with_max_turns(policy.max_turns_per_agent);
        config.tools = tools;
        let agent = Agent::new(config);

        let mut stream =
            agent.run(RunInput::new(task).with_cancellation(ctx.cancellation.clone()));
        let mut last_content = String::new();
        let mut failure: Option<String> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::Message { message } = &event {
                if message.role == Role::Assistant && !message.content.is_empty() {
                    last_content = message.content.clone();
                }
            }
            if let AgentEvent::Error { message } = &event {
                failure = Some(message.clone());
            }
            let failed = matches!(
                &event,
                AgentEvent::Done {
                    reason: FinishReason::Error,
                    ..
                }
            );
            match serde_json::to_value(&event) {
                Ok(value) => self
                    .bus
                    .emit("agent:event", json!({ "name": name, "event": value })),
                Err(e) => return SubAgentOutcome::Failed(e.to_string()),
            }
            if failed {
                return SubAgentOutcome::Failed(
                    failure.unwrap_or_else(|| "run failed".to_string()),
                );
            }
        }

        SubAgentOutcome::Completed(last_content)
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            DELEGATE_TOOL_NAME,
            "Spawn a supervised sub-agent to work on a task and return its result",
        )
        .with_parameters(json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Short name for the sub-agent" },
                "task": { "type": "string", "description": "Task the sub-agent should complete" },
                "model": { "type": "string", "description": "Model override" },
                "provider": { "type": "string", "description": "Named provider to use" },
                "systemPrompt": { "type": "string", "description": "System prompt override" }
            }
        }))
        .with_required(["name", "task"])
    }

    async fn execute(&self, input: &str, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let args: Value = match serde_json::from_str(input) {
            Ok(value) => value,
            Err(e) => {
                return Ok(ToolOutput::error(format!("Invalid delegate arguments: {e}")));
            }
        };
        let Some(name) = optional_string(&args, "name") else {
            return Ok(ToolOutput::error("Missing required field 'name'"));
        };
        let Some(task) = optional_string(&args, "task") else {
            return Ok(ToolOutput::error("Missing required field 'task'"));
        };

        let policy = &self.schema.delegation;
        if self.active.load(Ordering::SeqCst) >= policy.max_concurrent {
            return Ok(ToolOutput::error(format!(
                "Delegation limit reached: {} sub-agents already active (max {})",
                self.active.load(Ordering::SeqCst),
                policy.max_concurrent
            )));
        }

        let model =
            optional_string(&args, "model").unwrap_or_else(|| self.schema.agent.model.clone());
        if let Some(allowed) = &policy.allowed_models {
            if !allowed.contains(&model) {
                return Ok(ToolOutput::error(format!(
                    "Model '{model}' is not allowed for sub-agents (allowed: {})",
                    allowed.join(", ")
                )));
            }
        }

        let provider_name = optional_string(&args, "provider")
            .unwrap_or_else(|| self.schema.default_provider.clone());
        let Some(provider) = self.schema.providers.get(&provider_name).cloned() else {
            let mut available: Vec<&str> =
                self.schema.providers.keys().map(String::as_str).collect();
            available.sort_unstable();
            return Ok(ToolOutput::error(format!(
                "Provider '{provider_name}' not found (available: {})",
                available.join(", ")
            )));
        };

        let spawn = SpawnRequest {
            name: name.clone(),
            model: model.clone(),
            task: task.clone(),
        };
        if let Some(hooks) = self.schema.hooks.clone() {
            if !hooks.on_spawn(&spawn).await {
                return Ok(ToolOutput::error("spawn blocked by workflow policy"));
            }
        }

        tracing::debug!(agent = %name, model = %model, "spawning sub-agent");
        self.bus.emit(
            "agent:spawned",
            json!({ "name": name, "model": model, "task": task }),
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .supervise(
                &name,
                &task,
                model,
                provider,
                optional_string(&args, "systemPrompt"),
                ctx,
            )
            .await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            SubAgentOutcome::Completed(output) => {
                self.bus.emit(
                    "agent:completed",
                    json!({
                        "name": name,
                        "output": truncate_output(&output, OUTPUT_PREVIEW_CHARS),
                    }),
                );
                Ok(ToolOutput::success(output))
            }
            SubAgentOutcome::Failed(message) => {
                Ok(ToolOutput::error(format!("Sub-agent error: {message}")))
            }
        }
    }
}

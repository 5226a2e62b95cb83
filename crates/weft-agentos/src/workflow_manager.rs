//! Run registry for workflow instances.
//!
//! The manager drives each workflow's event stream on a background task and
//! materializes a [`WorkflowRunInfo`] snapshot per run: a bounded ring
//! buffer of recent events, sub-agent bookkeeping in spawn order, and usage
//! aggregation over every observed agent message.

use crate::events::{
    usage_from_agent_event_value, WorkflowEvent, WorkflowEventKind, WorkflowResult, WorkflowStatus,
};
use crate::workflow::{Workflow, WorkflowRunOptions, WorkflowSchema};
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use weft_contract::{now_unix_millis, EventBus, TokenUsage};

/// Ring-buffer capacity for `recent_events`.
pub const RECENT_EVENTS_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Running,
    Completed,
    Error,
}

/// Bookkeeping for one spawned sub-agent.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentInfo {
    pub name: String,
    pub model: String,
    pub status: SubAgentStatus,
    pub spawned_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub task: String,
    /// Truncated to 200 chars.
    pub output: Option<String>,
    pub event_count: u64,
}

/// Frozen view of the schema's policy surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowPolicySnapshot {
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub providers: Vec<String>,
    pub default_provider: String,
    pub tools: Vec<String>,
    pub delegation_enabled: bool,
    pub max_concurrent: usize,
    pub sandbox_root: Option<String>,
}

impl WorkflowPolicySnapshot {
    fn from_schema(schema: &WorkflowSchema) -> Self {
        let mut providers: Vec<String> = schema.providers.keys().cloned().collect();
        providers.sort_unstable();
        Self {
            model: schema.agent.model.clone(),
            system_prompt: schema.agent.system_prompt.clone(),
            max_turns: schema.agent.max_turns,
            providers,
            default_provider: schema.default_provider.clone(),
            tools: schema
                .tools
                .iter()
                .map(|tool| tool.descriptor().name)
                .collect(),
            delegation_enabled: schema.delegation.enabled,
            max_concurrent: schema.delegation.max_concurrent,
            sandbox_root: schema
                .sandbox
                .as_ref()
                .map(|s| s.root_dir.display().to_string()),
        }
    }
}

/// Materialized snapshot of one workflow run.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowRunInfo {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub prompt: String,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub policy: WorkflowPolicySnapshot,
    /// In spawn order.
    pub agents: Vec<SubAgentInfo>,
    pub usage: TokenUsage,
    pub output: String,
    pub recent_events: VecDeque<WorkflowEvent>,
    pub result: Option<WorkflowResult>,
}

impl WorkflowRunInfo {
    fn new(id: String, name: String, prompt: String, policy: WorkflowPolicySnapshot) -> Self {
        Self {
            id,
            name,
            status: WorkflowStatus::Running,
            prompt,
            started_at_ms: now_unix_millis(),
            finished_at_ms: None,
            duration_ms: None,
            policy,
            agents: Vec::new(),
            usage: TokenUsage::default(),
            output: String::new(),
            recent_events: VecDeque::new(),
            result: None,
        }
    }

    /// Append to the bounded ring buffer, dropping the oldest entry past
    /// capacity.
    pub(crate) fn record_event(&mut self, event: WorkflowEvent) {
        if self.recent_events.len() >= RECENT_EVENTS_CAPACITY {
            self.recent_events.pop_front();
        }
        self.recent_events.push_back(event);
    }

    fn apply(&mut self, event: &WorkflowEvent) {
        self.record_event(event.clone());
        match event.kind {
            WorkflowEventKind::AgentSpawned => {
                self.agents.push(SubAgentInfo {
                    name: event
                        .agent
                        .clone()
                        .unwrap_or_else(|| "(unnamed)".to_string()),
                    model: event
                        .data
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: SubAgentStatus::Running,
                    spawned_at_ms: event.timestamp_ms,
                    completed_at_ms: None,
                    task: event
                        .data
                        .get("task")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    output: None,
                    event_count: 0,
                });
            }
            WorkflowEventKind::AgentCompleted => {
                if let Some(name) = event.agent.as_deref() {
                    if let Some(entry) = self
                        .agents
                        .iter_mut()
                        .rev()
                        .find(|a| a.name == name && a.status == SubAgentStatus::Running)
                    {
                        entry.status = SubAgentStatus::Completed;
                        entry.completed_at_ms = Some(event.timestamp_ms);
                        entry.output = event
                            .data
                            .get("output")
                            .and_then(Value::as_str)
                            .map(|s| s.chars().take(200).collect());
                    }
                }
            }
            WorkflowEventKind::AgentEvent => {
                if let Some(usage) = usage_from_agent_event_value(&event.data) {
                    self.usage = self.usage.merge(&usage);
                }
                if let Some(name) = event.agent.as_deref() {
                    if let Some(entry) = self
                        .agents
                        .iter_mut()
                        .rev()
                        .find(|a| a.name == name)
                    {
                        entry.event_count += 1;
                        let errored = event.data.get("type").and_then(Value::as_str)
                            == Some("done")
                            && event
                                .data
                                .get("data")
                                .and_then(|d| d.get("reason"))
                                .and_then(Value::as_str)
                                == Some("error");
                        if errored {
                            entry.status = SubAgentStatus::Error;
                        }
                    }
                }
            }
            WorkflowEventKind::Started => {}
            WorkflowEventKind::Completed | WorkflowEventKind::Error => {}
        }
        if let Some(result) = &event.result {
            self.status = result.status;
            self.finished_at_ms = Some(event.timestamp_ms);
            self.duration_ms = Some(result.duration_ms);
            self.output = result.output.clone();
            self.usage = result.usage;
            self.result = Some(result.clone());
        }
    }
}

struct WorkflowRunEntry {
    info: WorkflowRunInfo,
    #[allow(dead_code)]
    schema: Arc<WorkflowSchema>,
}

/// Shared handle over the workflow run registry.
#[derive(Clone, Default)]
pub struct WorkflowManager {
    runs: Arc<Mutex<HashMap<String, WorkflowRunEntry>>>,
    bus: EventBus,
}

impl WorkflowManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start a workflow run in the background and return its id.
    pub fn start_run(
        &self,
        schema: Arc<WorkflowSchema>,
        prompt: &str,
        options: WorkflowRunOptions,
    ) -> String {
        let workflow = Workflow::new(schema.clone());
        let run_id = workflow.run_id().to_string();

        let info = WorkflowRunInfo::new(
            run_id.clone(),
            schema.name.clone(),
            prompt.to_string(),
            WorkflowPolicySnapshot::from_schema(&schema),
        );
        self.runs
            .lock()
            .expect("workflow runs lock poisoned")
            .insert(
                run_id.clone(),
                WorkflowRunEntry {
                    info,
                    schema: schema.clone(),
                },
            );

        let manager = self.clone();
        let prompt = prompt.to_string();
        let run_id_bg = run_id.clone();
        tokio::spawn(async move {
            let mut events = workflow.run(prompt, options);
            while let Some(event) = events.next().await {
                {
                    let mut runs = manager.runs.lock().expect("workflow runs lock poisoned");
                    if let Some(entry) = runs.get_mut(&run_id_bg) {
                        entry.info.apply(&event);
                    }
                }
                manager.bus.emit(
                    event.kind.as_str(),
                    serde_json::to_value(&event).unwrap_or(Value::Null),
                );
            }
            tracing::debug!(run_id = %run_id_bg, "workflow run drained");
        });

        run_id
    }

    pub fn get_run(&self, run_id: &str) -> Option<WorkflowRunInfo> {
        self.runs
            .lock()
            .expect("workflow runs lock poisoned")
            .get(run_id)
            .map(|entry| entry.info.clone())
    }

    pub fn list_runs(&self, status: Option<WorkflowStatus>) -> Vec<WorkflowRunInfo> {
        let mut runs: Vec<WorkflowRunInfo> = self
            .runs
            .lock()
            .expect("workflow runs lock poisoned")
            .values()
            .filter(|entry| status.map_or(true, |s| entry.info.status == s))
            .map(|entry| entry.info.clone())
            .collect();
        runs.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms));
        runs
    }

    pub fn get_agents(&self, run_id: &str) -> Vec<SubAgentInfo> {
        self.get_run(run_id)
            .map(|info| info.agents)
            .unwrap_or_default()
    }

    /// Most recent events, newest last, optionally limited.
    pub fn get_events(&self, run_id: &str, limit: Option<usize>) -> Vec<WorkflowEvent> {
        let Some(info) = self.get_run(run_id) else {
            return Vec::new();
        };
        let events: Vec<WorkflowEvent> = info.recent_events.into_iter().collect();
        match limit {
            Some(limit) if limit < events.len() => {
                events[events.len() - limit..].to_vec()
            }
            _ => events,
        }
    }
}

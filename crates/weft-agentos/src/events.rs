//! Workflow event plane: the envelope yielded by a running workflow and the
//! terminal result it carries.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use weft_contract::{now_unix_millis, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Error,
    Canceled,
}

/// Terminal outcome of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: WorkflowStatus,
    /// Last assistant text of the main agent.
    pub output: String,
    /// Aggregated over every observed agent message carrying usage,
    /// sub-agents included.
    pub usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowEventKind {
    #[serde(rename = "workflow:started")]
    Started,
    #[serde(rename = "agent:spawned")]
    AgentSpawned,
    #[serde(rename = "agent:event")]
    AgentEvent,
    #[serde(rename = "agent:completed")]
    AgentCompleted,
    #[serde(rename = "workflow:completed")]
    Completed,
    #[serde(rename = "workflow:error")]
    Error,
}

impl WorkflowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "workflow:started",
            Self::AgentSpawned => "agent:spawned",
            Self::AgentEvent => "agent:event",
            Self::AgentCompleted => "agent:completed",
            Self::Completed => "workflow:completed",
            Self::Error => "workflow:error",
        }
    }
}

/// One event of a workflow run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub kind: WorkflowEventKind,
    pub run_id: String,
    /// Monotonically increasing per run.
    pub seq: u64,
    /// The agent this event belongs to, for `agent:*` kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkflowResult>,
    pub timestamp_ms: u64,
}

/// Per-run event factory keeping the sequence counter.
#[derive(Debug)]
pub(crate) struct WorkflowEmitter {
    run_id: String,
    seq: u64,
}

impl WorkflowEmitter {
    pub(crate) fn new(run_id: String) -> Self {
        Self { run_id, seq: 0 }
    }

    pub(crate) fn event(
        &mut self,
        kind: WorkflowEventKind,
        agent: Option<String>,
        data: Value,
        result: Option<WorkflowResult>,
    ) -> WorkflowEvent {
        self.seq += 1;
        tracing::trace!(
            run_id = %self.run_id,
            seq = self.seq,
            kind = kind.as_str(),
            "emit workflow event"
        );
        WorkflowEvent {
            kind,
            run_id: self.run_id.clone(),
            seq: self.seq,
            agent,
            data,
            result,
            timestamp_ms: now_unix_millis(),
        }
    }
}

/// Extract the usage carried by a serialized agent event, counting each
/// turn exactly once (`message` events only — `done` repeats the final
/// turn's usage).
pub fn usage_from_agent_event_value(value: &Value) -> Option<TokenUsage> {
    if value.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    let usage = value.get("data")?.get("message")?.get("usage")?;
    serde_json::from_value(usage.clone()).ok()
}

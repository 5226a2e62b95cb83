//! Registry of agents and their background runs.
//!
//! `start_run` launches the agent's stream on a background task, captures
//! every event into the run's `RunInfo`, forwards it on the manager bus, and
//! restores the agent to idle when the stream terminates — whatever the
//! terminal reason was. Concurrent `start_run` calls on one agent are not
//! rejected; the second run overwrites `current_run_id`, and callers are
//! expected to serialize.

use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use weft_agent_loop::{Agent, AgentConfig, RunInput};
use weft_contract::{now_unix_millis, short_id, AgentEvent, EventBus, FinishReason, Session, TokenUsage};
use weft_sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Error,
    Canceled,
}

/// Registry snapshot of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub model: String,
    pub status: AgentStatus,
    pub current_run_id: Option<String>,
    pub total_usage: TokenUsage,
    pub created_at_ms: u64,
    pub last_active_at_ms: u64,
}

/// Snapshot of one run, including its captured event sequence.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub prompt: String,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
    pub events: Vec<AgentEvent>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

struct AgentEntry {
    info: AgentInfo,
    agent: Arc<Agent>,
    session: Session,
    sandbox: Option<Arc<Sandbox>>,
}

#[derive(Default)]
struct ManagerState {
    agents: HashMap<String, AgentEntry>,
    runs: HashMap<String, RunInfo>,
}

/// Shared handle over the agent registry.
#[derive(Clone, Default)]
pub struct AgentManager {
    state: Arc<Mutex<ManagerState>>,
    bus: EventBus,
}

impl AgentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register an agent; emits `agent:registered`.
    pub fn register(&self, config: AgentConfig, sandbox: Option<Arc<Sandbox>>) -> String {
        let id = short_id();
        let now = now_unix_millis();
        let info = AgentInfo {
            id: id.clone(),
            name: config.name.clone(),
            model: config.model.clone(),
            status: AgentStatus::Idle,
            current_run_id: None,
            total_usage: TokenUsage::default(),
            created_at_ms: now,
            last_active_at_ms: now,
        };
        let entry = AgentEntry {
            info,
            agent: Arc::new(Agent::new(config)),
            session: Session::new(),
            sandbox,
        };
        let name = entry.info.name.clone();
        self.state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .insert(id.clone(), entry);
        self.bus
            .emit("agent:registered", json!({ "agent_id": id, "name": name }));
        id
    }

    /// Remove an agent; emits `agent:removed`. Existing run records stay
    /// queryable.
    pub fn remove(&self, agent_id: &str) -> bool {
        let removed = self
            .state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .remove(agent_id)
            .is_some();
        if removed {
            self.bus
                .emit("agent:removed", json!({ "agent_id": agent_id }));
        }
        removed
    }

    /// Launch a background run and return its id immediately.
    pub fn start_run(&self, agent_id: &str, prompt: &str) -> Result<String, ManagerError> {
        let run_id = short_id();
        let (agent, session) = {
            let mut state = self.state.lock().expect("manager state lock poisoned");
            let entry = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))?;
            entry.info.status = AgentStatus::Running;
            entry.info.current_run_id = Some(run_id.clone());
            let agent = entry.agent.clone();
            let session = entry.session.clone();
            state.runs.insert(
                run_id.clone(),
                RunInfo {
                    id: run_id.clone(),
                    agent_id: agent_id.to_string(),
                    status: RunStatus::Running,
                    prompt: prompt.to_string(),
                    started_at_ms: now_unix_millis(),
                    finished_at_ms: None,
                    events: Vec::new(),
                    usage: None,
                },
            );
            (agent, session)
        };

        let manager = self.clone();
        let agent_id = agent_id.to_string();
        let run_id_bg = run_id.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            manager
                .drive_run(agent, session, agent_id, run_id_bg, prompt)
                .await;
        });
        Ok(run_id)
    }

    async fn drive_run(
        &self,
        agent: Arc<Agent>,
        session: Session,
        agent_id: String,
        run_id: String,
        prompt: String,
    ) {
        let mut stream = agent.run(RunInput::new(prompt).with_session(session));
        let mut final_reason: Option<FinishReason> = None;
        let mut final_usage: Option<TokenUsage> = None;

        while let Some(event) = stream.next().await {
            if let AgentEvent::Done { reason, usage } = &event {
                final_reason = Some(*reason);
                final_usage = *usage;
            }
            {
                let mut state = self.state.lock().expect("manager state lock poisoned");
                if let Some(run) = state.runs.get_mut(&run_id) {
                    run.events.push(event.clone());
                }
            }
            self.bus.emit(
                "run:event",
                json!({
                    "run_id": run_id,
                    "agent_id": agent_id,
                    "event": serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                }),
            );
        }

        let status = {
            let mut state = self.state.lock().expect("manager state lock poisoned");
            let status = match final_reason {
                Some(FinishReason::Canceled) => RunStatus::Canceled,
                Some(FinishReason::Error) => RunStatus::Error,
                Some(_) => RunStatus::Completed,
                None => RunStatus::Error,
            };
            if let Some(run) = state.runs.get_mut(&run_id) {
                run.status = status;
                run.finished_at_ms = Some(now_unix_millis());
                run.usage = final_usage;
                if final_reason.is_none() {
                    run.events.push(AgentEvent::Error {
                        message: "run terminated without a done event".to_string(),
                    });
                }
            }
            if let Some(entry) = state.agents.get_mut(&agent_id) {
                if let Some(usage) = final_usage {
                    entry.info.total_usage = entry.info.total_usage.merge(&usage);
                }
                entry.info.status = AgentStatus::Idle;
                entry.info.current_run_id = None;
                entry.info.last_active_at_ms = now_unix_millis();
            }
            status
        };

        tracing::debug!(run_id = %run_id, agent_id = %agent_id, status = ?status, "run finished");
        self.bus.emit(
            "run:completed",
            json!({
                "run_id": run_id,
                "agent_id": agent_id,
                "status": serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
            }),
        );
        self.bus.emit(
            "agent:status",
            json!({ "agent_id": agent_id, "status": "idle" }),
        );
    }

    /// Signal the internal cancellation of the agent's current run.
    pub fn cancel_run(&self, agent_id: &str) -> bool {
        let (agent, session_id) = {
            let state = self.state.lock().expect("manager state lock poisoned");
            let Some(entry) = state.agents.get(agent_id) else {
                return false;
            };
            (entry.agent.clone(), entry.session.id())
        };
        agent.cancel(&session_id)
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .get(agent_id)
            .map(|entry| entry.info.clone())
    }

    pub fn list_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self
            .state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        agents.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        agents
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunInfo> {
        self.state
            .lock()
            .expect("manager state lock poisoned")
            .runs
            .get(run_id)
            .cloned()
    }

    pub fn list_runs(&self, agent_id: Option<&str>) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self
            .state
            .lock()
            .expect("manager state lock poisoned")
            .runs
            .values()
            .filter(|run| agent_id.map_or(true, |id| run.agent_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms));
        runs
    }

    pub fn get_session(&self, agent_id: &str) -> Option<Session> {
        self.state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .get(agent_id)
            .map(|entry| entry.session.clone())
    }

    pub fn get_sandbox(&self, agent_id: &str) -> Option<Arc<Sandbox>> {
        self.state
            .lock()
            .expect("manager state lock poisoned")
            .agents
            .get(agent_id)
            .and_then(|entry| entry.sandbox.clone())
    }
}

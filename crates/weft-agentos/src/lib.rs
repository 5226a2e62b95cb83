//! Workflow layer: composes agents into a dynamic tree with a bounded
//! delegation pool, a shared event plane, and snapshot-queryable run
//! registries.
#![allow(missing_docs)]

mod agent_manager;
mod delegation;
mod events;
mod workflow;
mod workflow_manager;

pub use agent_manager::{
    AgentInfo, AgentManager, AgentStatus, ManagerError, RunInfo, RunStatus,
};
pub use delegation::{
    DelegationConfig, DELEGATE_TOOL_NAME, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_TURNS_PER_AGENT,
};
pub use events::{
    usage_from_agent_event_value, WorkflowEvent, WorkflowEventKind, WorkflowResult, WorkflowStatus,
};
pub use workflow::{
    MainAgentConfig, SpawnRequest, Workflow, WorkflowContext, WorkflowEventStream, WorkflowHooks,
    WorkflowRunOptions, WorkflowSchema, WorkflowSchemaBuilder,
};
pub use workflow_manager::{
    SubAgentInfo, SubAgentStatus, WorkflowManager, WorkflowPolicySnapshot, WorkflowRunInfo,
    RECENT_EVENTS_CAPACITY,
};

#[cfg(test)]
mod tests;

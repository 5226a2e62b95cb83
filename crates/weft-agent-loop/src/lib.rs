//! The turn loop: a cancellable async generator that drives one agent run
//! against a streaming provider and a set of tools.
#![allow(missing_docs)]

pub use weft_contract as contracts;

pub mod runtime;

pub use runtime::agent_tool::AgentTool;
pub use runtime::loop_runner::{
    Agent, AgentConfig, AgentEventStream, EventObserver, RunInput, DEFAULT_MAX_TURNS,
};
pub use runtime::run_context::{await_or_cancel, is_cancelled, CancelAware, RunCancellationToken};
pub use runtime::streaming::{StreamCollector, StreamSignal, TurnResult};

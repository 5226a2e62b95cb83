//! Core contracts for the weft agent runtime.
//!
//! This crate defines the shared vocabulary every other weft crate speaks:
//! the conversation data model ([`Message`] and friends), the streaming
//! [`Provider`] contract, the [`Tool`] contract, the [`AgentEvent`] taxonomy
//! emitted by the turn loop, the append-only [`Session`] log, and the
//! in-process [`EventBus`].
//!
//! No I/O happens here. Provider SDK bindings, tool implementations, and
//! transport façades live outside the core and consume these contracts.
#![allow(missing_docs)]

pub mod bus;
pub mod event;
pub mod ids;
pub mod message;
pub mod provider;
pub mod session;
pub mod testing;
pub mod tool;

pub use bus::{EventBus, EventHandler, Subscription};
pub use event::AgentEvent;
pub use ids::short_id;
pub use message::{
    now_unix_millis, ImageSource, Message, Role, TokenUsage, ToolInvocation, ToolOutcome,
};
pub use provider::{
    FinishReason, Provider, ProviderError, ProviderEvent, ProviderStream, StreamOptions, ToolSchema,
};
pub use session::Session;
pub use tool::{tool_map, Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput, TypedTool};

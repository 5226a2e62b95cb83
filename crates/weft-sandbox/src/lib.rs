//! Advisory sandbox: a synchronous policy oracle over paths, commands, file
//! extensions, and network destinations, plus an asynchronous
//! permission-request rendezvous.
//!
//! The sandbox never enforces anything inside tool implementations — tools
//! opt in by consulting it before acting.
#![allow(missing_docs)]

mod permission;
mod policy;

pub use permission::{
    PermissionCounters, PermissionDecision, PermissionHandler, PermissionRecord,
    PermissionRequest, PermissionRequestOptions, SandboxStatus, PERMISSION_TIMEOUT_MS,
};
pub use policy::{
    CommandVerdict, NetworkPolicy, SandboxConfig, SandboxError, DEFAULT_BANNED_COMMANDS,
    DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_MAX_OUTPUT_LENGTH, DEFAULT_SAFE_READ_ONLY_COMMANDS,
};

pub use permission::Sandbox;

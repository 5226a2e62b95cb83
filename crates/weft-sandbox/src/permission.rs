//! Asynchronous permission rendezvous.
//!
//! `request_permission` parks the caller on a oneshot channel until an
//! external binding grants or denies the request, a matching persistent grant
//! short-circuits it, or the five-minute auto-deny fires. Double resolution
//! is a no-op: the pending entry is removed exactly once.

use crate::policy::{absolutize, SandboxConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use weft_contract::{now_unix_millis, short_id};

/// Requests auto-deny after five minutes.
pub const PERMISSION_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// How many decision records a status snapshot exposes.
const STATUS_DECISION_WINDOW: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool: String,
    pub action: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub requested_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted,
    Denied,
}

#[derive(Debug, Clone, Serialize)]
pub struct PermissionRecord {
    #[serde(flatten)]
    pub request: PermissionRequest,
    pub decision: PermissionDecision,
    pub decided_at_ms: u64,
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PermissionCounters {
    pub total_requests: u64,
    pub granted: u64,
    pub denied: u64,
    pub path_violations: u64,
    pub command_violations: u64,
}

/// Optional fields of a permission request.
#[derive(Debug, Clone, Default)]
pub struct PermissionRequestOptions {
    pub path: Option<String>,
    pub command: Option<String>,
}

/// Snapshot of the sandbox for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    pub config: SandboxConfig,
    pub pending: Vec<PermissionRequest>,
    pub recent_decisions: Vec<PermissionRecord>,
    pub counters: PermissionCounters,
}

/// External binding notified when a request is created.
pub type PermissionHandler = Arc<dyn Fn(&PermissionRequest) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct GrantMatcher {
    tool: String,
    action: String,
    path: Option<String>,
}

#[derive(Default)]
struct PermissionState {
    pending: HashMap<String, (PermissionRequest, oneshot::Sender<bool>)>,
    decisions: Vec<PermissionRecord>,
    grants: Vec<GrantMatcher>,
    counters: PermissionCounters,
}

/// Policy oracle plus permission rendezvous. See [`crate::policy`] for the
/// synchronous validation methods.
pub struct Sandbox {
    pub(crate) config: SandboxConfig,
    state: Mutex<PermissionState>,
    handler: RwLock<Option<PermissionHandler>>,
}

impl Sandbox {
    /// Build a sandbox; the root directory is absolutized and normalized.
    pub fn new(mut config: SandboxConfig) -> Self {
        config.root_dir = absolutize(&config.root_dir);
        Self {
            config,
            state: Mutex::new(PermissionState::default()),
            handler: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Bind the external handler invoked for each new request.
    pub fn set_permission_handler(&self, handler: PermissionHandler) {
        *self.handler.write().expect("handler lock poisoned") = Some(handler);
    }

    pub(crate) fn note_path_violation(&self) {
        self.state
            .lock()
            .expect("permission state lock poisoned")
            .counters
            .path_violations += 1;
    }

    pub(crate) fn note_command_violation(&self) {
        self.state
            .lock()
            .expect("permission state lock poisoned")
            .counters
            .command_violations += 1;
    }

    /// Ask for permission. Resolves `true` on grant, `false` on deny or
    /// after the five-minute auto-deny.
    pub async fn request_permission(
        &self,
        tool: impl Into<String>,
        action: impl Into<String>,
        description: impl Into<String>,
        options: PermissionRequestOptions,
    ) -> bool {
        let tool = tool.into();
        let action = action.into();

        let receiver = {
            let mut state = self.state.lock().expect("permission state lock poisoned");
            state.counters.total_requests += 1;

            if self.config.auto_approve {
                state.counters.granted += 1;
                return true;
            }

            let matched = state.grants.iter().any(|grant| {
                grant.tool == tool
                    && grant.action == action
                    && (grant.path.is_none() || grant.path == options.path)
            });
            if matched {
                state.counters.granted += 1;
                return true;
            }

            let request = PermissionRequest {
                id: short_id(),
                tool,
                action,
                description: description.into(),
                path: options.path,
                command: options.command,
                requested_at_ms: now_unix_millis(),
            };
            let (tx, rx) = oneshot::channel();
            state
                .pending
                .insert(request.id.clone(), (request.clone(), tx));
            drop(state);

            let handler = self.handler.read().expect("handler lock poisoned").clone();
            if let Some(handler) = handler {
                handler(&request);
            }
            (request.id, rx)
        };

        let (id, rx) = receiver;
        match tokio::time::timeout(Duration::from_millis(PERMISSION_TIMEOUT_MS), rx).await {
            Ok(Ok(granted)) => granted,
            Ok(Err(_closed)) => false,
            Err(_elapsed) => {
                tracing::warn!(request_id = %id, "permission request timed out; auto-denied");
                self.resolve(&id, false, false);
                false
            }
        }
    }

    fn resolve(&self, id: &str, granted: bool, persistent: bool) -> bool {
        let mut state = self.state.lock().expect("permission state lock poisoned");
        let Some((request, tx)) = state.pending.remove(id) else {
            return false;
        };
        let decision = if granted {
            state.counters.granted += 1;
            PermissionDecision::Granted
        } else {
            state.counters.denied += 1;
            PermissionDecision::Denied
        };
        if granted && persistent {
            state.grants.push(GrantMatcher {
                tool: request.tool.clone(),
                action: request.action.clone(),
                path: request.path.clone(),
            });
        }
        state.decisions.push(PermissionRecord {
            request,
            decision,
            decided_at_ms: now_unix_millis(),
            persistent: granted && persistent,
        });
        // A dropped receiver (timeout already fired) is fine.
        let _ = tx.send(granted);
        true
    }

    /// Resolve a pending request as granted; `persistent` also records a
    /// matcher so future `(tool, action, path)` requests skip the rendezvous.
    /// Returns false when the id is unknown or already resolved.
    pub fn grant_permission(&self, id: &str, persistent: bool) -> bool {
        self.resolve(id, true, persistent)
    }

    /// Resolve a pending request as denied.
    pub fn deny_permission(&self, id: &str) -> bool {
        self.resolve(id, false, false)
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.state
            .lock()
            .expect("permission state lock poisoned")
            .pending
            .values()
            .map(|(request, _)| request.clone())
            .collect()
    }

    pub fn status(&self) -> SandboxStatus {
        let state = self.state.lock().expect("permission state lock poisoned");
        let skip = state.decisions.len().saturating_sub(STATUS_DECISION_WINDOW);
        SandboxStatus {
            config: self.config.clone(),
            pending: state.pending.values().map(|(r, _)| r.clone()).collect(),
            recent_decisions: state.decisions[skip..].to_vec(),
            counters: state.counters,
        }
    }
}

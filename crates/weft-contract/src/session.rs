//! Append-only conversation log.
//!
//! A [`Session`] is a cheaply-cloneable handle to shared state: the turn loop
//! appends messages for its run while managers hold the same handle for
//! queries. Sessions outlive individual runs and are cleared only on explicit
//! request. A file-backed variant is an external collaborator; the in-memory
//! log here is the core's only session.

use crate::ids::short_id;
use crate::message::Message;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct SessionInner {
    id: String,
    messages: Vec<Message>,
    metadata: HashMap<String, Value>,
}

/// Shared append-only message log with an opaque identifier and free-form
/// metadata.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(short_id())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                id: id.into(),
                messages: Vec::new(),
                metadata: HashMap::new(),
            })),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().expect("session lock poisoned").id.clone()
    }

    pub fn add_message(&self, message: Message) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .messages
            .push(message);
    }

    /// Stable ordered snapshot of the log.
    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .messages
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session lock poisoned").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .messages
            .clear();
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .metadata
            .insert(key.into(), value);
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.inner
            .lock()
            .expect("session lock poisoned")
            .metadata
            .clone()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

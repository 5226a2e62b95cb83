//! Identifier generation.

use uuid::Uuid;

/// Opaque short identifier for runs, agents, sessions, and permission
/// requests: 12 URL-safe hex chars drawn from a v4 UUID.
pub fn short_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    full[..12].to_string()
}

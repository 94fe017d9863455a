//! Session key computation — the unit of single-writer enforcement.
//!
//! Canonical form: `{tenant}:{agent}:{interlocutor}:{channel}` with
//! lowercase UUIDs.  The same key is used for the session mutex, the
//! active-turn index, and as the tool idempotency prefix, so it must be
//! built in exactly one place.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Composite conversation identifier.
///
/// Equality is plain string equality; construction is deterministic, so
/// two workers computing the key for the same inbound message always
/// agree on which mutex to contend for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Build the canonical key from its four parts.
    pub fn new(tenant_id: Uuid, agent_id: Uuid, interlocutor_id: Uuid, channel: &str) -> Self {
        Self(format!("{tenant_id}:{agent_id}:{interlocutor_id}:{channel}"))
    }

    /// Wrap an already-canonical key (e.g. read back from a store).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The channel token (final `:`-separated segment).
    pub fn channel(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or("")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

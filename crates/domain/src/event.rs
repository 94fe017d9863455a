//! Fabric lifecycle events — the wire vocabulary for observability,
//! audit, and external integrations.
//!
//! These track infrastructure operations (turns, mutexes, tool
//! executions), not user-facing channel protocol events.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionKey;

/// Event types emitted by the fabric.
///
/// The wire token is `category.name` (`turn.started`, `mutex.extended`);
/// listener patterns match on the token, its category wildcard
/// (`turn.*`), or `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FabricEventType {
    // Turn lifecycle
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed,
    #[serde(rename = "turn.superseded")]
    TurnSuperseded,

    // Accumulation
    #[serde(rename = "message.absorbed")]
    MessageAbsorbed,

    // Supersede coordination
    #[serde(rename = "supersede.requested")]
    SupersedeRequested,
    #[serde(rename = "supersede.executed")]
    SupersedeExecuted,

    // Commit points
    #[serde(rename = "commit.point_reached")]
    CommitPointReached,

    // Tool execution (side effects)
    #[serde(rename = "tool.authorized")]
    ToolAuthorized,
    #[serde(rename = "tool.executed")]
    ToolExecuted,
    #[serde(rename = "tool.failed")]
    ToolFailed,

    // Session management
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.resumed")]
    SessionResumed,
    #[serde(rename = "session.closed")]
    SessionClosed,

    // Mutex operations
    #[serde(rename = "mutex.acquired")]
    MutexAcquired,
    #[serde(rename = "mutex.released")]
    MutexReleased,
    #[serde(rename = "mutex.extended")]
    MutexExtended,
}

impl FabricEventType {
    /// The wire token, e.g. `"turn.started"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnStarted => "turn.started",
            Self::TurnCompleted => "turn.completed",
            Self::TurnFailed => "turn.failed",
            Self::TurnSuperseded => "turn.superseded",
            Self::MessageAbsorbed => "message.absorbed",
            Self::SupersedeRequested => "supersede.requested",
            Self::SupersedeExecuted => "supersede.executed",
            Self::CommitPointReached => "commit.point_reached",
            Self::ToolAuthorized => "tool.authorized",
            Self::ToolExecuted => "tool.executed",
            Self::ToolFailed => "tool.failed",
            Self::SessionCreated => "session.created",
            Self::SessionResumed => "session.resumed",
            Self::SessionClosed => "session.closed",
            Self::MutexAcquired => "mutex.acquired",
            Self::MutexReleased => "mutex.released",
            Self::MutexExtended => "mutex.extended",
        }
    }

    /// The category prefix, e.g. `"turn"` for `turn.started`.
    pub fn category(self) -> &'static str {
        let token = self.as_str();
        &token[..token.find('.').unwrap_or(token.len())]
    }
}

impl fmt::Display for FabricEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event emitted by the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricEvent {
    #[serde(rename = "type")]
    pub event_type: FabricEventType,
    pub logical_turn_id: Uuid,
    pub session_key: SessionKey,
    pub timestamp: DateTime<Utc>,
    /// Event-type-specific payload.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,

    // Optional routing context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interlocutor_id: Option<Uuid>,
}

impl FabricEvent {
    pub fn new(event_type: FabricEventType, logical_turn_id: Uuid, session_key: SessionKey) -> Self {
        Self {
            event_type,
            logical_turn_id,
            session_key,
            timestamp: Utc::now(),
            payload: HashMap::new(),
            tenant_id: None,
            agent_id: None,
            interlocutor_id: None,
        }
    }

    /// Attach a payload entry (builder-style).
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }
}

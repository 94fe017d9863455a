//! Raw inbound message — the unit channel adapters hand to the fabric.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single message as delivered by a channel adapter, before any turn
/// processing.  Immutable after creation; the fabric only ever stores
/// the `message_id` on turns and passes the full record to the Brain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Channel-specific metadata (sender handle, platform message id, …).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RawMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

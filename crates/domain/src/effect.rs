//! Side-effect records — what a turn has already done to the world.
//!
//! The reversibility policy is what makes supersession safe: a turn that
//! has executed an irreversible effect is past its commit point and can
//! no longer be cancelled or absorb new input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reversibility classification of a side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectPolicy {
    /// Can be undone; safe to supersede.
    Reversible,
    /// Cannot be undone; new messages must queue as a fresh turn.
    Irreversible,
    /// Safe to re-execute; supersede allowed.
    Idempotent,
    /// Undoable via an explicit compensating action.
    Compensatable,
}

/// Record of one side effect executed during turn processing.
///
/// Created only while a turn is PROCESSING, appended atomically with
/// turn persistence, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideEffect {
    /// Kind of effect (`"tool_call"`, `"api_call"`, …).
    pub effect_type: String,
    pub policy: SideEffectPolicy,
    pub executed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Effect-specific data.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl SideEffect {
    pub fn irreversible(&self) -> bool {
        self.policy == SideEffectPolicy::Irreversible
    }
}

//! Supersede coordination — what happens when a new message arrives
//! while a turn is already in flight.
//!
//! The fabric owns the facts (has this turn executed irreversible
//! effects? can it still be cancelled?) while the Brain owns the
//! semantics (is the new message a correction, a clarification, or a
//! brand-new request?).  The coordinator bridges the two: the Brain
//! returns a decision, the coordinator enforces it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::{Error, Result};

use crate::turn::{LogicalTurn, LogicalTurnStatus};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Four-state supersede model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedeAction {
    /// Cancel the current turn, start a successor with the new message.
    Supersede,
    /// Add the message to the current turn, optionally replaying from a
    /// checkpoint.
    Absorb,
    /// Finish the current turn, then process the new message as a
    /// separate turn with a fresh idempotency scope.
    Queue,
    /// Current turn is almost done; finish it and drop the message
    /// (channel policy may redeliver).
    ForceComplete,
}

/// Full decision about how to handle a message that arrived mid-turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupersedeDecision {
    pub action: SupersedeAction,
    pub reason: String,
    /// How to merge the message when action is ABSORB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absorb_strategy: Option<String>,
    /// Replay from this phase when action is ABSORB; artifacts from
    /// this phase onward are discarded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_from_phase: Option<u32>,
}

impl SupersedeDecision {
    pub fn new(action: SupersedeAction, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
            absorb_strategy: None,
            restart_from_phase: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Enforces supersede decisions against the turn state machine.
#[derive(Debug, Clone, Default)]
pub struct SupersedeCoordinator;

impl SupersedeCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Whether the turn is still eligible for superseding.
    pub fn can_supersede(&self, turn: &LogicalTurn) -> bool {
        match turn.status {
            LogicalTurnStatus::Complete | LogicalTurnStatus::Superseded => false,
            LogicalTurnStatus::Accumulating => true,
            LogicalTurnStatus::Processing => {
                !turn.side_effects.iter().any(|se| se.irreversible())
            }
        }
    }

    /// The policy applied when the Brain is not supersede-capable:
    /// cancel cleanly while still possible, otherwise queue.
    pub fn default_decision(&self, turn: &LogicalTurn) -> SupersedeDecision {
        if self.can_supersede(turn) {
            SupersedeDecision::new(SupersedeAction::Supersede, "default_policy")
        } else {
            SupersedeDecision::new(SupersedeAction::Queue, "past_commit_point")
        }
    }

    /// Enforce a decision.  Returns the successor turn for SUPERSEDE;
    /// for every other action the current turn (possibly mutated in
    /// place for ABSORB) remains the active one and `None` is returned.
    pub fn enforce_decision(
        &self,
        decision: &SupersedeDecision,
        current_turn: &mut LogicalTurn,
        new_message_id: Uuid,
        new_message_ts: DateTime<Utc>,
    ) -> Result<Option<LogicalTurn>> {
        match decision.action {
            SupersedeAction::Supersede => {
                if !self.can_supersede(current_turn) {
                    return Err(Error::SupersedeRejected(format!(
                        "turn {} is not eligible ({:?})",
                        current_turn.id, current_turn.status
                    )));
                }
                Ok(Some(self.handle_supersede(
                    current_turn,
                    new_message_id,
                    new_message_ts,
                )?))
            }
            SupersedeAction::Absorb => {
                current_turn.absorb_message(new_message_id, new_message_ts)?;
                if let Some(phase) = decision.restart_from_phase {
                    // Drop artifacts from the restart phase onward so the
                    // Brain replays them with the merged input.
                    current_turn.phase_artifacts.retain(|&p, _| p < phase);
                }
                Ok(None)
            }
            // The caller is responsible for enqueueing (QUEUE) or
            // dropping (FORCE_COMPLETE) the message.
            SupersedeAction::Queue | SupersedeAction::ForceComplete => Ok(None),
        }
    }

    fn handle_supersede(
        &self,
        current_turn: &mut LogicalTurn,
        new_message_id: Uuid,
        new_message_ts: DateTime<Utc>,
    ) -> Result<LogicalTurn> {
        let successor_id = Uuid::new_v4();
        let interrupt_point = current_turn.interrupt_point.clone();
        current_turn.mark_superseded(successor_id, interrupt_point.as_deref())?;

        // The successor inherits turn_group_id so tools already executed
        // on the predecessor dedupe instead of re-running.  Side effects
        // stay on the predecessor; they are history, not state to copy.
        let successor = LogicalTurn {
            id: successor_id,
            session_key: current_turn.session_key.clone(),
            turn_group_id: current_turn.turn_group_id,
            messages: vec![new_message_id],
            status: LogicalTurnStatus::Accumulating,
            first_at: new_message_ts,
            last_at: new_message_ts,
            completion_reason: None,
            phase_artifacts: Default::default(),
            side_effects: Vec::new(),
            scenario_checkpoint: false,
            superseded_by: None,
            superseded_from: Some(current_turn.id),
            interrupt_point: None,
        };

        tracing::info!(
            predecessor = %current_turn.id,
            successor = %successor.id,
            turn_group = %successor.turn_group_id,
            "turn superseded"
        );

        Ok(successor)
    }
}

/// Build the idempotency key for a tool execution, scoped to the turn
/// group.  A supersede chain shares the group (one execution); a queued
/// next turn has a fresh group (re-execution allowed).
pub fn build_tool_idempotency_key(tool_name: &str, business_key: &str, turn: &LogicalTurn) -> String {
    format!("{tool_name}:{business_key}:turn_group:{}", turn.turn_group_id)
}

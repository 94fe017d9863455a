//! The LogicalTurn state machine — the atomic unit of user intent.
//!
//! Lifecycle: `ACCUMULATING → PROCESSING → COMPLETE | SUPERSEDED`.
//! Terminal states never transition again, and `PROCESSING` never goes
//! back to `ACCUMULATING`.  All mutation happens under the session
//! mutex; the methods here enforce the transition rules and return
//! `Error::TurnState` on anything illegal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::{Error, Result, SessionKey, SideEffect};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle states for a logical turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalTurnStatus {
    /// Waiting for more messages; can absorb new ones.
    Accumulating,
    /// The Brain is running; may still absorb if no commit point.
    Processing,
    /// Response sent successfully.
    Complete,
    /// Cancelled in favor of a newer turn.
    Superseded,
}

impl LogicalTurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Superseded)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase artifacts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cached output of one Brain phase, kept so an ABSORB can resume from
/// a checkpoint instead of replaying the whole turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseArtifact {
    pub phase_number: u32,
    pub phase_name: String,
    pub artifact_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogicalTurn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A conversational beat: one or more raw messages processed as a
/// single request.
///
/// `turn_group_id` is the idempotency scope: a supersede chain shares
/// it (a successor inherits it), while a queued next turn mints a fresh
/// one.  Tool idempotency keys embed it so tools already executed on a
/// superseded predecessor are not re-executed by the successor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalTurn {
    pub id: Uuid,
    pub session_key: SessionKey,
    pub turn_group_id: Uuid,

    /// Ordered message IDs, in admission order.
    pub messages: Vec<Uuid>,
    pub status: LogicalTurnStatus,

    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,

    /// Why accumulation ended (`timeout`, `no_accumulation`,
    /// `cannot_absorb`, `explicit`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_reason: Option<String>,

    /// Checkpoint cache, keyed by phase number.
    #[serde(default)]
    pub phase_artifacts: BTreeMap<u32, PhaseArtifact>,

    /// Side effects in execution order.
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,

    /// Set when a scenario step marks an explicit commit checkpoint.
    #[serde(default)]
    pub scenario_checkpoint: bool,

    // Supersede chain links
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_from: Option<Uuid>,
    /// Where in processing the turn was interrupted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupt_point: Option<String>,
}

impl LogicalTurn {
    /// Create a new turn from its first admitted message.
    pub fn new(session_key: SessionKey, first_message_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_key,
            turn_group_id: Uuid::new_v4(),
            messages: vec![first_message_id],
            status: LogicalTurnStatus::Accumulating,
            first_at: at,
            last_at: at,
            completion_reason: None,
            phase_artifacts: BTreeMap::new(),
            side_effects: Vec::new(),
            scenario_checkpoint: false,
            superseded_by: None,
            superseded_from: None,
            interrupt_point: None,
        }
    }

    /// Whether this turn can take another incoming message.
    ///
    /// Quick structural check; for PROCESSING turns the Brain still gets
    /// the final say via `decide_supersede`.
    pub fn can_absorb_message(&self) -> bool {
        match self.status {
            LogicalTurnStatus::Complete | LogicalTurnStatus::Superseded => false,
            // Absorbing during processing is only safe before the first
            // irreversible effect.
            LogicalTurnStatus::Processing => !self.side_effects.iter().any(|se| se.irreversible()),
            LogicalTurnStatus::Accumulating => true,
        }
    }

    /// Append a message to this turn and advance `last_at`.
    pub fn absorb_message(&mut self, message_id: Uuid, timestamp: DateTime<Utc>) -> Result<()> {
        if !self.can_absorb_message() {
            return Err(Error::TurnState(format!(
                "cannot absorb message in status {:?}",
                self.status
            )));
        }
        self.messages.push(message_id);
        self.last_at = timestamp;
        Ok(())
    }

    /// Transition ACCUMULATING → PROCESSING.
    pub fn mark_processing(&mut self, reason: &str) -> Result<()> {
        if self.status != LogicalTurnStatus::Accumulating {
            return Err(Error::TurnState(format!(
                "cannot start processing from status {:?}",
                self.status
            )));
        }
        self.status = LogicalTurnStatus::Processing;
        self.completion_reason = Some(reason.to_owned());
        Ok(())
    }

    /// Transition PROCESSING → COMPLETE.
    pub fn mark_complete(&mut self) -> Result<()> {
        if self.status != LogicalTurnStatus::Processing {
            return Err(Error::TurnState(format!(
                "cannot complete from status {:?}",
                self.status
            )));
        }
        self.status = LogicalTurnStatus::Complete;
        Ok(())
    }

    /// Mark this turn superseded by a successor.
    pub fn mark_superseded(&mut self, by_turn_id: Uuid, at_point: Option<&str>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::TurnState(format!(
                "cannot supersede terminal status {:?}",
                self.status
            )));
        }
        self.status = LogicalTurnStatus::Superseded;
        self.superseded_by = Some(by_turn_id);
        self.interrupt_point = at_point.map(str::to_owned);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use acf_domain::SideEffectPolicy;

    fn turn() -> LogicalTurn {
        LogicalTurn::new(
            SessionKey::from_raw("t:a:i:web"),
            Uuid::new_v4(),
            Utc::now(),
        )
    }

    fn effect(policy: SideEffectPolicy) -> SideEffect {
        SideEffect {
            effect_type: "tool_call".into(),
            policy,
            executed_at: Utc::now(),
            tool_name: Some("send_email".into()),
            idempotency_key: None,
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn new_turn_is_accumulating_with_one_message() {
        let t = turn();
        assert_eq!(t.status, LogicalTurnStatus::Accumulating);
        assert_eq!(t.messages.len(), 1);
        assert_eq!(t.first_at, t.last_at);
    }

    #[test]
    fn accumulating_always_absorbs() {
        let mut t = turn();
        assert!(t.can_absorb_message());
        let id = Uuid::new_v4();
        let later = Utc::now();
        t.absorb_message(id, later).unwrap();
        assert_eq!(t.messages.last(), Some(&id));
        assert_eq!(t.last_at, later);
    }

    #[test]
    fn messages_keep_admission_order() {
        let mut t = turn();
        let first = t.messages[0];
        let m2 = Uuid::new_v4();
        let m3 = Uuid::new_v4();
        t.absorb_message(m2, Utc::now()).unwrap();
        t.absorb_message(m3, Utc::now()).unwrap();
        assert_eq!(t.messages, vec![first, m2, m3]);
    }

    #[test]
    fn processing_absorbs_until_irreversible_effect() {
        let mut t = turn();
        t.mark_processing("timeout").unwrap();
        assert!(t.can_absorb_message());

        t.side_effects.push(effect(SideEffectPolicy::Reversible));
        t.side_effects.push(effect(SideEffectPolicy::Idempotent));
        assert!(t.can_absorb_message());

        t.side_effects.push(effect(SideEffectPolicy::Irreversible));
        assert!(!t.can_absorb_message());
        assert!(t.absorb_message(Uuid::new_v4(), Utc::now()).is_err());
    }

    #[test]
    fn terminal_states_never_absorb() {
        let mut complete = turn();
        complete.mark_processing("timeout").unwrap();
        complete.mark_complete().unwrap();
        assert!(!complete.can_absorb_message());

        let mut superseded = turn();
        superseded.mark_superseded(Uuid::new_v4(), None).unwrap();
        assert!(!superseded.can_absorb_message());
    }

    #[test]
    fn processing_records_completion_reason() {
        let mut t = turn();
        t.mark_processing("no_accumulation").unwrap();
        assert_eq!(t.status, LogicalTurnStatus::Processing);
        assert_eq!(t.completion_reason.as_deref(), Some("no_accumulation"));
    }

    #[test]
    fn forbidden_transitions_error() {
        // PROCESSING → ACCUMULATING does not exist; COMPLETE is final.
        let mut t = turn();
        t.mark_processing("timeout").unwrap();
        assert!(t.mark_processing("timeout").is_err());

        t.mark_complete().unwrap();
        assert!(t.mark_complete().is_err());
        assert!(t.mark_superseded(Uuid::new_v4(), None).is_err());

        // ACCUMULATING cannot complete without processing first.
        let mut fresh = turn();
        assert!(fresh.mark_complete().is_err());
    }

    #[test]
    fn superseded_links_are_set_together() {
        let mut t = turn();
        let successor = Uuid::new_v4();
        t.mark_superseded(successor, Some("phase_3")).unwrap();
        assert_eq!(t.status, LogicalTurnStatus::Superseded);
        assert_eq!(t.superseded_by, Some(successor));
        assert_eq!(t.interrupt_point.as_deref(), Some("phase_3"));
    }

    #[test]
    fn turn_serializes_round_trip() {
        let mut t = turn();
        t.mark_processing("timeout").unwrap();
        t.side_effects.push(effect(SideEffectPolicy::Irreversible));
        let json = serde_json::to_string(&t).unwrap();
        let back: LogicalTurn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, t.id);
        assert_eq!(back.status, t.status);
        assert_eq!(back.side_effects.len(), 1);
        assert!(!back.can_absorb_message());
    }
}

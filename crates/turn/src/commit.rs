//! Commit-point tracking — the fabric's answer to "are we past the
//! point of no return?".
//!
//! A commit point is reached when an irreversible side effect executes
//! or a scenario step marks an explicit checkpoint.  After that, new
//! messages must queue as a separate turn.

use chrono::Utc;

use acf_domain::config::ToolPolicyConfig;
use acf_domain::{Error, Result, SideEffect, SideEffectPolicy};

use crate::turn::LogicalTurn;

/// Tracks commit points and records side effects on turns.
///
/// `record_side_effect` must only be called while the caller holds the
/// session mutex for the turn's key; the append is linearized with turn
/// persistence.
#[derive(Debug, Clone)]
pub struct CommitPointTracker {
    tool_policies: ToolPolicyConfig,
}

impl CommitPointTracker {
    pub fn new(tool_policies: ToolPolicyConfig) -> Self {
        Self { tool_policies }
    }

    /// True once the turn can no longer be superseded.
    pub fn has_reached_commit_point(&self, turn: &LogicalTurn) -> bool {
        turn.scenario_checkpoint || turn.side_effects.iter().any(|se| se.irreversible())
    }

    /// Append a side effect to the turn.
    ///
    /// Fails only when the turn is terminal; in every other state the
    /// record must succeed so the effect is never lost.
    pub fn record_side_effect(
        &self,
        turn: &mut LogicalTurn,
        effect_type: &str,
        policy: SideEffectPolicy,
        tool_name: Option<&str>,
        idempotency_key: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> Result<SideEffect> {
        if turn.status.is_terminal() {
            return Err(Error::TurnTerminal(turn.id));
        }

        let effect = SideEffect {
            effect_type: effect_type.to_owned(),
            policy,
            executed_at: Utc::now(),
            tool_name: tool_name.map(str::to_owned),
            idempotency_key: idempotency_key.map(str::to_owned),
            details: details.unwrap_or(serde_json::Value::Null),
        };
        turn.side_effects.push(effect.clone());

        tracing::debug!(
            turn_id = %turn.id,
            tool_name = tool_name.unwrap_or(""),
            policy = ?policy,
            "side effect recorded"
        );

        Ok(effect)
    }

    /// Resolve a tool's default side-effect policy from configuration.
    pub fn classify_tool_policy(&self, tool_name: &str) -> SideEffectPolicy {
        self.tool_policies.policy_for(tool_name)
    }

    /// Convenience: record a tool execution with its configured policy.
    pub fn record_tool_execution(
        &self,
        turn: &mut LogicalTurn,
        tool_name: &str,
        idempotency_key: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> Result<SideEffect> {
        let policy = self.classify_tool_policy(tool_name);
        self.record_side_effect(
            turn,
            "tool_call",
            policy,
            Some(tool_name),
            idempotency_key,
            details,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use uuid::Uuid;

    use acf_domain::SessionKey;

    fn tracker() -> CommitPointTracker {
        CommitPointTracker::new(ToolPolicyConfig::default())
    }

    fn turn() -> LogicalTurn {
        let mut t = LogicalTurn::new(
            SessionKey::from_raw("t:a:i:web"),
            Uuid::new_v4(),
            Utc::now(),
        );
        t.mark_processing("timeout").unwrap();
        t
    }

    #[test]
    fn fresh_turn_has_no_commit_point() {
        let t = turn();
        assert!(!tracker().has_reached_commit_point(&t));
    }

    #[test]
    fn irreversible_effect_is_a_commit_point() {
        let tracker = tracker();
        let mut t = turn();

        tracker
            .record_side_effect(
                &mut t,
                "tool_call",
                SideEffectPolicy::Reversible,
                Some("draft_reply"),
                None,
                None,
            )
            .unwrap();
        assert!(!tracker.has_reached_commit_point(&t));

        tracker
            .record_tool_execution(&mut t, "send_email", Some("send_email:42"), None)
            .unwrap();
        assert!(tracker.has_reached_commit_point(&t));
        assert!(!t.can_absorb_message());
    }

    #[test]
    fn scenario_checkpoint_is_a_commit_point() {
        let mut t = turn();
        t.scenario_checkpoint = true;
        assert!(tracker().has_reached_commit_point(&t));
    }

    #[test]
    fn recording_on_terminal_turn_fails() {
        let tracker = tracker();
        let mut t = turn();
        t.mark_complete().unwrap();

        let err = tracker
            .record_side_effect(
                &mut t,
                "tool_call",
                SideEffectPolicy::Idempotent,
                Some("get_order"),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::TurnTerminal(_)));
        assert!(t.side_effects.is_empty());
    }

    #[test]
    fn effects_append_in_execution_order() {
        let tracker = tracker();
        let mut t = turn();
        for name in ["get_order", "validate_address", "send_email"] {
            tracker.record_tool_execution(&mut t, name, None, None).unwrap();
        }
        let names: Vec<_> = t
            .side_effects
            .iter()
            .map(|se| se.tool_name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["get_order", "validate_address", "send_email"]);
    }

    #[test]
    fn classification_comes_from_config() {
        let tracker = tracker();
        assert_eq!(
            tracker.classify_tool_policy("send_sms"),
            SideEffectPolicy::Irreversible
        );
        assert_eq!(
            tracker.classify_tool_policy("search_products"),
            SideEffectPolicy::Idempotent
        );
        assert_eq!(
            tracker.classify_tool_policy("unknown_tool"),
            SideEffectPolicy::Reversible
        );
    }
}

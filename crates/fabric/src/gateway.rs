//! Turn gateway — the admission layer every inbound message passes
//! through.
//!
//! The gateway answers one question: what should the channel adapter do
//! with this message?  Start a new workflow, signal the running one,
//! queue behind it, or reject it outright.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::{RawMessage, SessionKey};

use crate::index::ActiveTurnIndex;
use crate::ratelimit::{AdmissionRateLimiter, RateLimited};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Decision model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the adapter should do with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    /// Start a new workflow instance.
    TriggerNew,
    /// Post a `new_message` event to the running workflow.
    SignalExisting,
    /// Hold the message and redeliver after the current turn completes.
    Queue,
    /// Drop the message; `reason` says why.
    Reject,
}

/// Decision made by the gateway for one incoming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDecision {
    pub action: TurnAction,
    /// Target workflow (for SIGNAL_EXISTING).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Why, especially for REJECT.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TurnDecision {
    pub fn trigger_new() -> Self {
        Self {
            action: TurnAction::TriggerNew,
            workflow_id: None,
            reason: None,
        }
    }

    pub fn signal_existing(workflow_id: &str) -> Self {
        Self {
            action: TurnAction::SignalExisting,
            workflow_id: Some(workflow_id.to_owned()),
            reason: None,
        }
    }

    pub fn queue(reason: &str) -> Self {
        Self {
            action: TurnAction::Queue,
            workflow_id: None,
            reason: Some(reason.to_owned()),
        }
    }

    pub fn reject(reason: &str) -> Self {
        Self {
            action: TurnAction::Reject,
            workflow_id: None,
            reason: Some(reason.to_owned()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Message ingress: rate limit, index lookup, decision.
///
/// Register/deregister in the index are called by the workflow itself
/// during its steps, not by the gateway.
pub struct TurnGateway {
    index: Arc<ActiveTurnIndex>,
    limiter: Arc<AdmissionRateLimiter>,
}

impl TurnGateway {
    pub fn new(index: Arc<ActiveTurnIndex>, limiter: Arc<AdmissionRateLimiter>) -> Self {
        Self { index, limiter }
    }

    /// Entry point for all incoming messages from any channel.
    pub fn receive_message(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        channel: &str,
        interlocutor_id: Uuid,
        message: &RawMessage,
    ) -> TurnDecision {
        let session_key = SessionKey::new(tenant_id, agent_id, interlocutor_id, channel);

        tracing::info!(
            session_key = %session_key,
            message_id = %message.message_id,
            channel,
            "message received"
        );

        if let Err(RateLimited { tier, limit, .. }) =
            self.limiter.check_admission(&session_key, &tenant_id)
        {
            tracing::warn!(
                session_key = %session_key,
                ?tier,
                limit,
                "admission rate limit exceeded"
            );
            return TurnDecision::reject(RateLimited::REASON);
        }

        match self.index.lookup(&session_key) {
            // A draining workflow takes no more signals; the adapter
            // retains the message and redelivers after completion.
            Some(active) if active.draining => {
                tracing::debug!(
                    session_key = %session_key,
                    workflow_id = %active.workflow_id,
                    "active turn is draining; queueing message"
                );
                TurnDecision::queue("active_turn_draining")
            }
            Some(active) => {
                tracing::debug!(
                    session_key = %session_key,
                    workflow_id = %active.workflow_id,
                    "signaling existing workflow"
                );
                TurnDecision::signal_existing(&active.workflow_id)
            }
            None => {
                tracing::debug!(session_key = %session_key, "triggering new workflow");
                TurnDecision::trigger_new()
            }
        }
    }

    /// Register an active workflow for a session (called from workflow
    /// steps holding the session mutex).
    pub fn register_workflow(&self, session_key: &SessionKey, workflow_id: &str) {
        self.index.set(session_key, workflow_id, None);
    }

    /// Deregister when processing completes.
    pub fn unregister_workflow(&self, session_key: &SessionKey) {
        self.index.clear(session_key);
    }
}

//! The Brain contract — the seam between the fabric and whatever does
//! the thinking.
//!
//! The fabric is intentionally ignorant of *what* a Brain decides; it
//! only provides the turn, live queries, and an event channel, and
//! takes back a result.  The [`FabricTurnContext`] holds live callbacks
//! and is NOT serializable: the workflow rebuilds it at the start of
//! any step that needs it, so only data crosses durable boundaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use acf_domain::{FabricEvent, RawMessage, Result, SessionKey};
use acf_turn::{AccumulationHint, LogicalTurn, PhaseArtifact, SupersedeDecision};

use crate::mailbox::TurnMailbox;
use crate::router::EventRouter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Brain result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One piece of the response, in delivery order.  Channel adapters
/// handle platform-specific formatting; the fabric only carries these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSegment {
    pub content: String,
    /// Optional adapter hint (`"text"`, `"card"`, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ResponseSegment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: None,
        }
    }
}

/// What the Brain hands back at the end of a turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrainResult {
    pub response_segments: Vec<ResponseSegment>,
    /// Domain mutations to apply at commit (opaque to the fabric).
    #[serde(default)]
    pub staged_mutations: Vec<serde_json::Value>,
    /// Phase checkpoints to merge into the turn's artifact cache.
    #[serde(default)]
    pub artifacts: BTreeMap<u32, PhaseArtifact>,
    #[serde(default)]
    pub expects_more_input: bool,
    /// Escalation target when the Brain wants a human/another agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<String>,
    /// Bias for the next turn's accumulation window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulation_hint: Option<AccumulationHint>,
}

impl BrainResult {
    /// Flatten segments into the single response string persisted on
    /// the audit record.
    pub fn response_text(&self) -> Option<String> {
        if self.response_segments.is_empty() {
            return None;
        }
        Some(
            self.response_segments
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-turn handle given to the Brain.  Lives only inside one workflow
/// step; rebuilt from serialized state after every suspension.
pub struct FabricTurnContext {
    session_key: SessionKey,
    channel: String,
    /// Shared with the workflow so side effects recorded through
    /// `emit_event` land on the authoritative turn.
    turn: Arc<tokio::sync::Mutex<LogicalTurn>>,
    /// Full message records for the turn, in admission order.
    messages: Vec<RawMessage>,
    mailbox: Arc<TurnMailbox>,
    router: Arc<EventRouter>,
}

impl FabricTurnContext {
    pub(crate) fn new(
        session_key: SessionKey,
        channel: String,
        turn: Arc<tokio::sync::Mutex<LogicalTurn>>,
        messages: Vec<RawMessage>,
        mailbox: Arc<TurnMailbox>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            session_key,
            channel,
            turn,
            messages,
            mailbox,
            router,
        }
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The raw messages of this turn, in admission order.
    pub fn messages(&self) -> &[RawMessage] {
        &self.messages
    }

    /// Snapshot of the logical turn.
    pub async fn turn(&self) -> LogicalTurn {
        self.turn.lock().await.clone()
    }

    /// Did any new message arrive during this turn?  This is a fact
    /// query — the Brain decides what to do with the answer.  Monotonic
    /// within a turn: once true, stays true.
    pub fn has_pending_messages(&self) -> bool {
        self.mailbox.has_pending()
    }

    /// Emit a fabric event.  Tool-execution events are additionally
    /// recorded as side effects on the active turn.
    pub async fn emit_event(&self, event: FabricEvent) {
        let mut turn = self.turn.lock().await;
        self.router.route(&event, Some(&mut turn)).await;
    }

    /// Publish a phase checkpoint so a later ABSORB can resume here.
    pub async fn record_phase_artifact(&self, artifact: PhaseArtifact) {
        let mut turn = self.turn.lock().await;
        turn.phase_artifacts.insert(artifact.phase_number, artifact);
    }

    /// Idempotency key for a tool execution in this turn's group scope.
    pub async fn tool_idempotency_key(&self, tool_name: &str, business_key: &str) -> String {
        let turn = self.turn.lock().await;
        acf_turn::build_tool_idempotency_key(tool_name, business_key, &turn)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Brain trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The thinking unit invoked in workflow Step 3.
#[async_trait]
pub trait Brain: Send + Sync {
    /// Produce a response for the turn.  The Brain may poll
    /// `ctx.has_pending_messages()` at its own checkpoints and may emit
    /// events (tool executions) through the context.
    async fn think(&self, ctx: &FabricTurnContext) -> Result<BrainResult>;

    /// Decide how to handle a message that arrived mid-processing.
    /// `None` (the default) means the Brain is not supersede-capable
    /// and the fabric applies its default policy.
    async fn decide_supersede(
        &self,
        _current_turn: &LogicalTurn,
        _new_message: &RawMessage,
        _interrupt_point: Option<&str>,
    ) -> Option<SupersedeDecision> {
        None
    }
}

//! The durable logical-turn workflow — the four-step orchestration that
//! IS the conversation fabric.
//!
//! Steps: acquire-mutex → accumulate → run-brain → commit-and-release.
//! Only serializable data crosses step boundaries (the lock token, the
//! turn snapshot, message records); the Brain's live context is rebuilt
//! at the entry of Step 3.  Every step re-verifies the fencing token
//! before mutating anything, so a step resumed after lock expiry aborts
//! instead of corrupting a newer holder's state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::config::FabricConfig;
use acf_domain::{Error, FabricEvent, FabricEventType, RawMessage, Result, SessionKey};
use acf_turn::{
    AccumulationHint, LogicalTurn, LogicalTurnStatus, SupersedeAction, SupersedeCoordinator,
    SupersedeDecision, TurnManager, UserCadenceStats,
};

use crate::audit::{AuditSink, TurnRecord};
use crate::brain::{Brain, BrainResult, FabricTurnContext, ResponseSegment};
use crate::index::ActiveTurnIndex;
use crate::mailbox::TurnMailbox;
use crate::mutex::{LockToken, SessionMutex};
use crate::router::EventRouter;

/// Ceiling on supersede/absorb cycles inside one workflow before the
/// decision is forced to QUEUE.
const MAX_SUPERSEDE_CHAIN: usize = 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow input / output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input for one logical-turn workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub workflow_id: String,
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub interlocutor_id: Uuid,
    pub channel: String,
    pub message: RawMessage,
    /// Learned typing cadence for the interlocutor, if trustworthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cadence: Option<UserCadenceStats>,
    /// Hint produced by the previous turn's Brain result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hint: Option<AccumulationHint>,
    /// First turn this worker serves for the session.
    #[serde(default)]
    pub session_new: bool,
}

impl WorkflowInput {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(
            self.tenant_id,
            self.agent_id,
            self.interlocutor_id,
            &self.channel,
        )
    }
}

/// Final result of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub turn_id: Uuid,
    /// `complete`, `failed`, or `lock_failed`.
    pub status: String,
    pub response_segments: Vec<ResponseSegment>,
    /// Messages to re-admit through the gateway after deregistration
    /// (QUEUE decisions and non-absorbable arrivals).
    pub queued: Vec<RawMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulation_hint: Option<AccumulationHint>,
    pub expects_more_input: bool,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowOutput {
    fn lock_failed(turn_id: Uuid, error: &Error) -> Self {
        Self {
            turn_id,
            status: "lock_failed".into(),
            response_segments: Vec::new(),
            queued: Vec::new(),
            accumulation_hint: None,
            expects_more_input: false,
            message_count: 0,
            error: Some(error.to_string()),
        }
    }

    fn failed(turn_id: Uuid, error: &Error) -> Self {
        Self {
            turn_id,
            status: "failed".into(),
            response_segments: Vec::new(),
            queued: Vec::new(),
            accumulation_hint: None,
            expects_more_input: false,
            message_count: 0,
            error: Some(error.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step outputs (serializable — these cross durable boundaries)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexStepOutput {
    pub token: LockToken,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulateStepOutput {
    pub turn: LogicalTurn,
    /// Full message records for the turn, in admission order.
    pub messages: Vec<RawMessage>,
    /// A message the turn could not absorb; re-enters via the gateway.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow: Option<RawMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainStepOutput {
    pub turn: LogicalTurn,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BrainResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain_error: Option<String>,
    /// Messages awaiting re-admission after this workflow completes.
    #[serde(default)]
    pub queued: Vec<RawMessage>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable orchestrator for one logical turn.
pub struct LogicalTurnWorkflow {
    mutex: Arc<SessionMutex>,
    index: Arc<ActiveTurnIndex>,
    router: Arc<EventRouter>,
    audit: Arc<dyn AuditSink>,
    brain: Arc<dyn Brain>,
    turn_manager: Arc<TurnManager>,
    coordinator: SupersedeCoordinator,
    config: FabricConfig,
}

impl LogicalTurnWorkflow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mutex: Arc<SessionMutex>,
        index: Arc<ActiveTurnIndex>,
        router: Arc<EventRouter>,
        audit: Arc<dyn AuditSink>,
        brain: Arc<dyn Brain>,
        turn_manager: Arc<TurnManager>,
        config: FabricConfig,
    ) -> Self {
        Self {
            mutex,
            index,
            router,
            audit,
            brain,
            turn_manager,
            coordinator: SupersedeCoordinator::new(),
            config,
        }
    }

    // ── Step 1: acquire_mutex ───────────────────────────────────────

    /// Acquire the session lock.  The lock persists across steps and is
    /// released explicitly in Step 4 (or the failure hook).
    pub async fn acquire_mutex(
        &self,
        session_key: &SessionKey,
        turn_id: Uuid,
        input: &WorkflowInput,
    ) -> Result<MutexStepOutput> {
        let token = self
            .mutex
            .acquire(session_key, None)
            .await
            .ok_or_else(|| Error::LockFailed(session_key.to_string()))?;

        self.emit(FabricEventType::MutexAcquired, turn_id, input, |e| {
            e.with("fence", token.fence)
        })
        .await;

        Ok(MutexStepOutput {
            token,
            locked_at: Utc::now(),
        })
    }

    // ── Step 2: accumulate ──────────────────────────────────────────

    /// Create the initial turn and absorb messages until the adaptive
    /// window closes.
    pub async fn accumulate(
        &self,
        turn_id: Uuid,
        input: &WorkflowInput,
        mailbox: &TurnMailbox,
    ) -> Result<AccumulateStepOutput> {
        let session_key = input.session_key();
        mailbox.begin_turn();

        let mut turn = LogicalTurn::new(
            session_key,
            input.message.message_id,
            input.message.timestamp,
        );
        turn.id = turn_id;

        let session_event = if input.session_new {
            FabricEventType::SessionCreated
        } else {
            FabricEventType::SessionResumed
        };
        self.emit(session_event, turn.id, input, |e| {
            e.with("channel", input.channel.as_str())
        })
        .await;

        self.emit(FabricEventType::TurnStarted, turn.id, input, |e| {
            e.with("message_count", 1).with("channel", input.channel.as_str())
        })
        .await;

        let messages = vec![input.message.clone()];
        self.accumulation_loop(turn, messages, input, mailbox).await
    }

    /// The shared accumulation loop: wait for the window, absorb
    /// arrivals, recompute, until timeout or a non-absorbable message.
    async fn accumulation_loop(
        &self,
        mut turn: LogicalTurn,
        mut messages: Vec<RawMessage>,
        input: &WorkflowInput,
        mailbox: &TurnMailbox,
    ) -> Result<AccumulateStepOutput> {
        let latest = messages.last().expect("turn has at least one message");
        let mut wait_ms = self.turn_manager.suggest_wait_ms(
            &latest.content,
            &input.channel,
            input.user_cadence.as_ref(),
            input.previous_hint.as_ref(),
            turn.messages.len(),
        );

        tracing::info!(
            turn_id = %turn.id,
            initial_wait_ms = wait_ms,
            channel = %input.channel,
            "accumulation started"
        );

        if wait_ms == 0 {
            turn.mark_processing("no_accumulation")?;
            return Ok(AccumulateStepOutput {
                turn,
                messages,
                overflow: None,
            });
        }

        loop {
            match mailbox.wait_for_message(Duration::from_millis(wait_ms)).await {
                None => {
                    turn.mark_processing("timeout")?;
                    tracing::info!(
                        turn_id = %turn.id,
                        message_count = turn.messages.len(),
                        "accumulation complete"
                    );
                    return Ok(AccumulateStepOutput {
                        turn,
                        messages,
                        overflow: None,
                    });
                }
                Some(message) if turn.can_absorb_message() => {
                    turn.absorb_message(message.message_id, message.timestamp)?;
                    self.emit(FabricEventType::MessageAbsorbed, turn.id, input, |e| {
                        e.with("message_id", message.message_id.to_string())
                            .with("message_count", turn.messages.len())
                    })
                    .await;

                    wait_ms = self.turn_manager.suggest_wait_ms(
                        &message.content,
                        &input.channel,
                        input.user_cadence.as_ref(),
                        input.previous_hint.as_ref(),
                        turn.messages.len(),
                    );
                    messages.push(message);
                }
                Some(message) => {
                    turn.mark_processing("cannot_absorb")?;
                    tracing::info!(
                        turn_id = %turn.id,
                        queued_message_id = %message.message_id,
                        "accumulation closed by non-absorbable message"
                    );
                    return Ok(AccumulateStepOutput {
                        turn,
                        messages,
                        overflow: Some(message),
                    });
                }
            }
        }
    }

    // ── Step 3: run_brain ───────────────────────────────────────────

    /// Register in the active-turn index, rebuild the Brain context,
    /// and think — handling mid-turn arrivals via the supersede model.
    pub async fn run_brain(
        &self,
        accumulated: AccumulateStepOutput,
        input: &WorkflowInput,
        mailbox: &Arc<TurnMailbox>,
    ) -> Result<BrainStepOutput> {
        let session_key = input.session_key();
        self.index.set(&session_key, &input.workflow_id, None);

        let AccumulateStepOutput {
            mut turn,
            mut messages,
            overflow,
        } = accumulated;
        let mut queued: Vec<RawMessage> = overflow.into_iter().collect();
        let mut chain = 0usize;

        loop {
            let shared = Arc::new(tokio::sync::Mutex::new(turn));
            let ctx = FabricTurnContext::new(
                session_key.clone(),
                input.channel.clone(),
                shared.clone(),
                messages.clone(),
                mailbox.clone(),
                self.router.clone(),
            );

            tracing::info!(
                message_count = messages.len(),
                chain,
                "brain starting"
            );
            let think_result = self.brain.think(&ctx).await;
            drop(ctx);
            turn = shared.lock().await.clone();
            drop(shared);

            let result = match think_result {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(turn_id = %turn.id, error = %e, "brain failed");
                    return Ok(BrainStepOutput {
                        turn,
                        result: None,
                        brain_error: Some(e.to_string()),
                        queued,
                    });
                }
            };

            // Merge checkpoints the Brain published via its result.
            for (phase, artifact) in result.artifacts.clone() {
                turn.phase_artifacts.insert(phase, artifact);
            }

            // No arrival during thinking: the turn is done.
            let Some(new_message) = mailbox.try_take() else {
                turn.mark_complete()?;
                return Ok(BrainStepOutput {
                    turn,
                    result: Some(result),
                    brain_error: None,
                    queued,
                });
            };

            self.emit(FabricEventType::SupersedeRequested, turn.id, input, |e| {
                e.with("new_message_id", new_message.message_id.to_string())
            })
            .await;

            let mut decision = self
                .brain
                .decide_supersede(&turn, &new_message, turn.interrupt_point.as_deref())
                .await
                .unwrap_or_else(|| self.coordinator.default_decision(&turn));

            chain += 1;
            if chain >= MAX_SUPERSEDE_CHAIN
                && matches!(
                    decision.action,
                    SupersedeAction::Supersede | SupersedeAction::Absorb
                )
            {
                tracing::warn!(turn_id = %turn.id, chain, "supersede chain limit; forcing queue");
                decision = SupersedeDecision::new(SupersedeAction::Queue, "supersede_chain_limit");
            }
            if decision.action == SupersedeAction::Supersede
                && !self.coordinator.can_supersede(&turn)
            {
                // Past the commit point: the only safe option is a
                // fresh turn with a fresh idempotency scope.
                decision = SupersedeDecision::new(SupersedeAction::Queue, "past_commit_point");
            }

            match decision.action {
                SupersedeAction::Supersede => {
                    let successor = self
                        .coordinator
                        .enforce_decision(
                            &decision,
                            &mut turn,
                            new_message.message_id,
                            new_message.timestamp,
                        )?
                        .expect("supersede produces a successor");

                    // Commit the predecessor minimally: no response,
                    // its side effects retained for audit.
                    self.audit
                        .save_turn_record(&self.record_for(&turn, None))
                        .await?;
                    self.emit(FabricEventType::TurnSuperseded, turn.id, input, |e| {
                        e.with("superseded_by", successor.id.to_string())
                    })
                    .await;
                    self.emit(FabricEventType::SupersedeExecuted, successor.id, input, |e| {
                        e.with("superseded_from", turn.id.to_string())
                            .with("reason", decision.reason.as_str())
                    })
                    .await;

                    // Re-enter accumulation with the successor.
                    mailbox.begin_turn();
                    self.emit(FabricEventType::TurnStarted, successor.id, input, |e| {
                        e.with("message_count", 1)
                            .with("channel", input.channel.as_str())
                    })
                    .await;
                    let reaccumulated = self
                        .accumulation_loop(successor, vec![new_message], input, mailbox)
                        .await?;
                    turn = reaccumulated.turn;
                    messages = reaccumulated.messages;
                    queued.extend(reaccumulated.overflow);
                }
                SupersedeAction::Absorb => {
                    self.coordinator.enforce_decision(
                        &decision,
                        &mut turn,
                        new_message.message_id,
                        new_message.timestamp,
                    )?;
                    self.emit(FabricEventType::MessageAbsorbed, turn.id, input, |e| {
                        e.with("message_id", new_message.message_id.to_string())
                            .with("restart_from_phase", decision.restart_from_phase)
                    })
                    .await;
                    messages.push(new_message);
                }
                SupersedeAction::Queue => {
                    tracing::info!(
                        turn_id = %turn.id,
                        message_id = %new_message.message_id,
                        reason = %decision.reason,
                        "message queued for next turn"
                    );
                    // The turn is committed to finishing: arrivals from
                    // here on are the adapter's to retain, not signals.
                    self.index.mark_draining(&session_key);
                    queued.push(new_message);
                    turn.mark_complete()?;
                    return Ok(BrainStepOutput {
                        turn,
                        result: Some(result),
                        brain_error: None,
                        queued,
                    });
                }
                SupersedeAction::ForceComplete => {
                    tracing::warn!(
                        turn_id = %turn.id,
                        message_id = %new_message.message_id,
                        "message dropped by force_complete (channel policy may redeliver)"
                    );
                    self.index.mark_draining(&session_key);
                    turn.mark_complete()?;
                    return Ok(BrainStepOutput {
                        turn,
                        result: Some(result),
                        brain_error: None,
                        queued,
                    });
                }
            }
        }
    }

    // ── Step 4: commit_and_release ──────────────────────────────────

    /// Persist the turn, deregister, release the mutex, and emit the
    /// terminal event.  Idempotent against replay: persistence dedupes
    /// by turn id and release tolerates non-ownership.
    pub async fn commit_and_release(
        &self,
        output: &BrainStepOutput,
        token: &LockToken,
        input: &WorkflowInput,
    ) -> Result<WorkflowOutput> {
        let session_key = input.session_key();
        let response = output
            .result
            .as_ref()
            .and_then(|r| r.response_text());

        let mut record = self.record_for(&output.turn, response);
        if output.brain_error.is_some() {
            record.status = "failed".into();
        }
        // Release is deferred until persistence succeeds; on failure the
        // driver retries and auto-expiry is the backstop.
        self.audit.save_turn_record(&record).await?;

        self.index.clear(&session_key);
        let released = self.mutex.release(token).await;
        if released {
            self.emit(FabricEventType::MutexReleased, output.turn.id, input, |e| {
                e.with("fence", token.fence)
            })
            .await;
        }

        let (event_type, status) = if output.brain_error.is_some() {
            (FabricEventType::TurnFailed, "failed")
        } else {
            (FabricEventType::TurnCompleted, "complete")
        };
        self.emit(event_type, output.turn.id, input, |e| {
            e.with("message_count", output.turn.messages.len())
                .with(
                    "completion_reason",
                    output.turn.completion_reason.clone(),
                )
        })
        .await;

        Ok(WorkflowOutput {
            turn_id: output.turn.id,
            status: status.into(),
            response_segments: output
                .result
                .as_ref()
                .map(|r| r.response_segments.clone())
                .unwrap_or_default(),
            queued: output.queued.clone(),
            accumulation_hint: output
                .result
                .as_ref()
                .and_then(|r| r.accumulation_hint.clone()),
            expects_more_input: output
                .result
                .as_ref()
                .is_some_and(|r| r.expects_more_input),
            message_count: output.turn.messages.len(),
            error: output.brain_error.clone(),
        })
    }

    // ── Failure hook ────────────────────────────────────────────────

    /// Emit `turn.failed`, deregister, and release the lock if still
    /// held.  Safe to call multiple times.
    pub async fn on_failure(
        &self,
        token: &LockToken,
        turn_id: Uuid,
        input: &WorkflowInput,
        error: &Error,
    ) {
        tracing::error!(
            session_key = %token.session_key,
            error = %error,
            "logical turn workflow failed"
        );
        self.emit(FabricEventType::TurnFailed, turn_id, input, |e| {
            e.with("error", error.to_string())
        })
        .await;
        self.index.clear(&token.session_key);
        self.mutex.release(token).await;
    }

    // ── Driver ──────────────────────────────────────────────────────

    /// Execute the full workflow: all four steps with fencing checks at
    /// every boundary and per-step retry for transient failures.
    pub async fn run(&self, input: WorkflowInput, mailbox: Arc<TurnMailbox>) -> WorkflowOutput {
        let session_key = input.session_key();
        let turn_id = Uuid::new_v4();

        // Step 1.
        let mutex_out = match self
            .with_retry("acquire_mutex", || {
                self.acquire_mutex(&session_key, turn_id, &input)
            })
            .await
        {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(session_key = %session_key, error = %e, "lock not acquired");
                return WorkflowOutput::lock_failed(turn_id, &e);
            }
        };
        let token = mutex_out.token.clone();

        match self.run_locked(&token, turn_id, &input, &mailbox).await {
            Ok(output) => output,
            Err(e) => {
                self.on_failure(&token, turn_id, &input, &e).await;
                WorkflowOutput::failed(turn_id, &e)
            }
        }
    }

    /// Steps 2–4, with the lock held.
    async fn run_locked(
        &self,
        token: &LockToken,
        turn_id: Uuid,
        input: &WorkflowInput,
        mailbox: &Arc<TurnMailbox>,
    ) -> Result<WorkflowOutput> {
        // Step 2.
        self.ensure_held(token).await?;
        let accumulated = self.accumulate(turn_id, input, mailbox).await?;

        // Step 3.  Brain work may outlive the original TTL, so push the
        // expiry out before thinking starts.
        self.ensure_held(token).await?;
        if self.mutex.extend(token, None).await {
            self.emit(FabricEventType::MutexExtended, turn_id, input, |e| {
                e.with("fence", token.fence)
            })
            .await;
        }
        let brain_out = self.run_brain(accumulated, input, mailbox).await?;

        // Step 4.
        self.ensure_held(token).await?;
        self.with_retry("commit_and_release", || {
            self.commit_and_release(&brain_out, token, input)
        })
        .await
    }

    /// Fencing check at a step boundary.  A stale token means the lock
    /// expired mid-turn; the step must abort without mutation.
    async fn ensure_held(&self, token: &LockToken) -> Result<()> {
        if self.mutex.verify(token).await {
            Ok(())
        } else {
            Err(Error::MutexLost(token.session_key.to_string()))
        }
    }

    /// Retry a step on transient errors with exponential backoff.
    async fn with_retry<T, Fut>(
        &self,
        step: &'static str,
        mut f: impl FnMut() -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.config.workflow.max_retries => {
                    attempt += 1;
                    let backoff = self.config.workflow.retry_base_ms << (attempt - 1);
                    tracing::warn!(step, attempt, backoff_ms = backoff, error = %e, "retrying step");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_for(&self, turn: &LogicalTurn, response: Option<String>) -> TurnRecord {
        let status = match turn.status {
            LogicalTurnStatus::Complete => "complete",
            LogicalTurnStatus::Superseded => "superseded",
            LogicalTurnStatus::Accumulating | LogicalTurnStatus::Processing => "failed",
        };
        TurnRecord {
            turn_id: turn.id,
            session_key: turn.session_key.clone(),
            turn_group_id: turn.turn_group_id,
            messages: turn.messages.clone(),
            side_effects: turn.side_effects.clone(),
            status: status.into(),
            response,
            started_at: turn.first_at,
            completed_at: Utc::now(),
        }
    }

    async fn emit(
        &self,
        event_type: FabricEventType,
        turn_id: Uuid,
        input: &WorkflowInput,
        build: impl FnOnce(FabricEvent) -> FabricEvent,
    ) {
        let mut event = build(FabricEvent::new(event_type, turn_id, input.session_key()));
        event.tenant_id = Some(input.tenant_id);
        event.agent_id = Some(input.agent_id);
        event.interlocutor_id = Some(input.interlocutor_id);
        self.router.route(&event, None).await;
    }
}

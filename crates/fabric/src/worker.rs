//! The assembled fabric — what a channel adapter talks to.
//!
//! [`ConversationFabric`] owns every runtime component (mutex store,
//! index, router, gateway, audit sink, brain) and implements the
//! inbound adapter contract: `deliver` admits a message, drives a
//! workflow to completion, and re-admits whatever the turn queued.
//!
//! QUEUE carry-over lives here (adapter-buffered): messages a turn
//! could not take re-enter through the gateway after the workflow
//! deregisters, so they are re-admitted — and re-rate-limited — like
//! any fresh arrival.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use acf_domain::config::Config;
use acf_domain::{RawMessage, SessionKey};
use acf_turn::{AccumulationHint, TurnManager};

use crate::audit::AuditSink;
use crate::brain::Brain;
use crate::cadence::UserCadenceTracker;
use crate::gateway::{TurnAction, TurnGateway};
use crate::index::ActiveTurnIndex;
use crate::mailbox::TurnMailbox;
use crate::mutex::{InMemoryLockStore, LockStore, SessionMutex};
use crate::ratelimit::AdmissionRateLimiter;
use crate::router::EventRouter;
use crate::workflow::{LogicalTurnWorkflow, WorkflowInput, WorkflowOutput};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delivery outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happened to a delivered message.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// A workflow ran to completion for this message (possibly after
    /// driving several chained turns).
    Completed(WorkflowOutput),
    /// The message was posted into an already-running workflow.
    Signaled { workflow_id: String },
    /// The active turn is draining; the message is retained and will be
    /// redelivered once the turn commits.
    Queued { position: usize },
    /// Admission refused the message.
    Rejected { reason: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConversationFabric
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ActiveWorkflow {
    workflow_id: String,
    mailbox: Arc<TurnMailbox>,
}

/// The wired-up conversation fabric runtime.
pub struct ConversationFabric {
    gateway: Arc<TurnGateway>,
    mutex: Arc<SessionMutex>,
    index: Arc<ActiveTurnIndex>,
    router: Arc<EventRouter>,
    workflow: Arc<LogicalTurnWorkflow>,
    cadence: Arc<UserCadenceTracker>,

    /// Last accumulation hint per session, fed to the next turn.
    hints: Mutex<HashMap<SessionKey, AccumulationHint>>,
    /// Workflows running in this process, by session.  Covers the
    /// window before Step 3 registers them in the distributed index.
    active: Mutex<HashMap<SessionKey, ActiveWorkflow>>,
    /// Mailboxes by workflow id, for SIGNAL_EXISTING routing.
    mailboxes: Mutex<HashMap<String, Arc<TurnMailbox>>>,
    /// Messages retained on QUEUE decisions, redelivered after the
    /// session's workflow commits.
    deferred: Mutex<HashMap<SessionKey, VecDeque<RawMessage>>>,
    /// Sessions this worker has already served (session.created vs
    /// session.resumed).
    seen_sessions: Mutex<HashSet<SessionKey>>,
}

impl ConversationFabric {
    /// Assemble the fabric with the default in-memory lock store.
    pub fn new(config: &Config, brain: Arc<dyn Brain>, audit: Arc<dyn AuditSink>) -> Self {
        Self::with_lock_store(config, brain, audit, Arc::new(InMemoryLockStore::new()))
    }

    /// Assemble the fabric over a caller-provided lock backend.
    pub fn with_lock_store(
        config: &Config,
        brain: Arc<dyn Brain>,
        audit: Arc<dyn AuditSink>,
        lock_store: Arc<dyn LockStore>,
    ) -> Self {
        let fabric_config = config.fabric.clone();
        let mutex = Arc::new(SessionMutex::new(lock_store, fabric_config.mutex.clone()));
        let index = Arc::new(ActiveTurnIndex::new(std::time::Duration::from_secs(
            fabric_config.index.ttl_secs,
        )));
        let limiter = Arc::new(AdmissionRateLimiter::new(fabric_config.rate_limit.clone()));
        let gateway = Arc::new(TurnGateway::new(index.clone(), limiter));
        let router = Arc::new(EventRouter::new(config.tools.clone()));
        let turn_manager = Arc::new(TurnManager::new(fabric_config.accumulation.clone()));

        let workflow = Arc::new(LogicalTurnWorkflow::new(
            mutex.clone(),
            index.clone(),
            router.clone(),
            audit,
            brain,
            turn_manager,
            fabric_config,
        ));

        Self {
            gateway,
            mutex,
            index,
            router,
            workflow,
            cadence: Arc::new(UserCadenceTracker::new()),
            hints: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            seen_sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn gateway(&self) -> &Arc<TurnGateway> {
        &self.gateway
    }

    /// Workflows currently running in this process.
    pub fn active_turn_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Inbound adapter contract: admit one message and see it through.
    ///
    /// Blocks until the triggered workflow (and any chained turns born
    /// from QUEUE decisions) completes; a message routed into a running
    /// workflow returns immediately.
    pub async fn deliver(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        channel: &str,
        interlocutor_id: Uuid,
        message: RawMessage,
    ) -> DeliveryOutcome {
        self.cadence.record_message(&interlocutor_id);
        let session_key = SessionKey::new(tenant_id, agent_id, interlocutor_id, channel);

        let mut message = message;
        let mut carry: VecDeque<RawMessage> = VecDeque::new();
        let mut last_output: Option<WorkflowOutput> = None;

        loop {
            let decision = self.gateway.receive_message(
                tenant_id,
                agent_id,
                channel,
                interlocutor_id,
                &message,
            );

            match decision.action {
                TurnAction::Reject => {
                    // A rejection mid-chain still reports the completed work.
                    if let Some(output) = last_output {
                        tracing::warn!(
                            session_key = %session_key,
                            message_id = %message.message_id,
                            "carry-over message rejected on re-admission"
                        );
                        return DeliveryOutcome::Completed(output);
                    }
                    return DeliveryOutcome::Rejected {
                        reason: decision.reason.unwrap_or_else(|| "rejected".into()),
                    };
                }
                TurnAction::SignalExisting => {
                    let workflow_id = decision.workflow_id.expect("signal carries workflow id");
                    if let Some(mailbox) = self.mailboxes.lock().get(&workflow_id).cloned() {
                        mailbox.post(message);
                        return DeliveryOutcome::Signaled { workflow_id };
                    }
                    // Stale index entry (workflow gone): fall through and
                    // start fresh.
                    tracing::debug!(
                        session_key = %session_key,
                        workflow_id = %workflow_id,
                        "indexed workflow has no mailbox; triggering new"
                    );
                }
                TurnAction::Queue => {
                    // The active turn is draining: retain the message
                    // (and any carry-over) until the turn commits; the
                    // completing workflow's harvest redelivers it.
                    let position = {
                        let mut deferred = self.deferred.lock();
                        let waiting = deferred.entry(session_key.clone()).or_default();
                        waiting.push_back(message);
                        let position = waiting.len();
                        waiting.extend(carry.drain(..));
                        position
                    };
                    return match last_output {
                        Some(output) => DeliveryOutcome::Completed(output),
                        None => DeliveryOutcome::Queued { position },
                    };
                }
                TurnAction::TriggerNew => {}
            }

            // A workflow for this session may be running locally without
            // being indexed yet (it registers in Step 3).
            {
                let active = self.active.lock();
                if let Some(running) = active.get(&session_key) {
                    running.mailbox.post(message);
                    return DeliveryOutcome::Signaled {
                        workflow_id: running.workflow_id.clone(),
                    };
                }
            }

            let (output, leftovers) = self
                .run_workflow(
                    tenant_id,
                    agent_id,
                    channel,
                    interlocutor_id,
                    &session_key,
                    message,
                    &mut carry,
                )
                .await;

            match leftovers {
                Some(next) => {
                    // A queued message re-enters through the gateway as
                    // the seed of the next turn.
                    message = next;
                    last_output = Some(output);
                }
                None => return DeliveryOutcome::Completed(output),
            }
        }
    }

    /// Run one workflow instance for `message`, returning its output and
    /// the first message (if any) awaiting re-admission.
    async fn run_workflow(
        &self,
        tenant_id: Uuid,
        agent_id: Uuid,
        channel: &str,
        interlocutor_id: Uuid,
        session_key: &SessionKey,
        message: RawMessage,
        carry: &mut VecDeque<RawMessage>,
    ) -> (WorkflowOutput, Option<RawMessage>) {
        let workflow_id = Uuid::new_v4().to_string();
        let mailbox = Arc::new(TurnMailbox::new());

        self.active.lock().insert(
            session_key.clone(),
            ActiveWorkflow {
                workflow_id: workflow_id.clone(),
                mailbox: mailbox.clone(),
            },
        );
        self.mailboxes
            .lock()
            .insert(workflow_id.clone(), mailbox.clone());

        // Messages carried over from a previous turn arrive first, so
        // they accumulate in admission order ahead of live traffic.
        for queued in carry.drain(..) {
            mailbox.post(queued);
        }

        let session_new = self.seen_sessions.lock().insert(session_key.clone());
        let input = WorkflowInput {
            workflow_id: workflow_id.clone(),
            tenant_id,
            agent_id,
            interlocutor_id,
            channel: channel.to_owned(),
            message,
            user_cadence: self.cadence.stats(&interlocutor_id),
            previous_hint: self.hints.lock().get(session_key).cloned(),
            session_new,
        };

        let output = self.workflow.run(input, mailbox.clone()).await;

        // Teardown: local registry first, then harvest what is left.
        self.active.lock().remove(session_key);
        self.mailboxes.lock().remove(&workflow_id);

        match &output.accumulation_hint {
            Some(hint) => {
                self.hints.lock().insert(session_key.clone(), hint.clone());
            }
            None => {
                self.hints.lock().remove(session_key);
            }
        }

        let mut leftovers: VecDeque<RawMessage> = output.queued.iter().cloned().collect();
        leftovers.extend(mailbox.drain());
        // Messages the gateway queued against the draining turn.
        if let Some(waiting) = self.deferred.lock().remove(session_key) {
            leftovers.extend(waiting);
        }

        let next = leftovers.pop_front();
        *carry = leftovers;
        (output, next)
    }

    /// Administrative recovery: evict a stuck session's lock and index
    /// entry so the next admission starts fresh.
    pub async fn force_recover(&self, session_key: &SessionKey) {
        self.mutex.force_release(session_key).await;
        self.index.clear(session_key);
        self.active.lock().remove(session_key);
        tracing::warn!(session_key = %session_key, "session force-recovered");
    }
}

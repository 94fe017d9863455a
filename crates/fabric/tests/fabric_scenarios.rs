//! End-to-end scenarios over the assembled fabric: admission through
//! accumulation, supersession, commit, and recovery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use acf_domain::config::Config;
use acf_domain::{
    Error, FabricEvent, FabricEventType, RawMessage, Result, SessionKey, SideEffectPolicy,
};
use acf_turn::{SupersedeAction, SupersedeDecision};
use acf_fabric::{
    AuditSink, Brain, BrainResult, ConversationFabric, DeliveryOutcome, EventListener,
    FabricTurnContext, InMemoryLockStore, LockStore, MemoryAuditSink, ResponseSegment,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Captures every routed event as `(wire token, turn id)`.
#[derive(Default)]
struct EventCapture {
    seen: Mutex<Vec<(String, Uuid)>>,
}

impl EventCapture {
    fn tokens(&self) -> Vec<String> {
        self.seen.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    fn count(&self, token: &str) -> usize {
        self.seen.lock().iter().filter(|(t, _)| t == token).count()
    }
}

#[async_trait]
impl EventListener for EventCapture {
    async fn on_event(&self, event: &FabricEvent) -> Result<()> {
        self.seen
            .lock()
            .push((event.event_type.as_str().to_owned(), event.logical_turn_id));
        Ok(())
    }
}

struct TestEnv {
    fabric: Arc<ConversationFabric>,
    audit: Arc<MemoryAuditSink>,
    events: Arc<EventCapture>,
    tenant: Uuid,
    agent: Uuid,
    user: Uuid,
}

impl TestEnv {
    async fn new(brain: Arc<dyn Brain>) -> Self {
        Self::with_store(brain, Arc::new(InMemoryLockStore::new()), Config::default()).await
    }

    async fn with_store(
        brain: Arc<dyn Brain>,
        store: Arc<InMemoryLockStore>,
        config: Config,
    ) -> Self {
        let audit = Arc::new(MemoryAuditSink::new());
        let fabric = Arc::new(ConversationFabric::with_lock_store(
            &config,
            brain,
            audit.clone(),
            store,
        ));
        let events = Arc::new(EventCapture::default());
        fabric.router().register_listener("*", events.clone()).await;

        Self {
            fabric,
            audit,
            events,
            tenant: Uuid::new_v4(),
            agent: Uuid::new_v4(),
            user: Uuid::new_v4(),
        }
    }

    fn session_key(&self, channel: &str) -> SessionKey {
        SessionKey::new(self.tenant, self.agent, self.user, channel)
    }

    async fn deliver(&self, channel: &str, message: RawMessage) -> DeliveryOutcome {
        self.fabric
            .deliver(self.tenant, self.agent, channel, self.user, message)
            .await
    }
}

/// Brain that answers immediately with a fixed reply.
struct EchoBrain;

#[async_trait]
impl Brain for EchoBrain {
    async fn think(&self, ctx: &FabricTurnContext) -> Result<BrainResult> {
        let combined: Vec<&str> = ctx.messages().iter().map(|m| m.content.as_str()).collect();
        Ok(BrainResult {
            response_segments: vec![ResponseSegment::text(format!(
                "echo: {}",
                combined.join(" ")
            ))],
            ..Default::default()
        })
    }
}

/// Brain whose first invocation blocks until a new message arrives (or
/// a deadline passes); later invocations return immediately.
struct InterruptibleBrain {
    first_call: AtomicBool,
    decision: Option<SupersedeDecision>,
    /// Tool to execute (via `tool.executed`) before waiting.
    tool: Option<&'static str>,
    thinks: AtomicUsize,
}

impl InterruptibleBrain {
    fn new(decision: Option<SupersedeDecision>, tool: Option<&'static str>) -> Self {
        Self {
            first_call: AtomicBool::new(true),
            decision,
            tool,
            thinks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Brain for InterruptibleBrain {
    async fn think(&self, ctx: &FabricTurnContext) -> Result<BrainResult> {
        self.thinks.fetch_add(1, Ordering::SeqCst);

        if self.first_call.swap(false, Ordering::SeqCst) {
            if let Some(tool) = self.tool {
                let turn = ctx.turn().await;
                let key = ctx.tool_idempotency_key(tool, "order-42").await;
                ctx.emit_event(
                    FabricEvent::new(
                        FabricEventType::ToolExecuted,
                        turn.id,
                        ctx.session_key().clone(),
                    )
                    .with("tool_name", tool)
                    .with("idempotency_key", key),
                )
                .await;
            }

            // Cooperative checkpoint loop: wait for the interrupting
            // message the test is about to send.
            for _ in 0..100 {
                if ctx.has_pending_messages() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        Ok(BrainResult {
            response_segments: vec![ResponseSegment::text("handled")],
            ..Default::default()
        })
    }

    async fn decide_supersede(
        &self,
        _current_turn: &acf_turn::LogicalTurn,
        _new_message: &RawMessage,
        _interrupt_point: Option<&str>,
    ) -> Option<SupersedeDecision> {
        self.decision.clone()
    }
}

/// Brain that always fails.
struct BrokenBrain;

#[async_trait]
impl Brain for BrokenBrain {
    async fn think(&self, _ctx: &FabricTurnContext) -> Result<BrainResult> {
        Err(Error::BrainFailure("no thoughts".into()))
    }
}

fn msg(content: &str) -> RawMessage {
    RawMessage::new(content)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1 — clean single-message turn on email (no accumulation)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn clean_single_message_turn_on_email() {
    let env = TestEnv::new(Arc::new(EchoBrain)).await;
    let m1 = msg("Please cancel order 42.");
    let m1_id = m1.message_id;

    let outcome = env.deliver("email", m1).await;
    let DeliveryOutcome::Completed(output) = outcome else {
        panic!("expected completed turn, got {outcome:?}");
    };

    assert_eq!(output.status, "complete");
    assert_eq!(output.message_count, 1);
    assert_eq!(
        output.response_segments[0].content,
        "echo: Please cancel order 42."
    );
    assert!(output.queued.is_empty());

    let records = env.audit.records_for_session(&env.session_key("email")).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "complete");
    assert_eq!(records[0].messages, vec![m1_id]);

    let tokens = env.events.tokens();
    assert!(tokens.contains(&"session.created".to_owned()));
    assert!(tokens.contains(&"turn.started".to_owned()));
    assert!(tokens.contains(&"turn.completed".to_owned()));
    assert!(tokens.contains(&"mutex.acquired".to_owned()));
    assert!(tokens.contains(&"mutex.released".to_owned()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2 — burst accumulation on WhatsApp
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn burst_accumulates_into_one_turn() {
    let env = Arc::new(TestEnv::new(Arc::new(EchoBrain)).await);

    let m1 = msg("hi");
    let m2 = msg("my order");
    let m3 = msg("42 please");
    let ids = [m1.message_id, m2.message_id, m3.message_id];

    let first = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("whatsapp", m1).await })
    };

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        env.deliver("whatsapp", m2).await,
        DeliveryOutcome::Signaled { .. }
    ));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(matches!(
        env.deliver("whatsapp", m3).await,
        DeliveryOutcome::Signaled { .. }
    ));

    let outcome = first.await.unwrap();
    let DeliveryOutcome::Completed(output) = outcome else {
        panic!("expected completed turn, got {outcome:?}");
    };
    assert_eq!(output.status, "complete");
    assert_eq!(output.message_count, 3);

    let records = env
        .audit
        .records_for_session(&env.session_key("whatsapp"))
        .await;
    assert_eq!(records.len(), 1, "one logical turn for the burst");
    assert_eq!(records[0].messages, ids.to_vec());

    assert_eq!(env.events.count("message.absorbed"), 2);
    assert_eq!(env.events.count("turn.completed"), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3 — supersede before any irreversible effect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn supersede_before_commit_point() {
    let brain = Arc::new(InterruptibleBrain::new(
        Some(SupersedeDecision::new(
            SupersedeAction::Supersede,
            "new intent replaces the old one",
        )),
        None,
    ));
    let env = Arc::new(TestEnv::with_store(
        brain.clone(),
        Arc::new(InMemoryLockStore::new()),
        Config::default(),
    )
    .await);

    let m1 = msg("Please cancel order 42.");
    let m2 = msg("Actually change the delivery address.");
    let m2_id = m2.message_id;

    let first = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("web", m1).await })
    };

    // Let the workflow reach the thinking phase, then interrupt.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let signal = env.deliver("web", m2).await;
    assert!(matches!(signal, DeliveryOutcome::Signaled { .. }));

    let DeliveryOutcome::Completed(output) = first.await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(output.status, "complete");

    let records = env.audit.records_for_session(&env.session_key("web")).await;
    assert_eq!(records.len(), 2, "predecessor and successor both persisted");

    let superseded = &records[0];
    let successor = &records[1];
    assert_eq!(superseded.status, "superseded");
    assert!(superseded.response.is_none());
    assert_eq!(successor.status, "complete");
    assert_eq!(successor.messages, vec![m2_id]);
    // Idempotency scope is inherited across the supersede chain.
    assert_eq!(successor.turn_group_id, superseded.turn_group_id);

    assert_eq!(env.events.count("supersede.requested"), 1);
    assert_eq!(env.events.count("supersede.executed"), 1);
    assert_eq!(env.events.count("turn.superseded"), 1);
    assert_eq!(brain.thinks.load(Ordering::SeqCst), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4 — queued message after an irreversible effect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn irreversible_effect_forces_queue_with_fresh_group() {
    // The brain executes send_email, then a new message arrives; it is
    // not supersede-capable, so the default policy applies and must
    // pick QUEUE (the commit point has passed).
    let brain = Arc::new(InterruptibleBrain::new(None, Some("send_email")));
    let env = Arc::new(TestEnv::with_store(
        brain.clone(),
        Arc::new(InMemoryLockStore::new()),
        Config::default(),
    )
    .await);

    let m1 = msg("Email me the invoice.");
    let m2 = msg("Also update my phone number.");
    let m2_id = m2.message_id;

    let first = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("web", m1).await })
    };

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(matches!(
        env.deliver("web", m2).await,
        DeliveryOutcome::Signaled { .. }
    ));

    let DeliveryOutcome::Completed(output) = first.await.unwrap() else {
        panic!("expected completion");
    };
    assert_eq!(output.status, "complete");

    let records = env.audit.records_for_session(&env.session_key("web")).await;
    assert_eq!(records.len(), 2, "first turn plus the re-admitted queued turn");

    let first_record = &records[0];
    let queued_record = &records[1];
    assert_eq!(first_record.status, "complete");
    assert_eq!(first_record.side_effects.len(), 1);
    assert_eq!(
        first_record.side_effects[0].policy,
        SideEffectPolicy::Irreversible
    );
    assert_eq!(queued_record.messages, vec![m2_id]);
    // QUEUE breaks the idempotency scope: a fresh turn group.
    assert_ne!(queued_record.turn_group_id, first_record.turn_group_id);

    assert_eq!(env.events.count("commit.point_reached"), 1);
    assert_eq!(env.events.count("turn.superseded"), 0);
    assert_eq!(env.events.count("turn.completed"), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5 — gateway rate limit on a free-tier tenant
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn free_tier_rate_limit_rejects_the_sixty_first() {
    let env = TestEnv::new(Arc::new(EchoBrain)).await;

    for i in 0..60 {
        let outcome = env.deliver("email", msg(&format!("message {i}"))).await;
        assert!(
            matches!(outcome, DeliveryOutcome::Completed(_)),
            "admission {i} should complete"
        );
    }

    let outcome = env.deliver("email", msg("one too many")).await;
    let DeliveryOutcome::Rejected { reason } = outcome else {
        panic!("expected rejection, got {outcome:?}");
    };
    assert_eq!(reason, "rate_limit_exceeded");

    let records = env.audit.records_for_session(&env.session_key("email")).await;
    assert_eq!(records.len(), 60);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6 — crash-safe mutex recovery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn crashed_holder_expires_and_next_turn_starts_fresh() {
    let store = Arc::new(InMemoryLockStore::new());
    let env = TestEnv::with_store(Arc::new(EchoBrain), store.clone(), Config::default()).await;
    let key = env.session_key("email");

    // A worker acquired the lock and died before Step 4: the lock sits
    // there until TTL expiry, and no index entry survives.
    let dead_fence = store
        .try_acquire_nx(&key, Duration::from_millis(300))
        .await
        .expect("simulated crashed worker takes the lock");

    let outcome = env.deliver("email", msg("Anyone there?")).await;
    let DeliveryOutcome::Completed(output) = outcome else {
        panic!("expected completion after expiry, got {outcome:?}");
    };
    assert_eq!(output.status, "complete");

    // The dead worker's fencing token is useless now.
    assert!(!store.verify(&key, dead_fence).await);

    // No double-persist: only the new turn reached the audit sink.
    let records = env.audit.records_for_session(&key).await;
    assert_eq!(records.len(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Failure paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn brain_failure_terminalizes_the_turn() {
    let env = TestEnv::new(Arc::new(BrokenBrain)).await;

    let DeliveryOutcome::Completed(output) = env.deliver("email", msg("hello?")).await else {
        panic!("expected a terminal outcome");
    };
    assert_eq!(output.status, "failed");
    assert!(output.response_segments.is_empty());

    let records = env.audit.records_for_session(&env.session_key("email")).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "failed");
    assert!(records[0].response.is_none());

    assert_eq!(env.events.count("turn.failed"), 1);
    assert_eq!(env.events.count("turn.completed"), 0);

    // The session is usable again immediately.
    let DeliveryOutcome::Completed(second) = env.deliver("email", msg("retry?")).await else {
        panic!("expected the next turn to run");
    };
    assert_eq!(second.status, "failed");
}

#[tokio::test]
async fn held_lock_yields_lock_failed() {
    let store = Arc::new(InMemoryLockStore::new());
    let mut config = Config::default();
    config.fabric.mutex.blocking_timeout_secs = 1;
    let env = TestEnv::with_store(Arc::new(EchoBrain), store.clone(), config).await;
    let key = env.session_key("email");

    // Another holder keeps the lock past the blocking window.
    store
        .try_acquire_nx(&key, Duration::from_secs(30))
        .await
        .unwrap();

    let DeliveryOutcome::Completed(output) = env.deliver("email", msg("hi")).await else {
        panic!("expected lock_failed output");
    };
    assert_eq!(output.status, "lock_failed");
    assert!(env
        .audit
        .records_for_session(&key)
        .await
        .is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-cutting properties
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn sessions_on_distinct_channels_run_independently() {
    let env = Arc::new(TestEnv::new(Arc::new(EchoBrain)).await);

    let web = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("email", msg("on email.")).await })
    };
    let sms = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("api", msg("on api.")).await })
    };

    assert!(matches!(
        web.await.unwrap(),
        DeliveryOutcome::Completed(o) if o.status == "complete"
    ));
    assert!(matches!(
        sms.await.unwrap(),
        DeliveryOutcome::Completed(o) if o.status == "complete"
    ));

    assert_eq!(env.audit.records_for_session(&env.session_key("email")).await.len(), 1);
    assert_eq!(env.audit.records_for_session(&env.session_key("api")).await.len(), 1);
}

#[tokio::test]
async fn every_admitted_message_lands_in_exactly_one_turn() {
    // Scenario 4 shape, then check message conservation (P4): both
    // message ids appear across the two records, no duplicates.
    let brain = Arc::new(InterruptibleBrain::new(None, Some("send_email")));
    let env = Arc::new(TestEnv::with_store(
        brain,
        Arc::new(InMemoryLockStore::new()),
        Config::default(),
    )
    .await);

    let m1 = msg("Email me the invoice.");
    let m2 = msg("And one more thing.");
    let (m1_id, m2_id) = (m1.message_id, m2.message_id);

    let first = {
        let env = env.clone();
        tokio::spawn(async move { env.deliver("web", m1).await })
    };
    tokio::time::sleep(Duration::from_millis(450)).await;
    let _ = env.deliver("web", m2).await;
    let _ = first.await.unwrap();

    let records = env.audit.records_for_session(&env.session_key("web")).await;
    let mut all_ids: Vec<Uuid> = records.iter().flat_map(|r| r.messages.clone()).collect();
    all_ids.sort();
    let mut expected = vec![m1_id, m2_id];
    expected.sort();
    assert_eq!(all_ids, expected);
}

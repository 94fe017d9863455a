//! Event fan-out — pattern-matched dispatch of fabric lifecycle events.
//!
//! Listeners register against a pattern (`*`, `turn.*`, or an exact
//! token).  Dispatch is concurrent and failure-isolated: one broken
//! listener is logged and the rest still run.  The registry lock is
//! never held while dispatching.
//!
//! The router is also where tool executions become side effects: when
//! routed with the active turn, a `tool.executed` event is synthesized
//! into a [`SideEffect`] on that turn, and crossing the commit point
//! fans out a `commit.point_reached` event.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;

use acf_domain::config::ToolPolicyConfig;
use acf_domain::{FabricEvent, FabricEventType, Result, SideEffectPolicy};
use acf_turn::{CommitPointTracker, LogicalTurn};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listener contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Async event consumer: audit writers, metrics, live UI streams,
/// external integrations.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &FabricEvent) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routes fabric events to matching listeners and records tool side
/// effects on the active turn.
pub struct EventRouter {
    listeners: tokio::sync::Mutex<Vec<(String, Arc<dyn EventListener>)>>,
    tracker: CommitPointTracker,
}

impl EventRouter {
    pub fn new(tool_policies: ToolPolicyConfig) -> Self {
        Self {
            listeners: tokio::sync::Mutex::new(Vec::new()),
            tracker: CommitPointTracker::new(tool_policies),
        }
    }

    pub fn tracker(&self) -> &CommitPointTracker {
        &self.tracker
    }

    /// Register a listener for events matching `pattern`.
    pub async fn register_listener(&self, pattern: &str, listener: Arc<dyn EventListener>) {
        let mut listeners = self.listeners.lock().await;
        listeners.push((pattern.to_owned(), listener));
        tracing::debug!(pattern, total = listeners.len(), "event listener registered");
    }

    /// Remove a previously registered listener (matched by identity).
    pub async fn unregister_listener(&self, pattern: &str, listener: &Arc<dyn EventListener>) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|(p, l)| !(p == pattern && Arc::ptr_eq(l, listener)));
    }

    /// Dispatch `event` to every matching listener; with an active turn,
    /// additionally record tool side effects on it.
    pub async fn route(&self, event: &FabricEvent, active_turn: Option<&mut LogicalTurn>) {
        self.dispatch(event).await;

        if let Some(turn) = active_turn {
            self.record_side_effect(event, turn).await;
        }
    }

    /// Fan out to matching listeners.  The registry lock is released
    /// before any listener runs.
    async fn dispatch(&self, event: &FabricEvent) {
        let matching: Vec<Arc<dyn EventListener>> = {
            let listeners = self.listeners.lock().await;
            listeners
                .iter()
                .filter(|(pattern, _)| matches_pattern(event.event_type.as_str(), pattern))
                .map(|(_, l)| l.clone())
                .collect()
        };

        if matching.is_empty() {
            return;
        }

        tracing::debug!(
            event_type = %event.event_type,
            listeners = matching.len(),
            logical_turn_id = %event.logical_turn_id,
            "routing event"
        );

        let dispatches = matching.iter().map(|listener| {
            let listener = listener.clone();
            async move {
                if let Err(e) = listener.on_event(event).await {
                    tracing::error!(
                        event_type = %event.event_type,
                        error = %e,
                        logical_turn_id = %event.logical_turn_id,
                        "event listener failed"
                    );
                }
            }
        });
        join_all(dispatches).await;
    }

    /// Synthesize a side effect from a `tool.executed` event.
    async fn record_side_effect(&self, event: &FabricEvent, turn: &mut LogicalTurn) {
        if event.event_type != FabricEventType::ToolExecuted {
            return;
        }

        let tool_name = event
            .payload
            .get("tool_name")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let idempotency_key = event
            .payload
            .get("idempotency_key")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let policy = event
            .payload
            .get("policy")
            .and_then(|v| v.as_str())
            .and_then(parse_policy)
            .or_else(|| tool_name.as_deref().map(|t| self.tracker.classify_tool_policy(t)))
            .unwrap_or(SideEffectPolicy::Idempotent);

        let was_committed = self.tracker.has_reached_commit_point(turn);

        let recorded = self.tracker.record_side_effect(
            turn,
            "tool_call",
            policy,
            tool_name.as_deref(),
            idempotency_key.as_deref(),
            Some(serde_json::to_value(&event.payload).unwrap_or_default()),
        );

        match recorded {
            Ok(effect) => {
                // First irreversible effect: announce the commit point.
                if !was_committed && effect.irreversible() {
                    let commit_event = FabricEvent::new(
                        FabricEventType::CommitPointReached,
                        turn.id,
                        turn.session_key.clone(),
                    )
                    .with("tool_name", tool_name.clone().unwrap_or_default());
                    self.dispatch(&commit_event).await;
                }
            }
            Err(e) => {
                tracing::warn!(
                    logical_turn_id = %turn.id,
                    error = %e,
                    "tool event on terminal turn; side effect dropped"
                );
            }
        }
    }
}

fn parse_policy(raw: &str) -> Option<SideEffectPolicy> {
    match raw {
        "reversible" => Some(SideEffectPolicy::Reversible),
        "irreversible" => Some(SideEffectPolicy::Irreversible),
        "idempotent" => Some(SideEffectPolicy::Idempotent),
        "compensatable" => Some(SideEffectPolicy::Compensatable),
        _ => None,
    }
}

/// Pattern language: `*` matches everything, `category.*` matches the
/// category, anything else is an exact token match.
fn matches_pattern(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" || event_type == pattern {
        return true;
    }
    if let Some(category) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(category)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use acf_domain::{Error, SessionKey};

    /// Test listener that records every event type it sees.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, event: &FabricEvent) -> Result<()> {
            self.seen.lock().push(event.event_type.as_str().to_owned());
            Ok(())
        }
    }

    /// Test listener that always fails.
    struct Exploder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EventListener for Exploder {
        async fn on_event(&self, _event: &FabricEvent) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("listener exploded".into()))
        }
    }

    fn router() -> EventRouter {
        EventRouter::new(ToolPolicyConfig::default())
    }

    fn event(ty: FabricEventType) -> FabricEvent {
        FabricEvent::new(ty, Uuid::new_v4(), SessionKey::from_raw("t:a:i:web"))
    }

    fn processing_turn() -> LogicalTurn {
        let mut t = LogicalTurn::new(
            SessionKey::from_raw("t:a:i:web"),
            Uuid::new_v4(),
            Utc::now(),
        );
        t.mark_processing("timeout").unwrap();
        t
    }

    #[test]
    fn pattern_matching_rules() {
        assert!(matches_pattern("turn.started", "*"));
        assert!(matches_pattern("turn.started", "turn.*"));
        assert!(matches_pattern("turn.started", "turn.started"));
        assert!(!matches_pattern("turn.started", "turn.completed"));
        assert!(!matches_pattern("turn.started", "tool.*"));
        // A category wildcard must not match a longer category prefix.
        assert!(!matches_pattern("supersede.requested", "super.*"));
    }

    #[tokio::test]
    async fn exact_and_wildcard_listeners_both_fire() {
        let router = router();
        let all = Arc::new(Recorder::default());
        let turns = Arc::new(Recorder::default());
        let exact = Arc::new(Recorder::default());

        router.register_listener("*", all.clone()).await;
        router.register_listener("turn.*", turns.clone()).await;
        router.register_listener("tool.executed", exact.clone()).await;

        router.route(&event(FabricEventType::TurnStarted), None).await;
        router.route(&event(FabricEventType::MutexAcquired), None).await;

        assert_eq!(
            *all.seen.lock(),
            vec!["turn.started".to_owned(), "mutex.acquired".to_owned()]
        );
        assert_eq!(*turns.seen.lock(), vec!["turn.started".to_owned()]);
        assert!(exact.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn listener_failure_is_isolated() {
        let router = router();
        let exploder = Arc::new(Exploder {
            calls: AtomicUsize::new(0),
        });
        let recorder = Arc::new(Recorder::default());

        router.register_listener("*", exploder.clone()).await;
        router.register_listener("*", recorder.clone()).await;

        router.route(&event(FabricEventType::TurnCompleted), None).await;

        assert_eq!(exploder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let router = router();
        let recorder = Arc::new(Recorder::default());
        let as_listener: Arc<dyn EventListener> = recorder.clone();

        router.register_listener("turn.*", as_listener.clone()).await;
        router.route(&event(FabricEventType::TurnStarted), None).await;
        router.unregister_listener("turn.*", &as_listener).await;
        router.route(&event(FabricEventType::TurnFailed), None).await;

        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn tool_executed_becomes_side_effect() {
        let router = router();
        let mut turn = processing_turn();

        let ev = event(FabricEventType::ToolExecuted)
            .with("tool_name", "get_order")
            .with("idempotency_key", "get_order:42:turn_group:g");
        router.route(&ev, Some(&mut turn)).await;

        assert_eq!(turn.side_effects.len(), 1);
        let effect = &turn.side_effects[0];
        assert_eq!(effect.tool_name.as_deref(), Some("get_order"));
        assert_eq!(effect.policy, SideEffectPolicy::Idempotent);
        assert_eq!(
            effect.idempotency_key.as_deref(),
            Some("get_order:42:turn_group:g")
        );
    }

    #[tokio::test]
    async fn explicit_policy_in_payload_wins() {
        let router = router();
        let mut turn = processing_turn();

        let ev = event(FabricEventType::ToolExecuted)
            .with("tool_name", "get_order")
            .with("policy", "irreversible");
        router.route(&ev, Some(&mut turn)).await;

        assert_eq!(turn.side_effects[0].policy, SideEffectPolicy::Irreversible);
    }

    #[tokio::test]
    async fn non_tool_events_record_nothing() {
        let router = router();
        let mut turn = processing_turn();
        router
            .route(&event(FabricEventType::TurnStarted), Some(&mut turn))
            .await;
        assert!(turn.side_effects.is_empty());
    }

    #[tokio::test]
    async fn first_irreversible_effect_announces_commit_point() {
        let router = router();
        let commits = Arc::new(Recorder::default());
        router
            .register_listener("commit.point_reached", commits.clone())
            .await;

        let mut turn = processing_turn();
        let ev = event(FabricEventType::ToolExecuted).with("tool_name", "send_email");
        router.route(&ev, Some(&mut turn)).await;
        // Second irreversible effect must not re-announce.
        let ev2 = event(FabricEventType::ToolExecuted).with("tool_name", "send_sms");
        router.route(&ev2, Some(&mut turn)).await;

        assert_eq!(commits.seen.lock().len(), 1);
        assert_eq!(turn.side_effects.len(), 2);
    }
}

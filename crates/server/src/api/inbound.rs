//! Inbound channel contract — the normalized envelope that connectors
//! post.
//!
//! `POST /v1/inbound` accepts messages from any channel (web chat,
//! WhatsApp, SMS, voice, email, API) and returns the turn outcome.
//! This is the single entry point for all channel connectors.
//!
//! The endpoint handles:
//! - Idempotent delivery (`event_id` deduplication)
//! - Admission via the fabric gateway (rate limits, index lookup)
//! - Full turn execution (blocking until the turn commits)

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::RawMessage;
use acf_fabric::{DeliveryOutcome, ResponseSegment};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Replay guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound replay guard.  Connectors retry webhooks and replay polls,
/// so every envelope may carry an `event_id`; an id already delivered
/// inside the dedupe window is acknowledged without running a second
/// turn.
///
/// Two-generation design: ids land in the current bucket, and when the
/// window elapses the buckets rotate (current becomes previous).  An id
/// is therefore remembered for at least one full window and at most
/// two, with no per-entry timestamps and no sweep pass.
pub struct DedupeStore {
    window: Duration,
    buckets: Mutex<Buckets>,
}

struct Buckets {
    current: HashSet<String>,
    previous: HashSet<String>,
    rotated_at: Instant,
}

impl Buckets {
    fn rotate_if_due(&mut self, window: Duration) {
        let elapsed = self.rotated_at.elapsed();
        if elapsed < window {
            return;
        }
        if elapsed >= window * 2 {
            // Idle across both generations: everything has expired.
            self.current.clear();
            self.previous.clear();
        } else {
            self.previous = std::mem::take(&mut self.current);
        }
        self.rotated_at = Instant::now();
    }
}

impl DedupeStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            buckets: Mutex::new(Buckets {
                current: HashSet::new(),
                previous: HashSet::new(),
                rotated_at: Instant::now(),
            }),
        }
    }

    /// Record the id and report whether it was already delivered within
    /// the window.
    pub fn seen_before(&self, event_id: &str) -> bool {
        let mut buckets = self.buckets.lock();
        buckets.rotate_if_due(self.window);

        if buckets.current.contains(event_id) || buckets.previous.contains(event_id) {
            return true;
        }
        buckets.current.insert(event_id.to_owned());
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalized inbound envelope.
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    /// Channel token: `"whatsapp"`, `"webchat"`, `"email"`, …
    pub channel: String,
    /// The interlocutor's canonical ID.
    pub channel_user_id: Uuid,
    /// The message text.
    pub text: String,
    /// Platform-native message ID; minted when absent.
    #[serde(default)]
    pub message_id: Option<Uuid>,
    /// Idempotency key (e.g. `"{channel}:{account}:{message_id}"`).
    #[serde(default)]
    pub event_id: Option<String>,
    /// Message timestamp; defaults to arrival time.
    #[serde(default)]
    pub ts: Option<DateTime<Utc>>,
    /// Channel-specific metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response for one delivered envelope.
#[derive(Debug, Serialize)]
pub struct InboundResponse {
    /// `completed`, `signaled`, `queued`, `rejected`, or `duplicate`.
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_segments: Vec<ResponseSegment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InboundResponse {
    fn bare(outcome: &str) -> Self {
        Self {
            outcome: outcome.into(),
            turn_id: None,
            status: None,
            workflow_id: None,
            queue_position: None,
            response_segments: Vec::new(),
            reason: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn inbound(
    State(state): State<AppState>,
    Json(envelope): Json<InboundEnvelope>,
) -> impl IntoResponse {
    // Idempotent delivery: duplicates are acknowledged, not re-run.
    if let Some(event_id) = &envelope.event_id {
        if state.dedupe.seen_before(event_id) {
            tracing::debug!(event_id = %event_id, "duplicate inbound event ignored");
            return (StatusCode::OK, Json(InboundResponse::bare("duplicate")));
        }
    }

    let message = RawMessage {
        message_id: envelope.message_id.unwrap_or_else(Uuid::new_v4),
        content: envelope.text,
        timestamp: envelope.ts.unwrap_or_else(Utc::now),
        metadata: envelope.metadata,
    };

    let outcome = state
        .fabric
        .deliver(
            envelope.tenant_id,
            envelope.agent_id,
            &envelope.channel,
            envelope.channel_user_id,
            message,
        )
        .await;

    match outcome {
        DeliveryOutcome::Completed(output) => (
            StatusCode::OK,
            Json(InboundResponse {
                turn_id: Some(output.turn_id),
                status: Some(output.status),
                response_segments: output.response_segments,
                reason: output.error,
                ..InboundResponse::bare("completed")
            }),
        ),
        DeliveryOutcome::Signaled { workflow_id } => (
            StatusCode::ACCEPTED,
            Json(InboundResponse {
                workflow_id: Some(workflow_id),
                ..InboundResponse::bare("signaled")
            }),
        ),
        DeliveryOutcome::Queued { position } => (
            StatusCode::ACCEPTED,
            Json(InboundResponse {
                queue_position: Some(position),
                ..InboundResponse::bare("queued")
            }),
        ),
        DeliveryOutcome::Rejected { reason } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(InboundResponse {
                reason: Some(reason),
                ..InboundResponse::bare("rejected")
            }),
        ),
    }
}

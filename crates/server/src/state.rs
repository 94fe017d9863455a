use std::sync::Arc;
use std::time::Instant;

use acf_domain::config::Config;
use acf_fabric::ConversationFabric;

use crate::api::inbound::DedupeStore;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// The assembled conversation fabric runtime.
    pub fabric: Arc<ConversationFabric>,
    /// Idempotency store for inbound event deduplication.
    pub dedupe: Arc<DedupeStore>,
    /// SHA-256 digest of the API bearer token (hashed once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_digest: Option<[u8; 32]>,
    pub started_at: Instant,
}

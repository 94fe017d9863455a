use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fabric runtime config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn-lifecycle runtime knobs: accumulation windows, mutex timeouts,
/// admission rate limits, and the active-turn index TTL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabricConfig {
    #[serde(default)]
    pub accumulation: AccumulationConfig,
    #[serde(default)]
    pub mutex: MutexConfig,
    #[serde(default)]
    pub rate_limit: AdmissionRateLimitConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Accumulation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Adaptive accumulation window bounds and per-channel baselines.
///
/// A channel default of 0 means the channel never accumulates (email,
/// voice, api) — the first message is processed immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccumulationConfig {
    #[serde(default = "d_min_wait_ms")]
    pub min_wait_ms: u64,
    #[serde(default = "d_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Per-channel baseline wait (ms).  Channels not listed here use
    /// [`AccumulationConfig::FALLBACK_WAIT_MS`].
    #[serde(default = "d_channel_defaults")]
    pub channel_defaults: HashMap<String, u64>,
}

impl AccumulationConfig {
    /// Baseline for channels with no configured default.
    pub const FALLBACK_WAIT_MS: u64 = 800;

    /// The baseline wait for a channel.
    pub fn channel_default(&self, channel: &str) -> u64 {
        self.channel_defaults
            .get(channel)
            .copied()
            .unwrap_or(Self::FALLBACK_WAIT_MS)
    }
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            min_wait_ms: d_min_wait_ms(),
            max_wait_ms: d_max_wait_ms(),
            channel_defaults: d_channel_defaults(),
        }
    }
}

fn d_min_wait_ms() -> u64 {
    200
}
fn d_max_wait_ms() -> u64 {
    3000
}
fn d_channel_defaults() -> HashMap<String, u64> {
    HashMap::from([
        ("whatsapp".into(), 1200), // users send in bursts
        ("telegram".into(), 1000),
        ("sms".into(), 800), // more deliberate due to cost/friction
        ("web".into(), 600),
        ("webchat".into(), 600),
        ("slack".into(), 800),
        ("teams".into(), 800),
        ("email".into(), 0), // always complete, no accumulation
        ("voice".into(), 0), // handled by speech recognition
        ("api".into(), 0),   // direct API calls are complete
    ])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session mutex
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session mutex timeouts.  Long-running turns must extend the lock
/// before `lock_timeout_secs` elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexConfig {
    /// Auto-expiry: how long a lock is held before the store releases it.
    #[serde(default = "d_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// How long `acquire` blocks while contending for a held lock.
    #[serde(default = "d_blocking_timeout_secs")]
    pub blocking_timeout_secs: u64,
    /// Default extension granted by `extend`.
    #[serde(default = "d_extend_secs")]
    pub extend_secs: u64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: d_lock_timeout_secs(),
            blocking_timeout_secs: d_blocking_timeout_secs(),
            extend_secs: d_extend_secs(),
        }
    }
}

fn d_lock_timeout_secs() -> u64 {
    30
}
fn d_blocking_timeout_secs() -> u64 {
    5
}
fn d_extend_secs() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admission rate limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tenant tier for admission rate limiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

/// Sliding-window admission limits per SessionKey, tiered by tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRateLimitConfig {
    #[serde(default = "d_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "d_free_limit")]
    pub free_limit: u32,
    #[serde(default = "d_pro_limit")]
    pub pro_limit: u32,
    #[serde(default = "d_enterprise_limit")]
    pub enterprise_limit: u32,
    #[serde(default)]
    pub default_tier: RateTier,
    /// Tenant UUID (string) → tier.  Unlisted tenants use `default_tier`.
    #[serde(default)]
    pub tenant_tiers: HashMap<String, RateTier>,
}

impl AdmissionRateLimitConfig {
    pub fn tier_for(&self, tenant_id: &uuid::Uuid) -> RateTier {
        self.tenant_tiers
            .get(&tenant_id.to_string())
            .copied()
            .unwrap_or(self.default_tier)
    }

    pub fn limit_for(&self, tier: RateTier) -> u32 {
        match tier {
            RateTier::Free => self.free_limit,
            RateTier::Pro => self.pro_limit,
            RateTier::Enterprise => self.enterprise_limit,
        }
    }
}

impl Default for AdmissionRateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: d_window_seconds(),
            free_limit: d_free_limit(),
            pro_limit: d_pro_limit(),
            enterprise_limit: d_enterprise_limit(),
            default_tier: RateTier::Free,
            tenant_tiers: HashMap::new(),
        }
    }
}

fn d_window_seconds() -> u64 {
    60
}
fn d_free_limit() -> u32 {
    60
}
fn d_pro_limit() -> u32 {
    600
}
fn d_enterprise_limit() -> u32 {
    6000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Active-turn index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Active-turn index entry lifetime.  Must be at least the mutex lock
/// timeout so a crashed worker's entry outlives its lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "d_index_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            ttl_secs: d_index_ttl_secs(),
        }
    }
}

fn d_index_ttl_secs() -> u64 {
    300
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Step retry policy for the durable workflow driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    #[serde(default = "d_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: d_max_retries(),
            retry_base_ms: d_retry_base_ms(),
        }
    }
}

fn d_max_retries() -> u32 {
    3
}
fn d_retry_base_ms() -> u64 {
    100
}

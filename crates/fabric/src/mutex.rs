//! Session mutex — advisory mutual exclusion per SessionKey with
//! auto-expiry and fencing.
//!
//! A plain lock-with-TTL is not enough: a slow worker whose lock
//! expired can still write.  Every acquisition therefore carries a
//! monotonically increasing fencing value, and all guarded writes
//! assert the value is still current.  Release is a compare-and-delete
//! on the same value, so a late-returning zombie holder can never
//! unlock (or extend) someone else's acquisition.
//!
//! The store is a trait seam: the in-memory implementation serves a
//! single process, and any distributed backend must provide the same
//! three primitives (acquire-with-NX, TTL auto-expiry, atomic
//! compare-and-delete on the fencing value).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use acf_domain::config::MutexConfig;
use acf_domain::SessionKey;

/// Poll interval while blocking on a held lock.
const ACQUIRE_POLL_MS: u64 = 25;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock token
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Proof of one acquisition.  Serializable so it survives durable step
/// boundaries — a resumed step on a different worker releases with the
/// fencing value, not a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub session_key: SessionKey,
    pub fence: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock store seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single-writer lock primitive.
///
/// Implementations must linearize all five operations against each
/// other; the fencing value comparison is what keeps expired holders
/// out.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire iff not currently held (NX).  Returns the fencing value
    /// on success.
    async fn try_acquire_nx(&self, key: &SessionKey, ttl: Duration) -> Option<u64>;

    /// Delete iff held with this exact fencing value.
    async fn compare_and_delete(&self, key: &SessionKey, fence: u64) -> bool;

    /// Push the expiry out iff held with this exact fencing value.
    async fn compare_and_extend(&self, key: &SessionKey, fence: u64, additional: Duration)
        -> bool;

    /// Whether this fencing value is still the current holder.
    async fn verify(&self, key: &SessionKey, fence: u64) -> bool;

    /// Administrative delete regardless of holder.
    async fn force_delete(&self, key: &SessionKey) -> bool;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LockEntry {
    fence: u64,
    deadline: Instant,
}

/// Process-local lock store with TTL auto-expiry and fencing.
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<SessionKey, LockEntry>>,
    fence_counter: AtomicU64,
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            fence_counter: AtomicU64::new(1),
        }
    }

    /// Number of currently-held (unexpired) locks.
    pub fn held_count(&self) -> usize {
        let now = Instant::now();
        self.locks.lock().values().filter(|e| e.deadline > now).count()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire_nx(&self, key: &SessionKey, ttl: Duration) -> Option<u64> {
        let mut locks = self.locks.lock();
        let now = Instant::now();

        if let Some(entry) = locks.get(key) {
            if entry.deadline > now {
                return None; // held and not expired
            }
        }

        let fence = self.fence_counter.fetch_add(1, Ordering::Relaxed);
        locks.insert(
            key.clone(),
            LockEntry {
                fence,
                deadline: now + ttl,
            },
        );
        Some(fence)
    }

    async fn compare_and_delete(&self, key: &SessionKey, fence: u64) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(entry) if entry.fence == fence => {
                locks.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn compare_and_extend(
        &self,
        key: &SessionKey,
        fence: u64,
        additional: Duration,
    ) -> bool {
        let mut locks = self.locks.lock();
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(entry) if entry.fence == fence && entry.deadline > now => {
                entry.deadline += additional;
                true
            }
            _ => false,
        }
    }

    async fn verify(&self, key: &SessionKey, fence: u64) -> bool {
        let locks = self.locks.lock();
        matches!(
            locks.get(key),
            Some(entry) if entry.fence == fence && entry.deadline > Instant::now()
        )
    }

    async fn force_delete(&self, key: &SessionKey) -> bool {
        self.locks.lock().remove(key).is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionMutex
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Distributed advisory lock keyed by SessionKey.
///
/// All mutation of turn state, index entries, and side-effect appends
/// for a key must happen while holding this mutex.
pub struct SessionMutex {
    store: Arc<dyn LockStore>,
    config: MutexConfig,
}

impl SessionMutex {
    pub fn new(store: Arc<dyn LockStore>, config: MutexConfig) -> Self {
        Self { store, config }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config.lock_timeout_secs)
    }

    /// Try to acquire for up to `blocking_timeout` (defaults to the
    /// configured value).  Returns a fencing token on success.
    pub async fn acquire(
        &self,
        session_key: &SessionKey,
        blocking_timeout: Option<Duration>,
    ) -> Option<LockToken> {
        let ttl = self.lock_timeout();
        let deadline = Instant::now()
            + blocking_timeout
                .unwrap_or_else(|| Duration::from_secs(self.config.blocking_timeout_secs));

        loop {
            if let Some(fence) = self.store.try_acquire_nx(session_key, ttl).await {
                tracing::debug!(session_key = %session_key, fence, "mutex acquired");
                return Some(LockToken {
                    session_key: session_key.clone(),
                    fence,
                });
            }
            if Instant::now() >= deadline {
                tracing::warn!(session_key = %session_key, "mutex acquisition timed out");
                return None;
            }
            tokio::time::sleep(Duration::from_millis(ACQUIRE_POLL_MS)).await;
        }
    }

    /// Release iff the token still matches the current holder.
    /// A stale token is a silent no-op (returns false).
    pub async fn release(&self, token: &LockToken) -> bool {
        let released = self
            .store
            .compare_and_delete(&token.session_key, token.fence)
            .await;
        if released {
            tracing::debug!(session_key = %token.session_key, fence = token.fence, "mutex released");
        }
        released
    }

    /// Extend the auto-expiry while held.
    pub async fn extend(&self, token: &LockToken, additional: Option<Duration>) -> bool {
        let additional =
            additional.unwrap_or_else(|| Duration::from_secs(self.config.extend_secs));
        self.store
            .compare_and_extend(&token.session_key, token.fence, additional)
            .await
    }

    /// Whether the token is still the current holder.  Steps must call
    /// this before mutating state — a false answer means the lock
    /// expired and someone else may hold it now.
    pub async fn verify(&self, token: &LockToken) -> bool {
        self.store.verify(&token.session_key, token.fence).await
    }

    /// Administrative override for recovery paths.
    pub async fn force_release(&self, session_key: &SessionKey) -> bool {
        tracing::warn!(session_key = %session_key, "mutex force-released");
        self.store.force_delete(session_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(channel: &str) -> SessionKey {
        SessionKey::from_raw(format!("t:a:i:{channel}"))
    }

    fn mutex_with(lock_timeout_secs: u64) -> SessionMutex {
        SessionMutex::new(
            Arc::new(InMemoryLockStore::new()),
            MutexConfig {
                lock_timeout_secs,
                blocking_timeout_secs: 1,
                extend_secs: 1,
            },
        )
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let mutex = mutex_with(30);
        let token = mutex.acquire(&key("web"), None).await.unwrap();
        assert!(mutex.verify(&token).await);
        assert!(mutex.release(&token).await);
        assert!(!mutex.verify(&token).await);
    }

    #[tokio::test]
    async fn second_acquire_blocks_until_release() {
        let mutex = mutex_with(30);
        let k = key("web");
        let token = mutex.acquire(&k, None).await.unwrap();

        // Held: a short blocking attempt fails.
        assert!(mutex
            .acquire(&k, Some(Duration::from_millis(80)))
            .await
            .is_none());

        mutex.release(&token).await;
        assert!(mutex.acquire(&k, None).await.is_some());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let mutex = mutex_with(30);
        let a = mutex.acquire(&key("web"), None).await.unwrap();
        let b = mutex.acquire(&key("sms"), None).await.unwrap();
        assert!(mutex.verify(&a).await);
        assert!(mutex.verify(&b).await);
    }

    #[tokio::test]
    async fn stale_token_release_is_a_noop() {
        let mutex = mutex_with(30);
        let k = key("web");
        let stale = mutex.acquire(&k, None).await.unwrap();
        mutex.release(&stale).await;

        // A new holder acquires; the stale token must not unlock it.
        let current = mutex.acquire(&k, None).await.unwrap();
        assert!(!mutex.release(&stale).await);
        assert!(mutex.verify(&current).await);
    }

    #[tokio::test]
    async fn fencing_values_increase_per_acquisition() {
        let mutex = mutex_with(30);
        let k = key("web");
        let first = mutex.acquire(&k, None).await.unwrap();
        mutex.release(&first).await;
        let second = mutex.acquire(&k, None).await.unwrap();
        assert!(second.fence > first.fence);
    }

    #[tokio::test]
    async fn expired_lock_is_reacquirable_and_old_token_dead() {
        let store = Arc::new(InMemoryLockStore::new());
        let k = key("web");

        // Tiny TTL via the store directly.
        let old_fence = store
            .try_acquire_nx(&k, Duration::from_millis(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Expired: verify fails, NX acquire succeeds for a new holder.
        assert!(!store.verify(&k, old_fence).await);
        let new_fence = store
            .try_acquire_nx(&k, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(new_fence > old_fence);

        // The zombie holder can neither extend nor delete.
        assert!(
            !store
                .compare_and_extend(&k, old_fence, Duration::from_secs(10))
                .await
        );
        assert!(!store.compare_and_delete(&k, old_fence).await);
        assert!(store.verify(&k, new_fence).await);
    }

    #[tokio::test]
    async fn extend_pushes_expiry_out() {
        let store = Arc::new(InMemoryLockStore::new());
        let k = key("web");
        let fence = store
            .try_acquire_nx(&k, Duration::from_millis(80))
            .await
            .unwrap();
        assert!(
            store
                .compare_and_extend(&k, fence, Duration::from_secs(5))
                .await
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Without the extension this would have expired.
        assert!(store.verify(&k, fence).await);
    }

    #[tokio::test]
    async fn force_release_evicts_current_holder() {
        let mutex = mutex_with(30);
        let k = key("web");
        let token = mutex.acquire(&k, None).await.unwrap();
        assert!(mutex.force_release(&k).await);
        assert!(!mutex.verify(&token).await);
        assert!(mutex.acquire(&k, None).await.is_some());
    }

    #[tokio::test]
    async fn token_survives_serialization() {
        let mutex = mutex_with(30);
        let token = mutex.acquire(&key("web"), None).await.unwrap();

        // Round-trip the token as a durable step boundary would.
        let json = serde_json::to_string(&token).unwrap();
        let resumed: LockToken = serde_json::from_str(&json).unwrap();
        assert!(mutex.verify(&resumed).await);
        assert!(mutex.release(&resumed).await);
    }
}

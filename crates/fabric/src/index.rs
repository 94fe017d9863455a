//! Active-turn index — O(1) SessionKey → workflow-instance lookup.
//!
//! Entries are TTL-scoped so a crashed worker's registration ages out
//! on its own; the next admission then observes a miss and triggers a
//! fresh workflow.  Reads are lock-free from the caller's perspective
//! (the gateway reads outside the session mutex); writes happen inside
//! workflow steps that already hold it.
//!
//! An entry can be marked **draining**: the workflow has committed to
//! finishing and will not take further signals.  The gateway turns
//! arrivals for a draining turn into QUEUE decisions so the adapter
//! retains them for redelivery.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use acf_domain::SessionKey;

/// Snapshot of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTurn {
    pub workflow_id: String,
    pub draining: bool,
}

struct IndexEntry {
    workflow_id: String,
    draining: bool,
    expires: Instant,
}

/// TTL-bounded map of running workflows by session key.
pub struct ActiveTurnIndex {
    entries: Mutex<HashMap<SessionKey, IndexEntry>>,
    default_ttl: Duration,
}

impl ActiveTurnIndex {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// The active registration for a session, if any.
    pub fn lookup(&self, session_key: &SessionKey) -> Option<ActiveTurn> {
        let mut entries = self.entries.lock();
        match entries.get(session_key) {
            Some(entry) if entry.expires > Instant::now() => Some(ActiveTurn {
                workflow_id: entry.workflow_id.clone(),
                draining: entry.draining,
            }),
            Some(_) => {
                // Expired: drop it so the map does not grow unbounded.
                entries.remove(session_key);
                None
            }
            None => None,
        }
    }

    /// The active workflow id for a session, if any.
    pub fn get(&self, session_key: &SessionKey) -> Option<String> {
        self.lookup(session_key).map(|active| active.workflow_id)
    }

    /// Register the active workflow for a session.
    pub fn set(&self, session_key: &SessionKey, workflow_id: &str, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.entries.lock().insert(
            session_key.clone(),
            IndexEntry {
                workflow_id: workflow_id.to_owned(),
                draining: false,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Flag the session's workflow as finishing: it will take no more
    /// signals.  Returns false when no live registration exists.
    pub fn mark_draining(&self, session_key: &SessionKey) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(session_key) {
            Some(entry) if entry.expires > Instant::now() => {
                entry.draining = true;
                true
            }
            _ => false,
        }
    }

    /// Deregister a session's workflow.
    pub fn clear(&self, session_key: &SessionKey) {
        self.entries.lock().remove(session_key);
    }

    /// Number of unexpired registrations (for monitoring).
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_raw("t:a:i:web")
    }

    #[test]
    fn miss_then_set_then_hit() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        assert_eq!(index.get(&key()), None);

        index.set(&key(), "wf-1", None);
        assert_eq!(index.get(&key()).as_deref(), Some("wf-1"));
    }

    #[test]
    fn clear_removes_entry() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", None);
        index.clear(&key());
        assert_eq!(index.get(&key()), None);
    }

    #[test]
    fn set_overwrites_previous_registration() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", None);
        index.set(&key(), "wf-2", None);
        assert_eq!(index.get(&key()).as_deref(), Some("wf-2"));
    }

    #[test]
    fn fresh_registrations_are_not_draining() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", None);
        assert!(!index.lookup(&key()).unwrap().draining);
    }

    #[test]
    fn mark_draining_flags_a_live_entry() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", None);

        assert!(index.mark_draining(&key()));
        let active = index.lookup(&key()).unwrap();
        assert!(active.draining);
        assert_eq!(active.workflow_id, "wf-1");
    }

    #[test]
    fn mark_draining_without_registration_is_false() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        assert!(!index.mark_draining(&key()));
    }

    #[test]
    fn reregistration_resets_the_draining_flag() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", None);
        index.mark_draining(&key());

        index.set(&key(), "wf-2", None);
        assert!(!index.lookup(&key()).unwrap().draining);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let index = ActiveTurnIndex::new(Duration::from_secs(300));
        index.set(&key(), "wf-1", Some(Duration::from_millis(40)));
        assert!(index.get(&key()).is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(index.get(&key()), None);
        assert!(!index.mark_draining(&key()));
        assert!(index.is_empty());
    }
}

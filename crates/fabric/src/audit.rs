//! Audit sink — the durable record of every committed turn.
//!
//! Saves are idempotent on `turn_id`: the workflow engine may replay
//! Step 4, and a replay must yield the same stored record instead of a
//! duplicate.  Records are persisted to a JSONL file and kept in an
//! in-memory map for fast lookup.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use acf_domain::{Error, Result, SessionKey, SideEffect};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted summary of one logical turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: Uuid,
    pub session_key: SessionKey,
    pub turn_group_id: Uuid,
    pub messages: Vec<Uuid>,
    pub side_effects: Vec<SideEffect>,
    /// Final status: `complete`, `superseded`, or `failed`.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sink contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Destination for committed turn records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist a record.  Idempotent on `turn_id`.
    async fn save_turn_record(&self, record: &TurnRecord) -> Result<()>;

    /// Look up a stored record.
    async fn get_turn_record(&self, turn_id: &Uuid) -> Option<TurnRecord>;

    /// All records for a session, in commit order.
    async fn records_for_session(&self, session_key: &SessionKey) -> Vec<TurnRecord>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Volatile sink for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<HashMap<Uuid, TurnRecord>>,
    order: RwLock<Vec<Uuid>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn save_turn_record(&self, record: &TurnRecord) -> Result<()> {
        let mut records = self.records.write();
        if records.insert(record.turn_id, record.clone()).is_none() {
            self.order.write().push(record.turn_id);
        }
        Ok(())
    }

    async fn get_turn_record(&self, turn_id: &Uuid) -> Option<TurnRecord> {
        self.records.read().get(turn_id).cloned()
    }

    async fn records_for_session(&self, session_key: &SessionKey) -> Vec<TurnRecord> {
        let records = self.records.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| records.get(id))
            .filter(|r| &r.session_key == session_key)
            .cloned()
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSONL sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-backed sink: appends one JSON line per save under
/// `state_path/audit/turns.jsonl`, deduplicating by `turn_id` in the
/// in-memory index (last write wins on reload).
pub struct JsonlAuditSink {
    path: PathBuf,
    records: RwLock<HashMap<Uuid, TurnRecord>>,
    order: RwLock<Vec<Uuid>>,
}

impl JsonlAuditSink {
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("audit");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("turns.jsonl");

        let mut records = HashMap::new();
        let mut order = Vec::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<TurnRecord>(line) {
                    Ok(record) => {
                        if records.insert(record.turn_id, record.clone()).is_none() {
                            order.push(record.turn_id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping corrupt audit line");
                    }
                }
            }
        }

        tracing::info!(
            records = records.len(),
            path = %path.display(),
            "audit sink loaded"
        );

        Ok(Self {
            path,
            records: RwLock::new(records),
            order: RwLock::new(order),
        })
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn append_line(&self, record: &TurnRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::PersistenceFailure(format!("opening audit file: {e}")))?;
        writeln!(file, "{json}")
            .map_err(|e| Error::PersistenceFailure(format!("appending audit record: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn save_turn_record(&self, record: &TurnRecord) -> Result<()> {
        {
            let records = self.records.read();
            // Replay of an already-persisted record is a no-op.
            if records.contains_key(&record.turn_id) {
                return Ok(());
            }
        }

        self.append_line(record)?;

        let mut records = self.records.write();
        if records.insert(record.turn_id, record.clone()).is_none() {
            self.order.write().push(record.turn_id);
        }
        Ok(())
    }

    async fn get_turn_record(&self, turn_id: &Uuid) -> Option<TurnRecord> {
        self.records.read().get(turn_id).cloned()
    }

    async fn records_for_session(&self, session_key: &SessionKey) -> Vec<TurnRecord> {
        let records = self.records.read();
        self.order
            .read()
            .iter()
            .filter_map(|id| records.get(id))
            .filter(|r| &r.session_key == session_key)
            .cloned()
            .collect()
    }
}

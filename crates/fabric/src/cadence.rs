//! Per-interlocutor typing cadence — learned inter-message gaps that
//! feed the adaptive accumulation window.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::RwLock;
use uuid::Uuid;

use acf_turn::UserCadenceStats;

/// Keep at most this many recent gaps per interlocutor.
const MAX_SAMPLES: usize = 64;

struct CadenceEntry {
    last_message_at: Instant,
    gaps_ms: VecDeque<u64>,
}

/// Rolling inter-message gap statistics per interlocutor.
#[derive(Default)]
pub struct UserCadenceTracker {
    entries: RwLock<HashMap<Uuid, CadenceEntry>>,
}

impl UserCadenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one message arrival for the interlocutor.
    pub fn record_message(&self, interlocutor_id: &Uuid) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(interlocutor_id) {
            Some(entry) => {
                let gap = now.duration_since(entry.last_message_at).as_millis() as u64;
                entry.last_message_at = now;
                entry.gaps_ms.push_back(gap);
                if entry.gaps_ms.len() > MAX_SAMPLES {
                    entry.gaps_ms.pop_front();
                }
            }
            None => {
                entries.insert(
                    *interlocutor_id,
                    CadenceEntry {
                        last_message_at: now,
                        gaps_ms: VecDeque::new(),
                    },
                );
            }
        }
    }

    /// Current stats, if any gaps have been observed.  Callers should
    /// still check `sample_count` against
    /// [`UserCadenceStats::MIN_SAMPLES`] before trusting them.
    pub fn stats(&self, interlocutor_id: &Uuid) -> Option<UserCadenceStats> {
        let entries = self.entries.read();
        let entry = entries.get(interlocutor_id)?;
        if entry.gaps_ms.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = entry.gaps_ms.iter().copied().collect();
        sorted.sort_unstable();

        Some(UserCadenceStats {
            inter_message_p50_ms: percentile(&sorted, 0.50),
            inter_message_p95_ms: percentile(&sorted, 0.95),
            sample_count: sorted.len() as u32,
        })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

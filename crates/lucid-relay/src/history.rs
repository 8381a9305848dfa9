//! In-memory session transcripts with best-effort durability.
//!
//! Appends are O(1) into a per-connection buffer. `flush` persists the
//! not-yet-durable suffix through [`TranscriptRepo`]; only after a
//! successful flush may the soft cap evict entries, and it only ever
//! evicts entries that are already persisted.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::instrument;

use lucid_core::history::HistoryEntry;
use lucid_core::ids::ConnectionId;
use lucid_store::TranscriptRepo;

use crate::error::RelayError;

struct Buffer {
    entries: VecDeque<HistoryEntry>,
    /// Absolute sequence number of `entries[0]`.
    base_seq: u64,
    /// Absolute sequence number of the first entry not yet persisted.
    persisted: u64,
}

impl Buffer {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            base_seq: 0,
            persisted: 0,
        }
    }

    fn next_seq(&self) -> u64 {
        self.base_seq + self.entries.len() as u64
    }
}

pub struct SessionHistoryStore {
    buffers: DashMap<ConnectionId, Buffer>,
    repo: TranscriptRepo,
    soft_cap: Option<usize>,
}

impl SessionHistoryStore {
    pub fn new(repo: TranscriptRepo, soft_cap: Option<usize>) -> Self {
        Self {
            buffers: DashMap::new(),
            repo,
            soft_cap,
        }
    }

    pub fn append(&self, connection_id: &ConnectionId, entry: HistoryEntry) {
        self.buffers
            .entry(connection_id.clone())
            .or_insert_with(Buffer::new)
            .entries
            .push_back(entry);
    }

    /// In-memory entries for a connection, oldest first.
    pub fn snapshot(&self, connection_id: &ConnectionId) -> Vec<HistoryEntry> {
        self.buffers
            .get(connection_id)
            .map(|b| b.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, connection_id: &ConnectionId) -> usize {
        self.buffers.get(connection_id).map_or(0, |b| b.entries.len())
    }

    pub fn is_empty(&self, connection_id: &ConnectionId) -> bool {
        self.len(connection_id) == 0
    }

    /// Persist the unpersisted suffix. Returns how many entries were
    /// written. Failure leaves the buffer untouched so a later flush can
    /// retry; callers treat it as non-fatal.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub fn flush(&self, connection_id: &ConnectionId) -> Result<usize, RelayError> {
        let Some(mut buffer) = self.buffers.get_mut(connection_id) else {
            return Ok(0);
        };

        let unpersisted_from = (buffer.persisted - buffer.base_seq) as usize;
        let pending: Vec<HistoryEntry> = buffer
            .entries
            .iter()
            .skip(unpersisted_from)
            .cloned()
            .collect();

        if !pending.is_empty() {
            self.repo
                .append_entries(connection_id, buffer.persisted, &pending)?;
            buffer.persisted = buffer.next_seq();
        }

        // Retention: evict oldest persisted entries beyond the cap.
        if let Some(cap) = self.soft_cap {
            while buffer.entries.len() > cap && buffer.base_seq < buffer.persisted {
                buffer.entries.pop_front();
                buffer.base_seq += 1;
            }
        }

        Ok(pending.len())
    }

    /// Teardown path: flush, then discard the buffer regardless of outcome.
    pub fn flush_and_remove(&self, connection_id: &ConnectionId) -> Result<usize, RelayError> {
        let result = self.flush(connection_id);
        self.buffers.remove(connection_id);
        result
    }
}

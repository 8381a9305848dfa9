use chrono::Utc;
use tracing::instrument;

use lucid_core::history::{HistoryEntry, Role};
use lucid_core::ids::ConnectionId;

use crate::database::Database;
use crate::error::StoreError;

/// Durable session transcripts, keyed by `(connection_id, seq)`.
///
/// Writers assign sequence numbers; re-flushing the same range is a no-op
/// because appends use `INSERT OR REPLACE` over the same keys.
pub struct TranscriptRepo {
    db: Database,
}

impl TranscriptRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a run of entries starting at `start_seq`, in one transaction.
    #[instrument(skip(self, entries), fields(connection_id = %connection_id, count = entries.len()))]
    pub fn append_entries(
        &self,
        connection_id: &ConnectionId,
        start_seq: u64,
        entries: &[HistoryEntry],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let flushed_at = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute_batch("BEGIN")?;
            let result = (|| {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO transcripts
                     (connection_id, seq, role, content, timestamp, flushed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for (offset, entry) in entries.iter().enumerate() {
                    stmt.execute(rusqlite::params![
                        connection_id.as_str(),
                        start_seq + offset as u64,
                        entry.role.as_str(),
                        entry.content,
                        entry.timestamp,
                        flushed_at,
                    ])?;
                }
                Ok::<(), StoreError>(())
            })();
            match result {
                Ok(()) => {
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    Err(e)
                }
            }
        })
    }

    /// Load a connection's full transcript, ordered by sequence.
    pub fn load(&self, connection_id: &ConnectionId) -> Result<Vec<HistoryEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT role, content, timestamp FROM transcripts
                 WHERE connection_id = ?1 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map([connection_id.as_str()], |row| {
                let role_str: String = row.get(0)?;
                Ok((role_str, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;

            let mut entries = Vec::new();
            for row in rows {
                let (role_str, content, timestamp) = row?;
                let role: Role = role_str
                    .parse()
                    .map_err(StoreError::Serialization)?;
                entries.push(HistoryEntry {
                    role,
                    content,
                    timestamp,
                });
            }
            Ok(entries)
        })
    }

    pub fn count(&self, connection_id: &ConnectionId) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let count: u64 = conn.query_row(
                "SELECT COUNT(*) FROM transcripts WHERE connection_id = ?1",
                [connection_id.as_str()],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    pub fn delete(&self, connection_id: &ConnectionId) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM transcripts WHERE connection_id = ?1",
                [connection_id.as_str()],
            )?;
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> TranscriptRepo {
        TranscriptRepo::new(Database::in_memory().unwrap())
    }

    fn entries(contents: &[&str]) -> Vec<HistoryEntry> {
        contents.iter().map(|c| HistoryEntry::user(*c)).collect()
    }

    #[test]
    fn append_and_load_ordered() {
        let repo = repo();
        let id = ConnectionId::from_raw("conn_a");

        repo.append_entries(&id, 0, &entries(&["one", "two"])).unwrap();
        repo.append_entries(&id, 2, &entries(&["three"])).unwrap();

        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].content, "one");
        assert_eq!(loaded[2].content, "three");
    }

    #[test]
    fn reflush_same_range_is_idempotent() {
        let repo = repo();
        let id = ConnectionId::from_raw("conn_a");

        let batch = entries(&["one", "two"]);
        repo.append_entries(&id, 0, &batch).unwrap();
        repo.append_entries(&id, 0, &batch).unwrap();

        assert_eq!(repo.count(&id).unwrap(), 2);
    }

    #[test]
    fn roles_survive_roundtrip() {
        let repo = repo();
        let id = ConnectionId::from_raw("conn_a");

        let batch = vec![
            HistoryEntry::system("persona"),
            HistoryEntry::user("hi"),
            HistoryEntry::assistant("hello"),
        ];
        repo.append_entries(&id, 0, &batch).unwrap();

        let loaded = repo.load(&id).unwrap();
        assert_eq!(loaded[0].role, Role::System);
        assert_eq!(loaded[1].role, Role::User);
        assert_eq!(loaded[2].role, Role::Assistant);
    }

    #[test]
    fn connections_are_isolated() {
        let repo = repo();
        let a = ConnectionId::from_raw("conn_a");
        let b = ConnectionId::from_raw("conn_b");

        repo.append_entries(&a, 0, &entries(&["for a"])).unwrap();
        repo.append_entries(&b, 0, &entries(&["for b", "more b"])).unwrap();

        assert_eq!(repo.count(&a).unwrap(), 1);
        assert_eq!(repo.count(&b).unwrap(), 2);
        assert_eq!(repo.load(&a).unwrap()[0].content, "for a");
    }

    #[test]
    fn delete_removes_only_target() {
        let repo = repo();
        let a = ConnectionId::from_raw("conn_a");
        let b = ConnectionId::from_raw("conn_b");

        repo.append_entries(&a, 0, &entries(&["x"])).unwrap();
        repo.append_entries(&b, 0, &entries(&["y"])).unwrap();

        assert_eq!(repo.delete(&a).unwrap(), 1);
        assert_eq!(repo.count(&a).unwrap(), 0);
        assert_eq!(repo.count(&b).unwrap(), 1);
    }

    #[test]
    fn empty_append_is_noop() {
        let repo = repo();
        let id = ConnectionId::from_raw("conn_a");
        repo.append_entries(&id, 0, &[]).unwrap();
        assert_eq!(repo.count(&id).unwrap(), 0);
    }

    #[test]
    fn load_unknown_connection_is_empty() {
        let repo = repo();
        let id = ConnectionId::from_raw("conn_missing");
        assert!(repo.load(&id).unwrap().is_empty());
    }
}

//! Append-only audit history of high-activity snapshots.
//!
//! The scanner is the only writer. Records are never updated and no
//! retention is applied here.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::registry::OwnerId;

/// Limit applied when a query asks for `<= 0` rows.
pub(crate) const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// `history_db` value that keeps history in process memory only.
pub(crate) const IN_MEMORY_HISTORY: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HighActiveRecord {
    /// Assigned by the store on append; 0 before that.
    pub(crate) id: i64,
    #[serde(rename = "user_id")]
    pub(crate) owner_id: OwnerId,
    #[serde(rename = "username")]
    pub(crate) owner_name: String,
    pub(crate) active_slots: usize,
    pub(crate) window_secs: i64,
    pub(crate) created_at: i64,
}

/// Zero or negative bounds mean "unbounded"; `owner_id <= 0` means all owners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HistoryQuery {
    pub(crate) start_time: i64,
    pub(crate) end_time: i64,
    pub(crate) owner_id: OwnerId,
    pub(crate) limit: i64,
}

impl HistoryQuery {
    pub(crate) fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            self.limit
        }
    }

    fn accepts(&self, record: &HighActiveRecord) -> bool {
        (self.start_time <= 0 || record.created_at >= self.start_time)
            && (self.end_time <= 0 || record.created_at <= self.end_time)
            && (self.owner_id <= 0 || record.owner_id == self.owner_id)
    }
}

pub(crate) trait HistoryStore: Send + Sync {
    /// Persist one record, returning its assigned id.
    fn append(&self, record: &HighActiveRecord) -> Result<i64>;

    /// Matching records, newest `created_at` first.
    fn query(&self, query: &HistoryQuery) -> Result<Vec<HighActiveRecord>>;
}

// ── SQLite backend ───────────────────────────────────────────────────────

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS high_active_task_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    username TEXT NOT NULL DEFAULT '',
    active_slots INTEGER NOT NULL,
    window_secs INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_high_active_user ON high_active_task_records(user_id);
CREATE INDEX IF NOT EXISTS idx_high_active_created ON high_active_task_records(created_at);
";

pub(crate) struct SqliteHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteHistoryStore {
    /// Open or create a history database file with full schema.
    pub(crate) fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::SlotwatchError::io_at(e, parent))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn record_count(&self) -> Result<usize> {
        let count = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM high_active_task_records",
            [],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as usize)
    }

    fn row_to_record(row: &rusqlite::Row) -> std::result::Result<HighActiveRecord, rusqlite::Error> {
        Ok(HighActiveRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            owner_name: row.get(2)?,
            active_slots: row.get::<_, i64>(3)? as usize,
            window_secs: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&self, record: &HighActiveRecord) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO high_active_task_records
                (user_id, username, active_slots, window_secs, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.owner_id,
                record.owner_name,
                record.active_slots as i64,
                record.window_secs,
                record.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn query(&self, query: &HistoryQuery) -> Result<Vec<HighActiveRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, username, active_slots, window_secs, created_at
             FROM high_active_task_records
             WHERE (?1 <= 0 OR created_at >= ?1)
               AND (?2 <= 0 OR created_at <= ?2)
               AND (?3 <= 0 OR user_id = ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                query.start_time,
                query.end_time,
                query.owner_id,
                query.effective_limit()
            ],
            Self::row_to_record,
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

// ── In-memory backend ────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MemoryHistoryStore {
    records: Mutex<Vec<HighActiveRecord>>,
}

impl MemoryHistoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.records.lock().len()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn append(&self, record: &HighActiveRecord) -> Result<i64> {
        let mut records = self.records.lock();
        let id = records.len() as i64 + 1;
        records.push(HighActiveRecord {
            id,
            ..record.clone()
        });
        Ok(id)
    }

    fn query(&self, query: &HistoryQuery) -> Result<Vec<HighActiveRecord>> {
        let records = self.records.lock();
        let mut matched: Vec<HighActiveRecord> = records
            .iter()
            .filter(|r| query.accepts(r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matched.truncate(query.effective_limit() as usize);
        Ok(matched)
    }
}

/// Open the configured backend. [`IN_MEMORY_HISTORY`] selects the in-memory
/// store; anything else is a SQLite file path.
pub(crate) fn open_history_store(path: &Path) -> Result<Arc<dyn HistoryStore>> {
    if path.as_os_str() == IN_MEMORY_HISTORY {
        tracing::warn!("history kept in memory only; records are lost on exit");
        return Ok(Arc::new(MemoryHistoryStore::new()));
    }
    Ok(Arc::new(SqliteHistoryStore::open_or_create(path)?))
}

// ── Tests ────────────────────────────────────────────────────────────────

//! Database persistence for scrape session state.
//!
//! The background process is evicted as a normal browser optimization; the
//! persisted row is the sole source of truth for rehydrating a session and
//! resuming from its last cursor or scroll position.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::Result;
use crate::models::{SessionRecord, SessionStatus};

#[derive(Clone)]
pub struct SessionStore {
    db_path: PathBuf,
}

impl SessionStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.init()?;
        Ok(store)
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 30000;
        "#,
        )?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scrape_sessions (
                id TEXT PRIMARY KEY,
                target_post_id TEXT NOT NULL,
                tab_id INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                paused INTEGER NOT NULL DEFAULT 0,
                comments_found INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                cursor TEXT,
                scroll_position INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_tab
                ON scrape_sessions (tab_id, active);
        "#,
        )?;
        Ok(())
    }

    /// Write the session row; called on every state transition.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO scrape_sessions
               (id, target_post_id, tab_id, active, paused, comments_found,
                status, message, cursor, scroll_position, started_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                record.id,
                record.target_post_id,
                record.tab_id as i64,
                record.active as i64,
                record.paused as i64,
                record.comments_found as i64,
                record.status.as_str(),
                record.message,
                record.cursor,
                record.scroll_position as i64,
                record.started_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(id = %record.id, status = record.status.as_str(), "session state persisted");
        Ok(())
    }

    /// The active session for a tab, if one survived a restart.
    pub fn load_active_for_tab(&self, tab_id: u32) -> Result<Option<SessionRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                r#"SELECT id, target_post_id, tab_id, active, paused, comments_found,
                          status, message, cursor, scroll_position, started_at, updated_at
                   FROM scrape_sessions
                   WHERE tab_id = ? AND active = 1
                   ORDER BY updated_at DESC LIMIT 1"#,
                params![tab_id as i64],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    pub fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                r#"SELECT id, target_post_id, tab_id, active, paused, comments_found,
                          status, message, cursor, scroll_position, started_at, updated_at
                   FROM scrape_sessions WHERE id = ?"#,
                params![id],
                row_to_record,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    /// All sessions still marked active (for status reporting).
    pub fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"SELECT id, target_post_id, tab_id, active, paused, comments_found,
                      status, message, cursor, scroll_position, started_at, updated_at
               FROM scrape_sessions WHERE active = 1 ORDER BY updated_at DESC"#,
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let parse = |s: String| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    Ok(SessionRecord {
        id: row.get(0)?,
        target_post_id: row.get(1)?,
        tab_id: row.get::<_, i64>(2)? as u32,
        active: row.get::<_, i64>(3)? != 0,
        paused: row.get::<_, i64>(4)? != 0,
        comments_found: row.get::<_, i64>(5)? as u64,
        status: SessionStatus::from_str(&row.get::<_, String>(6)?)
            .unwrap_or(SessionStatus::Error),
        message: row.get(7)?,
        cursor: row.get(8)?,
        scroll_position: row.get::<_, i64>(9)? as u32,
        started_at: parse(row.get::<_, String>(10)?),
        updated_at: parse(row.get::<_, String>(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips_with_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();

        let mut record = SessionRecord::new("post-1", 3);
        record.status = SessionStatus::Scraping;
        record.cursor = Some("120".to_string());
        record.comments_found = 42;
        store.save(&record).unwrap();

        let loaded = store.load_active_for_tab(3).unwrap().unwrap();
        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.cursor.as_deref(), Some("120"));
        assert_eq!(loaded.comments_found, 42);
        assert_eq!(loaded.status, SessionStatus::Scraping);
    }

    #[test]
    fn inactive_sessions_do_not_rehydrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path().join("sessions.db")).unwrap();

        let mut record = SessionRecord::new("post-1", 3);
        record.active = false;
        record.status = SessionStatus::Complete;
        store.save(&record).unwrap();

        assert!(store.load_active_for_tab(3).unwrap().is_none());
        assert!(store.active_sessions().unwrap().is_empty());
    }
}

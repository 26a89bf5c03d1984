//! Database persistence for rate limit state.
//!
//! The pause must survive a background process restart; otherwise an evicted
//! and relaunched engine would immediately hammer a host that just limited
//! it.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use super::{RateLimitMonitor, RateLimitState};
use crate::error::Result;

/// Open a database connection with proper concurrency settings.
pub(crate) fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

fn init_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS rate_limit_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            limited INTEGER NOT NULL DEFAULT 0,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            first_error_at TEXT,
            last_error_at TEXT,
            paused_until TEXT,
            total_hits INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
    "#,
    )?;
    Ok(())
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Load persisted rate limit state into the monitor. Expired pauses are not
/// restored.
pub async fn load_rate_limit_state(monitor: &RateLimitMonitor, db_path: &Path) -> Result<bool> {
    let conn = open_db(db_path)?;
    init_table(&conn)?;

    let row = conn
        .query_row(
            r#"SELECT limited, consecutive_errors, first_error_at, last_error_at,
                      paused_until, total_hits
               FROM rate_limit_state WHERE id = 1"#,
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? != 0,
                    row.get::<_, i64>(1)? as u32,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)? as u64,
                ))
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let Some((limited, consecutive_errors, first, last, paused_until, total_hits)) = row else {
        return Ok(false);
    };

    let paused_until = parse_ts(paused_until).filter(|until| *until > Utc::now());
    let still_limited = limited && paused_until.is_some();
    if still_limited {
        info!(
            consecutive_errors,
            ?paused_until,
            "restored active rate limit pause"
        );
    }

    monitor
        .restore(RateLimitState {
            limited: still_limited,
            consecutive_errors: if still_limited { consecutive_errors } else { 0 },
            first_error_at: parse_ts(first),
            last_error_at: parse_ts(last),
            paused_until,
            probe_pending: false,
            total_hits,
        })
        .await;

    Ok(still_limited)
}

/// Save the monitor's current state.
pub async fn save_rate_limit_state(monitor: &RateLimitMonitor, db_path: &Path) -> Result<()> {
    let state = monitor.state().await;
    let conn = open_db(db_path)?;
    init_table(&conn)?;

    conn.execute(
        r#"INSERT OR REPLACE INTO rate_limit_state
           (id, limited, consecutive_errors, first_error_at, last_error_at,
            paused_until, total_hits, updated_at)
           VALUES (1, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)"#,
        params![
            state.limited as i64,
            state.consecutive_errors as i64,
            state.first_error_at.map(|t| t.to_rfc3339()),
            state.last_error_at.map(|t| t.to_rfc3339()),
            state.paused_until.map(|t| t.to_rfc3339()),
            state.total_hits as i64,
        ],
    )?;
    debug!("saved rate limit state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BackoffConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn state_round_trips_through_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("engine.db");

        let monitor = RateLimitMonitor::new(BackoffConfig {
            initial: Duration::from_secs(120),
            max: Duration::from_secs(600),
        });
        monitor.report_failure().await;
        monitor.report_failure().await;
        save_rate_limit_state(&monitor, &db).await.unwrap();

        let restored = RateLimitMonitor::default();
        let limited = load_rate_limit_state(&restored, &db).await.unwrap();
        assert!(limited);
        let state = restored.state().await;
        assert_eq!(state.consecutive_errors, 2);
        assert_eq!(state.total_hits, 2);
        assert!(restored.is_limited().await);
    }

    #[tokio::test]
    async fn expired_pause_is_not_restored() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("engine.db");

        let monitor = RateLimitMonitor::new(BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(1),
        });
        monitor.report_failure().await;
        save_rate_limit_state(&monitor, &db).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let restored = RateLimitMonitor::default();
        let limited = load_rate_limit_state(&restored, &db).await.unwrap();
        assert!(!limited);
        assert!(!restored.is_limited().await);
    }
}

//! Collected-record store.
//!
//! Owns the comment/post records the engine produces before the dashboard
//! collaborator syncs them, the ignore list, and reply outcome updates.
//! Dedup happens here: a record is accepted only if its (post id, comment
//! id) key is unseen and its text matches no ignore-list entry.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::Result;
use crate::models::{CommentRecord, CommentSource, IgnoreEntry, PostRecord, ScrapeStats};

/// Why a record was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Identity key already stored.
    Duplicate,
    /// Text matched an ignore-list entry.
    Ignored,
}

#[derive(Clone)]
pub struct CommentStore {
    db_path: PathBuf,
}

impl CommentStore {
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
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 30000;
        "#,
        )?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                post_id TEXT PRIMARY KEY,
                media_url TEXT,
                author TEXT NOT NULL,
                ordering INTEGER NOT NULL DEFAULT 0,
                scraped_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS comments (
                post_id TEXT NOT NULL,
                comment_id TEXT NOT NULL,
                author TEXT NOT NULL,
                text TEXT NOT NULL,
                posted_at TEXT,
                parent_comment_id TEXT,
                reply_count INTEGER NOT NULL DEFAULT 0,
                source TEXT NOT NULL,
                scraped_at TEXT NOT NULL,
                reply_sent INTEGER NOT NULL DEFAULT 0,
                reply_sent_at TEXT,
                reply_error TEXT,
                reply_content TEXT,
                PRIMARY KEY (post_id, comment_id)
            );
            CREATE TABLE IF NOT EXISTS ignore_list (
                text TEXT PRIMARY KEY,
                added_at TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Insert a comment record, deduplicating against stored rows and the
    /// ignore list.
    pub fn insert_comment(&self, record: &CommentRecord) -> Result<InsertOutcome> {
        if self.is_ignored(&record.text)? {
            debug!(comment_id = %record.comment_id, "record matched ignore list");
            return Ok(InsertOutcome::Ignored);
        }

        let conn = self.connect()?;
        let changed = conn.execute(
            r#"INSERT OR IGNORE INTO comments
               (post_id, comment_id, author, text, posted_at, parent_comment_id,
                reply_count, source, scraped_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                record.post_id,
                record.comment_id,
                record.author,
                record.text,
                record.posted_at.map(|t| t.to_rfc3339()),
                record.parent_comment_id,
                record.reply_count as i64,
                record.source.as_str(),
                record.scraped_at.to_rfc3339(),
            ],
        )?;

        if changed == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Insert a batch, producing the session's acceptance stats.
    pub fn insert_comments(&self, records: &[CommentRecord]) -> Result<ScrapeStats> {
        let mut stats = ScrapeStats::default();
        for record in records {
            stats.found += 1;
            match self.insert_comment(record)? {
                InsertOutcome::Inserted => stats.new += 1,
                InsertOutcome::Duplicate => stats.preexisting += 1,
                InsertOutcome::Ignored => stats.ignored += 1,
            }
        }
        Ok(stats)
    }

    pub fn upsert_post(&self, post: &PostRecord) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"INSERT OR REPLACE INTO posts (post_id, media_url, author, ordering, scraped_at)
               VALUES (?, ?, ?, ?, ?)"#,
            params![
                post.post_id,
                post.media_url,
                post.author,
                post.ordering as i64,
                post.scraped_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_comment(&self, post_id: &str, comment_id: &str) -> Result<Option<CommentRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                r#"SELECT post_id, comment_id, author, text, posted_at, parent_comment_id,
                          reply_count, source, scraped_at
                   FROM comments WHERE post_id = ? AND comment_id = ?"#,
                params![post_id, comment_id],
                row_to_comment,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(record)
    }

    pub fn comments_for_post(&self, post_id: &str) -> Result<Vec<CommentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"SELECT post_id, comment_id, author, text, posted_at, parent_comment_id,
                      reply_count, source, scraped_at
               FROM comments WHERE post_id = ? ORDER BY scraped_at"#,
        )?;
        let rows = stmt.query_map(params![post_id], row_to_comment)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn count_comments(&self) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM comments", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Remove a scraped comment (dashboard command, or a vanished reply
    /// target when the feature flag asks for it).
    pub fn remove_comment(&self, post_id: &str, comment_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM comments WHERE post_id = ? AND comment_id = ?",
            params![post_id, comment_id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_comment_text(&self, post_id: &str, comment_id: &str, text: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE comments SET text = ? WHERE post_id = ? AND comment_id = ?",
            params![text, post_id, comment_id],
        )?;
        Ok(changed > 0)
    }

    /// Record a reply outcome against its target comment.
    pub fn mark_reply(
        &self,
        post_id: &str,
        comment_id: &str,
        sent: bool,
        sent_at: Option<DateTime<Utc>>,
        error: Option<&str>,
        content: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            r#"UPDATE comments
               SET reply_sent = ?, reply_sent_at = ?, reply_error = ?, reply_content = ?
               WHERE post_id = ? AND comment_id = ?"#,
            params![
                sent as i64,
                sent_at.map(|t| t.to_rfc3339()),
                error,
                content,
                post_id,
                comment_id,
            ],
        )?;
        Ok(())
    }

    // Ignore list: append/remove only, matched by exact-trim equality.

    pub fn is_ignored(&self, text: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ignore_list WHERE text = ?",
            params![text.trim()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn add_ignore(&self, entry: &IgnoreEntry) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR IGNORE INTO ignore_list (text, added_at) VALUES (?, ?)",
            params![entry.text.trim(), entry.added_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_ignore(&self, text: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM ignore_list WHERE text = ?",
            params![text.trim()],
        )?;
        Ok(changed > 0)
    }

    pub fn list_ignores(&self) -> Result<Vec<IgnoreEntry>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT text, added_at FROM ignore_list ORDER BY added_at")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (text, added_at) = row?;
            entries.push(IgnoreEntry {
                text,
                added_at: DateTime::parse_from_rfc3339(&added_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(entries)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn row_to_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommentRecord> {
    Ok(CommentRecord {
        post_id: row.get(0)?,
        comment_id: row.get(1)?,
        author: row.get(2)?,
        text: row.get(3)?,
        posted_at: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)),
        parent_comment_id: row.get(5)?,
        reply_count: row.get::<_, i64>(6)? as u32,
        source: CommentSource::from_str(&row.get::<_, String>(7)?)
            .unwrap_or(CommentSource::Extracted),
        scraped_at: row
            .get::<_, String>(8)
            .ok()
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CommentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CommentStore::open(dir.path().join("records.db")).unwrap();
        (dir, store)
    }

    fn record(post: &str, cid: &str, text: &str) -> CommentRecord {
        let mut r = CommentRecord::new(post, cid);
        r.text = text.to_string();
        r.author = "someone".to_string();
        r
    }

    #[test]
    fn second_identical_scrape_counts_as_preexisting() {
        let (_dir, store) = store();
        let first = store
            .insert_comments(&[record("p1", "c1", "same text")])
            .unwrap();
        assert_eq!(first.new, 1);

        let second = store
            .insert_comments(&[record("p1", "c1", "same text")])
            .unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.preexisting, 1);
        assert_eq!(store.count_comments().unwrap(), 1);
    }

    #[test]
    fn ignored_text_never_reaches_storage() {
        let (_dir, store) = store();
        store.add_ignore(&IgnoreEntry::new("nope")).unwrap();

        let stats = store
            .insert_comments(&[record("p1", "c1", "  nope  ")])
            .unwrap();
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.new, 0);
        assert_eq!(store.count_comments().unwrap(), 0);
    }

    #[test]
    fn same_comment_id_under_different_posts_is_distinct() {
        let (_dir, store) = store();
        store.insert_comment(&record("p1", "c1", "a")).unwrap();
        let outcome = store.insert_comment(&record("p2", "c1", "a")).unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);
        assert_eq!(store.count_comments().unwrap(), 2);
    }

    #[test]
    fn ignore_list_add_remove_round_trip() {
        let (_dir, store) = store();
        store.add_ignore(&IgnoreEntry::new("spam")).unwrap();
        assert!(store.is_ignored(" spam ").unwrap());
        assert_eq!(store.list_ignores().unwrap().len(), 1);
        assert!(store.remove_ignore("spam").unwrap());
        assert!(!store.is_ignored("spam").unwrap());
    }

    #[test]
    fn reply_outcome_updates_land_on_the_record() {
        let (_dir, store) = store();
        store.insert_comment(&record("p1", "c1", "hello")).unwrap();
        store
            .mark_reply("p1", "c1", true, Some(Utc::now()), None, Some("thanks!"))
            .unwrap();

        let conn = store.connect().unwrap();
        let (sent, content): (i64, Option<String>) = conn
            .query_row(
                "SELECT reply_sent, reply_content FROM comments WHERE comment_id = 'c1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(content.as_deref(), Some("thanks!"));
    }

    #[test]
    fn remove_and_update_comment() {
        let (_dir, store) = store();
        store.insert_comment(&record("p1", "c1", "old")).unwrap();
        assert!(store.update_comment_text("p1", "c1", "new").unwrap());
        let fetched = store.get_comment("p1", "c1").unwrap().unwrap();
        assert_eq!(fetched.text, "new");
        assert!(store.remove_comment("p1", "c1").unwrap());
        assert!(store.get_comment("p1", "c1").unwrap().is_none());
    }

    #[test]
    fn post_upsert_round_trip() {
        let (_dir, store) = store();
        let mut post = PostRecord::new("p1", "author", 0);
        post.media_url = Some("https://cdn/thumb.jpg".to_string());
        store.upsert_post(&post).unwrap();

        let conn = store.connect().unwrap();
        let media: Option<String> = conn
            .query_row(
                "SELECT media_url FROM posts WHERE post_id = 'p1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(media.as_deref(), Some("https://cdn/thumb.jpg"));
    }
}

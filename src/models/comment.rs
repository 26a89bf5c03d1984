//! Comment and post records extracted from the host page.
//!
//! Identity is the natural key (post id, comment id); records are
//! deduplicated against already-stored rows and the ignore list before
//! acceptance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a comment record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentSource {
    /// Read off the host page or its listing API.
    Extracted,
    /// Authored by this engine during a bulk reply run.
    Automated,
}

impl CommentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracted => "extracted",
            Self::Automated => "automated",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "extracted" => Some(Self::Extracted),
            "automated" => Some(Self::Automated),
            _ => None,
        }
    }
}

/// Identity key for a comment within one end-user scope.
pub type CommentKey = (String, String);

/// A single comment extracted from the host page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentRecord {
    /// Stable comment id assigned by the host.
    pub comment_id: String,
    /// Id of the post the comment belongs to.
    pub post_id: String,
    /// Author handle as displayed by the host.
    pub author: String,
    /// Comment text.
    pub text: String,
    /// Host-reported creation time, when recoverable.
    pub posted_at: Option<DateTime<Utc>>,
    /// Parent comment id when this is a reply.
    pub parent_comment_id: Option<String>,
    /// Number of replies the host reports under this comment.
    pub reply_count: u32,
    /// Extracted vs. authored by automation.
    pub source: CommentSource,
    /// When this engine scraped the record.
    pub scraped_at: DateTime<Utc>,
}

impl CommentRecord {
    pub fn new(post_id: impl Into<String>, comment_id: impl Into<String>) -> Self {
        Self {
            comment_id: comment_id.into(),
            post_id: post_id.into(),
            author: String::new(),
            text: String::new(),
            posted_at: None,
            parent_comment_id: None,
            reply_count: 0,
            source: CommentSource::Extracted,
            scraped_at: Utc::now(),
        }
    }

    /// Identity key: (post id, comment id).
    pub fn key(&self) -> CommentKey {
        (self.post_id.clone(), self.comment_id.clone())
    }

    /// Whether this record is a reply to another comment.
    pub fn is_reply(&self) -> bool {
        self.parent_comment_id.is_some()
    }
}

/// A post owning zero or more comment records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRecord {
    pub post_id: String,
    /// Thumbnail or media URL, when the host exposes one.
    pub media_url: Option<String>,
    pub author: String,
    /// Position of the post in the profile listing it was found in.
    pub ordering: u32,
    pub scraped_at: DateTime<Utc>,
}

impl PostRecord {
    pub fn new(post_id: impl Into<String>, author: impl Into<String>, ordering: u32) -> Self {
        Self {
            post_id: post_id.into(),
            media_url: None,
            author: author.into(),
            ordering,
            scraped_at: Utc::now(),
        }
    }
}

/// Banned text pattern; comments matching by exact-trim equality are dropped
/// at extraction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IgnoreEntry {
    pub text: String,
    pub added_at: DateTime<Utc>,
}

impl IgnoreEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            added_at: Utc::now(),
        }
    }

    /// Exact-trim equality match against comment text.
    pub fn matches(&self, comment_text: &str) -> bool {
        self.text.trim() == comment_text.trim()
    }
}

/// Acceptance counters for one scrape session or batch item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeStats {
    /// Records the extractor produced.
    pub found: u64,
    /// Records accepted as new.
    pub new: u64,
    /// Records rejected as already stored.
    pub preexisting: u64,
    /// Records rejected by the ignore list.
    pub ignored: u64,
}

impl ScrapeStats {
    /// Fold another item's counters into this running total.
    pub fn merge(&mut self, other: &ScrapeStats) {
        self.found += other.found;
        self.new += other.new;
        self.preexisting += other.preexisting;
        self.ignored += other.ignored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comment_key_is_post_and_comment_id() {
        let record = CommentRecord::new("post-1", "c-9");
        assert_eq!(record.key(), ("post-1".to_string(), "c-9".to_string()));
        assert!(!record.is_reply());
    }

    #[test]
    fn ignore_entry_matches_by_trimmed_equality() {
        let entry = IgnoreEntry::new("spam text");
        assert!(entry.matches("  spam text \n"));
        assert!(!entry.matches("spam text!"));
    }

    #[test]
    fn stats_merge_accumulates() {
        let mut total = ScrapeStats::default();
        total.merge(&ScrapeStats {
            found: 3,
            new: 2,
            preexisting: 1,
            ignored: 0,
        });
        total.merge(&ScrapeStats {
            found: 2,
            new: 0,
            preexisting: 1,
            ignored: 1,
        });
        assert_eq!(total.found, 5);
        assert_eq!(total.new, 2);
        assert_eq!(total.preexisting, 2);
        assert_eq!(total.ignored, 1);
    }
}

//! Scrape session and batch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ScrapeStats;

/// Lifecycle of one scrape session.
///
/// Status only moves forward; the only resets are an explicit cancel or a
/// resume out of `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Navigating,
    Scraping,
    Paused,
    Complete,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigating => "navigating",
            Self::Scraping => "scraping",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "navigating" => Some(Self::Navigating),
            "scraping" => Some(Self::Scraping),
            "paused" => Some(Self::Paused),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// Persisted state of one scrape session.
///
/// This row is the sole source of truth for resuming after the background
/// process is evicted; everything needed to continue (cursor or scroll
/// position) lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id, unique per run.
    pub id: String,
    /// Post or profile being extracted.
    pub target_post_id: String,
    /// Browser tab owning the session; at most one active session per tab.
    pub tab_id: u32,
    pub active: bool,
    pub paused: bool,
    pub comments_found: u64,
    pub status: SessionStatus,
    /// Human-readable progress line for the dashboard.
    pub message: String,
    /// Last pagination cursor seen on the network path.
    pub cursor: Option<String>,
    /// Last DOM scroll iteration on the structural path.
    pub scroll_position: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(target_post_id: impl Into<String>, tab_id: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target_post_id: target_post_id.into(),
            tab_id,
            active: true,
            paused: false,
            comments_found: 0,
            status: SessionStatus::Navigating,
            message: String::new(),
            cursor: None,
            scroll_position: 0,
            started_at: now,
            updated_at: now,
        }
    }
}

/// Batch run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Paused,
    Complete,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Derived progress over one batch run; recomputed as the queue advances and
/// never independently persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub current_index: usize,
    pub current_target: Option<String>,
    /// Running comment total across completed items.
    pub comments_total: u64,
    pub stats: ScrapeStats,
    pub status: BatchStatus,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            current_index: 0,
            current_target: None,
            comments_total: 0,
            stats: ScrapeStats::default(),
            status: BatchStatus::Running,
        }
    }
}

/// Per-user settings consumed from the backend collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    /// Cap on posts walked per profile scrape.
    pub max_posts: Option<u32>,
    /// Cap on comments collected per session.
    pub max_comments: Option<u64>,
    /// Skip comments authored by this handle when extracting.
    pub hide_own_replies: bool,
    /// The end user's own handle, for `hide_own_replies`.
    pub own_handle: Option<String>,
    /// Remove stored records whose target vanished from the host.
    pub delete_missing_comments: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            max_posts: None,
            max_comments: None,
            hide_own_replies: true,
            own_handle: None,
            delete_missing_comments: false,
        }
    }
}

impl UserSettings {
    /// Whether an extracted record should be skipped as the user's own reply.
    pub fn hides(&self, author: &str) -> bool {
        self.hide_own_replies
            && self
                .own_handle
                .as_deref()
                .is_some_and(|handle| handle == author)
    }
}

//! Reply targets, per-item progress, and bulk run reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One comment selected for a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub post_id: String,
    pub comment_id: String,
    /// Original comment text, used for best-effort matching when the host
    /// no longer resolves the id.
    pub text_hint: Option<String>,
}

impl ReplyTarget {
    pub fn new(post_id: impl Into<String>, comment_id: impl Into<String>) -> Self {
        Self {
            post_id: post_id.into(),
            comment_id: comment_id.into(),
            text_hint: None,
        }
    }

    pub fn with_text_hint(mut self, hint: impl Into<String>) -> Self {
        self.text_hint = Some(hint.into());
        self
    }
}

/// Stage of one in-flight reply; cleared on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStage {
    Navigating,
    Finding,
    Replying,
    Complete,
    Error,
}

impl ReplyStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Navigating => "navigating",
            Self::Finding => "finding",
            Self::Replying => "replying",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Progress record for one in-flight reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyProgress {
    pub comment_id: String,
    pub stage: ReplyStage,
    pub message: String,
}

/// Final classification of one reply attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    /// Generic submission failure.
    Failed,
    /// Target account blocks mentions.
    MentionUnavailable,
    /// Target comment was not found within the click/scroll budget.
    Skipped,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::MentionUnavailable => "mention_unavailable",
            Self::Skipped => "skipped",
        }
    }
}

/// Outcome of one reply attempt, pushed to the backend collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyOutcome {
    pub target: ReplyTarget,
    pub status: ReplyStatus,
    /// Reply text actually submitted, when one was.
    pub content: Option<String>,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Aggregate progress over one bulk reply run; mutated item-by-item and
/// never rolled back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkReplyProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current: Option<String>,
    pub stopped: bool,
}

impl BulkReplyProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn record(&mut self, status: &ReplyStatus) {
        match status {
            ReplyStatus::Completed => self.completed += 1,
            ReplyStatus::Failed | ReplyStatus::MentionUnavailable => self.failed += 1,
            ReplyStatus::Skipped => self.skipped += 1,
        }
    }
}

/// Final report for one bulk reply run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkReplyReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub stopped: bool,
    pub outcomes: Vec<ReplyOutcome>,
}

impl BulkReplyReport {
    pub fn from_progress(progress: &BulkReplyProgress, outcomes: Vec<ReplyOutcome>) -> Self {
        Self {
            total: progress.total,
            completed: progress.completed,
            failed: progress.failed,
            skipped: progress.skipped,
            stopped: progress.stopped,
            outcomes,
        }
    }
}

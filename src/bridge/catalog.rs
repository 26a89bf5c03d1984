//! Typed message catalog.
//!
//! Every kind is either fire-and-forget (an event broadcast) or
//! request/response, where a request kind maps to exactly one response kind.
//! Contexts never share references; everything crossing a context boundary
//! is one of these types.

use serde::{Deserialize, Serialize};

use crate::config::DelayProfile;
use crate::models::{
    BatchProgress, BulkReplyProgress, BulkReplyReport, CommentRecord, ReplyOutcome, ReplyProgress,
    ReplyTarget, ScrapeStats, SessionStatus,
};
use crate::page::{CapturedCall, PageSnapshot, SubmitOutcome};

/// The four isolated execution contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Context {
    /// Extension background process: owns sessions, queue, orchestrator.
    Background,
    /// Content script: relays DOM-side signals.
    Content,
    /// Injected host-page script: the only context touching host internals.
    Page,
    /// Companion dashboard tab.
    Dashboard,
}

/// Request half of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeRequest {
    // Dashboard -> background.
    GetVideoComments {
        post_id: String,
        tab_id: u32,
        limit: Option<u64>,
    },
    GetBatchComments {
        post_ids: Vec<String>,
        tab_id: u32,
    },
    ReplyComment {
        target: ReplyTarget,
        message: String,
    },
    BulkReplyStart {
        targets: Vec<ReplyTarget>,
        variations: Vec<String>,
    },
    BulkReplyStop,
    ScrapePause {
        session_id: String,
    },
    ScrapeResume {
        session_id: String,
    },
    ScrapeStop {
        session_id: String,
    },
    CheckBridge,
    RemoveScrapedComment {
        post_id: String,
        comment_id: String,
    },
    UpdateScrapedComment {
        post_id: String,
        comment_id: String,
        text: String,
    },
    // Background -> page.
    Navigate {
        post_id: String,
    },
    ProbeReadiness,
    Snapshot,
    ScrollComments,
    LocateComment {
        comment_id: String,
        text_hint: Option<String>,
    },
    HostGlobals,
    CapturedListing,
    SignRequest {
        url: String,
    },
    FetchListing {
        call: CapturedCall,
    },
    SubmitReply {
        comment_id: String,
        text: String,
        typing: DelayProfile,
    },
}

/// Response half of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeResponse {
    Ack,
    BridgeReady {
        version: String,
    },
    Comments {
        records: Vec<CommentRecord>,
        stats: ScrapeStats,
    },
    BatchReport {
        progress: BatchProgress,
    },
    ReplyReport {
        report: BulkReplyReport,
    },
    Ready {
        ready: bool,
    },
    Page {
        snapshot: PageSnapshot,
    },
    Scrolled {
        loaded_more: bool,
    },
    Located {
        found: bool,
    },
    Globals {
        globals: serde_json::Value,
    },
    Captured {
        call: Option<CapturedCall>,
    },
    Signed {
        params: Vec<(String, String)>,
    },
    Listing {
        body: serde_json::Value,
    },
    Submitted {
        outcome: SubmitOutcome,
    },
    Error {
        message: String,
    },
}

/// Fire-and-forget broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    ScrapeProgress {
        session_id: String,
        status: SessionStatus,
        comments_found: u64,
        message: String,
    },
    BatchProgress(BatchProgress),
    ReplyProgress(ReplyProgress),
    BulkReplyProgress(BulkReplyProgress),
    ReplyOutcome(ReplyOutcome),
    PausedState {
        session_id: String,
        paused: bool,
    },
    VisibilityChanged {
        tab_id: u32,
        visible: bool,
    },
    RequestCaptured {
        call: CapturedCall,
    },
    /// Liveness probe from the dashboard side.
    Probe,
    /// Liveness acknowledgment from the engine side.
    ProbeAck,
    /// Hard signal: the engine context is gone.
    ConnectionLost,
}

impl BridgeRequest {
    /// Catalog name of this request kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetVideoComments { .. } => "get_video_comments",
            Self::GetBatchComments { .. } => "get_batch_comments",
            Self::ReplyComment { .. } => "reply_comment",
            Self::BulkReplyStart { .. } => "bulk_reply_start",
            Self::BulkReplyStop => "bulk_reply_stop",
            Self::ScrapePause { .. } => "scrape_pause",
            Self::ScrapeResume { .. } => "scrape_resume",
            Self::ScrapeStop { .. } => "scrape_stop",
            Self::CheckBridge => "check_bridge",
            Self::RemoveScrapedComment { .. } => "remove_scraped_comment",
            Self::UpdateScrapedComment { .. } => "update_scraped_comment",
            Self::Navigate { .. } => "navigate",
            Self::ProbeReadiness => "probe_readiness",
            Self::Snapshot => "snapshot",
            Self::ScrollComments => "scroll_comments",
            Self::LocateComment { .. } => "locate_comment",
            Self::HostGlobals => "host_globals",
            Self::CapturedListing => "captured_listing",
            Self::SignRequest { .. } => "sign_request",
            Self::FetchListing { .. } => "fetch_listing",
            Self::SubmitReply { .. } => "submit_reply",
        }
    }

    /// The one response kind this request maps to (besides `error`).
    pub fn response_kind(&self) -> &'static str {
        match self {
            Self::GetVideoComments { .. } => "comments",
            Self::GetBatchComments { .. } => "batch_report",
            Self::ReplyComment { .. } => "reply_report",
            Self::BulkReplyStart { .. } => "reply_report",
            Self::ScrapePause { .. }
            | Self::ScrapeResume { .. }
            | Self::ScrapeStop { .. }
            | Self::BulkReplyStop
            | Self::RemoveScrapedComment { .. }
            | Self::UpdateScrapedComment { .. }
            | Self::Navigate { .. } => "ack",
            Self::CheckBridge => "bridge_ready",
            Self::ProbeReadiness => "ready",
            Self::Snapshot => "page",
            Self::ScrollComments => "scrolled",
            Self::LocateComment { .. } => "located",
            Self::HostGlobals => "globals",
            Self::CapturedListing => "captured",
            Self::SignRequest { .. } => "signed",
            Self::FetchListing { .. } => "listing",
            Self::SubmitReply { .. } => "submitted",
        }
    }
}

impl BridgeResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::BridgeReady { .. } => "bridge_ready",
            Self::Comments { .. } => "comments",
            Self::BatchReport { .. } => "batch_report",
            Self::ReplyReport { .. } => "reply_report",
            Self::Ready { .. } => "ready",
            Self::Page { .. } => "page",
            Self::Scrolled { .. } => "scrolled",
            Self::Located { .. } => "located",
            Self::Globals { .. } => "globals",
            Self::Captured { .. } => "captured",
            Self::Signed { .. } => "signed",
            Self::Listing { .. } => "listing",
            Self::Submitted { .. } => "submitted",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_request_maps_to_one_response_kind() {
        let requests = vec![
            BridgeRequest::CheckBridge,
            BridgeRequest::ProbeReadiness,
            BridgeRequest::Snapshot,
            BridgeRequest::ScrollComments,
            BridgeRequest::HostGlobals,
            BridgeRequest::CapturedListing,
            BridgeRequest::Navigate {
                post_id: "p".into(),
            },
            BridgeRequest::SignRequest { url: "u".into() },
        ];
        for request in requests {
            assert!(!request.response_kind().is_empty(), "{}", request.kind());
        }
    }

    #[test]
    fn catalog_serializes_with_kind_tags() {
        let json = serde_json::to_value(&BridgeRequest::CheckBridge).unwrap();
        assert_eq!(json["kind"], "check_bridge");

        let event = BridgeEvent::PausedState {
            session_id: "s".into(),
            paused: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "paused_state");
    }
}

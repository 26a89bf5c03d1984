//! Structural extraction: ordered selector fallback lists plus a bounded
//! walk of the host framework's internal component state.
//!
//! This is the fallback-of-fallbacks. Host markup varies by rollout, so
//! every logical element carries a list of known selectors tried in order;
//! when markup alone is not enough, elements exposing an internal state
//! handle get their prop tree walked for a comment object. Both layers are
//! finite, so extraction always terminates.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::SelectorConfig;
use crate::error::{EngineError, Result};
use crate::models::{CommentRecord, CommentSource};
use crate::page::PageSnapshot;

/// Hard bound on the internal-state walk; guards against pathological or
/// self-referencing host structures.
pub const MAX_STATE_DEPTH: usize = 10;

/// Internal-node keys the walk descends through.
const CHILD_KEYS: [&str; 3] = ["child", "sibling", "memoizedProps"];

pub struct StructuralExtractor {
    selectors: SelectorConfig,
}

impl StructuralExtractor {
    pub fn new(selectors: SelectorConfig) -> Self {
        Self { selectors }
    }

    /// Extract comment records from a page snapshot.
    ///
    /// Fails only when every comment-item selector yields zero matches;
    /// individual elements that produce nothing are skipped.
    pub fn extract(&self, post_id: &str, snapshot: &PageSnapshot) -> Result<Vec<CommentRecord>> {
        let document = Html::parse_document(&snapshot.html);
        let items = self.select_items(&document)?;

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut records = Vec::new();
        for element in items {
            let record = self
                .from_internal_state(post_id, &element, snapshot)
                .or_else(|| self.from_visible_text(post_id, &element));
            if let Some(record) = record {
                if seen.insert(record.key()) {
                    records.push(record);
                }
            }
        }

        debug!(count = records.len(), "structural extraction produced records");
        Ok(records)
    }

    /// First comment-item selector yielding at least one match wins.
    fn select_items<'a>(&self, document: &'a Html) -> Result<Vec<ElementRef<'a>>> {
        for raw in &self.selectors.comment_item {
            let Ok(selector) = Selector::parse(raw) else {
                trace!(selector = %raw, "unparseable selector skipped");
                continue;
            };
            let matches: Vec<ElementRef<'a>> = document.select(&selector).collect();
            if !matches.is_empty() {
                trace!(selector = %raw, count = matches.len(), "comment item selector matched");
                return Ok(matches);
            }
        }
        Err(EngineError::Extraction(
            "comment item selectors exhausted with zero matches".into(),
        ))
    }

    /// Recover a record from the element's attached internal state, if the
    /// snapshot carries one.
    fn from_internal_state(
        &self,
        post_id: &str,
        element: &ElementRef<'_>,
        snapshot: &PageSnapshot,
    ) -> Option<CommentRecord> {
        let marker = element.value().attr(&self.selectors.state_marker_attr)?;
        let state = snapshot.state.get(marker)?;
        let payload = find_comment_state(state, 0)?;
        comment_from_state(post_id, payload)
    }

    /// Read visible text through the configured sub-selector lists.
    fn from_visible_text(&self, post_id: &str, element: &ElementRef<'_>) -> Option<CommentRecord> {
        let comment_id = self
            .selectors
            .comment_id_attrs
            .iter()
            .find_map(|attr| element.value().attr(attr))?
            .to_string();

        let text = first_match_text(element, &self.selectors.comment_text)?;
        let author = first_match_text(element, &self.selectors.comment_author).unwrap_or_default();

        let mut record = CommentRecord::new(post_id, comment_id);
        record.text = text;
        record.author = author;
        Some(record)
    }
}

/// First sub-selector yielding a non-empty text wins.
fn first_match_text(element: &ElementRef<'_>, selectors: &[String]) -> Option<String> {
    for raw in selectors {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(found) = element.select(&selector).next() {
            let text: String = found.text().collect::<String>().trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// Walk an internal state tree looking for a comment object (id plus
/// creation timestamp), bounded to `MAX_STATE_DEPTH`.
///
/// Direct child (`comment`) and nested single-child (`props.comment`)
/// shapes are checked explicitly before recursing into internal child and
/// sibling nodes.
pub(crate) fn find_comment_state(node: &Value, depth: usize) -> Option<&Value> {
    if depth >= MAX_STATE_DEPTH {
        return None;
    }

    if is_comment_object(node) {
        return Some(node);
    }

    let object = node.as_object()?;

    if let Some(direct) = object.get("comment") {
        if is_comment_object(direct) {
            return Some(direct);
        }
    }
    if let Some(nested) = object.get("props").and_then(|p| p.get("comment")) {
        if is_comment_object(nested) {
            return Some(nested);
        }
    }

    for key in CHILD_KEYS {
        if let Some(child) = object.get(key) {
            if let Some(found) = find_comment_state(child, depth + 1) {
                return Some(found);
            }
        }
    }

    None
}

fn is_comment_object(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    let has_id = object.contains_key("cid") || object.contains_key("comment_id");
    let has_time = object.contains_key("create_time") || object.contains_key("createTime");
    has_id && has_time
}

/// Map a comment state object to a record. Returns None without an id.
fn comment_from_state(post_id: &str, payload: &Value) -> Option<CommentRecord> {
    let comment_id = super::json_path_string(payload, "cid")
        .or_else(|| super::json_path_string(payload, "comment_id"))?;

    let mut record = CommentRecord::new(post_id, comment_id);
    record.text = super::json_path_string(payload, "text").unwrap_or_default();
    record.author = super::json_path_string(payload, "user.unique_id")
        .or_else(|| super::json_path_string(payload, "user.nickname"))
        .unwrap_or_default();
    record.posted_at = payload
        .get("create_time")
        .or_else(|| payload.get("createTime"))
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
    record.reply_count = super::json_path(payload, "reply_comment_total")
        .as_u64()
        .unwrap_or(0) as u32;
    record.parent_comment_id = super::json_path_string(payload, "reply_id")
        .filter(|id| id != "0");
    record.source = CommentSource::Extracted;
    Some(record)
}

//! Network interception path: replay the host's own comment-listing calls.
//!
//! A captured call template supplies the endpoint and parameters; pagination
//! advances the cursor until the host reports no more pages, a configured
//! page cap is hit, or the retry ceiling is exhausted. Rate-limit responses
//! feed the global monitor and the same page is retried after the pause, so
//! already-collected pages are never lost.

use serde_json::Value;
use tracing::{debug, warn};

use super::{json_path, json_path_string, SigningPath};
use crate::config::{ApiConfig, EngineConfig, LimitConfig};
use crate::control::StopFlag;
use crate::error::{EngineError, Result};
use crate::models::CommentRecord;
use crate::page::{CapturedCall, PageClient};
use crate::ratelimit::{BackoffConfig, RateLimitMonitor};

/// Summary of one pagination run.
#[derive(Debug, Clone, Default)]
pub struct NetworkRun {
    pub pages: u32,
    pub found: u64,
    /// Total count the host reported, when the response carries one.
    pub reported_total: Option<u64>,
    /// True when a stop command or the page callback ended the run early.
    pub stopped: bool,
}

pub struct NetworkExtractor {
    page: PageClient,
    monitor: RateLimitMonitor,
    backoff: BackoffConfig,
    api: ApiConfig,
    limits: LimitConfig,
}

impl NetworkExtractor {
    pub fn new(page: PageClient, monitor: RateLimitMonitor, config: &EngineConfig) -> Self {
        Self {
            page,
            monitor,
            backoff: BackoffConfig::from_limits(&config.limits),
            api: config.api.clone(),
            limits: config.limits.clone(),
        }
    }

    /// Paginate through the listing for `post_id`.
    ///
    /// `on_page` receives each page's records and the cursor to persist;
    /// returning `false` ends the run (item cap reached). A `resume_cursor`
    /// continues a rehydrated session instead of starting over.
    pub async fn paginate<F>(
        &self,
        post_id: &str,
        captured: &CapturedCall,
        signing: Option<&SigningPath>,
        stop: &StopFlag,
        resume_cursor: Option<String>,
        mut on_page: F,
    ) -> Result<NetworkRun>
    where
        F: FnMut(Vec<CommentRecord>, Option<String>) -> bool,
    {
        let mut run = NetworkRun::default();
        let mut cursor = resume_cursor.or_else(|| captured.cursor.clone());
        let mut retries: u32 = 0;

        loop {
            if stop.is_stopped() {
                run.stopped = true;
                return Ok(run);
            }
            if run.pages >= self.limits.max_pages {
                debug!(pages = run.pages, "page cap reached");
                return Ok(run);
            }

            let call = self.build_call(captured, signing, cursor.as_deref()).await?;
            let was_probe = self.monitor.probe_armed().await;

            let body = match self.page.fetch_listing(call).await {
                Ok(body) => body,
                Err(EngineError::RateLimited { .. }) => {
                    retries += 1;
                    if retries > self.limits.retry_ceiling {
                        return Err(EngineError::Network(format!(
                            "retry ceiling ({}) exceeded while rate limited",
                            self.limits.retry_ceiling
                        )));
                    }
                    self.monitor.report_failure().await;
                    self.monitor.wait_until_clear().await;
                    continue;
                }
                Err(EngineError::Signing(reason)) => {
                    // Signing rejection downgrades the session; surface the
                    // class so the caller can switch strategies.
                    return Err(EngineError::Signing(reason));
                }
                Err(e) => {
                    retries += 1;
                    if retries > self.limits.retry_ceiling {
                        return Err(EngineError::Network(format!(
                            "retry ceiling ({}) exceeded: {e}",
                            self.limits.retry_ceiling
                        )));
                    }
                    let wait = self.backoff.pause_for(retries);
                    warn!(retries, ?wait, error = %e, "page fetch failed, backing off");
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            // The host can rate limit inside a 200 body via its status field.
            let body_status = json_path(&body, &self.api.response_fields.status_code_path).as_i64();
            if body_status == Some(self.api.rate_limit_status) {
                retries += 1;
                if retries > self.limits.retry_ceiling {
                    return Err(EngineError::Network(format!(
                        "retry ceiling ({}) exceeded while rate limited",
                        self.limits.retry_ceiling
                    )));
                }
                self.monitor.report_failure().await;
                self.monitor.wait_until_clear().await;
                continue;
            }

            self.monitor.report_success(was_probe).await;
            retries = 0;

            let fields = &self.api.response_fields;
            if run.reported_total.is_none() {
                run.reported_total = json_path(&body, &fields.total_path).as_u64();
            }

            let records = self.map_comments(post_id, &body);
            let next_cursor = json_path_string(&body, &fields.cursor_path);
            let has_more = match json_path(&body, &fields.has_more_path) {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
                _ => false,
            };

            run.pages += 1;
            run.found += records.len() as u64;
            cursor = next_cursor.clone();

            if !on_page(records, next_cursor) {
                run.stopped = true;
                return Ok(run);
            }
            if !has_more {
                debug!(pages = run.pages, found = run.found, "listing exhausted");
                return Ok(run);
            }
        }
    }

    async fn build_call(
        &self,
        captured: &CapturedCall,
        signing: Option<&SigningPath>,
        cursor: Option<&str>,
    ) -> Result<CapturedCall> {
        let mut call = captured.clone();

        let cursor_param = &self.api.request_fields.cursor_param;
        call.params.retain(|(k, _)| k != cursor_param);
        if let Some(cursor) = cursor {
            call.params.push((cursor_param.clone(), cursor.to_string()));
        }

        if signing.is_some() {
            // Re-sign per page through the host's own routine; replayed
            // signatures go stale.
            call.signed_params = self.page.sign(&call.url).await?;
        }
        Ok(call)
    }

    fn map_comments(&self, post_id: &str, body: &Value) -> Vec<CommentRecord> {
        let fields = &self.api.response_fields;
        let Some(items) = json_path(body, &fields.comments_path).as_array() else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(|item| {
                let comment_id = json_path_string(item, &fields.comment_id_path)?;
                let mut record = CommentRecord::new(post_id, comment_id);
                record.text = json_path_string(item, &fields.comment_text_path).unwrap_or_default();
                record.author =
                    json_path_string(item, &fields.comment_author_path).unwrap_or_default();
                record.posted_at = json_path(item, &fields.comment_time_path)
                    .as_i64()
                    .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
                record.reply_count =
                    json_path(item, &fields.reply_count_path).as_u64().unwrap_or(0) as u32;
                record.parent_comment_id =
                    json_path_string(item, &fields.parent_id_path).filter(|id| id != "0");
                Some(record)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, Context};
    use crate::config::DelayProfile;
    use crate::page::{run_page_actor, PageDriver, PageSnapshot, SubmitOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct ScriptedDriver {
        listings: Mutex<VecDeque<Result<Value>>>,
    }

    impl ScriptedDriver {
        fn new(pages: Vec<Result<Value>>) -> Self {
            Self {
                listings: Mutex::new(pages.into()),
            }
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn navigate(&self, _: &str) -> Result<()> {
            Ok(())
        }
        async fn is_ready(&self) -> Result<bool> {
            Ok(true)
        }
        async fn snapshot(&self) -> Result<PageSnapshot> {
            Ok(PageSnapshot::default())
        }
        async fn scroll_comments(&self) -> Result<bool> {
            Ok(false)
        }
        async fn locate_comment(&self, _: &str, _: Option<&str>) -> Result<bool> {
            Ok(true)
        }
        async fn host_globals(&self) -> Result<Value> {
            Ok(json!({}))
        }
        async fn captured_listing(&self) -> Result<Option<CapturedCall>> {
            Ok(None)
        }
        async fn sign(&self, _: &str) -> Result<Vec<(String, String)>> {
            Ok(vec![("X-Bogus".to_string(), "sig".to_string())])
        }
        async fn fetch_listing(&self, _: &CapturedCall) -> Result<Value> {
            self.listings
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Network("script exhausted".into())))
        }
        async fn submit_reply(&self, _: &str, _: &str, _: &DelayProfile) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::Submitted)
        }
    }

    fn page(comments: &[(&str, &str)], cursor: &str, has_more: bool) -> Value {
        json!({
            "comments": comments
                .iter()
                .map(|(cid, text)| json!({
                    "cid": cid,
                    "text": text,
                    "create_time": 1700000000,
                    "user": {"unique_id": "author"},
                }))
                .collect::<Vec<_>>(),
            "cursor": cursor,
            "has_more": has_more,
            "total": 4,
            "status_code": 0,
        })
    }

    fn captured() -> CapturedCall {
        CapturedCall {
            url: "https://host/api/comment/list".to_string(),
            params: vec![("aweme_id".to_string(), "post-1".to_string())],
            signed_params: vec![("X-Bogus".to_string(), "sig0".to_string())],
            cursor: None,
            page_size: 20,
        }
    }

    fn extractor_with(driver: ScriptedDriver) -> NetworkExtractor {
        let bridge = Bridge::new(Duration::from_secs(2));
        let inbox = bridge.register(Context::Page);
        tokio::spawn(run_page_actor(inbox, Arc::new(driver)));

        let mut config = EngineConfig::default();
        config.limits.initial_backoff_ms = 10;
        config.limits.max_backoff_ms = 40;
        let monitor =
            RateLimitMonitor::new(crate::ratelimit::BackoffConfig::from_limits(&config.limits));
        NetworkExtractor::new(PageClient::new(bridge), monitor, &config)
    }

    #[tokio::test]
    async fn pagination_terminates_when_has_more_clears() {
        let driver = ScriptedDriver::new(vec![
            Ok(page(&[("c1", "one"), ("c2", "two")], "20", true)),
            Ok(page(&[("c3", "three")], "40", false)),
        ]);
        let extractor = extractor_with(driver);

        let mut collected = Vec::new();
        let run = extractor
            .paginate(
                "post-1",
                &captured(),
                None,
                &StopFlag::new(),
                None,
                |records, _cursor| {
                    collected.extend(records);
                    true
                },
            )
            .await
            .unwrap();

        assert_eq!(run.pages, 2);
        assert_eq!(run.found, 3);
        assert_eq!(run.reported_total, Some(4));
        assert!(!run.stopped);
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].author, "author");
    }

    #[tokio::test]
    async fn retry_ceiling_ends_in_network_error() {
        let driver = ScriptedDriver::new(vec![
            Err(EngineError::Network("boom".into())),
            Err(EngineError::Network("boom".into())),
            Err(EngineError::Network("boom".into())),
            Err(EngineError::Network("boom".into())),
        ]);
        let extractor = extractor_with(driver);

        let err = extractor
            .paginate(
                "post-1",
                &captured(),
                None,
                &StopFlag::new(),
                None,
                |_, _| true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Network(_)));
    }

    #[tokio::test]
    async fn rate_limit_mid_run_pauses_and_keeps_collected_pages() {
        let driver = ScriptedDriver::new(vec![
            Ok(page(&[("c1", "one")], "20", true)),
            Ok(page(&[("c2", "two")], "40", true)),
            Err(EngineError::RateLimited { retry_after: None }),
            Ok(page(&[("c3", "three")], "60", true)),
            Ok(page(&[("c4", "four")], "80", false)),
        ]);
        let extractor = extractor_with(driver);
        let monitor = extractor.monitor.clone();

        let mut collected = Vec::new();
        let run = extractor
            .paginate(
                "post-1",
                &captured(),
                None,
                &StopFlag::new(),
                None,
                |records, _| {
                    collected.extend(records);
                    true
                },
            )
            .await
            .unwrap();

        assert_eq!(run.pages, 4);
        assert_eq!(collected.len(), 4);
        // The probe success after the pause cleared the limited state.
        assert!(!monitor.is_limited().await);
        assert_eq!(monitor.state().await.total_hits, 1);
    }

    #[tokio::test]
    async fn in_body_rate_limit_status_is_detected() {
        let mut limited = page(&[], "0", true);
        limited["status_code"] = json!(2483);
        let driver = ScriptedDriver::new(vec![
            Ok(limited),
            Ok(page(&[("c1", "one")], "20", false)),
        ]);
        let extractor = extractor_with(driver);
        let monitor = extractor.monitor.clone();

        let run = extractor
            .paginate(
                "post-1",
                &captured(),
                None,
                &StopFlag::new(),
                None,
                |_, _| true,
            )
            .await
            .unwrap();
        assert_eq!(run.pages, 1);
        assert_eq!(monitor.state().await.total_hits, 1);
    }

    #[tokio::test]
    async fn stop_flag_ends_run_before_next_fetch() {
        let driver = ScriptedDriver::new(vec![Ok(page(&[("c1", "one")], "20", true))]);
        let extractor = extractor_with(driver);
        let stop = StopFlag::new();

        let stop_inner = stop.clone();
        let run = extractor
            .paginate("post-1", &captured(), None, &stop, None, |_, _| {
                stop_inner.stop();
                true
            })
            .await
            .unwrap();
        assert!(run.stopped);
        assert_eq!(run.pages, 1);
    }

    #[tokio::test]
    async fn callback_false_caps_the_run() {
        let driver = ScriptedDriver::new(vec![
            Ok(page(&[("c1", "one")], "20", true)),
            Ok(page(&[("c2", "two")], "40", true)),
        ]);
        let extractor = extractor_with(driver);

        let run = extractor
            .paginate(
                "post-1",
                &captured(),
                None,
                &StopFlag::new(),
                None,
                |_, _| false,
            )
            .await
            .unwrap();
        assert!(run.stopped);
        assert_eq!(run.pages, 1);
    }
}

//! HTTP-backed page driver.
//!
//! Stands in for the injected page script when the engine runs outside a
//! browser: navigation fetches the post page over HTTP, listing replay goes
//! straight to the host API, and reply publishing posts to the configured
//! endpoint. Signing uses parameters captured at interception time; there is
//! no live signing routine on this path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CapturedCall, PageDriver, PageSnapshot, SubmitOutcome};
use crate::config::{DelayProfile, EngineConfig};
use crate::error::{EngineError, Result};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Default)]
struct DriverState {
    current_post: Option<String>,
    html: Option<String>,
    captured: Option<CapturedCall>,
}

/// Page driver replaying host traffic over plain HTTP.
pub struct HttpPageDriver {
    client: reqwest::Client,
    base_url: String,
    config: Arc<EngineConfig>,
    state: Mutex<DriverState>,
    rng: Mutex<StdRng>,
}

impl HttpPageDriver {
    pub fn new(base_url: impl Into<String>, config: Arc<EngineConfig>) -> Result<Self> {
        let base_url = base_url.into();
        url::Url::parse(&base_url)
            .map_err(|e| EngineError::Config(format!("base url {base_url}: {e}")))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(config.timeouts.comment_post_ms))
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            state: Mutex::new(DriverState::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<EngineError> {
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Some(EngineError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Some(EngineError::Network(format!("http status {status}")));
        }
        None
    }

    fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl PageDriver for HttpPageDriver {
    async fn navigate(&self, post_id: &str) -> Result<()> {
        let path = self
            .config
            .api
            .post_url_template
            .replace("{post_id}", &urlencoding::encode(post_id));
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "navigating to post page");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("navigate {url}: {e}")))?;
        let retry_after = Self::retry_after(response.headers());
        if let Some(err) = Self::classify_status(response.status(), retry_after) {
            return Err(err);
        }
        let html = response
            .text()
            .await
            .map_err(|e| EngineError::Network(format!("read {url}: {e}")))?;

        let mut state = self.state.lock().await;
        state.current_post = Some(post_id.to_string());
        state.html = Some(html);
        // Direct replay needs no interception step: seed the captured call
        // from the API description block.
        state.captured = Some(CapturedCall {
            url: format!("{}{}", self.base_url, self.config.api.comment_list_pattern),
            params: vec![
                (
                    self.config.api.request_fields.item_id_param.clone(),
                    post_id.to_string(),
                ),
                (
                    self.config.api.request_fields.count_param.clone(),
                    self.config.api.page_size.to_string(),
                ),
            ],
            signed_params: Vec::new(),
            cursor: None,
            page_size: self.config.api.page_size,
        });
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool> {
        let state = self.state.lock().await;
        let Some(html) = &state.html else {
            return Ok(false);
        };
        let document = Html::parse_document(html);
        for raw in &self.config.selectors.ready_marker {
            if let Ok(selector) = Selector::parse(raw) {
                if document.select(&selector).next().is_some() {
                    return Ok(true);
                }
            }
        }
        // A fetched page with none of the ready markers still counts once
        // the body parsed; markers track the host's SPA hydration, which
        // plain HTTP never observes.
        Ok(!html.is_empty())
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        let state = self.state.lock().await;
        let html = state
            .html
            .clone()
            .ok_or_else(|| EngineError::Extraction("no page loaded".into()))?;
        Ok(PageSnapshot::from_html(html))
    }

    async fn scroll_comments(&self) -> Result<bool> {
        // A static fetch has nothing further to load.
        Ok(false)
    }

    async fn locate_comment(&self, comment_id: &str, text_hint: Option<&str>) -> Result<bool> {
        let state = self.state.lock().await;
        let Some(html) = &state.html else {
            return Ok(false);
        };
        if html.contains(comment_id) {
            return Ok(true);
        }
        Ok(text_hint.is_some_and(|hint| html.contains(hint.trim())))
    }

    async fn host_globals(&self) -> Result<serde_json::Value> {
        // No script runs on this path, so no signing surface exists; the
        // strategy selector will fall back accordingly.
        Ok(serde_json::json!({}))
    }

    async fn captured_listing(&self) -> Result<Option<CapturedCall>> {
        Ok(self.state.lock().await.captured.clone())
    }

    async fn sign(&self, url: &str) -> Result<Vec<(String, String)>> {
        let state = self.state.lock().await;
        match &state.captured {
            Some(call) if !call.signed_params.is_empty() => Ok(call.signed_params.clone()),
            _ => Err(EngineError::Signing(format!(
                "no signing capability for {url}"
            ))),
        }
    }

    async fn fetch_listing(&self, call: &CapturedCall) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(&call.url)
            .query(&call.params)
            .query(&call.signed_params)
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("listing {}: {e}", call.url)))?;
        let retry_after = Self::retry_after(response.headers());
        if let Some(err) = Self::classify_status(response.status(), retry_after) {
            return Err(err);
        }
        response
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("listing body {}: {e}", call.url)))
    }

    async fn submit_reply(
        &self,
        comment_id: &str,
        text: &str,
        typing: &DelayProfile,
    ) -> Result<SubmitOutcome> {
        // Simulate composing before the publish call lands.
        let total: Duration = {
            let mut rng = self.rng.lock().await;
            text.chars().map(|_| typing.sample(&mut *rng)).sum()
        };
        tokio::time::sleep(total).await;

        let (post_id, url) = {
            let state = self.state.lock().await;
            let post_id = state
                .current_post
                .clone()
                .ok_or_else(|| EngineError::ReplyFailed("no post open".into()))?;
            (
                post_id,
                format!("{}{}", self.base_url, self.config.api.reply_publish_pattern),
            )
        };

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "item_id": post_id,
                "reply_to": comment_id,
                "text": text,
            }))
            .send()
            .await
            .map_err(|e| EngineError::ReplyFailed(format!("publish: {e}")))?;

        let status = response.status();
        let retry_after = Self::retry_after(response.headers());
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(EngineError::RateLimited { retry_after });
        }
        if status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            if body.contains("mention") {
                return Ok(SubmitOutcome::MentionUnavailable);
            }
            return Ok(SubmitOutcome::Failed {
                message: format!("forbidden: {body}"),
            });
        }
        if !status.is_success() {
            warn!(%status, "reply publish rejected");
            return Ok(SubmitOutcome::Failed {
                message: format!("http status {status}"),
            });
        }
        Ok(SubmitOutcome::Submitted)
    }
}

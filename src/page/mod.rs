//! Host-page peer: the injected-context side of the bridge.
//!
//! The engine never touches host internals directly; a [`PageDriver`]
//! implementation lives in the page context and is reached through bridge
//! requests served by [`run_page_actor`]. [`PageClient`] is the typed caller
//! the engine-side components use.

mod http;

pub use http::HttpPageDriver;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::{Bridge, BridgeRequest, BridgeResponse, Context, Envelope};
use crate::config::DelayProfile;
use crate::error::{EngineError, Result};

/// Point-in-time view of the host page.
///
/// `state` maps an element's state-marker attribute value to the framework's
/// internal prop tree for that element, when the page script could read one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub html: String,
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,
}

impl PageSnapshot {
    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            state: HashMap::new(),
        }
    }
}

/// A comment-listing call captured off the host page's own traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedCall {
    pub url: String,
    /// Plain query parameters as sent by the host client.
    pub params: Vec<(String, String)>,
    /// Per-request signed parameters captured alongside.
    pub signed_params: Vec<(String, String)>,
    /// Cursor value at capture time.
    pub cursor: Option<String>,
    pub page_size: u32,
}

/// Outcome of a reply submission as observed in the page context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Submitted,
    /// The target account blocks mentions.
    MentionUnavailable,
    Failed { message: String },
}

/// Operations the injected page script exposes to the engine.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, post_id: &str) -> Result<()>;
    /// Whether the readiness marker for the current target is present.
    async fn is_ready(&self) -> Result<bool>;
    async fn snapshot(&self) -> Result<PageSnapshot>;
    /// Scroll the comment area; returns whether new content loaded.
    async fn scroll_comments(&self) -> Result<bool>;
    /// Bring a specific comment into view. One call spends one unit of the
    /// caller's click/scroll budget.
    async fn locate_comment(&self, comment_id: &str, text_hint: Option<&str>) -> Result<bool>;
    /// View of the host page's global object graph for the signing probe.
    async fn host_globals(&self) -> Result<serde_json::Value>;
    /// Most recent captured comment-listing call, if any was intercepted.
    async fn captured_listing(&self) -> Result<Option<CapturedCall>>;
    /// Ask the host's own signing routine to sign a request URL.
    async fn sign(&self, url: &str) -> Result<Vec<(String, String)>>;
    /// Replay a listing call and return the raw response body.
    async fn fetch_listing(&self, call: &CapturedCall) -> Result<serde_json::Value>;
    async fn submit_reply(
        &self,
        comment_id: &str,
        text: &str,
        typing: &DelayProfile,
    ) -> Result<SubmitOutcome>;
}

/// Serve bridge requests against a driver until the inbox closes.
pub async fn run_page_actor(mut inbox: mpsc::Receiver<Envelope>, driver: Arc<dyn PageDriver>) {
    while let Some(Envelope { request, reply }) = inbox.recv().await {
        debug!(kind = request.kind(), "page actor serving request");
        let response = serve(&*driver, request).await;
        // A dropped reply means the caller timed out; nothing to do.
        let _ = reply.send(response);
    }
}

async fn serve(driver: &dyn PageDriver, request: BridgeRequest) -> BridgeResponse {
    let result = match request {
        BridgeRequest::Navigate { post_id } => {
            driver.navigate(&post_id).await.map(|_| BridgeResponse::Ack)
        }
        BridgeRequest::ProbeReadiness => driver
            .is_ready()
            .await
            .map(|ready| BridgeResponse::Ready { ready }),
        BridgeRequest::Snapshot => driver
            .snapshot()
            .await
            .map(|snapshot| BridgeResponse::Page { snapshot }),
        BridgeRequest::ScrollComments => driver
            .scroll_comments()
            .await
            .map(|loaded_more| BridgeResponse::Scrolled { loaded_more }),
        BridgeRequest::LocateComment {
            comment_id,
            text_hint,
        } => driver
            .locate_comment(&comment_id, text_hint.as_deref())
            .await
            .map(|found| BridgeResponse::Located { found }),
        BridgeRequest::HostGlobals => driver
            .host_globals()
            .await
            .map(|globals| BridgeResponse::Globals { globals }),
        BridgeRequest::CapturedListing => driver
            .captured_listing()
            .await
            .map(|call| BridgeResponse::Captured { call }),
        BridgeRequest::SignRequest { url } => driver
            .sign(&url)
            .await
            .map(|params| BridgeResponse::Signed { params }),
        BridgeRequest::FetchListing { call } => driver
            .fetch_listing(&call)
            .await
            .map(|body| BridgeResponse::Listing { body }),
        BridgeRequest::SubmitReply {
            comment_id,
            text,
            typing,
        } => driver
            .submit_reply(&comment_id, &text, &typing)
            .await
            .map(|outcome| BridgeResponse::Submitted { outcome }),
        other => Err(EngineError::Extraction(format!(
            "page context cannot serve {}",
            other.kind()
        ))),
    };

    result.unwrap_or_else(|e| BridgeResponse::Error {
        message: e.to_string(),
    })
}

/// Typed engine-side caller for page-context requests.
#[derive(Clone)]
pub struct PageClient {
    bridge: Arc<Bridge>,
}

impl PageClient {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    async fn call(&self, request: BridgeRequest) -> Result<BridgeResponse> {
        match self.bridge.request(Context::Page, request).await? {
            BridgeResponse::Error { message } => classify_page_error(message),
            response => Ok(response),
        }
    }

    pub async fn navigate(&self, post_id: &str) -> Result<()> {
        self.call(BridgeRequest::Navigate {
            post_id: post_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn is_ready(&self) -> Result<bool> {
        match self.call(BridgeRequest::ProbeReadiness).await? {
            BridgeResponse::Ready { ready } => Ok(ready),
            other => Err(unexpected("ready", &other)),
        }
    }

    pub async fn snapshot(&self) -> Result<PageSnapshot> {
        match self.call(BridgeRequest::Snapshot).await? {
            BridgeResponse::Page { snapshot } => Ok(snapshot),
            other => Err(unexpected("page", &other)),
        }
    }

    pub async fn scroll_comments(&self) -> Result<bool> {
        match self.call(BridgeRequest::ScrollComments).await? {
            BridgeResponse::Scrolled { loaded_more } => Ok(loaded_more),
            other => Err(unexpected("scrolled", &other)),
        }
    }

    pub async fn locate_comment(&self, comment_id: &str, text_hint: Option<&str>) -> Result<bool> {
        match self
            .call(BridgeRequest::LocateComment {
                comment_id: comment_id.to_string(),
                text_hint: text_hint.map(str::to_string),
            })
            .await?
        {
            BridgeResponse::Located { found } => Ok(found),
            other => Err(unexpected("located", &other)),
        }
    }

    pub async fn host_globals(&self) -> Result<serde_json::Value> {
        match self.call(BridgeRequest::HostGlobals).await? {
            BridgeResponse::Globals { globals } => Ok(globals),
            other => Err(unexpected("globals", &other)),
        }
    }

    pub async fn captured_listing(&self) -> Result<Option<CapturedCall>> {
        match self.call(BridgeRequest::CapturedListing).await? {
            BridgeResponse::Captured { call } => Ok(call),
            other => Err(unexpected("captured", &other)),
        }
    }

    pub async fn sign(&self, url: &str) -> Result<Vec<(String, String)>> {
        match self
            .call(BridgeRequest::SignRequest {
                url: url.to_string(),
            })
            .await?
        {
            BridgeResponse::Signed { params } => Ok(params),
            other => Err(unexpected("signed", &other)),
        }
    }

    pub async fn fetch_listing(&self, call: CapturedCall) -> Result<serde_json::Value> {
        match self.call(BridgeRequest::FetchListing { call }).await? {
            BridgeResponse::Listing { body } => Ok(body),
            other => Err(unexpected("listing", &other)),
        }
    }

    pub async fn submit_reply(
        &self,
        comment_id: &str,
        text: &str,
        typing: DelayProfile,
    ) -> Result<SubmitOutcome> {
        match self
            .call(BridgeRequest::SubmitReply {
                comment_id: comment_id.to_string(),
                text: text.to_string(),
                typing,
            })
            .await?
        {
            BridgeResponse::Submitted { outcome } => Ok(outcome),
            other => Err(unexpected("submitted", &other)),
        }
    }
}

/// Errors cross the bridge as strings; recover the classes the engine
/// reacts to.
fn classify_page_error<T>(message: String) -> Result<T> {
    if message.contains("rate limited") {
        Err(EngineError::RateLimited { retry_after: None })
    } else if message.contains("signing") {
        Err(EngineError::Signing(message))
    } else {
        Err(EngineError::Extraction(message))
    }
}

fn unexpected(expected: &str, got: &BridgeResponse) -> EngineError {
    EngineError::Extraction(format!(
        "expected {expected} response, got {}",
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubDriver {
        ready_after: Mutex<u32>,
    }

    #[async_trait]
    impl PageDriver for StubDriver {
        async fn navigate(&self, _post_id: &str) -> Result<()> {
            Ok(())
        }
        async fn is_ready(&self) -> Result<bool> {
            let mut remaining = self.ready_after.lock().unwrap();
            if *remaining == 0 {
                Ok(true)
            } else {
                *remaining -= 1;
                Ok(false)
            }
        }
        async fn snapshot(&self) -> Result<PageSnapshot> {
            Ok(PageSnapshot::from_html("<html></html>"))
        }
        async fn scroll_comments(&self) -> Result<bool> {
            Ok(false)
        }
        async fn locate_comment(&self, _: &str, _: Option<&str>) -> Result<bool> {
            Ok(false)
        }
        async fn host_globals(&self) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn captured_listing(&self) -> Result<Option<CapturedCall>> {
            Ok(None)
        }
        async fn sign(&self, _: &str) -> Result<Vec<(String, String)>> {
            Err(EngineError::Signing("no signer".into()))
        }
        async fn fetch_listing(&self, _: &CapturedCall) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn submit_reply(
            &self,
            _: &str,
            _: &str,
            _: &DelayProfile,
        ) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::Submitted)
        }
    }

    fn wire(driver: StubDriver) -> PageClient {
        let bridge = Bridge::new(Duration::from_millis(500));
        let inbox = bridge.register(Context::Page);
        tokio::spawn(run_page_actor(inbox, Arc::new(driver)));
        PageClient::new(bridge)
    }

    #[tokio::test]
    async fn readiness_round_trip() {
        let client = wire(StubDriver {
            ready_after: Mutex::new(1),
        });
        assert!(!client.is_ready().await.unwrap());
        assert!(client.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn driver_errors_surface_as_typed_engine_errors() {
        let client = wire(StubDriver {
            ready_after: Mutex::new(0),
        });
        let err = client.sign("https://host/api").await.unwrap_err();
        assert!(matches!(err, EngineError::Signing(_)));
    }
}

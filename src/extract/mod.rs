//! Extraction strategies for comment data.
//!
//! Two paths exist: replaying the host's own listing calls (fast, needs a
//! signing capability) and walking page structure (slow, always available).
//! Selection happens per session; a runtime failure on the network path
//! silently downgrades the current session to structural extraction rather
//! than aborting it.

mod network;
mod signing;
mod structural;

pub use network::{NetworkExtractor, NetworkRun};
pub use signing::{resolve_signing_path, SigningPath};
pub use structural::{StructuralExtractor, MAX_STATE_DEPTH};

use tracing::debug;

use crate::config::EngineConfig;
use crate::page::{CapturedCall, PageClient};

/// Extraction path chosen for one session.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// Replay the captured listing call, re-signing per page when a signing
    /// path resolved.
    Network {
        captured: CapturedCall,
        signing: Option<SigningPath>,
    },
    /// Walk markup and internal component state.
    Structural,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Structural => "structural",
        }
    }
}

/// Choose the extraction strategy for a new session.
///
/// The network path needs a captured listing call plus either a resolved
/// signing capability or captured signed parameters to replay verbatim.
/// Everything else falls back to structural extraction, silently.
pub async fn select_strategy(page: &PageClient, config: &EngineConfig) -> Strategy {
    if !config.features.network_extraction {
        return Strategy::Structural;
    }

    let captured = match page.captured_listing().await {
        Ok(Some(call)) => call,
        _ => {
            debug!("no captured listing call, using structural extraction");
            return Strategy::Structural;
        }
    };

    let signing = match page.host_globals().await {
        Ok(globals) => resolve_signing_path(&globals, &config.api.signing),
        Err(_) => None,
    };

    if signing.is_none() && captured.signed_params.is_empty() {
        debug!("no signing capability resolved, using structural extraction");
        return Strategy::Structural;
    }

    debug!(signing = ?signing, "network extraction selected");
    Strategy::Network { captured, signing }
}

/// Extract a value from nested JSON using a dot-notation path.
pub(crate) fn json_path<'a>(data: &'a serde_json::Value, path: &str) -> &'a serde_json::Value {
    if path.is_empty() {
        return data;
    }

    let mut current = data;
    for key in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(key).unwrap_or(&serde_json::Value::Null),
            serde_json::Value::Array(arr) => {
                if let Ok(idx) = key.parse::<usize>() {
                    arr.get(idx).unwrap_or(&serde_json::Value::Null)
                } else {
                    &serde_json::Value::Null
                }
            }
            _ => &serde_json::Value::Null,
        };
    }

    current
}

/// Read a string at a path, accepting numeric values (host ids come back as
/// either).
pub(crate) fn json_path_string(data: &serde_json::Value, path: &str) -> Option<String> {
    match json_path(data, path) {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_path_walks_objects_and_arrays() {
        let data = json!({"a": {"b": [{"c": 7}]}});
        assert_eq!(json_path(&data, "a.b.0.c"), &json!(7));
        assert_eq!(json_path(&data, "a.missing"), &serde_json::Value::Null);
        assert_eq!(json_path(&data, ""), &data);
    }

    #[test]
    fn json_path_string_accepts_numbers() {
        let data = json!({"cid": 12345, "text": "hi", "empty": ""});
        assert_eq!(json_path_string(&data, "cid"), Some("12345".to_string()));
        assert_eq!(json_path_string(&data, "text"), Some("hi".to_string()));
        assert_eq!(json_path_string(&data, "empty"), None);
    }
}

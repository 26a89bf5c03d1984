//! Signing-capability probe.
//!
//! The host page computes request-authentication parameters with its own
//! routine; the engine captures a path to that routine rather than
//! reimplementing it. The probe works over a JSON view of the host's global
//! object graph in which the page script marks callables with the string
//! `"function"`.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::json_path;
use crate::config::SigningConfig;

/// Dot-notation path to a callable signing routine on the host globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningPath(pub String);

fn is_callable(value: &Value) -> bool {
    matches!(value, Value::String(s) if s == "function")
}

/// Resolve a callable signing function from the host globals.
///
/// Order: the configured primary path, then fallback method names under each
/// top-level namespace, then a key-pattern scan of the globals two levels
/// deep.
pub fn resolve_signing_path(globals: &Value, config: &SigningConfig) -> Option<SigningPath> {
    if is_callable(json_path(globals, &config.primary_path)) {
        debug!(path = %config.primary_path, "signing function at primary path");
        return Some(SigningPath(config.primary_path.clone()));
    }

    let Value::Object(namespaces) = globals else {
        return None;
    };

    for (namespace, value) in namespaces {
        let Value::Object(members) = value else {
            continue;
        };
        for method in &config.fallback_methods {
            if members.get(method).is_some_and(is_callable) {
                let path = format!("{namespace}.{method}");
                debug!(%path, "signing function via fallback method name");
                return Some(SigningPath(path));
            }
        }
    }

    let pattern = Regex::new(&config.key_pattern).ok()?;
    for (namespace, value) in namespaces {
        if pattern.is_match(namespace) && is_callable(value) {
            debug!(path = %namespace, "signing function via key pattern");
            return Some(SigningPath(namespace.clone()));
        }
        let Value::Object(members) = value else {
            continue;
        };
        for (key, member) in members {
            if pattern.is_match(key) && is_callable(member) {
                let path = format!("{namespace}.{key}");
                debug!(%path, "signing function via key pattern");
                return Some(SigningPath(path));
            }
        }
    }

    None
}

//! Engine configuration.
//!
//! Everything that tracks host-site churn lives here rather than in code:
//! ordered selector fallback lists, timeouts, delay profiles, numeric limits,
//! feature flags, and the API description block (intercepted path patterns,
//! field-name maps, signing lookup paths). The resolver loads TOML or JSON
//! and supports hot reload; the engine treats the resolved config as
//! read-only.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{EngineError, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Config revision, surfaced in status output.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub delays: DelayConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Ordered fallback selector lists per logical element.
///
/// Host markup varies by rollout; lists are tried in order and the first
/// selector yielding at least one match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_comment_item_selectors")]
    pub comment_item: Vec<String>,
    #[serde(default = "default_comment_text_selectors")]
    pub comment_text: Vec<String>,
    #[serde(default = "default_comment_author_selectors")]
    pub comment_author: Vec<String>,
    #[serde(default = "default_comment_timestamp_selectors")]
    pub comment_timestamp: Vec<String>,
    #[serde(default = "default_ready_marker_selectors")]
    pub ready_marker: Vec<String>,
    /// Attribute carrying the element's internal-state handle in page
    /// snapshots.
    #[serde(default = "default_state_marker_attr")]
    pub state_marker_attr: String,
    /// Attributes tried in order when recovering a comment id from markup
    /// alone.
    #[serde(default = "default_comment_id_attrs")]
    pub comment_id_attrs: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            comment_item: default_comment_item_selectors(),
            comment_text: default_comment_text_selectors(),
            comment_author: default_comment_author_selectors(),
            comment_timestamp: default_comment_timestamp_selectors(),
            ready_marker: default_ready_marker_selectors(),
            state_marker_attr: default_state_marker_attr(),
            comment_id_attrs: default_comment_id_attrs(),
        }
    }
}

fn default_comment_item_selectors() -> Vec<String> {
    vec![
        "[data-e2e=comment-item]".to_string(),
        "div[class*=CommentItemContainer]".to_string(),
        "div[class*=comment-item]".to_string(),
    ]
}
fn default_comment_text_selectors() -> Vec<String> {
    vec![
        "[data-e2e=comment-text]".to_string(),
        "p[class*=comment-text]".to_string(),
        "span[class*=CommentText]".to_string(),
    ]
}
fn default_comment_author_selectors() -> Vec<String> {
    vec![
        "[data-e2e=comment-username]".to_string(),
        "a[class*=user-link]".to_string(),
    ]
}
fn default_comment_timestamp_selectors() -> Vec<String> {
    vec![
        "[data-e2e=comment-time]".to_string(),
        "span[class*=TimeText]".to_string(),
    ]
}
fn default_ready_marker_selectors() -> Vec<String> {
    vec!["[data-e2e=comment-list]".to_string()]
}
fn default_state_marker_attr() -> String {
    "data-rf-state".to_string()
}
fn default_comment_id_attrs() -> Vec<String> {
    vec![
        "data-cid".to_string(),
        "data-comment-id".to_string(),
        "id".to_string(),
    ]
}

/// Numeric timeouts in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_selector_wait_ms")]
    pub selector_wait_ms: u64,
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,
    #[serde(default = "default_comment_post_ms")]
    pub comment_post_ms: u64,
    #[serde(default = "default_bridge_request_ms")]
    pub bridge_request_ms: u64,
    /// Window after which a missing liveness ack marks the bridge
    /// disconnected.
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            selector_wait_ms: default_selector_wait_ms(),
            readiness_poll_ms: default_readiness_poll_ms(),
            comment_post_ms: default_comment_post_ms(),
            bridge_request_ms: default_bridge_request_ms(),
            liveness_window_ms: default_liveness_window_ms(),
            liveness_interval_ms: default_liveness_interval_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn selector_wait(&self) -> Duration {
        Duration::from_millis(self.selector_wait_ms)
    }
    pub fn readiness_poll(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_ms)
    }
    pub fn bridge_request(&self) -> Duration {
        Duration::from_millis(self.bridge_request_ms)
    }
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

fn default_selector_wait_ms() -> u64 {
    15_000
}
fn default_readiness_poll_ms() -> u64 {
    500
}
fn default_comment_post_ms() -> u64 {
    10_000
}
fn default_bridge_request_ms() -> u64 {
    120_000
}
fn default_liveness_window_ms() -> u64 {
    8_000
}
fn default_liveness_interval_ms() -> u64 {
    2_500
}

/// Truncated-normal delay profile in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayProfile {
    pub mean_ms: f64,
    pub std_dev_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayProfile {
    /// Sample a humanlike delay: normal via Box-Muller, clamped to
    /// [min_ms, max_ms].
    pub fn sample(&self, rng: &mut impl rand::Rng) -> Duration {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let raw = self.mean_ms + z * self.std_dev_ms;
        let clamped = raw.clamp(self.min_ms as f64, self.max_ms as f64);
        Duration::from_millis(clamped as u64)
    }
}

/// Delay profiles per speed class plus queue jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Between bulk-reply items.
    #[serde(default = "default_between_items_profile")]
    pub between_items: DelayProfile,
    /// Between simulated keystrokes while composing a reply.
    #[serde(default = "default_typing_profile")]
    pub typing: DelayProfile,
    /// Fixed delay between batch queue items.
    #[serde(default = "default_inter_session_ms")]
    pub inter_session_ms: u64,
    /// Random jitter added on top of the inter-session delay.
    #[serde(default = "default_inter_session_jitter_ms")]
    pub inter_session_jitter_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            between_items: default_between_items_profile(),
            typing: default_typing_profile(),
            inter_session_ms: default_inter_session_ms(),
            inter_session_jitter_ms: default_inter_session_jitter_ms(),
        }
    }
}

fn default_between_items_profile() -> DelayProfile {
    DelayProfile {
        mean_ms: 12_000.0,
        std_dev_ms: 4_000.0,
        min_ms: 5_000,
        max_ms: 30_000,
    }
}
fn default_typing_profile() -> DelayProfile {
    DelayProfile {
        mean_ms: 120.0,
        std_dev_ms: 60.0,
        min_ms: 30,
        max_ms: 400,
    }
}
fn default_inter_session_ms() -> u64 {
    8_000
}
fn default_inter_session_jitter_ms() -> u64 {
    4_000
}

/// A minimum-variation rule: selections larger than `targets_above` need at
/// least `min_variations` distinct reply texts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationRule {
    pub targets_above: usize,
    pub min_variations: usize,
}

/// Numeric limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Click/scroll budget when locating a reply target in a thread.
    #[serde(default = "default_max_clicks_per_thread")]
    pub max_clicks_per_thread: u32,
    /// Consecutive no-new-item iterations before a structural session is
    /// considered complete.
    #[serde(default = "default_stable_iterations_required")]
    pub stable_iterations_required: u32,
    #[serde(default = "default_max_comments_per_session")]
    pub max_comments_per_session: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_variation_rules")]
    pub variation_rules: Vec<VariationRule>,
    /// Refuse new batch targets while a rate-limit pause is active instead
    /// of appending them behind it.
    #[serde(default)]
    pub reject_enqueue_while_limited: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            retry_ceiling: default_retry_ceiling(),
            max_clicks_per_thread: default_max_clicks_per_thread(),
            stable_iterations_required: default_stable_iterations_required(),
            max_comments_per_session: default_max_comments_per_session(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            variation_rules: default_variation_rules(),
            reject_enqueue_while_limited: false,
        }
    }
}

fn default_max_pages() -> u32 {
    50
}
fn default_retry_ceiling() -> u32 {
    3
}
fn default_max_clicks_per_thread() -> u32 {
    12
}
fn default_stable_iterations_required() -> u32 {
    3
}
fn default_max_comments_per_session() -> u64 {
    5_000
}
fn default_initial_backoff_ms() -> u64 {
    30_000
}
fn default_max_backoff_ms() -> u64 {
    900_000
}
fn default_variation_rules() -> Vec<VariationRule> {
    vec![
        VariationRule {
            targets_above: 10,
            min_variations: 2,
        },
        VariationRule {
            targets_above: 30,
            min_variations: 3,
        },
    ]
}

/// Feature flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Permit the network interception path at all.
    #[serde(default = "default_true")]
    pub network_extraction: bool,
    /// Permit the structural fallback path.
    #[serde(default = "default_true")]
    pub structural_fallback: bool,
    /// Ask the collaborator to drop records whose reply target vanished.
    #[serde(default)]
    pub remove_missing_reply_targets: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            network_extraction: true,
            structural_fallback: true,
            remove_missing_reply_targets: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Field-name map for intercepted listing requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFieldMap {
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    #[serde(default = "default_count_param")]
    pub count_param: String,
    #[serde(default = "default_item_id_param")]
    pub item_id_param: String,
}

impl Default for RequestFieldMap {
    fn default() -> Self {
        Self {
            cursor_param: default_cursor_param(),
            count_param: default_count_param(),
            item_id_param: default_item_id_param(),
        }
    }
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}
fn default_count_param() -> String {
    "count".to_string()
}
fn default_item_id_param() -> String {
    "aweme_id".to_string()
}

/// Dot-notation paths into listing responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFieldMap {
    #[serde(default = "default_comments_path")]
    pub comments_path: String,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: String,
    #[serde(default = "default_has_more_path")]
    pub has_more_path: String,
    #[serde(default = "default_total_path")]
    pub total_path: String,
    #[serde(default = "default_status_code_path")]
    pub status_code_path: String,
    #[serde(default = "default_comment_id_path")]
    pub comment_id_path: String,
    #[serde(default = "default_comment_text_path")]
    pub comment_text_path: String,
    #[serde(default = "default_comment_author_path")]
    pub comment_author_path: String,
    #[serde(default = "default_comment_time_path")]
    pub comment_time_path: String,
    #[serde(default = "default_reply_count_path")]
    pub reply_count_path: String,
    #[serde(default = "default_parent_id_path")]
    pub parent_id_path: String,
}

impl Default for ResponseFieldMap {
    fn default() -> Self {
        Self {
            comments_path: default_comments_path(),
            cursor_path: default_cursor_path(),
            has_more_path: default_has_more_path(),
            total_path: default_total_path(),
            status_code_path: default_status_code_path(),
            comment_id_path: default_comment_id_path(),
            comment_text_path: default_comment_text_path(),
            comment_author_path: default_comment_author_path(),
            comment_time_path: default_comment_time_path(),
            reply_count_path: default_reply_count_path(),
            parent_id_path: default_parent_id_path(),
        }
    }
}

fn default_comments_path() -> String {
    "comments".to_string()
}
fn default_cursor_path() -> String {
    "cursor".to_string()
}
fn default_has_more_path() -> String {
    "has_more".to_string()
}
fn default_total_path() -> String {
    "total".to_string()
}
fn default_status_code_path() -> String {
    "status_code".to_string()
}
fn default_comment_id_path() -> String {
    "cid".to_string()
}
fn default_comment_text_path() -> String {
    "text".to_string()
}
fn default_comment_author_path() -> String {
    "user.unique_id".to_string()
}
fn default_comment_time_path() -> String {
    "create_time".to_string()
}
fn default_reply_count_path() -> String {
    "reply_comment_total".to_string()
}
fn default_parent_id_path() -> String {
    "reply_id".to_string()
}

/// Signing-function lookup paths on the host page's global objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Primary dot-notation path to the signing function.
    #[serde(default = "default_signing_primary")]
    pub primary_path: String,
    /// Fallback method names searched under each global namespace.
    #[serde(default = "default_signing_fallbacks")]
    pub fallback_methods: Vec<String>,
    /// Regex tried against global object keys as a last resort.
    #[serde(default = "default_signing_key_pattern")]
    pub key_pattern: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            primary_path: default_signing_primary(),
            fallback_methods: default_signing_fallbacks(),
            key_pattern: default_signing_key_pattern(),
        }
    }
}

fn default_signing_primary() -> String {
    "byted_acrawler.sign".to_string()
}
fn default_signing_fallbacks() -> Vec<String> {
    vec!["sign".to_string(), "frontierSign".to_string()]
}
fn default_signing_key_pattern() -> String {
    "(?i)sign|acrawler".to_string()
}

/// API description block for the network interception path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Substring pattern matching the comment listing endpoint.
    #[serde(default = "default_comment_list_pattern")]
    pub comment_list_pattern: String,
    /// Sub-pattern matching the reply listing endpoint.
    #[serde(default = "default_reply_list_pattern")]
    pub reply_list_pattern: String,
    /// Endpoint replies are published to.
    #[serde(default = "default_reply_publish_pattern")]
    pub reply_publish_pattern: String,
    /// Path template for a post's page, with a `{post_id}` placeholder.
    #[serde(default = "default_post_url_template")]
    pub post_url_template: String,
    #[serde(default)]
    pub request_fields: RequestFieldMap,
    #[serde(default)]
    pub response_fields: ResponseFieldMap,
    #[serde(default)]
    pub signing: SigningConfig,
    /// Cookie holding the session token the listing API expects.
    #[serde(default = "default_cookie_token_name")]
    pub cookie_token_name: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Status-code field value the host uses for rate limiting.
    #[serde(default = "default_rate_limit_status")]
    pub rate_limit_status: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            comment_list_pattern: default_comment_list_pattern(),
            reply_list_pattern: default_reply_list_pattern(),
            reply_publish_pattern: default_reply_publish_pattern(),
            post_url_template: default_post_url_template(),
            request_fields: RequestFieldMap::default(),
            response_fields: ResponseFieldMap::default(),
            signing: SigningConfig::default(),
            cookie_token_name: default_cookie_token_name(),
            page_size: default_page_size(),
            rate_limit_status: default_rate_limit_status(),
        }
    }
}

fn default_comment_list_pattern() -> String {
    "/api/comment/list".to_string()
}
fn default_reply_list_pattern() -> String {
    "/api/comment/list/reply".to_string()
}
fn default_reply_publish_pattern() -> String {
    "/api/comment/publish".to_string()
}
fn default_post_url_template() -> String {
    "/video/{post_id}".to_string()
}
fn default_cookie_token_name() -> String {
    "msToken".to_string()
}
fn default_page_size() -> u32 {
    20
}
fn default_rate_limit_status() -> i64 {
    2483
}

impl EngineConfig {
    /// Load configuration from a TOML or JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("read {}: {e}", path.display())))?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))?,
            _ => toml::from_str(&raw)
                .map_err(|e| EngineError::Config(format!("parse {}: {e}", path.display())))?,
        };
        Ok(config)
    }
}

/// Hot-reloadable handle to the engine configuration.
///
/// External to the engine proper; components take a snapshot per session and
/// never mutate it.
#[derive(Clone)]
pub struct ConfigResolver {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<EngineConfig>>>,
}

impl ConfigResolver {
    /// Resolver over a fixed in-memory config (tests, embedded defaults).
    pub fn fixed(config: EngineConfig) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Resolver backed by a file; missing file falls back to defaults.
    pub fn from_file(path: PathBuf) -> Result<Self> {
        let config = if path.exists() {
            EngineConfig::load(&path)?
        } else {
            EngineConfig::default()
        };
        Ok(Self {
            path: Some(path),
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Current config snapshot.
    pub async fn get(&self) -> Arc<EngineConfig> {
        self.current.read().await.clone()
    }

    /// Re-read the backing file, replacing the current snapshot.
    pub async fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = EngineConfig::load(path)?;
        info!(version = %config.version, "reloaded engine config");
        *self.current.write().await = Arc::new(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_ordered_selector_lists() {
        let config = EngineConfig::default();
        assert!(config.selectors.comment_item.len() >= 2);
        assert_eq!(config.limits.retry_ceiling, 3);
        assert_eq!(config.timeouts.bridge_request_ms, 120_000);
    }

    #[test]
    fn variation_rules_default_to_documented_thresholds() {
        let limits = LimitConfig::default();
        assert_eq!(
            limits.variation_rules,
            vec![
                VariationRule {
                    targets_above: 10,
                    min_variations: 2
                },
                VariationRule {
                    targets_above: 30,
                    min_variations: 3
                },
            ]
        );
    }

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let raw = r#"
            version = "7"

            [limits]
            max_pages = 5

            [api]
            comment_list_pattern = "/listing/v2"
        "#;
        let config: EngineConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.version, "7");
        assert_eq!(config.limits.max_pages, 5);
        assert_eq!(config.limits.retry_ceiling, 3);
        assert_eq!(config.api.comment_list_pattern, "/listing/v2");
        assert_eq!(config.api.response_fields.has_more_path, "has_more");
    }

    #[test]
    fn json_config_parses() {
        let raw = r#"{"version":"2","delays":{"inter_session_ms":100}}"#;
        let config: EngineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.version, "2");
        assert_eq!(config.delays.inter_session_ms, 100);
        assert_eq!(config.delays.typing.min_ms, 30);
    }

    #[test]
    fn delay_samples_stay_within_profile_bounds() {
        let profile = DelayProfile {
            mean_ms: 100.0,
            std_dev_ms: 500.0,
            min_ms: 50,
            max_ms: 200,
        };
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let d = profile.sample(&mut rng);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn resolver_reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "version = \"1\"\n").unwrap();
        let resolver = ConfigResolver::from_file(path.clone()).unwrap();
        assert_eq!(resolver.get().await.version, "1");

        std::fs::write(&path, "version = \"2\"\n").unwrap();
        resolver.reload().await.unwrap();
        assert_eq!(resolver.get().await.version, "2");
    }
}

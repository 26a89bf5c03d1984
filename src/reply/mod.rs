//! Bulk reply orchestration.
//!
//! Drives sequential reply submission across a selected set of comments:
//! navigate to the target's post, locate the comment within a click/scroll
//! budget, submit a reply chosen round-robin from the variation list, then
//! wait out a humanlike delay before the next item. Failures are isolated
//! per item; only a stop command or a dead bridge ends the run early, and
//! partial results are kept, never rolled back.

use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent};
use crate::config::{EngineConfig, VariationRule};
use crate::control::{sleep_cancellable, StopFlag};
use crate::error::{EngineError, Result};
use crate::models::{
    BulkReplyProgress, BulkReplyReport, ReplyOutcome, ReplyProgress, ReplyStage, ReplyStatus,
    ReplyTarget,
};
use crate::page::{PageClient, SubmitOutcome};
use crate::ratelimit::RateLimitMonitor;
use crate::store::CommentStore;

/// Input for one bulk reply run.
#[derive(Debug, Clone)]
pub struct ReplyRun {
    pub targets: Vec<ReplyTarget>,
    pub variations: Vec<String>,
}

/// Pre-flight check: selections above the configured size thresholds need a
/// minimum number of distinct variations. Blocks the run from starting; not
/// a runtime check.
pub fn validate_variations(
    target_count: usize,
    variations: &[String],
    rules: &[VariationRule],
) -> Result<()> {
    let mut distinct: Vec<&str> = variations
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    distinct.sort_unstable();
    distinct.dedup();

    if distinct.is_empty() {
        return Err(EngineError::Validation(
            "at least one reply variation is required".into(),
        ));
    }

    let mut required = 1;
    for rule in rules {
        if target_count > rule.targets_above {
            required = required.max(rule.min_variations);
        }
    }
    if distinct.len() < required {
        return Err(EngineError::Validation(format!(
            "{target_count} targets require at least {required} distinct variations, got {}",
            distinct.len()
        )));
    }
    Ok(())
}

pub struct ReplyOrchestrator {
    config: Arc<EngineConfig>,
    page: PageClient,
    store: CommentStore,
    monitor: RateLimitMonitor,
    bridge: Arc<Bridge>,
}

impl ReplyOrchestrator {
    pub fn new(
        config: Arc<EngineConfig>,
        page: PageClient,
        store: CommentStore,
        monitor: RateLimitMonitor,
        bridge: Arc<Bridge>,
    ) -> Self {
        Self {
            config,
            page,
            store,
            monitor,
            bridge,
        }
    }

    /// Execute a bulk reply run to completion or stop.
    pub async fn run(&self, run: ReplyRun, stop: &StopFlag) -> Result<BulkReplyReport> {
        validate_variations(
            run.targets.len(),
            &run.variations,
            &self.config.limits.variation_rules,
        )?;

        let variations: Vec<String> = run
            .variations
            .iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        let mut progress = BulkReplyProgress::new(run.targets.len());
        let mut outcomes: Vec<ReplyOutcome> = Vec::new();
        let mut rng = StdRng::from_entropy();
        let mut current_post: Option<String> = None;
        let mut rotation: usize = 0;

        for target in &run.targets {
            if stop.is_stopped() {
                info!(
                    completed = progress.completed,
                    "bulk reply stopped, keeping partial results"
                );
                progress.stopped = true;
                break;
            }

            // The monitor's pause gates each item, like the batch queue.
            self.monitor.wait_until_clear().await;

            progress.current = Some(target.comment_id.clone());
            self.broadcast_progress(&progress);

            let outcome = self
                .process_target(target, &variations, &mut rotation, &mut current_post, stop)
                .await;
            self.record_outcome(&outcome);
            progress.record(&outcome.status);
            outcomes.push(outcome.clone());
            self.bridge.broadcast(BridgeEvent::ReplyOutcome(outcome));
            self.broadcast_progress(&progress);

            if !stop.is_stopped() {
                let delay = self.config.delays.between_items.sample(&mut rng);
                debug!(?delay, "inter-item delay");
                sleep_cancellable(delay, stop).await;
            }
        }

        progress.current = None;
        self.broadcast_progress(&progress);
        Ok(BulkReplyReport::from_progress(&progress, outcomes))
    }

    /// One target, in isolation: its failure never ends the run.
    async fn process_target(
        &self,
        target: &ReplyTarget,
        variations: &[String],
        rotation: &mut usize,
        current_post: &mut Option<String>,
        stop: &StopFlag,
    ) -> ReplyOutcome {
        if current_post.as_deref() != Some(target.post_id.as_str()) {
            self.stage(target, ReplyStage::Navigating, "opening post");
            if let Err(e) = self.page.navigate(&target.post_id).await {
                return self.failed(target, &format!("navigation failed: {e}"));
            }
            *current_post = Some(target.post_id.clone());
        }

        self.stage(target, ReplyStage::Finding, "locating comment");
        if !self.locate_within_budget(target).await {
            self.stage(target, ReplyStage::Error, "comment not found");
            if self.config.features.remove_missing_reply_targets {
                let _ = self
                    .store
                    .remove_comment(&target.post_id, &target.comment_id);
            }
            return ReplyOutcome {
                target: target.clone(),
                status: ReplyStatus::Skipped,
                content: None,
                error: Some("comment not found".into()),
                sent_at: None,
            };
        }

        let text = variations[*rotation % variations.len()].clone();
        *rotation += 1;

        self.stage(target, ReplyStage::Replying, "submitting reply");
        let mut attempts: u32 = 0;
        loop {
            let was_probe = self.monitor.probe_armed().await;
            match self
                .page
                .submit_reply(&target.comment_id, &text, self.config.delays.typing)
                .await
            {
                Ok(SubmitOutcome::Submitted) => {
                    self.monitor.report_success(was_probe).await;
                    self.stage(target, ReplyStage::Complete, "reply sent");
                    return ReplyOutcome {
                        target: target.clone(),
                        status: ReplyStatus::Completed,
                        content: Some(text),
                        error: None,
                        sent_at: Some(Utc::now()),
                    };
                }
                Ok(SubmitOutcome::MentionUnavailable) => {
                    self.stage(target, ReplyStage::Error, "mentions unavailable");
                    return ReplyOutcome {
                        target: target.clone(),
                        status: ReplyStatus::MentionUnavailable,
                        content: None,
                        error: Some("target account blocks mentions".into()),
                        sent_at: None,
                    };
                }
                Ok(SubmitOutcome::Failed { message }) => {
                    return self.failed(target, &message);
                }
                Err(EngineError::RateLimited { .. }) => {
                    // Never terminal: pause the engine and retry this item.
                    attempts += 1;
                    if attempts > self.config.limits.retry_ceiling || stop.is_stopped() {
                        return self.failed(target, "rate limited past retry ceiling");
                    }
                    self.monitor.report_failure().await;
                    self.monitor.wait_until_clear().await;
                }
                Err(e) => {
                    warn!(comment = %target.comment_id, error = %e, "reply submission failed");
                    return self.failed(target, &e.to_string());
                }
            }
        }
    }

    /// Try to bring the target into view, spending at most the configured
    /// click/scroll budget.
    async fn locate_within_budget(&self, target: &ReplyTarget) -> bool {
        let budget = self.config.limits.max_clicks_per_thread;
        for _ in 0..budget.max(1) {
            match self
                .page
                .locate_comment(&target.comment_id, target.text_hint.as_deref())
                .await
            {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return false,
            }
        }
        false
    }

    fn failed(&self, target: &ReplyTarget, message: &str) -> ReplyOutcome {
        self.stage(target, ReplyStage::Error, message);
        ReplyOutcome {
            target: target.clone(),
            status: ReplyStatus::Failed,
            content: None,
            error: Some(message.to_string()),
            sent_at: None,
        }
    }

    /// Push the reply outcome update onto the stored record.
    fn record_outcome(&self, outcome: &ReplyOutcome) {
        let result = self.store.mark_reply(
            &outcome.target.post_id,
            &outcome.target.comment_id,
            outcome.status == ReplyStatus::Completed,
            outcome.sent_at,
            outcome.error.as_deref(),
            outcome.content.as_deref(),
        );
        if let Err(e) = result {
            warn!(error = %e, "failed to record reply outcome");
        }
    }

    fn stage(&self, target: &ReplyTarget, stage: ReplyStage, message: &str) {
        self.bridge.broadcast(BridgeEvent::ReplyProgress(ReplyProgress {
            comment_id: target.comment_id.clone(),
            stage,
            message: message.to_string(),
        }));
    }

    fn broadcast_progress(&self, progress: &BulkReplyProgress) {
        self.bridge
            .broadcast(BridgeEvent::BulkReplyProgress(progress.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Context;
    use crate::config::DelayProfile;
    use crate::error::Result as EngineResult;
    use crate::page::{run_page_actor, CapturedCall, PageDriver, PageSnapshot};
    use crate::ratelimit::BackoffConfig;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ReplyPage {
        /// Comment ids the page can actually find.
        present: HashSet<String>,
        /// Scripted submit results, popped per attempt.
        submit_script: StdMutex<VecDeque<EngineResult<SubmitOutcome>>>,
        submitted: Arc<StdMutex<Vec<(String, String)>>>,
        locate_calls: Arc<StdMutex<u32>>,
    }

    #[async_trait]
    impl PageDriver for ReplyPage {
        async fn navigate(&self, _: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn is_ready(&self) -> EngineResult<bool> {
            Ok(true)
        }
        async fn snapshot(&self) -> EngineResult<PageSnapshot> {
            Ok(PageSnapshot::default())
        }
        async fn scroll_comments(&self) -> EngineResult<bool> {
            Ok(false)
        }
        async fn locate_comment(&self, comment_id: &str, _: Option<&str>) -> EngineResult<bool> {
            *self.locate_calls.lock().unwrap() += 1;
            Ok(self.present.contains(comment_id))
        }
        async fn host_globals(&self) -> EngineResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn captured_listing(&self) -> EngineResult<Option<CapturedCall>> {
            Ok(None)
        }
        async fn sign(&self, _: &str) -> EngineResult<Vec<(String, String)>> {
            Ok(vec![])
        }
        async fn fetch_listing(&self, _: &CapturedCall) -> EngineResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
        async fn submit_reply(
            &self,
            comment_id: &str,
            text: &str,
            _: &DelayProfile,
        ) -> EngineResult<SubmitOutcome> {
            let scripted = self.submit_script.lock().unwrap().pop_front();
            match scripted {
                Some(result) => {
                    if matches!(result, Ok(SubmitOutcome::Submitted)) {
                        self.submitted
                            .lock()
                            .unwrap()
                            .push((comment_id.to_string(), text.to_string()));
                    }
                    result
                }
                None => {
                    self.submitted
                        .lock()
                        .unwrap()
                        .push((comment_id.to_string(), text.to_string()));
                    Ok(SubmitOutcome::Submitted)
                }
            }
        }
    }

    struct Fixture {
        orchestrator: ReplyOrchestrator,
        submitted: Arc<StdMutex<Vec<(String, String)>>>,
        store: CommentStore,
        _dir: tempfile::TempDir,
    }

    fn fixture(present: &[&str], script: Vec<EngineResult<SubmitOutcome>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(Duration::from_secs(2));
        let inbox = bridge.register(Context::Page);
        let submitted = Arc::new(StdMutex::new(Vec::new()));
        tokio::spawn(run_page_actor(
            inbox,
            Arc::new(ReplyPage {
                present: present.iter().map(|s| s.to_string()).collect(),
                submit_script: StdMutex::new(script.into()),
                submitted: submitted.clone(),
                locate_calls: Arc::new(StdMutex::new(0)),
            }),
        ));

        let mut config = EngineConfig::default();
        config.delays.between_items = DelayProfile {
            mean_ms: 1.0,
            std_dev_ms: 0.0,
            min_ms: 1,
            max_ms: 2,
        };
        config.limits.max_clicks_per_thread = 3;
        config.limits.initial_backoff_ms = 20;
        config.limits.max_backoff_ms = 40;
        let config = Arc::new(config);

        let store = CommentStore::open(dir.path().join("records.db")).unwrap();
        let monitor = RateLimitMonitor::new(BackoffConfig {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(40),
        });
        let orchestrator = ReplyOrchestrator::new(
            config,
            PageClient::new(bridge.clone()),
            store.clone(),
            monitor,
            bridge,
        );
        Fixture {
            orchestrator,
            submitted,
            store,
            _dir: dir,
        }
    }

    fn targets(ids: &[&str]) -> Vec<ReplyTarget> {
        ids.iter().map(|id| ReplyTarget::new("p1", *id)).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn preflight_rejects_thin_variation_sets() {
        let rules = crate::config::LimitConfig::default().variation_rules;
        // 35 targets with 2 variations: rejected, needs at least 3.
        let err = validate_variations(35, &strings(&["a", "b"]), &rules).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        // The same selection with 3 variations is accepted.
        validate_variations(35, &strings(&["a", "b", "c"]), &rules).unwrap();
        // Small selections pass with a single variation.
        validate_variations(5, &strings(&["a"]), &rules).unwrap();
        // Duplicates and blanks do not count as distinct.
        let err = validate_variations(35, &strings(&["a", "a", " ", "b"]), &rules).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn variations_rotate_round_robin() {
        let f = fixture(&["c1", "c2", "c3"], vec![]);
        let run = ReplyRun {
            targets: targets(&["c1", "c2", "c3"]),
            variations: strings(&["first", "second"]),
        };
        let report = f.orchestrator.run(run, &StopFlag::new()).await.unwrap();
        assert_eq!(report.completed, 3);

        let submitted = f.submitted.lock().unwrap();
        let texts: Vec<&str> = submitted.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "first"]);
    }

    #[tokio::test]
    async fn missing_target_is_skipped_and_run_continues() {
        let f = fixture(&["c1", "c3"], vec![]);
        let run = ReplyRun {
            targets: targets(&["c1", "c2", "c3"]),
            variations: strings(&["hello"]),
        };
        let report = f.orchestrator.run(run, &StopFlag::new()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            report.completed + report.failed + report.skipped,
            report.total
        );
        let skipped: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| o.status == ReplyStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].target.comment_id, "c2");
    }

    #[tokio::test]
    async fn mention_unavailable_counts_as_failed() {
        let f = fixture(&["c1"], vec![Ok(SubmitOutcome::MentionUnavailable)]);
        let run = ReplyRun {
            targets: targets(&["c1"]),
            variations: strings(&["hello"]),
        };
        let report = f.orchestrator.run(run, &StopFlag::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.outcomes[0].status,
            ReplyStatus::MentionUnavailable
        );
    }

    #[tokio::test]
    async fn rate_limit_pauses_then_retries_same_target() {
        let f = fixture(
            &["c1"],
            vec![Err(EngineError::RateLimited { retry_after: None })],
        );
        let run = ReplyRun {
            targets: targets(&["c1"]),
            variations: strings(&["hello"]),
        };
        let report = f.orchestrator.run(run, &StopFlag::new()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(f.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_outcome_lands_on_stored_record() {
        let f = fixture(&["c1"], vec![]);
        let mut record = crate::models::CommentRecord::new("p1", "c1");
        record.text = "original".into();
        f.store.insert_comment(&record).unwrap();

        let run = ReplyRun {
            targets: targets(&["c1"]),
            variations: strings(&["thanks!"]),
        };
        f.orchestrator.run(run, &StopFlag::new()).await.unwrap();
        // Outcome update is observable through the store.
        let stored = f.store.get_comment("p1", "c1").unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn stop_keeps_partial_results() {
        let f = fixture(&["c1", "c2"], vec![]);
        let stop = StopFlag::new();
        let run = ReplyRun {
            targets: targets(&["c1", "c2"]),
            variations: strings(&["hello"]),
        };

        // Stop after the first outcome is recorded.
        let submitted = f.submitted.clone();
        let stop_clone = stop.clone();
        tokio::spawn(async move {
            loop {
                if !submitted.lock().unwrap().is_empty() {
                    stop_clone.stop();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        });

        let report = f.orchestrator.run(run, &stop).await.unwrap();
        assert!(report.stopped || report.completed == 2);
        assert!(report.completed >= 1);
    }
}

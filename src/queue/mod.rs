//! Batch queue: serialized multi-target scraping.
//!
//! Strict FIFO over target ids, exactly one scrape session in flight,
//! fixed inter-item delay plus jitter. A rate-limit pause suspends
//! dequeuing without losing queued items; a stop command drains the queue
//! and cancels the in-flight session while keeping completed items' stats.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bridge::BridgeEvent;
use crate::control::{sleep_cancellable, StopFlag};
use crate::error::{EngineError, Result};
use crate::models::{BatchProgress, BatchStatus};
use crate::session::{ScrapeSession, SessionControls, SessionDeps};

pub struct BatchQueue {
    deps: SessionDeps,
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl BatchQueue {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Append targets behind anything already queued.
    ///
    /// While a rate-limit pause is active the default is still to append
    /// (the pause is transient); `reject_enqueue_while_limited` flips this
    /// to an outright refusal.
    pub async fn enqueue(&self, targets: Vec<String>) -> Result<usize> {
        if self.deps.config.limits.reject_enqueue_while_limited
            && self.deps.monitor.is_limited().await
        {
            return Err(EngineError::Validation(
                "rate limit pause active, enqueue rejected".into(),
            ));
        }
        let mut queue = self.queue.lock().await;
        for target in targets {
            queue.push_back(target);
        }
        debug!(len = queue.len(), "batch queue extended");
        Ok(queue.len())
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Process the queue to empty (or stop), one session at a time.
    pub async fn run(&self, tab_id: u32, controls: &mut SessionControls) -> Result<BatchProgress> {
        let mut progress = BatchProgress::new(self.len().await);
        let mut rng = StdRng::from_entropy();
        let inter_item = self.deps.config.delays.inter_session_ms;
        let jitter_cap = self.deps.config.delays.inter_session_jitter_ms;

        loop {
            if controls.stop.is_stopped() {
                let drained = self.drain().await;
                info!(drained, "batch stopped, queue drained");
                progress.status = BatchStatus::Cancelled;
                break;
            }

            // The monitor's pause preempts new work; queued items wait.
            if self.deps.monitor.is_limited().await {
                progress.status = BatchStatus::Paused;
                self.deps
                    .bridge
                    .broadcast(BridgeEvent::BatchProgress(progress.clone()));
                self.deps.monitor.wait_until_clear().await;
                progress.status = BatchStatus::Running;
                continue;
            }

            let Some(target) = self.queue.lock().await.pop_front() else {
                progress.status = BatchStatus::Complete;
                break;
            };

            progress.total = progress.completed + 1 + self.len().await;
            progress.current_index = progress.completed;
            progress.current_target = Some(target.clone());

            let session = ScrapeSession::start(self.deps.clone(), &target, tab_id)?;
            let mut session_controls = SessionControls {
                stop: controls.stop.clone(),
                pause: controls.pause.clone(),
            };
            let outcome = session.run(&mut session_controls, None).await?;

            progress.completed += 1;
            progress.comments_total += outcome.record.comments_found;
            progress.stats.merge(&outcome.stats);
            self.deps
                .bridge
                .broadcast(BridgeEvent::BatchProgress(progress.clone()));
            debug!(
                target = %target,
                status = outcome.record.status.as_str(),
                new = outcome.stats.new,
                "batch item finished"
            );

            if self.len().await > 0 && !controls.stop.is_stopped() {
                let jitter = if jitter_cap > 0 {
                    rng.gen_range(0..=jitter_cap)
                } else {
                    0
                };
                sleep_cancellable(
                    std::time::Duration::from_millis(inter_item + jitter),
                    &controls.stop,
                )
                .await;
            }
        }

        progress.current_target = None;
        self.deps
            .bridge
            .broadcast(BridgeEvent::BatchProgress(progress.clone()));
        Ok(progress)
    }

    async fn drain(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let drained = queue.len();
        queue.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Bridge, Context};
    use crate::config::{DelayProfile, EngineConfig};
    use crate::error::Result as EngineResult;
    use crate::models::UserSettings;
    use crate::page::{
        run_page_actor, CapturedCall, PageClient, PageDriver, PageSnapshot, SubmitOutcome,
    };
    use crate::ratelimit::{BackoffConfig, RateLimitMonitor};
    use crate::session::SessionStore;
    use crate::store::CommentStore;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Page driver that records navigation order and serves one comment per
    /// post.
    struct OrderedPage {
        visits: Arc<StdMutex<Vec<String>>>,
        current: StdMutex<String>,
    }

    #[async_trait]
    impl PageDriver for OrderedPage {
        async fn navigate(&self, post_id: &str) -> EngineResult<()> {
            self.visits.lock().unwrap().push(post_id.to_string());
            *self.current.lock().unwrap() = post_id.to_string();
            Ok(())
        }
        async fn is_ready(&self) -> EngineResult<bool> {
            Ok(true)
        }
        async fn snapshot(&self) -> EngineResult<PageSnapshot> {
            let post = self.current.lock().unwrap().clone();
            Ok(PageSnapshot::from_html(format!(
                r#"<div data-e2e="comment-item" data-cid="c-{post}">
                     <span data-e2e="comment-text">comment on {post}</span>
                   </div>"#
            )))
        }
        async fn scroll_comments(&self) -> EngineResult<bool> {
            Ok(false)
        }
        async fn locate_comment(&self, _: &str, _: Option<&str>) -> EngineResult<bool> {
            Ok(true)
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
            _: &str,
            _: &str,
            _: &DelayProfile,
        ) -> EngineResult<SubmitOutcome> {
            Ok(SubmitOutcome::Submitted)
        }
    }

    fn deps(visits: Arc<StdMutex<Vec<String>>>) -> (tempfile::TempDir, SessionDeps) {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Bridge::new(Duration::from_secs(2));
        let inbox = bridge.register(Context::Page);
        tokio::spawn(run_page_actor(
            inbox,
            Arc::new(OrderedPage {
                visits,
                current: StdMutex::new(String::new()),
            }),
        ));

        let mut config = EngineConfig::default();
        config.timeouts.readiness_poll_ms = 5;
        config.delays.inter_session_ms = 10;
        config.delays.inter_session_jitter_ms = 5;
        config.limits.initial_backoff_ms = 30;
        config.limits.max_backoff_ms = 60;

        let monitor = RateLimitMonitor::new(BackoffConfig::from_limits(&config.limits));
        let deps = SessionDeps {
            config: Arc::new(config),
            page: PageClient::new(bridge.clone()),
            store: CommentStore::open(dir.path().join("records.db")).unwrap(),
            sessions: SessionStore::open(dir.path().join("sessions.db")).unwrap(),
            monitor,
            bridge,
            settings: UserSettings::default(),
        };
        (dir, deps)
    }

    #[tokio::test]
    async fn items_process_in_fifo_order() {
        let visits = Arc::new(StdMutex::new(Vec::new()));
        let (_dir, deps) = deps(visits.clone());
        let queue = BatchQueue::new(deps);
        queue
            .enqueue(vec!["p1".into(), "p2".into(), "p3".into()])
            .await
            .unwrap();

        let (mut controls, _handles) = SessionControls::create();
        let progress = queue.run(7, &mut controls).await.unwrap();

        assert_eq!(progress.status, BatchStatus::Complete);
        assert_eq!(progress.completed, 3);
        assert_eq!(progress.stats.new, 3);
        assert_eq!(progress.comments_total, 3);
        assert_eq!(*visits.lock().unwrap(), vec!["p1", "p2", "p3"]);
    }

    #[tokio::test]
    async fn stop_drains_queue_and_keeps_completed_stats() {
        let visits = Arc::new(StdMutex::new(Vec::new()));
        let (_dir, deps) = deps(visits.clone());
        let bridge = deps.bridge.clone();
        let queue = Arc::new(BatchQueue::new(deps));
        queue
            .enqueue(vec!["p1".into(), "p2".into(), "p3".into(), "p4".into()])
            .await
            .unwrap();

        let (mut controls, handles) = SessionControls::create();

        // Stop as soon as the first item's progress lands.
        let mut events = bridge.subscribe();
        let stopper = handles.stop.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let BridgeEvent::BatchProgress(p) = event {
                    if p.completed >= 1 {
                        stopper.stop();
                        return;
                    }
                }
            }
        });

        let progress = queue.run(7, &mut controls).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Cancelled);
        assert!(progress.completed >= 1);
        // Completed stats survive the stop.
        assert_eq!(progress.stats.new as usize, progress.completed);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn rate_limit_pause_suspends_dequeue_without_losing_items() {
        let visits = Arc::new(StdMutex::new(Vec::new()));
        let (_dir, deps) = deps(visits.clone());
        let monitor = deps.monitor.clone();
        let queue = BatchQueue::new(deps);
        queue
            .enqueue(vec!["p1".into(), "p2".into()])
            .await
            .unwrap();

        // Engine enters a short pause before the run starts.
        monitor.report_failure().await;

        let (mut controls, _handles) = SessionControls::create();
        let progress = queue.run(7, &mut controls).await.unwrap();

        // Both items still processed after the pause cleared.
        assert_eq!(progress.status, BatchStatus::Complete);
        assert_eq!(progress.completed, 2);
        assert_eq!(*visits.lock().unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn enqueue_during_pause_rejected_when_configured() {
        let visits = Arc::new(StdMutex::new(Vec::new()));
        let (_dir, mut deps) = deps(visits);
        let mut config = (*deps.config).clone();
        config.limits.reject_enqueue_while_limited = true;
        deps.config = Arc::new(config);

        deps.monitor.report_failure().await;
        let queue = BatchQueue::new(deps);
        let err = queue.enqueue(vec!["p1".into()]).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}

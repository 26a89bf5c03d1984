//! Scrape session state machine.
//!
//! One session drives extraction for a single target through
//! `navigating -> scraping -> (paused) -> complete | error | cancelled`.
//! Every transition is persisted, so an evicted background process
//! rehydrates the session and resumes from the stored cursor or scroll
//! position instead of restarting from zero.

mod persistence;

pub use persistence::SessionStore;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeEvent};
use crate::config::EngineConfig;
use crate::control::{pause_channel, PauseGate, PauseHandle, StopFlag};
use crate::error::{EngineError, Result};
use crate::extract::{
    select_strategy, NetworkExtractor, SigningPath, Strategy, StructuralExtractor,
};
use crate::models::{ScrapeStats, SessionRecord, SessionStatus, UserSettings};
use crate::page::{CapturedCall, PageClient};
use crate::ratelimit::RateLimitMonitor;
use crate::store::CommentStore;

/// Cooperative control surface for one running session.
pub struct SessionControls {
    pub stop: StopFlag,
    pub pause: PauseGate,
}

/// The matching handles held by whoever commands the session.
#[derive(Clone)]
pub struct SessionHandles {
    pub stop: StopFlag,
    pub pause: PauseHandle,
}

impl SessionControls {
    pub fn create() -> (Self, SessionHandles) {
        let stop = StopFlag::new();
        let (pause_handle, pause_gate) = pause_channel();
        (
            Self {
                stop: stop.clone(),
                pause: pause_gate,
            },
            SessionHandles {
                stop,
                pause: pause_handle,
            },
        )
    }
}

/// Everything a session borrows from the engine.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<EngineConfig>,
    pub page: PageClient,
    pub store: CommentStore,
    pub sessions: SessionStore,
    pub monitor: RateLimitMonitor,
    pub bridge: Arc<Bridge>,
    pub settings: UserSettings,
}

/// Terminal report of one session run.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub record: SessionRecord,
    pub stats: ScrapeStats,
}

enum End {
    Complete,
    Cancelled,
}

enum Readiness {
    Ready,
    TimedOut,
    Stopped,
}

pub struct ScrapeSession {
    deps: SessionDeps,
    record: SessionRecord,
    stats: ScrapeStats,
}

impl std::fmt::Debug for ScrapeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeSession")
            .field("record", &self.record)
            .field("stats", &self.stats)
            .finish()
    }
}

impl ScrapeSession {
    /// Begin a new session. At most one session may be active per tab.
    pub fn start(deps: SessionDeps, target_post_id: &str, tab_id: u32) -> Result<Self> {
        if let Some(existing) = deps.sessions.load_active_for_tab(tab_id)? {
            if !existing.status.is_terminal() {
                return Err(EngineError::SessionActive(tab_id));
            }
        }
        let record = SessionRecord::new(target_post_id, tab_id);
        deps.sessions.save(&record)?;
        Ok(Self {
            deps,
            record,
            stats: ScrapeStats::default(),
        })
    }

    /// Rehydrate a persisted session after a process restart.
    pub fn resume(deps: SessionDeps, record: SessionRecord) -> Self {
        info!(
            id = %record.id,
            status = record.status.as_str(),
            cursor = ?record.cursor,
            "rehydrating persisted session"
        );
        Self {
            deps,
            record,
            stats: ScrapeStats::default(),
        }
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Drive the session to a terminal state. Always returns a reportable
    /// outcome; only persistence failures surface as `Err`.
    pub async fn run(
        mut self,
        controls: &mut SessionControls,
        limit: Option<u64>,
    ) -> Result<SessionOutcome> {
        let cap = limit
            .or(self.deps.settings.max_comments)
            .unwrap_or(u64::MAX)
            .min(self.deps.config.limits.max_comments_per_session);

        self.transition(SessionStatus::Navigating, "opening target page")?;
        if controls.stop.is_stopped() {
            return self.finish(SessionStatus::Cancelled, "stopped before navigation");
        }
        if let Err(e) = self.deps.page.navigate(&self.record.target_post_id).await {
            return self.finish(SessionStatus::Error, &format!("navigation failed: {e}"));
        }

        match self.wait_ready(controls).await {
            Readiness::Ready => {}
            Readiness::TimedOut => {
                return self.finish(SessionStatus::Error, "target page never became ready")
            }
            Readiness::Stopped => {
                return self.finish(SessionStatus::Cancelled, "stopped while waiting for page")
            }
        }

        self.transition(SessionStatus::Scraping, "extracting comments")?;
        let strategy = select_strategy(&self.deps.page, &self.deps.config).await;
        debug!(strategy = strategy.name(), "extraction strategy selected");

        let result = match strategy {
            Strategy::Network { captured, signing } => {
                match self
                    .run_network(controls, cap, &captured, signing.as_ref())
                    .await
                {
                    Err(EngineError::Network(reason)) | Err(EngineError::Signing(reason))
                        if self.deps.config.features.structural_fallback =>
                    {
                        // Silent per-session downgrade; the session carries
                        // on with whatever it has collected so far.
                        debug!(%reason, "network path failed, downgrading to structural");
                        self.run_structural(controls, cap).await
                    }
                    other => other,
                }
            }
            Strategy::Structural => self.run_structural(controls, cap).await,
        };

        match result {
            Ok(End::Complete) => self.finish(SessionStatus::Complete, "extraction complete"),
            Ok(End::Cancelled) => self.finish(SessionStatus::Cancelled, "stopped"),
            Err(e) => {
                let message = format!("extraction failed: {e}");
                self.finish(SessionStatus::Error, &message)
            }
        }
    }

    async fn wait_ready(&self, controls: &SessionControls) -> Readiness {
        let deadline = Instant::now() + self.deps.config.timeouts.selector_wait();
        loop {
            if controls.stop.is_stopped() {
                return Readiness::Stopped;
            }
            match self.deps.page.is_ready().await {
                Ok(true) => return Readiness::Ready,
                Ok(false) | Err(_) => {}
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut;
            }
            tokio::time::sleep(self.deps.config.timeouts.readiness_poll()).await;
        }
    }

    async fn run_network(
        &mut self,
        controls: &mut SessionControls,
        cap: u64,
        captured: &CapturedCall,
        signing: Option<&SigningPath>,
    ) -> Result<End> {
        let extractor = NetworkExtractor::new(
            self.deps.page.clone(),
            self.deps.monitor.clone(),
            &self.deps.config,
        );
        let target = self.record.target_post_id.clone();

        loop {
            let mut want_pause = false;
            {
                let store = self.deps.store.clone();
                let sessions = self.deps.sessions.clone();
                let bridge = self.deps.bridge.clone();
                let settings = self.deps.settings.clone();
                let record = &mut self.record;
                let stats = &mut self.stats;
                let pause = &controls.pause;

                extractor
                    .paginate(
                        &target,
                        captured,
                        signing,
                        &controls.stop,
                        record.cursor.clone(),
                        |records, cursor| {
                            let kept: Vec<_> = records
                                .into_iter()
                                .filter(|r| !settings.hides(&r.author))
                                .collect();
                            let page_stats = match store.insert_comments(&kept) {
                                Ok(s) => s,
                                Err(e) => {
                                    warn!(error = %e, "failed to store page of records");
                                    ScrapeStats::default()
                                }
                            };
                            stats.merge(&page_stats);
                            record.comments_found += page_stats.new;
                            record.cursor = cursor;
                            record.updated_at = Utc::now();
                            let _ = sessions.save(record);
                            bridge.broadcast(BridgeEvent::ScrapeProgress {
                                session_id: record.id.clone(),
                                status: record.status,
                                comments_found: record.comments_found,
                                message: format!("{} comments collected", record.comments_found),
                            });

                            if pause.is_paused() {
                                want_pause = true;
                                return false;
                            }
                            record.comments_found < cap
                        },
                    )
                    .await?;
            }

            if controls.stop.is_stopped() {
                return Ok(End::Cancelled);
            }
            if want_pause {
                match self.enter_pause(controls).await? {
                    End::Cancelled => return Ok(End::Cancelled),
                    End::Complete => continue,
                }
            }
            return Ok(End::Complete);
        }
    }

    async fn run_structural(&mut self, controls: &mut SessionControls, cap: u64) -> Result<End> {
        let extractor = StructuralExtractor::new(self.deps.config.selectors.clone());
        let target = self.record.target_post_id.clone();
        let required = self.deps.config.limits.stable_iterations_required;
        let mut stable: u32 = 0;

        loop {
            if controls.stop.is_stopped() {
                return Ok(End::Cancelled);
            }
            if controls.pause.is_paused() {
                match self.enter_pause(controls).await? {
                    End::Cancelled => return Ok(End::Cancelled),
                    End::Complete => {}
                }
            }

            let snapshot = self.deps.page.snapshot().await?;
            let records = match extractor.extract(&target, &snapshot) {
                Ok(records) => records,
                Err(e) if self.record.comments_found == 0 => return Err(e),
                Err(_) => {
                    // Items collected earlier and markup gone now: treat as
                    // an exhausted listing, not a failure.
                    stable += 1;
                    Vec::new()
                }
            };

            let kept: Vec<_> = records
                .into_iter()
                .filter(|r| !self.deps.settings.hides(&r.author))
                .collect();
            let page_stats = self.deps.store.insert_comments(&kept)?;
            self.stats.merge(&page_stats);
            self.record.comments_found += page_stats.new;
            if page_stats.new == 0 {
                stable += 1;
            } else {
                stable = 0;
            }

            self.record.scroll_position += 1;
            self.record.updated_at = Utc::now();
            self.deps.sessions.save(&self.record)?;
            self.deps.bridge.broadcast(BridgeEvent::ScrapeProgress {
                session_id: self.record.id.clone(),
                status: self.record.status,
                comments_found: self.record.comments_found,
                message: format!("{} comments collected", self.record.comments_found),
            });

            if self.record.comments_found >= cap {
                return Ok(End::Complete);
            }
            if stable >= required {
                return Ok(End::Complete);
            }

            let loaded_more = self.deps.page.scroll_comments().await.unwrap_or(false);
            if !loaded_more {
                stable += 1;
            }
            tokio::time::sleep(self.deps.config.timeouts.readiness_poll()).await;
        }
    }

    /// Park the session while the tab is hidden; on refocus, re-probe
    /// readiness before resuming.
    async fn enter_pause(&mut self, controls: &mut SessionControls) -> Result<End> {
        self.record.paused = true;
        self.transition(SessionStatus::Paused, "tab lost visibility")?;
        self.deps.bridge.broadcast(BridgeEvent::PausedState {
            session_id: self.record.id.clone(),
            paused: true,
        });

        // A stop command must be able to cancel a parked session, so poll
        // both signals rather than waiting on the gate alone.
        while controls.pause.is_paused() && !controls.stop.is_stopped() {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        if controls.stop.is_stopped() {
            return Ok(End::Cancelled);
        }

        if let Readiness::TimedOut = self.wait_ready(controls).await {
            warn!("page not ready after resume, continuing anyway");
        }
        self.record.paused = false;
        self.transition(SessionStatus::Scraping, "resumed")?;
        self.deps.bridge.broadcast(BridgeEvent::PausedState {
            session_id: self.record.id.clone(),
            paused: false,
        });
        Ok(End::Complete)
    }

    fn transition(&mut self, status: SessionStatus, message: &str) -> Result<()> {
        self.record.status = status;
        self.record.message = message.to_string();
        self.record.updated_at = Utc::now();
        self.deps.sessions.save(&self.record)?;
        self.deps.bridge.broadcast(BridgeEvent::ScrapeProgress {
            session_id: self.record.id.clone(),
            status,
            comments_found: self.record.comments_found,
            message: message.to_string(),
        });
        Ok(())
    }

    fn finish(mut self, status: SessionStatus, message: &str) -> Result<SessionOutcome> {
        self.record.active = false;
        self.record.paused = false;
        self.transition(status, message)?;
        info!(
            id = %self.record.id,
            status = status.as_str(),
            found = self.stats.found,
            new = self.stats.new,
            preexisting = self.stats.preexisting,
            ignored = self.stats.ignored,
            "session finished"
        );
        Ok(SessionOutcome {
            record: self.record,
            stats: self.stats,
        })
    }
}

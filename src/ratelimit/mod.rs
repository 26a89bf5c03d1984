//! Process-wide rate limit monitor.
//!
//! Any component reporting a rate-limit-class failure feeds the consecutive
//! error counter; the pause it computes gates the batch queue and the reply
//! orchestrator globally. Backs off exponentially, auto-resumes when the
//! pause elapses, and allows a single probe call before restoring full
//! throughput.

mod persistence;

pub use persistence::{load_rate_limit_state, save_rate_limit_state};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::LimitConfig;

/// Backoff parameters, lifted from the limit config.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffConfig {
    pub fn from_limits(limits: &LimitConfig) -> Self {
        Self {
            initial: Duration::from_millis(limits.initial_backoff_ms),
            max: Duration::from_millis(limits.max_backoff_ms),
        }
    }

    /// Pause for the k-th consecutive failure: `min(initial * 2^(k-1), max)`.
    pub fn pause_for(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return Duration::ZERO;
        }
        let exponent = consecutive_errors.saturating_sub(1).min(31);
        let scaled = self.initial.saturating_mul(1u32 << exponent);
        scaled.min(self.max)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from_limits(&LimitConfig::default())
    }
}

/// Observable rate-limit state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    pub limited: bool,
    pub consecutive_errors: u32,
    pub first_error_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub paused_until: Option<DateTime<Utc>>,
    /// Set while the one allowed probe call after a pause is outstanding.
    pub probe_pending: bool,
    pub total_hits: u64,
}

/// Process-wide singleton; clone shares the underlying state.
#[derive(Clone)]
pub struct RateLimitMonitor {
    config: BackoffConfig,
    state: Arc<RwLock<RateLimitState>>,
}

impl RateLimitMonitor {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(RateLimitState::default())),
        }
    }

    pub async fn state(&self) -> RateLimitState {
        self.state.read().await.clone()
    }

    /// Record a rate-limit-class failure and return the pause now in effect.
    pub async fn report_failure(&self) -> Duration {
        let mut state = self.state.write().await;
        let now = Utc::now();
        state.consecutive_errors += 1;
        state.total_hits += 1;
        state.limited = true;
        state.probe_pending = false;
        state.first_error_at.get_or_insert(now);
        state.last_error_at = Some(now);

        let pause = self.config.pause_for(state.consecutive_errors);
        let candidate = now
            + chrono::Duration::from_std(pause).unwrap_or_else(|_| chrono::Duration::zero());
        // Never move the pause backwards while failures continue.
        let paused_until = match state.paused_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        state.paused_until = Some(paused_until);

        warn!(
            consecutive = state.consecutive_errors,
            pause_secs = pause.as_secs(),
            "rate limit reported, engine paused"
        );
        pause
    }

    /// Record a successful call. A success that was itself the retry of a
    /// limited call (the post-pause probe) clears the limit fully; any other
    /// success resets the counter only when the monitor is not limited.
    pub async fn report_success(&self, was_probe: bool) {
        let mut state = self.state.write().await;
        if was_probe && state.probe_pending {
            info!("rate limit probe succeeded, resuming full throughput");
            *state = RateLimitState {
                total_hits: state.total_hits,
                ..RateLimitState::default()
            };
            return;
        }
        if !state.limited {
            state.consecutive_errors = 0;
            state.first_error_at = None;
        }
    }

    pub async fn is_limited(&self) -> bool {
        let state = self.state.read().await;
        match state.paused_until {
            Some(until) => until > Utc::now(),
            None => false,
        }
    }

    /// Remaining pause, if one is active.
    pub async fn pause_remaining(&self) -> Option<Duration> {
        let state = self.state.read().await;
        let until = state.paused_until?;
        let remaining = until - Utc::now();
        remaining.to_std().ok().filter(|d| !d.is_zero())
    }

    /// Sleep out any active pause. On wake the pause is cleared and the one
    /// probe call is armed; callers then report their next result with
    /// `was_probe = true`.
    pub async fn wait_until_clear(&self) {
        loop {
            let remaining = self.pause_remaining().await;
            match remaining {
                Some(wait) => {
                    debug!(wait_secs = wait.as_secs(), "waiting out rate limit pause");
                    tokio::time::sleep(wait).await;
                }
                None => break,
            }
        }
        let mut state = self.state.write().await;
        if state.limited {
            state.limited = false;
            state.paused_until = None;
            state.probe_pending = true;
            info!("rate limit pause elapsed, probe call armed");
        }
    }

    /// Whether the next call should be treated as the post-pause probe.
    pub async fn probe_armed(&self) -> bool {
        self.state.read().await.probe_pending
    }

    pub(crate) async fn restore(&self, restored: RateLimitState) {
        *self.state.write().await = restored;
    }
}

impl Default for RateLimitMonitor {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(40),
            max: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = BackoffConfig {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(900),
        };
        assert_eq!(config.pause_for(1), Duration::from_secs(30));
        assert_eq!(config.pause_for(2), Duration::from_secs(60));
        assert_eq!(config.pause_for(3), Duration::from_secs(120));
        assert_eq!(config.pause_for(6), Duration::from_secs(900));
        assert_eq!(config.pause_for(30), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn failures_accumulate_and_success_resets() {
        let monitor = RateLimitMonitor::new(fast_config());
        monitor.report_failure().await;
        monitor.report_failure().await;
        let state = monitor.state().await;
        assert_eq!(state.consecutive_errors, 2);
        assert!(state.limited);

        monitor.wait_until_clear().await;
        assert!(monitor.probe_armed().await);
        monitor.report_success(true).await;
        let state = monitor.state().await;
        assert_eq!(state.consecutive_errors, 0);
        assert!(!state.limited);
        assert!(state.paused_until.is_none());
        assert_eq!(state.total_hits, 2);
    }

    #[tokio::test]
    async fn paused_until_never_regresses_under_continued_failures() {
        let monitor = RateLimitMonitor::new(BackoffConfig {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(3600),
        });
        monitor.report_failure().await;
        let first = monitor.state().await.paused_until.unwrap();
        monitor.report_failure().await;
        let second = monitor.state().await.paused_until.unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn wait_until_clear_returns_once_pause_elapses() {
        let monitor = RateLimitMonitor::new(fast_config());
        monitor.report_failure().await;
        assert!(monitor.is_limited().await);
        monitor.wait_until_clear().await;
        assert!(!monitor.is_limited().await);
    }

    #[tokio::test]
    async fn ordinary_success_while_limited_does_not_clear_pause() {
        let monitor = RateLimitMonitor::new(BackoffConfig {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(600),
        });
        monitor.report_failure().await;
        monitor.report_success(false).await;
        assert!(monitor.is_limited().await);
        assert_eq!(monitor.state().await.consecutive_errors, 1);
    }
}

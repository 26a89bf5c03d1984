//! Cooperative cancellation and pause signalling.
//!
//! Every suspension point in the engine checks these before proceeding;
//! nothing is preempted mid-step except by the rate limit monitor's global
//! pause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Shared stop flag; setting it asks the owning loop to wind down after the
/// current step.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sender half of the pause signal; held by whoever translates visibility
/// changes and pause/resume commands.
#[derive(Clone, Debug)]
pub struct PauseHandle {
    tx: watch::Sender<bool>,
}

impl PauseHandle {
    pub fn set_paused(&self, paused: bool) {
        let _ = self.tx.send(paused);
    }
}

/// Receiver half; owned by the session loop.
#[derive(Clone, Debug)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
}

impl PauseGate {
    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate is no longer paused (or the sender is gone, which
    /// counts as resumed).
    pub async fn resumed(&mut self) {
        while *self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a linked pause handle/gate pair, initially not paused.
pub fn pause_channel() -> (PauseHandle, PauseGate) {
    let (tx, rx) = watch::channel(false);
    (PauseHandle { tx }, PauseGate { rx })
}

/// Sleep that wakes early when the stop flag is raised.
pub async fn sleep_cancellable(duration: std::time::Duration, stop: &StopFlag) {
    const SLICE: std::time::Duration = std::time::Duration::from_millis(100);
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline && !stop.is_stopped() {
        let remaining = deadline - tokio::time::Instant::now();
        tokio::time::sleep(remaining.min(SLICE)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn stop_flag_latches() {
        let flag = StopFlag::new();
        assert!(!flag.is_stopped());
        flag.stop();
        assert!(flag.is_stopped());
        assert!(flag.clone().is_stopped());
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let (handle, mut gate) = pause_channel();
        handle.set_paused(true);
        assert!(gate.is_paused());

        let waiter = tokio::spawn(async move {
            gate.resumed().await;
            gate
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        handle.set_paused(false);
        let gate = waiter.await.unwrap();
        assert!(!gate.is_paused());
    }
}

//! Asynchronous message bridge between the four execution contexts.
//!
//! Contexts hold no references to each other; every interaction is a typed
//! request/response round-trip or a broadcast event on this bridge. Requests
//! are bounded by a client-side timeout after which the caller treats the
//! peer as failed. Liveness between dashboard and engine is maintained by
//! periodic probe/acknowledge events, independent of any single request's
//! timeout.

mod catalog;

pub use catalog::{BridgeEvent, BridgeRequest, BridgeResponse, Context};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Queue depth per registered context.
const ENDPOINT_QUEUE: usize = 64;
/// Broadcast buffer; slow subscribers miss old events rather than block.
const EVENT_BUFFER: usize = 256;

/// A request paired with its one-shot reply channel.
pub struct Envelope {
    pub request: BridgeRequest,
    pub reply: oneshot::Sender<BridgeResponse>,
}

/// The bridge itself: endpoint registry plus event fan-out.
pub struct Bridge {
    endpoints: RwLock<HashMap<Context, mpsc::Sender<Envelope>>>,
    events: broadcast::Sender<BridgeEvent>,
    request_timeout: Duration,
}

impl Bridge {
    pub fn new(request_timeout: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            events,
            request_timeout,
        })
    }

    /// Register a context, returning its request inbox. Re-registering
    /// replaces the previous endpoint (a reloaded context supersedes the
    /// dead one).
    pub fn register(&self, context: Context) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.endpoints
            .write()
            .expect("bridge endpoint registry poisoned")
            .insert(context, tx);
        debug!(?context, "context registered on bridge");
        rx
    }

    pub fn is_registered(&self, context: Context) -> bool {
        self.endpoints
            .read()
            .expect("bridge endpoint registry poisoned")
            .contains_key(&context)
    }

    /// Send a request to a context and await its response, bounded by the
    /// bridge timeout.
    pub async fn request(
        &self,
        context: Context,
        request: BridgeRequest,
    ) -> Result<BridgeResponse> {
        let sender = {
            let endpoints = self
                .endpoints
                .read()
                .expect("bridge endpoint registry poisoned");
            endpoints.get(&context).cloned()
        };
        let Some(sender) = sender else {
            return Err(EngineError::BridgeDisconnected(format!(
                "no endpoint for {context:?}"
            )));
        };

        let kind = request.kind();
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| {
                EngineError::BridgeDisconnected(format!("{context:?} inbox closed ({kind})"))
            })?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EngineError::BridgeDisconnected(format!(
                "{context:?} dropped reply for {kind}"
            ))),
            Err(_) => Err(EngineError::BridgeTimeout(self.request_timeout)),
        }
    }

    /// Fire-and-forget broadcast to every subscriber.
    pub fn broadcast(&self, event: BridgeEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}

/// Dashboard-side liveness state over the bridge.
#[derive(Clone)]
pub struct LivenessMonitor {
    disconnected: Arc<AtomicBool>,
    last_ack: Arc<Mutex<Instant>>,
}

impl LivenessMonitor {
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// Spawn the dashboard-side probe loop: emit `Probe` on a fixed interval and
/// flip to disconnected when no `ProbeAck` lands within the window.
pub fn spawn_liveness_probe(
    bridge: Arc<Bridge>,
    interval: Duration,
    window: Duration,
) -> LivenessMonitor {
    let monitor = LivenessMonitor {
        disconnected: Arc::new(AtomicBool::new(false)),
        last_ack: Arc::new(Mutex::new(Instant::now())),
    };

    // Ack listener.
    {
        let monitor = monitor.clone();
        let mut events = bridge.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, BridgeEvent::ProbeAck) {
                    *monitor.last_ack.lock().expect("liveness clock poisoned") = Instant::now();
                    monitor.disconnected.store(false, Ordering::SeqCst);
                }
            }
        });
    }

    // Probe ticker.
    {
        let monitor = monitor.clone();
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                bridge.broadcast(BridgeEvent::Probe);
                let elapsed = monitor
                    .last_ack
                    .lock()
                    .expect("liveness clock poisoned")
                    .elapsed();
                if elapsed > window && !monitor.disconnected.swap(true, Ordering::SeqCst) {
                    warn!(?elapsed, "bridge liveness window elapsed without ack");
                    bridge.broadcast(BridgeEvent::ConnectionLost);
                }
            }
        });
    }

    monitor
}

/// Spawn the engine-side responder that answers every `Probe` with a
/// `ProbeAck`.
pub fn spawn_probe_responder(bridge: Arc<Bridge>) {
    let mut events = bridge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, BridgeEvent::Probe) {
                bridge.broadcast(BridgeEvent::ProbeAck);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bridge() -> Arc<Bridge> {
        Bridge::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn request_round_trips_through_registered_endpoint() {
        let bridge = test_bridge();
        let mut inbox = bridge.register(Context::Page);

        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                assert_eq!(envelope.request.kind(), "probe_readiness");
                let _ = envelope.reply.send(BridgeResponse::Ready { ready: true });
            }
        });

        let response = bridge
            .request(Context::Page, BridgeRequest::ProbeReadiness)
            .await
            .unwrap();
        assert!(matches!(response, BridgeResponse::Ready { ready: true }));
    }

    #[tokio::test]
    async fn request_to_unregistered_context_fails_fast() {
        let bridge = test_bridge();
        let err = bridge
            .request(Context::Page, BridgeRequest::ProbeReadiness)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BridgeDisconnected(_)));
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let bridge = test_bridge();
        // Endpoint registered but never serviced; keep the receiver alive so
        // the send succeeds and only the reply is missing.
        let _inbox = bridge.register(Context::Page);
        let err = bridge
            .request(Context::Page, BridgeRequest::Snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BridgeTimeout(_)));
    }

    #[tokio::test]
    async fn liveness_flags_disconnect_without_acks() {
        let bridge = test_bridge();
        let monitor = spawn_liveness_probe(
            bridge.clone(),
            Duration::from_millis(10),
            Duration::from_millis(30),
        );
        assert!(!monitor.is_disconnected());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(monitor.is_disconnected());
    }

    #[tokio::test]
    async fn liveness_stays_connected_while_acks_flow() {
        let bridge = test_bridge();
        spawn_probe_responder(bridge.clone());
        let monitor = spawn_liveness_probe(
            bridge.clone(),
            Duration::from_millis(10),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!monitor.is_disconnected());
    }
}

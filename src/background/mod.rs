//! Background-context actor.
//!
//! The extension background process owns the engine: it serves the dashboard
//! half of the message catalog, runs sessions, batches, and reply runs, and
//! translates visibility broadcasts into pause signals for the session on
//! the affected tab. At most one session is active per tab, so running work
//! is tracked by tab id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::bridge::{
    spawn_probe_responder, Bridge, BridgeEvent, BridgeRequest, BridgeResponse, Context, Envelope,
};
use crate::control::StopFlag;
use crate::error::EngineError;
use crate::queue::BatchQueue;
use crate::reply::{ReplyOrchestrator, ReplyRun};
use crate::session::{ScrapeSession, SessionControls, SessionDeps, SessionHandles};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

struct Running {
    by_tab: HashMap<u32, SessionHandles>,
    bulk_reply: Option<StopFlag>,
}

/// Shared state of the background context.
#[derive(Clone)]
pub struct BackgroundContext {
    deps: SessionDeps,
    running: Arc<Mutex<Running>>,
}

/// Register the background context on the bridge and start serving.
pub fn spawn_background(bridge: Arc<Bridge>, deps: SessionDeps) -> BackgroundContext {
    let inbox = bridge.register(Context::Background);
    let context = BackgroundContext {
        deps,
        running: Arc::new(Mutex::new(Running {
            by_tab: HashMap::new(),
            bulk_reply: None,
        })),
    };

    spawn_probe_responder(bridge.clone());
    tokio::spawn(visibility_loop(bridge.subscribe(), context.clone()));
    tokio::spawn(serve_loop(inbox, context.clone()));
    context
}

/// Translate tab visibility broadcasts into pause signals.
async fn visibility_loop(
    mut events: tokio::sync::broadcast::Receiver<BridgeEvent>,
    context: BackgroundContext,
) {
    while let Ok(event) = events.recv().await {
        if let BridgeEvent::VisibilityChanged { tab_id, visible } = event {
            let running = context.running.lock().await;
            if let Some(handles) = running.by_tab.get(&tab_id) {
                debug!(tab_id, visible, "visibility change routed to session");
                handles.pause.set_paused(!visible);
            }
        }
    }
}

async fn serve_loop(mut inbox: mpsc::Receiver<Envelope>, context: BackgroundContext) {
    while let Some(Envelope { request, reply }) = inbox.recv().await {
        // Long-running requests (sessions, batches, reply runs) must not
        // block pause/stop commands, so every request gets its own task.
        let context = context.clone();
        tokio::spawn(async move {
            let response = handle(request, context).await;
            let _ = reply.send(response);
        });
    }
}

fn error_response(e: EngineError) -> BridgeResponse {
    BridgeResponse::Error {
        message: e.to_string(),
    }
}

async fn handle(request: BridgeRequest, context: BackgroundContext) -> BridgeResponse {
    let deps = &context.deps;
    match request {
        BridgeRequest::CheckBridge => BridgeResponse::BridgeReady {
            version: ENGINE_VERSION.to_string(),
        },

        BridgeRequest::GetVideoComments {
            post_id,
            tab_id,
            limit,
        } => run_single_session(&context, &post_id, tab_id, limit).await,

        BridgeRequest::GetBatchComments { post_ids, tab_id } => {
            let queue = BatchQueue::new(deps.clone());
            if let Err(e) = queue.enqueue(post_ids).await {
                return error_response(e);
            }
            let (mut controls, handles) = SessionControls::create();
            context
                .running
                .lock()
                .await
                .by_tab
                .insert(tab_id, handles);
            let result = queue.run(tab_id, &mut controls).await;
            context.running.lock().await.by_tab.remove(&tab_id);
            match result {
                Ok(progress) => BridgeResponse::BatchReport { progress },
                Err(e) => error_response(e),
            }
        }

        BridgeRequest::ReplyComment { target, message } => {
            run_reply(
                &context,
                ReplyRun {
                    targets: vec![target],
                    variations: vec![message],
                },
            )
            .await
        }

        BridgeRequest::BulkReplyStart {
            targets,
            variations,
        } => {
            run_reply(
                &context,
                ReplyRun {
                    targets,
                    variations,
                },
            )
            .await
        }

        BridgeRequest::BulkReplyStop => {
            let running = context.running.lock().await;
            if let Some(stop) = &running.bulk_reply {
                stop.stop();
            }
            BridgeResponse::Ack
        }

        BridgeRequest::ScrapePause { session_id } => {
            set_session_paused(&context, &session_id, true).await
        }
        BridgeRequest::ScrapeResume { session_id } => {
            set_session_paused(&context, &session_id, false).await
        }

        BridgeRequest::ScrapeStop { session_id } => {
            match tab_for_session(&context, &session_id).await {
                Some(tab_id) => {
                    let running = context.running.lock().await;
                    if let Some(handles) = running.by_tab.get(&tab_id) {
                        handles.stop.stop();
                        // Wake the session if it is parked in a pause.
                        handles.pause.set_paused(false);
                    }
                    BridgeResponse::Ack
                }
                None => error_response(EngineError::Extraction(format!(
                    "unknown session {session_id}"
                ))),
            }
        }

        BridgeRequest::RemoveScrapedComment {
            post_id,
            comment_id,
        } => match deps.store.remove_comment(&post_id, &comment_id) {
            Ok(_) => BridgeResponse::Ack,
            Err(e) => error_response(e),
        },

        BridgeRequest::UpdateScrapedComment {
            post_id,
            comment_id,
            text,
        } => match deps.store.update_comment_text(&post_id, &comment_id, &text) {
            Ok(_) => BridgeResponse::Ack,
            Err(e) => error_response(e),
        },

        other => error_response(EngineError::Extraction(format!(
            "background context cannot serve {}",
            other.kind()
        ))),
    }
}

async fn run_single_session(
    context: &BackgroundContext,
    post_id: &str,
    tab_id: u32,
    limit: Option<u64>,
) -> BridgeResponse {
    let deps = context.deps.clone();
    let session = match ScrapeSession::start(deps.clone(), post_id, tab_id) {
        Ok(session) => session,
        Err(e) => return error_response(e),
    };

    let (mut controls, handles) = SessionControls::create();
    context
        .running
        .lock()
        .await
        .by_tab
        .insert(tab_id, handles);
    let result = session.run(&mut controls, limit).await;
    context.running.lock().await.by_tab.remove(&tab_id);

    match result {
        Ok(outcome) => {
            let records = deps
                .store
                .comments_for_post(&outcome.record.target_post_id)
                .unwrap_or_default();
            BridgeResponse::Comments {
                records,
                stats: outcome.stats,
            }
        }
        Err(e) => error_response(e),
    }
}

async fn run_reply(context: &BackgroundContext, run: ReplyRun) -> BridgeResponse {
    let deps = &context.deps;
    let stop = StopFlag::new();
    {
        let mut running = context.running.lock().await;
        if running
            .bulk_reply
            .as_ref()
            .is_some_and(|s| !s.is_stopped())
        {
            return error_response(EngineError::Validation(
                "a bulk reply run is already in flight".into(),
            ));
        }
        running.bulk_reply = Some(stop.clone());
    }

    let orchestrator = ReplyOrchestrator::new(
        deps.config.clone(),
        deps.page.clone(),
        deps.store.clone(),
        deps.monitor.clone(),
        deps.bridge.clone(),
    );
    let result = orchestrator.run(run, &stop).await;
    context.running.lock().await.bulk_reply = None;

    match result {
        Ok(report) => BridgeResponse::ReplyReport { report },
        Err(e) => {
            warn!(error = %e, "reply run rejected");
            error_response(e)
        }
    }
}

async fn set_session_paused(
    context: &BackgroundContext,
    session_id: &str,
    paused: bool,
) -> BridgeResponse {
    match tab_for_session(context, session_id).await {
        Some(tab_id) => {
            let running = context.running.lock().await;
            if let Some(handles) = running.by_tab.get(&tab_id) {
                handles.pause.set_paused(paused);
            }
            BridgeResponse::Ack
        }
        None => error_response(EngineError::Extraction(format!(
            "unknown session {session_id}"
        ))),
    }
}

async fn tab_for_session(context: &BackgroundContext, session_id: &str) -> Option<u32> {
    context
        .deps
        .sessions
        .load(session_id)
        .ok()
        .flatten()
        .map(|record| record.tab_id)
}

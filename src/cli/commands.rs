//! Command implementations.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::background::spawn_background;
use crate::bridge::{
    spawn_liveness_probe, Bridge, BridgeEvent, BridgeRequest, BridgeResponse, Context,
    LivenessMonitor,
};
use crate::config::ConfigResolver;
use crate::models::{IgnoreEntry, ReplyTarget, ScrapeStats};
use crate::page::{run_page_actor, HttpPageDriver, PageClient};
use crate::ratelimit::{load_rate_limit_state, save_rate_limit_state, BackoffConfig, RateLimitMonitor};
use crate::session::{SessionDeps, SessionStore};
use crate::store::CommentStore;

/// Wired-up engine environment for one CLI invocation.
pub struct Env {
    pub resolver: ConfigResolver,
    pub bridge: Arc<Bridge>,
    pub store: CommentStore,
    pub sessions: SessionStore,
    pub monitor: RateLimitMonitor,
    pub liveness: LivenessMonitor,
    pub state_db: PathBuf,
}

impl Env {
    pub async fn prepare(
        config_path: Option<PathBuf>,
        data_dir: Option<PathBuf>,
        base_url: &str,
    ) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("replyforge")
        });
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;

        let resolver = match config_path {
            Some(path) => ConfigResolver::from_file(path)?,
            None => ConfigResolver::from_file(data_dir.join("engine.toml"))?,
        };
        let config = resolver.get().await;

        let store = CommentStore::open(data_dir.join("records.db"))?;
        let sessions = SessionStore::open(data_dir.join("sessions.db"))?;
        let state_db = data_dir.join("engine.db");

        let monitor = RateLimitMonitor::new(BackoffConfig::from_limits(&config.limits));
        // A pause from the previous run still applies after a restart.
        load_rate_limit_state(&monitor, &state_db).await?;

        let bridge = Bridge::new(config.timeouts.bridge_request());
        let page_inbox = bridge.register(Context::Page);
        let driver = HttpPageDriver::new(base_url, config.clone())?;
        tokio::spawn(run_page_actor(page_inbox, Arc::new(driver)));

        let deps = SessionDeps {
            config: config.clone(),
            page: PageClient::new(bridge.clone()),
            store: store.clone(),
            sessions: sessions.clone(),
            monitor: monitor.clone(),
            bridge: bridge.clone(),
            settings: Default::default(),
        };
        spawn_background(bridge.clone(), deps);

        // This process is also the dashboard: keep the probe/ack loop going
        // so a dead engine surfaces as disconnected rather than as a hang.
        let liveness = spawn_liveness_probe(
            bridge.clone(),
            config.timeouts.liveness_interval(),
            config.timeouts.liveness_window(),
        );

        Ok(Self {
            resolver,
            bridge,
            store,
            sessions,
            monitor,
            liveness,
            state_db,
        })
    }

    async fn persist_state(&self) {
        if let Err(e) = save_rate_limit_state(&self.monitor, &self.state_db).await {
            eprintln!("warning: failed to save engine state: {e}");
        }
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template"),
    );
    pb.set_message(message.to_string());
    pb
}

/// Mirror scrape progress broadcasts onto a spinner until dropped.
fn follow_scrape_events(env: &Env, pb: ProgressBar) -> JoinHandle<()> {
    let mut events = env.bridge.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BridgeEvent::ScrapeProgress {
                    status,
                    comments_found,
                    message,
                    ..
                } => {
                    pb.set_message(format!(
                        "[{}] {} ({comments_found} comments)",
                        status.as_str(),
                        message
                    ));
                    pb.tick();
                }
                BridgeEvent::BatchProgress(p) => {
                    pb.set_message(format!(
                        "[{}] {}/{} targets, {} comments",
                        p.status.as_str(),
                        p.completed,
                        p.total,
                        p.comments_total
                    ));
                    pb.tick();
                }
                BridgeEvent::BulkReplyProgress(p) => {
                    pb.set_message(format!(
                        "{}/{} replied ({} failed, {} skipped)",
                        p.completed, p.total, p.failed, p.skipped
                    ));
                    pb.tick();
                }
                _ => {}
            }
        }
    })
}

fn print_stats(stats: &ScrapeStats) {
    println!(
        "  {} found, {} new, {} preexisting, {} ignored",
        stats.found,
        style(stats.new).green(),
        stats.preexisting,
        stats.ignored
    );
}

pub async fn scrape(env: &Env, post_id: &str, tab: u32, limit: Option<u64>) -> anyhow::Result<()> {
    let pb = spinner("starting session");
    let follower = follow_scrape_events(env, pb.clone());

    let response = env
        .bridge
        .request(
            Context::Background,
            BridgeRequest::GetVideoComments {
                post_id: post_id.to_string(),
                tab_id: tab,
                limit,
            },
        )
        .await?;
    follower.abort();
    pb.finish_and_clear();
    env.persist_state().await;

    match response {
        BridgeResponse::Comments { records, stats } => {
            println!("{} {}", style("scraped").green().bold(), post_id);
            print_stats(&stats);
            println!("  {} records stored for this post", records.len());
            Ok(())
        }
        BridgeResponse::Error { message } => anyhow::bail!("scrape failed: {message}"),
        other => anyhow::bail!("unexpected response: {}", other.kind()),
    }
}

pub async fn batch(env: &Env, post_ids: Vec<String>, tab: u32) -> anyhow::Result<()> {
    if post_ids.is_empty() {
        anyhow::bail!("no post ids given");
    }
    let pb = spinner(&format!("batch of {} targets", post_ids.len()));
    let follower = follow_scrape_events(env, pb.clone());

    let response = env
        .bridge
        .request(
            Context::Background,
            BridgeRequest::GetBatchComments { post_ids, tab_id: tab },
        )
        .await?;
    follower.abort();
    pb.finish_and_clear();
    env.persist_state().await;

    match response {
        BridgeResponse::BatchReport { progress } => {
            println!(
                "{} {}/{} targets, {} comments total",
                style("batch finished").green().bold(),
                progress.completed,
                progress.total,
                progress.comments_total
            );
            print_stats(&progress.stats);
            Ok(())
        }
        BridgeResponse::Error { message } => anyhow::bail!("batch failed: {message}"),
        other => anyhow::bail!("unexpected response: {}", other.kind()),
    }
}

pub async fn reply(
    env: &Env,
    post_id: &str,
    variations: Vec<String>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let mut comments = env.store.comments_for_post(post_id)?;
    if let Some(limit) = limit {
        comments.truncate(limit);
    }
    if comments.is_empty() {
        anyhow::bail!("no stored comments for post {post_id}; scrape it first");
    }

    let targets: Vec<ReplyTarget> = comments
        .iter()
        .map(|c| {
            ReplyTarget::new(c.post_id.clone(), c.comment_id.clone())
                .with_text_hint(c.text.clone())
        })
        .collect();

    let pb = spinner(&format!("replying to {} comments", targets.len()));
    let follower = follow_scrape_events(env, pb.clone());

    let response = env
        .bridge
        .request(
            Context::Background,
            BridgeRequest::BulkReplyStart {
                targets,
                variations,
            },
        )
        .await?;
    follower.abort();
    pb.finish_and_clear();
    env.persist_state().await;

    match response {
        BridgeResponse::ReplyReport { report } => {
            println!(
                "{} {} completed, {} failed, {} skipped of {}",
                style("bulk reply finished").green().bold(),
                style(report.completed).green(),
                style(report.failed).red(),
                report.skipped,
                report.total
            );
            if report.stopped {
                println!("  run was stopped early; partial results kept");
            }
            Ok(())
        }
        BridgeResponse::Error { message } => anyhow::bail!("bulk reply rejected: {message}"),
        other => anyhow::bail!("unexpected response: {}", other.kind()),
    }
}

pub async fn status(env: &Env) -> anyhow::Result<()> {
    let config = env.resolver.get().await;
    println!("{}", style("replyforge status").bold());
    println!("  config version: {}", if config.version.is_empty() {
        "(default)".to_string()
    } else {
        config.version.clone()
    });
    println!("  stored comments: {}", env.store.count_comments()?);

    let active = env.sessions.active_sessions()?;
    if active.is_empty() {
        println!("  active sessions: none");
    } else {
        for session in active {
            println!(
                "  session {} on tab {}: {} ({} comments, {})",
                session.id,
                session.tab_id,
                session.status.as_str(),
                session.comments_found,
                session.message
            );
        }
    }

    println!(
        "  bridge: {}",
        if env.liveness.is_disconnected() {
            style("disconnected").red().to_string()
        } else {
            "connected".to_string()
        }
    );

    let state = env.monitor.state().await;
    if let Some(remaining) = env.monitor.pause_remaining().await {
        println!(
            "  rate limit: {} for {}s ({} consecutive errors)",
            style("paused").red(),
            remaining.as_secs(),
            state.consecutive_errors
        );
    } else {
        println!("  rate limit: clear ({} hits total)", state.total_hits);
    }
    Ok(())
}

pub fn ignore_add(env: &Env, text: &str) -> anyhow::Result<()> {
    env.store.add_ignore(&IgnoreEntry::new(text))?;
    println!("added ignore pattern");
    Ok(())
}

pub fn ignore_remove(env: &Env, text: &str) -> anyhow::Result<()> {
    if env.store.remove_ignore(text)? {
        println!("removed ignore pattern");
    } else {
        println!("pattern not found");
    }
    Ok(())
}

pub fn ignore_list(env: &Env) -> anyhow::Result<()> {
    let entries = env.store.list_ignores()?;
    if entries.is_empty() {
        println!("ignore list is empty");
        return Ok(());
    }
    for entry in entries {
        println!("  {}  (added {})", entry.text, entry.added_at.format("%Y-%m-%d"));
    }
    Ok(())
}

pub async fn show_config(env: &Env) -> anyhow::Result<()> {
    let config = env.resolver.get().await;
    println!("{}", toml::to_string_pretty(&*config)?);
    Ok(())
}

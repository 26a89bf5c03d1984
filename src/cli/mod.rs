//! Command-line interface driving the engine locally.
//!
//! The CLI stands in for the dashboard context: it wires the bridge, spawns
//! the background and page actors, then issues catalog requests and renders
//! progress broadcasts.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Check for verbose flag before full CLI parsing (needed for logging
/// setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Parser)]
#[command(
    name = "replyforge",
    version,
    about = "Comment collection and bulk reply automation engine"
)]
pub struct Cli {
    /// Engine config file (TOML or JSON); defaults apply when missing.
    #[arg(long, global = true, env = "REPLYFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for persisted engine state.
    #[arg(long, global = true, env = "REPLYFORGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Host base URL for the HTTP page driver.
    #[arg(long, global = true, env = "REPLYFORGE_BASE_URL", default_value = "https://www.tiktok.com")]
    base_url: String,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape comments from a single post.
    Scrape {
        /// Target post id.
        post_id: String,
        /// Tab the session is bound to.
        #[arg(long, default_value_t = 1)]
        tab: u32,
        /// Stop after this many accepted comments.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Scrape several posts through the batch queue, one at a time.
    Batch {
        /// Target post ids, processed in order.
        post_ids: Vec<String>,
        #[arg(long, default_value_t = 1)]
        tab: u32,
    },
    /// Reply to every stored comment of a post, rotating variations.
    Reply {
        post_id: String,
        /// Reply text variations, rotated round-robin.
        #[arg(long = "variation", required = true)]
        variations: Vec<String>,
        /// Reply to at most this many comments.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show engine state: sessions, rate limit, record counts.
    Status,
    /// Maintain the ignore list.
    Ignore {
        #[command(subcommand)]
        action: IgnoreAction,
    },
    /// Print the resolved configuration.
    Config,
}

#[derive(Subcommand)]
enum IgnoreAction {
    /// Add a banned text pattern.
    Add { text: String },
    /// Remove a pattern.
    Remove { text: String },
    /// List all patterns.
    List,
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = commands::Env::prepare(cli.config.clone(), cli.data_dir.clone(), &cli.base_url)
        .await?;

    match cli.command {
        Command::Scrape {
            post_id,
            tab,
            limit,
        } => commands::scrape(&env, &post_id, tab, limit).await,
        Command::Batch { post_ids, tab } => commands::batch(&env, post_ids, tab).await,
        Command::Reply {
            post_id,
            variations,
            limit,
        } => commands::reply(&env, &post_id, variations, limit).await,
        Command::Status => commands::status(&env).await,
        Command::Ignore { action } => match action {
            IgnoreAction::Add { text } => commands::ignore_add(&env, &text),
            IgnoreAction::Remove { text } => commands::ignore_remove(&env, &text),
            IgnoreAction::List => commands::ignore_list(&env),
        },
        Command::Config => commands::show_config(&env).await,
    }
}

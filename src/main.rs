//! `promptgate` — process entry point and CLI (spec §6.4).
//!
//! `start` boots the full daemon (storage, queue, worker pool, Telegram
//! listener); every other subcommand is a thin wrapper around `admin::*`
//! operating directly on the same SQLite file, for operators who don't
//! want to stand up the full admin transport the spec excludes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};

use promptgate::admission::AdmissionFront;
use promptgate::channel::telegram::TelegramChannel;
use promptgate::channel::Channel;
use promptgate::config::RuntimeConfig;
use promptgate::content::{self, Content};
use promptgate::engine::GameEngine;
use promptgate::grader::Grader;
use promptgate::llm::http::HttpLlmClient;
use promptgate::queue::PersistentQueue;
use promptgate::storage::{SqliteStorage, Storage};
use promptgate::worker::WorkerPoolHandle;
use promptgate::{admin, logging};

/// Channel buffer size between the Telegram listener and the Admission Front.
const INBOUND_BUFFER_SIZE: usize = 256;

/// How long `start` waits for in-flight workers to drain on SIGINT.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "promptgate", about = "Gated sequential prompt-challenge attempt-processing engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon: admission, workers, and the Telegram listener.
    Start,
    /// Create the SQLite database and schema if they don't already exist.
    Init,
    /// Reload activity/levels/rewards content from the config directory.
    Reload,
    /// Print queue depth and today's claim count.
    Stats,
    /// Ban a user from the activity.
    Ban {
        /// The channel-scoped user id.
        user_id: String,
        /// Why the user is being banned.
        reason: String,
    },
    /// Lift a ban.
    Unban {
        /// The channel-scoped user id.
        user_id: String,
    },
    /// Reset a user's session for a level back to READY.
    ResetSession {
        /// The channel-scoped user id.
        user_id: String,
        /// The level id.
        level_id: i64,
    },
    /// Drop every pending task, releasing in-flight sessions back to READY.
    ClearQueue,
    /// Print every log event recorded on a given date (`YYYY-MM-DD`, UTC).
    ExportLog {
        /// The date to export, e.g. `2026-07-30`.
        date: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = RuntimeConfig::load().context("failed to load runtime config")?;

    match cli.command {
        Command::Start => {
            let _logging_guard = logging::init_production(std::path::Path::new(&config.paths.logs_dir))
                .context("failed to initialize logging")?;
            run_start(config).await
        }
        Command::Init => {
            logging::init_cli();
            SqliteStorage::connect(&config.paths.db_path)
                .await
                .context("failed to initialize database")?;
            println!("database ready at {}", config.paths.db_path);
            Ok(())
        }
        Command::Reload => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            let loader = content::loader(&config.paths.config_dir);
            let loaded = loader.load().await.context("failed to load content")?;
            for pool in &loaded.pools {
                storage.reload_reward_items(&pool.pool_id, pool.enabled, &pool.items).await?;
            }
            println!("reloaded {} level(s) across {} pool(s)", loaded.levels.len(), loaded.pools.len());
            Ok(())
        }
        Command::Stats => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            let stats = admin::stats(&storage).await?;
            println!("queue_depth={} claims_today={}", stats.queue_depth, stats.claims_today);
            Ok(())
        }
        Command::Ban { user_id, reason } => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            admin::ban_user(&storage, &user_id, &reason).await?;
            println!("banned {user_id}");
            Ok(())
        }
        Command::Unban { user_id } => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            admin::unban_user(&storage, &user_id).await?;
            println!("unbanned {user_id}");
            Ok(())
        }
        Command::ResetSession { user_id, level_id } => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            admin::reset_session(&storage, &user_id, level_id).await?;
            println!("reset session for {user_id} level {level_id}");
            Ok(())
        }
        Command::ClearQueue => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            let queue = PersistentQueue::new(usize::MAX);
            queue.rehydrate(&storage).await?;
            let dropped = admin::clear_queue(&storage, &queue).await?;
            println!("cleared {dropped} pending task(s)");
            Ok(())
        }
        Command::ExportLog { date } => {
            logging::init_cli();
            let storage = open_storage(&config).await?;
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").context("expected date as YYYY-MM-DD")?;
            let events = admin::export_log(&storage, date).await?;
            for event in events {
                println!(
                    "{} {} user={:?} level={:?} {}",
                    event.created_at.to_rfc3339(),
                    event.event_type.as_str(),
                    event.user_id,
                    event.level_id,
                    event.content
                );
            }
            Ok(())
        }
    }
}

async fn open_storage(config: &RuntimeConfig) -> Result<SqliteStorage> {
    SqliteStorage::connect(&config.paths.db_path)
        .await
        .context("failed to open database")
}

async fn run_start(config: RuntimeConfig) -> Result<()> {
    let storage: Arc<dyn Storage> = Arc::new(open_storage(&config).await?);

    let loader = content::loader(&config.paths.config_dir);
    let loaded = loader.load().await.context("failed to load content")?;
    for pool in &loaded.pools {
        storage.reload_reward_items(&pool.pool_id, pool.enabled, &pool.items).await?;
    }
    let worker_concurrency = loaded.activity.worker_concurrency;
    let queue_max_length = loaded.activity.queue_max_length;
    let content = Arc::new(RwLock::new(loaded));

    let queue = PersistentQueue::new(queue_max_length);
    let replayed = queue.rehydrate(storage.as_ref()).await?;
    tracing::info!(replayed, "rehydrated persistent queue");

    let api_key = config
        .llm
        .api_key
        .clone()
        .context("PROMPTGATE_LLM_API_KEY (or runtime.toml [llm] api_key) is required")?;
    let llm_model = content.read().await.activity.llm_model.clone();
    let llm: Arc<dyn promptgate::llm::LlmClient> = Arc::new(HttpLlmClient::new(llm_model, api_key));
    let grader = Arc::new(Grader::new(Arc::clone(&llm)));

    let bot_token = config
        .telegram
        .bot_token
        .clone()
        .context("PROMPTGATE_TELEGRAM_BOT_TOKEN (or runtime.toml [telegram] bot_token) is required")?;
    let telegram = Arc::new(TelegramChannel::new(bot_token));
    let channel: Arc<dyn Channel> = telegram.clone();

    let admission = Arc::new(AdmissionFront::new(
        Arc::clone(&storage),
        Arc::clone(&content),
        Arc::clone(&queue),
        Arc::clone(&channel),
    ));
    let engine = Arc::new(GameEngine::new(
        Arc::clone(&storage),
        Arc::clone(&content),
        grader,
        llm,
        Arc::clone(&channel),
    ));

    let workers = WorkerPoolHandle::spawn(worker_concurrency, Arc::clone(&queue), engine);

    let (tx, mut rx) = mpsc::channel(INBOUND_BUFFER_SIZE);
    let listener = tokio::spawn(telegram.run_listener(tx));
    // Processed one at a time, in arrival order — admission enqueues into a
    // strictly FIFO queue, so admitting out of order would undo that
    // ordering before a single task ever reaches a worker. The per-user
    // lock inside `AdmissionFront` only bounds how long one user's turn can
    // block this line, not a substitute for this loop being sequential.
    let admission_loop = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = admission.on_message(msg).await {
                tracing::error!(error = %e, "admission failed");
            }
        }
    });

    tracing::info!("promptgate started");
    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received, draining workers");

    listener.abort();
    admission_loop.abort();
    workers.shutdown(SHUTDOWN_DRAIN).await;

    Ok(())
}

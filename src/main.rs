mod config;
mod dispatcher;
mod engine;
mod error;
mod event;
mod housekeeping;
mod outbound;
mod review;
mod session;
mod source;
mod storage;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::requests::Requester;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, TransportMode};
use crate::dispatcher::Dispatcher;
use crate::engine::{Engine, Stopped};
use crate::error::EngineError;
use crate::outbound::TelegramOutbound;
use crate::housekeeping::Housekeeping;
use crate::session::SessionStore;
use crate::source::polling::{classify, long_poll_bot, PollingTransport};
use crate::source::webhook::WebhookTransport;
use crate::source::{AckTracker, Backoff, UpdateSource};
use crate::storage::Store;

/// Exit status when the update transport gave up for good.
const EXIT_TRANSPORT_UNAVAILABLE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reviewbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<EngineError>() {
                Some(EngineError::TransportUnavailable { .. }) => {
                    ExitCode::from(EXIT_TRANSPORT_UNAVAILABLE)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            warn!("Cannot listen for Ctrl+C, running until the transport stops: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn run() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Transport: {}", config.transport.mode);
    info!("  Workers: {}", config.dispatcher.workers);
    info!("  Idle timeout: {:?}", config.dispatcher.idle_timeout());
    info!("  Database: {}", config.storage.database_path.display());

    let store = Store::open(&config.storage.database_path)?;
    for reviewer in &config.review.reviewers {
        store.add_reviewer(*reviewer).await?;
    }
    info!("  Reviewers: {:?}", store.reviewers().await?);
    let checkpoint = store.load_checkpoint().await?;

    if !checkpoint.stranded.is_empty() {
        info!("  Stranded updates to replay: {}", checkpoint.stranded.len());
    }

    let bot = long_poll_bot(&config.telegram.bot_token, &config.transport.polling)?;
    let me = bot
        .get_me()
        .await
        .map_err(|e| EngineError::TransportUnavailable {
            attempts: 1,
            last: classify(e),
        })
        .context("Failed to fetch bot identity")?;
    let username = me.user.username.clone();
    info!("  Bot: @{}", username.as_deref().unwrap_or("?"));

    let outbound = Arc::new(TelegramOutbound::new(bot.clone()));
    let handlers = review::handlers(store.clone(), outbound.clone(), config.telegram.group_id);
    info!("  Handlers: {}", handlers.names().collect::<Vec<_>>().join(", "));

    let dispatcher = Dispatcher::new(
        handlers,
        Arc::new(SessionStore::new(config.dispatcher.idle_timeout())),
        outbound,
    );
    let sessions = Arc::clone(dispatcher.sessions());
    let engine = Engine::new(Arc::new(dispatcher), &config.dispatcher);
    let tracker = Arc::new(AckTracker::new());
    let backoff = Backoff::from_config(&config.transport.retry);

    let housekeeping =
        Housekeeping::start(&config.dispatcher.sweep_cron, sessions, Arc::clone(&tracker))
            .await?;

    info!("Bot is starting...");
    let stopped: Stopped = match config.transport.mode {
        TransportMode::Polling => {
            let transport =
                PollingTransport::new(bot, &config.transport.polling).with_username(username);
            let source =
                UpdateSource::new(transport, tracker, backoff).with_checkpoint(&checkpoint);
            engine.run(source, shutdown_signal()).await
        }
        TransportMode::Webhook => {
            let webhook = config
                .transport
                .webhook
                .as_ref()
                .context("Webhook mode without [transport.webhook] section")?;
            let transport = WebhookTransport::bind(bot, webhook)
                .await?
                .with_username(username);
            let source =
                UpdateSource::new(transport, tracker, backoff).with_checkpoint(&checkpoint);
            engine.run(source, shutdown_signal()).await
        }
    };

    if let Err(e) = housekeeping.stop().await {
        warn!("{:#}", e);
    }
    store
        .save_checkpoint(&stopped.checkpoint)
        .await
        .context("Failed to save update checkpoint")?;

    match stopped.error {
        Some(e) => Err(e.into()),
        None => {
            info!("Bot stopped");
            Ok(())
        }
    }
}

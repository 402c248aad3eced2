//! Webhook transport.
//!
//! Telegram POSTs each update to our HTTP endpoint. The handler only checks
//! the secret, queues the update and answers 200 right away; a full queue
//! answers 503 so Telegram backs off and retries instead of us dropping it.
//!
//! A 200 is final: Telegram never resends that update. Whatever was
//! accepted but not dispatched at shutdown ends up in the checkpoint.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router};
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, Update};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::polling::classify;
use super::{Batch, Transport};
use crate::config::WebhookConfig;
use crate::error::{EngineError, TransportError};
use crate::event::{self, Seq};

const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
struct HookState {
    queue: mpsc::Sender<Update>,
    secret: Option<String>,
}

async fn receive_update(
    State(state): State<HookState>,
    headers: HeaderMap,
    Json(update): Json<Update>,
) -> StatusCode {
    if let Some(expected) = &state.secret {
        let given = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            warn!("Webhook call with missing or wrong secret token");
            return StatusCode::FORBIDDEN;
        }
    }

    match state.queue.try_send(update) {
        Ok(()) => StatusCode::OK,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Webhook queue full, asking Telegram to retry");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(mpsc::error::TrySendError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn router(path: &str, state: HookState) -> Router {
    Router::new()
        .route(path, post(receive_update))
        .with_state(state)
}

pub struct WebhookTransport {
    updates: mpsc::Receiver<Update>,
    batch_limit: usize,
    username: Option<String>,
    stop: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
}

impl WebhookTransport {
    /// Register the webhook with Telegram and start the HTTP listener.
    pub async fn bind(bot: Bot, config: &WebhookConfig) -> Result<Self> {
        let url = reqwest::Url::parse(&config.public_url)
            .with_context(|| format!("Invalid webhook public_url: {}", config.public_url))?;

        let mut request = bot
            .set_webhook(url)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
        if let Some(secret) = &config.secret_token {
            request = request.secret_token(secret.clone());
        }
        request
            .await
            .map_err(|e| EngineError::TransportUnavailable {
                attempts: 1,
                last: classify(e),
            })
            .context("Failed to register webhook")?;

        let (queue, updates) = mpsc::channel(config.queue_capacity);
        let app = router(
            &config.path,
            HookState {
                queue,
                secret: config.secret_token.clone(),
            },
        );

        let addr: SocketAddr = config
            .listen
            .parse()
            .with_context(|| format!("Invalid webhook listen address: {}", config.listen))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind webhook listener on {}", addr))?;

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async {
                stopped.await.ok();
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Webhook server exited: {}", e);
            }
        });

        info!("Webhook listening on {}{}", addr, config.path);
        Ok(Self {
            updates,
            batch_limit: config.batch_limit,
            username: None,
            stop: Some(stop),
            server: Some(server),
        })
    }

    /// The bot's own username, so commands for other bots are not taken.
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    #[cfg(test)]
    pub(crate) fn from_channel(updates: mpsc::Receiver<Update>, batch_limit: usize) -> Self {
        Self {
            updates,
            batch_limit,
            username: None,
            stop: None,
            server: None,
        }
    }

    fn batch(&self, updates: &[Update]) -> Batch {
        let me = self.username.as_deref();
        let high_water = updates.iter().map(|u| Seq::from(u.id.0)).max();
        let events = updates
            .iter()
            .filter_map(|u| event::from_telegram(u, me))
            .collect();
        Batch { events, high_water }
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn fetch(&mut self, _cursor: Option<Seq>) -> Result<Batch, TransportError> {
        let first = self.updates.recv().await.ok_or(TransportError::Closed)?;
        let mut updates = vec![first];
        while updates.len() < self.batch_limit {
            match self.updates.try_recv() {
                Ok(update) => updates.push(update),
                Err(_) => break,
            }
        }

        Ok(self.batch(&updates))
    }

    async fn acknowledge(&mut self, _cursor: Seq) -> Result<(), TransportError> {
        // Each update was acknowledged by its 200 response.
        Ok(())
    }

    fn acknowledges_on_receipt(&self) -> bool {
        true
    }

    async fn close(&mut self) {
        // New POSTs get refused from here on and Telegram keeps them for the
        // next start. Waiting for the server lets in-flight requests land in
        // the queue before it is drained.
        if let Some(stop) = self.stop.take() {
            stop.send(()).ok();
        }
        if let Some(server) = self.server.take() {
            if let Err(e) = server.await {
                warn!("Webhook server task failed: {}", e);
            }
        }
        debug!("Webhook intake closed");
    }

    fn drain(&mut self) -> Batch {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            updates.push(update);
        }
        self.batch(&updates)
    }
}

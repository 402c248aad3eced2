use anyhow::Context;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use teloxide::{ApiError, RequestError};
use tracing::{debug, info};

use super::{Batch, Transport};
use crate::config::PollingConfig;
use crate::error::TransportError;
use crate::event::{self, Seq};

/// Map a teloxide error onto the transport taxonomy.
pub(crate) fn classify(err: RequestError) -> TransportError {
    match &err {
        RequestError::Api(ApiError::InvalidToken) => {
            TransportError::Rejected(err.to_string())
        }
        RequestError::RetryAfter(secs) => TransportError::Throttled {
            message: err.to_string(),
            retry_after: Some(secs.duration()),
        },
        _ => TransportError::Network(err.to_string()),
    }
}

/// Bot whose HTTP client waits longer than a long poll.
///
/// teloxide's default client gives up after 17 seconds, which would cut
/// every idle `getUpdates` short and count it as a network failure.
pub fn long_poll_bot(token: &str, config: &PollingConfig) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(config.request_timeout())
        .build()
        .context("Failed to build HTTP client")?;
    Ok(Bot::with_client(token, client))
}

/// Long-poll transport over `getUpdates`.
pub struct PollingTransport {
    bot: Bot,
    timeout_secs: u32,
    limit: u8,
    username: Option<String>,
    webhook_cleared: bool,
}

impl PollingTransport {
    pub fn new(bot: Bot, config: &PollingConfig) -> Self {
        Self {
            bot,
            timeout_secs: config.timeout_secs,
            limit: config.limit,
            username: None,
            webhook_cleared: false,
        }
    }

    /// The bot's own username, so commands for other bots are not taken.
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    async fn fetch(&mut self, cursor: Option<Seq>) -> Result<Batch, TransportError> {
        if !self.webhook_cleared {
            // getUpdates is refused while a webhook is registered
            self.bot.delete_webhook().await.map_err(classify)?;
            self.webhook_cleared = true;
            info!("Long polling started");
        }

        let mut request = self
            .bot
            .get_updates()
            .timeout(self.timeout_secs)
            .limit(self.limit)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
        if let Some(offset) = cursor {
            request = request.offset(offset as i32);
        }

        let updates = request.await.map_err(classify)?;
        let high_water = updates.iter().map(|u| Seq::from(u.id.0)).max();
        let me = self.username.as_deref();
        let events = updates
            .iter()
            .filter_map(|u| event::from_telegram(u, me))
            .collect::<Vec<_>>();
        debug!(
            received = updates.len(),
            events = events.len(),
            cursor = ?cursor,
            "Poll returned"
        );

        Ok(Batch { events, high_water })
    }

    async fn acknowledge(&mut self, cursor: Seq) -> Result<(), TransportError> {
        // An offset confirms every update below it; limit 1 with no wait
        // keeps the call cheap.
        self.bot
            .get_updates()
            .offset(cursor as i32)
            .limit(1)
            .timeout(0)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

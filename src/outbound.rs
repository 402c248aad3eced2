use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId,
    ParseMode,
};
use tracing::debug;

use crate::event::ChatId as RawChatId;

/// Telegram rejects messages over 4096 chars; leave some headroom.
const MAX_MESSAGE_LEN: usize = 4000;

/// Inline button attached to a forwarded document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Something a handler wants delivered once its dispatch succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text {
        chat_id: RawChatId,
        text: String,
        html: bool,
    },
    Document {
        chat_id: RawChatId,
        file_id: String,
        caption: String,
        buttons: Vec<Button>,
    },
    /// Replaces the caption. The inline keyboard is replaced by `buttons`,
    /// so an empty list removes it.
    EditCaption {
        chat_id: RawChatId,
        message_id: i32,
        caption: String,
        buttons: Vec<Button>,
    },
    AnswerCallback {
        query_id: String,
    },
}

impl OutboundMessage {
    pub fn text(chat_id: RawChatId, text: impl Into<String>) -> Self {
        Self::Text {
            chat_id,
            text: text.into(),
            html: false,
        }
    }

    pub fn html(chat_id: RawChatId, text: impl Into<String>) -> Self {
        Self::Text {
            chat_id,
            text: text.into(),
            html: true,
        }
    }

    /// Chat the message ends up in, when it has one.
    pub fn chat_id(&self) -> Option<RawChatId> {
        match self {
            Self::Text { chat_id, .. }
            | Self::Document { chat_id, .. }
            | Self::EditCaption { chat_id, .. } => Some(*chat_id),
            Self::AnswerCallback { .. } => None,
        }
    }
}

/// Outbound message API. Delivery errors are returned to the dispatcher,
/// which reports them; handlers never see them.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<()>;
}

/// Group invitations. Unlike deliveries, failures go back to the caller.
#[async_trait]
pub trait InviteLinks: Send + Sync {
    /// Single-use invite link to `group_id`.
    async fn create_invite(&self, group_id: RawChatId) -> Result<String>;
}

fn keyboard(buttons: &[Button]) -> InlineKeyboardMarkup {
    let row = buttons
        .iter()
        .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.data.clone()))
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![row])
}

/// Split long messages for Telegram's 4096 char limit
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// teloxide-backed [`Outbound`]
pub struct TelegramOutbound {
    bot: Bot,
}

impl TelegramOutbound {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Outbound for TelegramOutbound {
    async fn send(&self, message: &OutboundMessage) -> Result<()> {
        debug!(?message, "Delivering outbound message");
        match message {
            OutboundMessage::Text {
                chat_id,
                text,
                html,
            } => {
                for chunk in split_message(text, MAX_MESSAGE_LEN) {
                    let request = self.bot.send_message(ChatId(*chat_id), chunk);
                    let request = if *html {
                        request.parse_mode(ParseMode::Html)
                    } else {
                        request
                    };
                    request
                        .await
                        .with_context(|| format!("Failed to send message to {}", chat_id))?;
                }
            }
            OutboundMessage::Document {
                chat_id,
                file_id,
                caption,
                buttons,
            } => {
                self.bot
                    .send_document(ChatId(*chat_id), InputFile::file_id(FileId(file_id.clone())))
                    .caption(caption.clone())
                    .reply_markup(keyboard(buttons))
                    .await
                    .with_context(|| format!("Failed to forward document to {}", chat_id))?;
            }
            OutboundMessage::EditCaption {
                chat_id,
                message_id,
                caption,
                buttons,
            } => {
                let request = self
                    .bot
                    .edit_message_caption(ChatId(*chat_id), MessageId(*message_id))
                    .caption(caption.clone());
                let request = if buttons.is_empty() {
                    request
                } else {
                    request.reply_markup(keyboard(buttons))
                };
                request
                    .await
                    .with_context(|| format!("Failed to edit caption in {}", chat_id))?;
            }
            OutboundMessage::AnswerCallback { query_id } => {
                self.bot
                    .answer_callback_query(CallbackQueryId(query_id.clone()))
                    .await
                    .context("Failed to answer callback query")?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl InviteLinks for TelegramOutbound {
    async fn create_invite(&self, group_id: RawChatId) -> Result<String> {
        let link = self
            .bot
            .create_chat_invite_link(ChatId(group_id))
            .member_limit(1)
            .await
            .with_context(|| format!("Failed to create invite link for {}", group_id))?;
        Ok(link.invite_link)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Records everything it is asked to deliver. Fails for chats listed in
    /// `failing`, and refuses invites to groups listed there.
    #[derive(Default)]
    pub struct RecordingOutbound {
        pub sent: Mutex<Vec<OutboundMessage>>,
        pub failing: Vec<RawChatId>,
    }

    impl RecordingOutbound {
        pub async fn sent(&self) -> Vec<OutboundMessage> {
            self.sent.lock().await.clone()
        }

        pub async fn texts_for(&self, chat_id: RawChatId) -> Vec<String> {
            self.sent
                .lock()
                .await
                .iter()
                .filter_map(|m| match m {
                    OutboundMessage::Text { chat_id: c, text, .. } if *c == chat_id => {
                        Some(text.clone())
                    }
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Outbound for RecordingOutbound {
        async fn send(&self, message: &OutboundMessage) -> Result<()> {
            if let Some(chat_id) = message.chat_id() {
                if self.failing.contains(&chat_id) {
                    anyhow::bail!("chat {} unreachable", chat_id);
                }
            }
            self.sent.lock().await.push(message.clone());
            Ok(())
        }
    }

    #[async_trait]
    impl InviteLinks for RecordingOutbound {
        async fn create_invite(&self, group_id: RawChatId) -> Result<String> {
            if self.failing.contains(&group_id) {
                anyhow::bail!("Bad Request: not enough rights to manage chat invite links");
            }
            Ok(format!("https://t.me/+invite{}", group_id.unsigned_abs()))
        }
    }
}

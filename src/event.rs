use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport-assigned update number. Monotonic per source.
pub type Seq = i64;

/// Chat identifier; sessions are keyed by it.
pub type ChatId = i64;

/// Kind of chat an event originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Private,
    Group,
}

/// The user who produced the event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: u64,
    pub username: Option<String>,
    pub full_name: String,
}

impl Sender {
    /// `@username` when available, display name otherwise.
    pub fn handle(&self) -> String {
        match &self.username {
            Some(name) => format!("@{}", name),
            None => self.full_name.clone(),
        }
    }
}

/// Normalized content of an inbound update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Text(String),
    Command {
        name: String,
        args: Vec<String>,
    },
    Document {
        file_id: String,
        file_name: Option<String>,
        mime_type: Option<String>,
    },
    /// Inline button press. `message_id` is the message carrying the button.
    Callback {
        query_id: String,
        data: String,
        message_id: Option<i32>,
    },
    Unsupported,
}

impl Payload {
    /// Split text into a command when it starts with `/`.
    ///
    /// `/unblock@hackbot 123` becomes `Command { name: "unblock", args: ["123"] }`
    /// when `me` is `hackbot` (or unknown). A command addressed to another
    /// bot is `Unsupported`.
    pub fn from_text(text: &str, me: Option<&str>) -> Self {
        let trimmed = text.trim();
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Payload::Text(text.to_string());
        };
        let mut parts = rest.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let (name, mention) = match head.split_once('@') {
            Some((name, mention)) => (name, Some(mention)),
            None => (head, None),
        };
        if name.is_empty() {
            return Payload::Text(text.to_string());
        }
        if let (Some(mention), Some(me)) = (mention, me) {
            if !mention.eq_ignore_ascii_case(me) {
                return Payload::Unsupported;
            }
        }
        Payload::Command {
            name: name.to_lowercase(),
            args: parts.map(str::to_string).collect(),
        }
    }
}

/// One inbound update, normalized. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl Event {
    pub fn command_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Command { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn callback_data(&self) -> Option<&str> {
        match &self.payload {
            Payload::Callback { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn is_private(&self) -> bool {
        self.chat_kind == ChatKind::Private
    }
}

/// Normalize a teloxide update. Returns `None` for updates without a chat
/// (inline queries, polls, ...) or of kinds we do not subscribe to.
///
/// `me` is the bot's own username, used to tell our commands apart from
/// other bots' in groups.
pub fn from_telegram(update: &teloxide::types::Update, me: Option<&str>) -> Option<Event> {
    use teloxide::types::UpdateKind;

    let seq = Seq::from(update.id.0);
    match &update.kind {
        UpdateKind::Message(msg) => {
            let user = msg.from.as_ref()?;
            let payload = if let Some(text) = msg.text() {
                Payload::from_text(text, me)
            } else if let Some(doc) = msg.document() {
                Payload::Document {
                    file_id: doc.file.id.to_string(),
                    file_name: doc.file_name.clone(),
                    mime_type: doc.mime_type.as_ref().map(|m| m.to_string()),
                }
            } else {
                Payload::Unsupported
            };
            Some(Event {
                seq,
                chat_id: msg.chat.id.0,
                chat_kind: if msg.chat.is_private() {
                    ChatKind::Private
                } else {
                    ChatKind::Group
                },
                sender: sender_from(user),
                timestamp: msg.date,
                payload,
            })
        }
        UpdateKind::CallbackQuery(query) => {
            let message = query.message.as_ref()?;
            let chat = message.chat();
            Some(Event {
                seq,
                chat_id: chat.id.0,
                chat_kind: if chat.is_private() {
                    ChatKind::Private
                } else {
                    ChatKind::Group
                },
                sender: sender_from(&query.from),
                timestamp: Utc::now(),
                payload: Payload::Callback {
                    query_id: query.id.to_string(),
                    data: query.data.clone().unwrap_or_default(),
                    message_id: Some(message.id().0),
                },
            })
        }
        _ => None,
    }
}

fn sender_from(user: &teloxide::types::User) -> Sender {
    Sender {
        id: user.id.0,
        username: user.username.clone(),
        full_name: user.full_name(),
    }
}

//! Writeup submission and the reviewer's decision on it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::dispatcher::{Action, Outbox, Transition};
use crate::event::{ChatId, Event, Payload};
use crate::outbound::{Button, InviteLinks, OutboundMessage};
use crate::session::Session;
use crate::storage::Store;

use super::{texts, AWAITING_REVIEW};

fn is_pdf(file_name: Option<&str>) -> bool {
    file_name.is_some_and(|name| name.to_lowercase().ends_with(".pdf"))
}

fn decision_buttons(user_id: u64) -> Vec<Button> {
    vec![
        Button::new("✅ Aceptar", format!("accept:{}", user_id)),
        Button::new("❌ Rechazar", format!("reject:{}", user_id)),
        Button::new("🚫 Bloquear", format!("block:{}", user_id)),
    ]
}

pub struct SubmitDocument {
    pub store: Store,
}

impl SubmitDocument {
    async fn submit(&self, event: &Event, file_id: &str, session: &mut Session, out: &mut Outbox) -> Result<()> {
        let user = &event.sender;
        let Some(reviewer) = self.store.next_reviewer().await? else {
            out.reply(texts::NO_REVIEWERS);
            return Ok(());
        };

        self.store
            .put_pending(user.id, user.username.as_deref(), file_id, reviewer)
            .await?;

        out.send(OutboundMessage::Document {
            chat_id: reviewer as ChatId,
            file_id: file_id.to_string(),
            caption: format!("📄 Nuevo writeup recibido de {}\n", user.handle()),
            buttons: decision_buttons(user.id),
        });
        out.reply(texts::SUBMITTED);
        session.transition(AWAITING_REVIEW);
        info!(user_id = user.id, reviewer, "Writeup submitted for review");
        Ok(())
    }
}

#[async_trait]
impl Action for SubmitDocument {
    async fn run(&self, event: &Event, session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        let Payload::Document {
            file_id, file_name, ..
        } = &event.payload
        else {
            return Ok(Transition::Commit);
        };

        // Documents posted in groups are not submissions.
        if !event.is_private() {
            return Ok(Transition::Commit);
        }

        if self.store.is_blocked(event.sender.id).await? {
            out.reply(texts::BLOCKED);
            return Ok(Transition::Commit);
        }
        if !is_pdf(file_name.as_deref()) {
            out.reply(texts::PDF_ONLY);
            return Ok(Transition::Commit);
        }

        if let Err(e) = self.submit(event, file_id, session, out).await {
            out.notice(texts::SUBMIT_FAILED);
            return Err(e);
        }
        Ok(Transition::Commit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accept,
    Reject,
    Block,
}

/// Parse `accept:<uid>`, `reject:<uid>` or `block:<uid>`.
fn parse_decision(data: &str) -> Option<(Verdict, u64)> {
    let (verdict, user_id) = data.split_once(':')?;
    let verdict = match verdict {
        "accept" => Verdict::Accept,
        "reject" => Verdict::Reject,
        "block" => Verdict::Block,
        _ => return None,
    };
    Some((verdict, user_id.parse().ok()?))
}

/// Rewrite the caption of the reviewer's copy, when we know which message
/// it is. The decision buttons go away unless `buttons` brings them back.
fn edit_caption(
    out: &mut Outbox,
    chat_id: ChatId,
    message_id: Option<i32>,
    caption: impl Into<String>,
    buttons: Vec<Button>,
) {
    if let Some(message_id) = message_id {
        out.send(OutboundMessage::EditCaption {
            chat_id,
            message_id,
            caption: caption.into(),
            buttons,
        });
    }
}

pub struct Decision {
    pub store: Store,
    pub invites: Arc<dyn InviteLinks>,
    pub group_id: ChatId,
}

#[async_trait]
impl Action for Decision {
    async fn run(&self, event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        let Payload::Callback {
            query_id,
            data,
            message_id,
        } = &event.payload
        else {
            return Ok(Transition::Commit);
        };
        out.send(OutboundMessage::AnswerCallback {
            query_id: query_id.clone(),
        });

        let Some((verdict, user_id)) = parse_decision(data) else {
            anyhow::bail!("malformed decision data: {:?}", data);
        };

        let Some(pending) = self.store.take_pending(user_id).await? else {
            edit_caption(out, event.chat_id, *message_id, texts::ALREADY_REVIEWED, vec![]);
            return Ok(Transition::Commit);
        };
        let who = match &pending.username {
            Some(name) => format!("@{}", name),
            None => user_id.to_string(),
        };

        match verdict {
            Verdict::Accept => match self.invites.create_invite(self.group_id).await {
                Ok(link) => {
                    edit_caption(
                        out,
                        event.chat_id,
                        *message_id,
                        format!("✅ Writeup de {} aceptado. Se le ha enviado la invitación al grupo.", who),
                        vec![],
                    );
                    out.send(OutboundMessage::text(
                        user_id as ChatId,
                        format!("{}\n\n{}", texts::ACCEPTED, link),
                    ));
                }
                Err(e) => {
                    warn!(user_id, group_id = self.group_id, "Invite failed: {:#}", e);
                    // back to pending so the buttons still work
                    self.store
                        .put_pending(
                            pending.user_id,
                            pending.username.as_deref(),
                            &pending.file_id,
                            pending.reviewer_id,
                        )
                        .await?;
                    edit_caption(
                        out,
                        event.chat_id,
                        *message_id,
                        format!("⚠️ Error al añadir al usuario: {:#}", e),
                        decision_buttons(user_id),
                    );
                    return Ok(Transition::Commit);
                }
            },
            Verdict::Reject => {
                edit_caption(
                    out,
                    event.chat_id,
                    *message_id,
                    format!("❌ Writeup de {} rechazado.", who),
                    vec![],
                );
                out.send(OutboundMessage::text(user_id as ChatId, texts::REJECTED));
            }
            Verdict::Block => {
                self.store.block(user_id).await?;
                edit_caption(
                    out,
                    event.chat_id,
                    *message_id,
                    format!(
                        "🚫 {} ha sido bloqueado.\n\nSi en un futuro quieres desbloquearlo, usa /unblock {}",
                        who, user_id
                    ),
                    vec![],
                );
                out.send(OutboundMessage::text(user_id as ChatId, texts::BLOCKED_NOTICE));
            }
        }

        info!(
            reviewer = event.sender.id,
            user_id,
            verdict = ?verdict,
            submission = %pending.id,
            "Writeup reviewed"
        );
        Ok(Transition::Commit)
    }
}

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::dispatcher::{Action, Outbox, Transition};
use crate::event::{Event, Payload};
use crate::session::Session;
use crate::storage::Store;

use super::{texts, STARTED};

pub struct Start;

#[async_trait]
impl Action for Start {
    async fn run(&self, _event: &Event, session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        session.transition(STARTED);
        out.reply_html(texts::WELCOME);
        Ok(Transition::Commit)
    }
}

pub struct Help;

#[async_trait]
impl Action for Help {
    async fn run(&self, _event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        out.reply(texts::HELP);
        Ok(Transition::Commit)
    }
}

/// Mainly for reviewers, who need their id for the config file.
pub struct UserInfo;

#[async_trait]
impl Action for UserInfo {
    async fn run(&self, event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        let sender = &event.sender;
        let name = sender.username.as_deref().unwrap_or(&sender.full_name);
        out.reply(format!(
            "Tu información:\n\nUsername: @{}\nUser ID: {}",
            name, sender.id
        ));
        Ok(Transition::Commit)
    }
}

pub struct Reset;

#[async_trait]
impl Action for Reset {
    async fn run(&self, _event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        out.reply(texts::RESET);
        Ok(Transition::Reset)
    }
}

pub struct Unblock {
    pub store: Store,
}

#[async_trait]
impl Action for Unblock {
    async fn run(&self, event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        if !self.store.is_reviewer(event.sender.id).await? {
            out.reply(texts::UNBLOCK_FORBIDDEN);
            return Ok(Transition::Commit);
        }

        let args = match &event.payload {
            Payload::Command { args, .. } => args.as_slice(),
            _ => &[],
        };
        let [target] = args else {
            out.reply(texts::UNBLOCK_USAGE);
            return Ok(Transition::Commit);
        };
        let Ok(target) = target.parse::<u64>() else {
            out.reply(texts::UNBLOCK_NOT_NUMERIC);
            return Ok(Transition::Commit);
        };

        if self.store.unblock(target).await? {
            info!(reviewer = event.sender.id, user_id = target, "User unblocked");
            out.reply(format!("✅ Usuario {} desbloqueado.", target));
        } else {
            out.reply(texts::NOT_BLOCKED);
        }
        Ok(Transition::Commit)
    }
}

/// Free text while a writeup is with a reviewer.
pub struct PendingStatus {
    pub store: Store,
}

#[async_trait]
impl Action for PendingStatus {
    async fn run(&self, event: &Event, session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        if self.store.get_pending(event.sender.id).await?.is_some() {
            out.reply(texts::STILL_PENDING);
        } else {
            // decided since; the applicant's own session never sees the verdict
            session.transition(STARTED);
            out.reply(texts::ALREADY_DECIDED);
        }
        Ok(Transition::Commit)
    }
}

/// Any other private text: point at the PDF flow.
pub struct Hint;

#[async_trait]
impl Action for Hint {
    async fn run(&self, _event: &Event, _session: &mut Session, out: &mut Outbox) -> Result<Transition> {
        out.reply(texts::HINT);
        Ok(Transition::Commit)
    }
}

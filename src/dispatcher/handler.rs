use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::event::{ChatId, Event, Payload};
use crate::outbound::OutboundMessage;
use crate::session::{Session, SessionState};

/// What happens to the session once an action succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Store the (possibly modified) draft.
    Commit,
    /// Throw the session away; the next event starts from `IDLE`.
    Reset,
}

/// Messages an action wants sent.
///
/// `reply`/`send` go out only if the action succeeds. `notice` is for
/// user-facing error notes and goes out either way.
#[derive(Debug)]
pub struct Outbox {
    chat_id: ChatId,
    messages: Vec<OutboundMessage>,
    notices: Vec<OutboundMessage>,
}

impl Outbox {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            messages: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn reply(&mut self, text: impl Into<String>) {
        self.messages.push(OutboundMessage::text(self.chat_id, text));
    }

    pub fn reply_html(&mut self, text: impl Into<String>) {
        self.messages.push(OutboundMessage::html(self.chat_id, text));
    }

    pub fn send(&mut self, message: OutboundMessage) {
        self.messages.push(message);
    }

    pub fn notice(&mut self, text: impl Into<String>) {
        self.notices.push(OutboundMessage::text(self.chat_id, text));
    }

    /// Everything, in order, for a successful dispatch.
    pub(crate) fn into_committed(self) -> Vec<OutboundMessage> {
        let mut all = self.notices;
        all.extend(self.messages);
        all
    }

    /// Only the notices, for a failed dispatch.
    pub(crate) fn into_notices(self) -> Vec<OutboundMessage> {
        self.notices
    }
}

/// The work part of a handler registration.
#[async_trait]
pub trait Action: Send + Sync {
    /// `session` is a private draft; it is committed only when this returns
    /// `Ok(Transition::Commit)`.
    async fn run(&self, event: &Event, session: &mut Session, out: &mut Outbox)
        -> Result<Transition>;
}

type Predicate = dyn Fn(&Event, &SessionState) -> bool + Send + Sync;

/// Predicate over an event and the chat's current state
#[derive(Clone)]
pub struct Matcher(Arc<Predicate>);

impl Matcher {
    pub fn new(f: impl Fn(&Event, &SessionState) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, event: &Event, state: &SessionState) -> bool {
        (self.0)(event, state)
    }

    pub fn and(self, other: Matcher) -> Matcher {
        Matcher::new(move |e, s| self.matches(e, s) && other.matches(e, s))
    }

    /// `/name`, regardless of arguments.
    pub fn command(name: &str) -> Self {
        let name = name.to_lowercase();
        Self::new(move |e, _| e.command_name() == Some(name.as_str()))
    }

    pub fn document() -> Self {
        Self::new(|e, _| matches!(e.payload, Payload::Document { .. }))
    }

    /// Callback whose data starts with any of `prefixes`.
    pub fn callback(prefixes: &[&str]) -> Self {
        let prefixes: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
        Self::new(move |e, _| {
            e.callback_data()
                .is_some_and(|data| prefixes.iter().any(|p| data.starts_with(p.as_str())))
        })
    }

    pub fn text() -> Self {
        Self::new(|e, _| matches!(e.payload, Payload::Text(_)))
    }

    pub fn in_state(tag: &str) -> Self {
        let tag = tag.to_string();
        Self::new(move |_, s| s.is(&tag))
    }

    pub fn private_chat() -> Self {
        Self::new(|e, _| e.is_private())
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Matcher(..)")
    }
}

pub struct Registration {
    pub name: String,
    pub matcher: Matcher,
    pub action: Arc<dyn Action>,
}

/// Ordered handler registrations. Built at startup, frozen afterwards.
#[derive(Default)]
pub struct Handlers {
    registrations: Vec<Registration>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, name: &str, matcher: Matcher, action: impl Action + 'static) -> Self {
        self.registrations.push(Registration {
            name: name.to_string(),
            matcher,
            action: Arc::new(action),
        });
        self
    }

    /// First registration whose matcher accepts the event.
    pub fn select(&self, event: &Event, state: &SessionState) -> Option<&Registration> {
        self.registrations
            .iter()
            .find(|r| r.matcher.matches(event, state))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registrations.iter().map(|r| r.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::testing::{command, event};

    struct Noop;

    #[async_trait]
    impl Action for Noop {
        async fn run(&self, _: &Event, _: &mut Session, _: &mut Outbox) -> Result<Transition> {
            Ok(Transition::Commit)
        }
    }

    #[test]
    fn test_command_matcher() {
        let m = Matcher::command("start");
        let idle = SessionState::idle();
        assert!(m.matches(&command(1, 1, "/start"), &idle));
        assert!(m.matches(&command(1, 1, "/start extra"), &idle));
        assert!(!m.matches(&command(1, 1, "/help"), &idle));
        assert!(!m.matches(&command(1, 1, "start"), &idle));
    }

    #[test]
    fn test_callback_prefix_matcher() {
        let m = Matcher::callback(&["accept:", "reject:"]);
        let cb = |data: &str| {
            event(
                1,
                1,
                Payload::Callback {
                    query_id: "q".into(),
                    data: data.into(),
                    message_id: Some(3),
                },
            )
        };
        let idle = SessionState::idle();
        assert!(m.matches(&cb("accept:12"), &idle));
        assert!(!m.matches(&cb("block:12"), &idle));
    }

    #[test]
    fn test_state_combinator() {
        let m = Matcher::text().and(Matcher::in_state("ASKING"));
        let ev = event(1, 1, Payload::Text("hi".into()));
        assert!(!m.matches(&ev, &SessionState::idle()));
        assert!(m.matches(&ev, &SessionState::new("ASKING")));
    }

    #[test]
    fn test_first_registration_wins() {
        let handlers = Handlers::new()
            .on("start", Matcher::command("start"), Noop)
            .on("any-command", Matcher::new(|e, _| e.command_name().is_some()), Noop);

        let idle = SessionState::idle();
        let chosen = handlers.select(&command(1, 1, "/start"), &idle).unwrap();
        assert_eq!(chosen.name, "start");
        let chosen = handlers.select(&command(1, 1, "/other"), &idle).unwrap();
        assert_eq!(chosen.name, "any-command");
        assert!(handlers
            .select(&event(1, 1, Payload::Text("x".into())), &idle)
            .is_none());
        assert_eq!(handlers.names().collect::<Vec<_>>(), vec!["start", "any-command"]);
    }

    #[test]
    fn test_outbox_lanes() {
        let mut out = Outbox::new(5);
        out.reply("done");
        out.notice("something went wrong");
        assert_eq!(
            out.into_notices(),
            vec![OutboundMessage::text(5, "something went wrong")]
        );

        let mut out = Outbox::new(5);
        out.notice("heads up");
        out.reply("done");
        assert_eq!(out.into_committed().len(), 2);
    }
}

//! Routes each event to exactly one handler, one chat at a time.

pub mod handler;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

pub use handler::{Action, Handlers, Matcher, Outbox, Transition};

use crate::event::{ChatId, Event, Seq};
use crate::outbound::{Outbound, OutboundMessage};
use crate::session::SessionStore;

/// Non-fatal conditions the dispatcher reports instead of raising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incident {
    UnhandledEvent {
        chat_id: ChatId,
        event_id: Seq,
    },
    HandlerFailed {
        chat_id: ChatId,
        event_id: Seq,
        handler: String,
        cause: String,
    },
    DeliveryFailed {
        chat_id: ChatId,
        event_id: Seq,
        cause: String,
    },
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incident::UnhandledEvent { chat_id, event_id } => {
                write!(f, "UnhandledEvent{{chat_id={}, event_id={}}}", chat_id, event_id)
            }
            Incident::HandlerFailed {
                chat_id,
                event_id,
                handler,
                cause,
            } => write!(
                f,
                "HandlerFailed{{chat_id={}, event_id={}, handler={}, cause={}}}",
                chat_id, event_id, handler, cause
            ),
            Incident::DeliveryFailed {
                chat_id,
                event_id,
                cause,
            } => write!(
                f,
                "DeliveryFailed{{chat_id={}, event_id={}, cause={}}}",
                chat_id, event_id, cause
            ),
        }
    }
}

/// Observability collaborator for [`Incident`]s.
pub trait IncidentSink: Send + Sync {
    fn report(&self, incident: Incident);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl IncidentSink for LogSink {
    fn report(&self, incident: Incident) {
        match &incident {
            Incident::UnhandledEvent { chat_id, event_id } => {
                warn!(chat_id, event_id, "Unhandled event")
            }
            Incident::HandlerFailed { chat_id, event_id, .. } => {
                error!(chat_id, event_id, "{}", incident)
            }
            Incident::DeliveryFailed { chat_id, event_id, .. } => {
                error!(chat_id, event_id, "{}", incident)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(String),
    Unhandled,
    Duplicate,
    Failed(String),
}

pub struct Dispatcher {
    handlers: Handlers,
    sessions: Arc<SessionStore>,
    outbound: Arc<dyn Outbound>,
    incidents: Arc<dyn IncidentSink>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Dispatcher {
    pub fn new(
        handlers: Handlers,
        sessions: Arc<SessionStore>,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        Self {
            handlers,
            sessions,
            outbound,
            incidents: Arc::new(LogSink),
        }
    }

    pub fn with_incident_sink(mut self, sink: Arc<dyn IncidentSink>) -> Self {
        self.incidents = sink;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    async fn deliver(&self, event: &Event, messages: Vec<OutboundMessage>) {
        for message in messages {
            if let Err(e) = self.outbound.send(&message).await {
                self.incidents.report(Incident::DeliveryFailed {
                    chat_id: message.chat_id().unwrap_or(event.chat_id),
                    event_id: event.seq,
                    cause: format!("{:#}", e),
                });
            }
        }
    }

    /// Run the one matching handler for `event`.
    ///
    /// The session is committed only after the action returns successfully;
    /// on failure or panic the prior session stays as it was and only the
    /// action's notices are delivered.
    pub async fn dispatch(&self, event: Event) -> DispatchOutcome {
        let chat_id = event.chat_id;
        let guard = self.sessions.begin(chat_id).await;

        if guard.is_duplicate(event.seq) {
            debug!(chat_id, seq = event.seq, "Duplicate event ignored");
            self.sessions.release(guard, None).await;
            return DispatchOutcome::Duplicate;
        }

        let session = self.sessions.get_or_create(chat_id).await;
        let Some(registration) = self.handlers.select(&event, &session.state) else {
            self.incidents.report(Incident::UnhandledEvent {
                chat_id,
                event_id: event.seq,
            });
            self.sessions.release(guard, Some(event.seq)).await;
            return DispatchOutcome::Unhandled;
        };

        debug!(
            chat_id,
            seq = event.seq,
            handler = %registration.name,
            state = %session.state,
            "Dispatching"
        );

        let mut draft = session.clone();
        let mut outbox = Outbox::new(chat_id);
        let result = AssertUnwindSafe(registration.action.run(&event, &mut draft, &mut outbox))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(transition)) => {
                match transition {
                    Transition::Commit => {
                        if draft.state != session.state {
                            info!(
                                chat_id,
                                from = %session.state,
                                to = %draft.state,
                                "Session transition"
                            );
                        }
                        self.sessions.commit(chat_id, draft).await;
                    }
                    Transition::Reset => {
                        // applied when the guard is released
                        self.sessions.evict(chat_id).await;
                    }
                }
                self.deliver(&event, outbox.into_committed()).await;
                DispatchOutcome::Handled(registration.name.clone())
            }
            Ok(Err(e)) => {
                let cause = format!("{:#}", e);
                self.fail(&event, &registration.name, cause, outbox).await
            }
            Err(panic) => {
                let cause = format!("handler panicked: {}", panic_message(panic.as_ref()));
                self.fail(&event, &registration.name, cause, outbox).await
            }
        };

        self.sessions.release(guard, Some(event.seq)).await;
        outcome
    }

    async fn fail(
        &self,
        event: &Event,
        handler: &str,
        cause: String,
        outbox: Outbox,
    ) -> DispatchOutcome {
        self.incidents.report(Incident::HandlerFailed {
            chat_id: event.chat_id,
            event_id: event.seq,
            handler: handler.to_string(),
            cause: cause.clone(),
        });
        self.deliver(event, outbox.into_notices()).await;
        DispatchOutcome::Failed(cause)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::CollectingSink;
    use super::*;
    use crate::event::testing::{command, event};
    use crate::event::Payload;
    use crate::outbound::testing::RecordingOutbound;
    use crate::session::testing::ManualClock;
    use crate::session::{Session, SessionState};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Start;

    #[async_trait]
    impl Action for Start {
        async fn run(&self, _: &Event, session: &mut Session, out: &mut Outbox) -> Result<Transition> {
            session.transition("STARTED");
            out.reply("welcome");
            Ok(Transition::Commit)
        }
    }

    /// Appends each event's seq to the `seen` attribute.
    struct Record;

    #[async_trait]
    impl Action for Record {
        async fn run(&self, event: &Event, session: &mut Session, _: &mut Outbox) -> Result<Transition> {
            let mut seen = session
                .attribute("seen")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            seen.push(Value::from(event.seq));
            session.set_attribute("seen", Value::Array(seen));
            Ok(Transition::Commit)
        }
    }

    struct Explode {
        panic: bool,
    }

    #[async_trait]
    impl Action for Explode {
        async fn run(&self, _: &Event, session: &mut Session, out: &mut Outbox) -> Result<Transition> {
            session.transition("BROKEN");
            session.set_attribute("junk", 1);
            out.notice("Sorry, that failed.");
            out.reply("this must never be sent");
            if self.panic {
                panic!("boom");
            }
            anyhow::bail!("database unavailable")
        }
    }

    struct Reset;

    #[async_trait]
    impl Action for Reset {
        async fn run(&self, _: &Event, _: &mut Session, out: &mut Outbox) -> Result<Transition> {
            out.reply("cleared");
            Ok(Transition::Reset)
        }
    }

    /// Counts concurrent runs per instance and sleeps a little.
    struct Slow {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Action for Slow {
        async fn run(&self, _: &Event, _: &mut Session, _: &mut Outbox) -> Result<Transition> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Transition::Commit)
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        outbound: Arc<RecordingOutbound>,
        sink: Arc<CollectingSink>,
    }

    fn fixture_with(handlers: Handlers, sessions: SessionStore, outbound: RecordingOutbound) -> Fixture {
        let outbound = Arc::new(outbound);
        let sink = Arc::new(CollectingSink::default());
        let dispatcher = Dispatcher::new(handlers, Arc::new(sessions), outbound.clone())
            .with_incident_sink(sink.clone());
        Fixture {
            dispatcher: Arc::new(dispatcher),
            outbound,
            sink,
        }
    }

    fn fixture(handlers: Handlers) -> Fixture {
        fixture_with(
            handlers,
            SessionStore::new(Duration::from_secs(600)),
            RecordingOutbound::default(),
        )
    }

    fn standard_handlers() -> Handlers {
        Handlers::new()
            .on("start", Matcher::command("start"), Start)
            .on("reset", Matcher::command("reset"), Reset)
            .on("fail", Matcher::command("fail"), Explode { panic: false })
            .on("panic", Matcher::command("panic"), Explode { panic: true })
            .on("record", Matcher::text(), Record)
    }

    #[tokio::test]
    async fn test_start_then_redelivery() {
        let f = fixture(standard_handlers());

        let outcome = f.dispatcher.dispatch(command(1, 42, "/start")).await;
        assert_eq!(outcome, DispatchOutcome::Handled("start".into()));
        assert!(f.dispatcher.sessions().get_or_create(42).await.state.is("STARTED"));
        assert_eq!(f.outbound.texts_for(42).await, vec!["welcome"]);

        let outcome = f.dispatcher.dispatch(command(1, 42, "/start")).await;
        assert_eq!(outcome, DispatchOutcome::Duplicate);
        assert_eq!(f.outbound.sent().await.len(), 1);
        assert!(f.dispatcher.sessions().get_or_create(42).await.state.is("STARTED"));
    }

    #[tokio::test]
    async fn test_failed_handler_rolls_back_and_sends_only_notices() {
        let f = fixture(standard_handlers());
        f.dispatcher.dispatch(command(1, 8, "/start")).await;
        let before = f.dispatcher.sessions().get_or_create(8).await;

        let outcome = f.dispatcher.dispatch(command(2, 8, "/fail")).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(ref c) if c.contains("database unavailable")));

        let after = f.dispatcher.sessions().get_or_create(8).await;
        assert_eq!(after.state, before.state);
        assert_eq!(after.attributes, before.attributes);

        assert_eq!(
            f.outbound.texts_for(8).await,
            vec!["welcome", "Sorry, that failed."]
        );
        assert_eq!(
            f.sink.take(),
            vec![Incident::HandlerFailed {
                chat_id: 8,
                event_id: 2,
                handler: "fail".into(),
                cause: "database unavailable".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let f = fixture(standard_handlers());
        let outcome = f.dispatcher.dispatch(command(1, 9, "/panic")).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(ref c) if c.contains("boom")));
        assert!(f
            .dispatcher
            .sessions()
            .get_or_create(9)
            .await
            .state
            .is(SessionState::IDLE));

        // the chat is not wedged
        let outcome = f.dispatcher.dispatch(command(2, 9, "/start")).await;
        assert_eq!(outcome, DispatchOutcome::Handled("start".into()));
    }

    #[tokio::test]
    async fn test_failed_event_is_consumed() {
        let f = fixture(standard_handlers());
        f.dispatcher.dispatch(command(3, 9, "/fail")).await;
        assert_eq!(
            f.dispatcher.dispatch(command(3, 9, "/fail")).await,
            DispatchOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_unhandled_event_is_reported_not_fatal() {
        let f = fixture(standard_handlers());
        let outcome = f.dispatcher.dispatch(command(4, 3, "/nope")).await;
        assert_eq!(outcome, DispatchOutcome::Unhandled);
        assert!(f.outbound.sent().await.is_empty());
        assert_eq!(
            f.sink.take(),
            vec![Incident::UnhandledEvent {
                chat_id: 3,
                event_id: 4
            }]
        );
    }

    #[tokio::test]
    async fn test_read_your_writes_across_events() {
        let f = fixture(standard_handlers());
        for seq in 1..=4 {
            f.dispatcher
                .dispatch(event(seq, 6, Payload::Text("hi".into())))
                .await;
        }
        let session = f.dispatcher.sessions().get_or_create(6).await;
        assert_eq!(
            session.attribute("seen"),
            Some(&serde_json::json!([1, 2, 3, 4]))
        );
    }

    #[tokio::test]
    async fn test_reset_evicts_after_dispatch() {
        let f = fixture(standard_handlers());
        f.dispatcher.dispatch(command(1, 4, "/start")).await;
        f.dispatcher.dispatch(command(2, 4, "/reset")).await;

        let session = f.dispatcher.sessions().get_or_create(4).await;
        assert!(session.state.is(SessionState::IDLE));
        assert_eq!(f.outbound.texts_for(4).await, vec!["welcome", "cleared"]);
    }

    #[tokio::test]
    async fn test_idle_chat_resumes_from_fresh_session() {
        let clock = ManualClock::new();
        let f = fixture_with(
            standard_handlers(),
            SessionStore::with_clock(Duration::from_secs(600), clock.clone()),
            RecordingOutbound::default(),
        );

        f.dispatcher.dispatch(command(1, 7, "/start")).await;
        clock.advance(Duration::from_secs(11 * 60));
        f.dispatcher
            .dispatch(event(2, 7, Payload::Text("back".into())))
            .await;

        let session = f.dispatcher.sessions().get_or_create(7).await;
        assert!(session.state.is(SessionState::IDLE));
        assert_eq!(session.attribute("seen"), Some(&serde_json::json!([2])));
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported() {
        let f = fixture_with(
            standard_handlers(),
            SessionStore::new(Duration::from_secs(600)),
            RecordingOutbound {
                failing: vec![13],
                ..Default::default()
            },
        );

        let outcome = f.dispatcher.dispatch(command(1, 13, "/start")).await;
        assert_eq!(outcome, DispatchOutcome::Handled("start".into()));
        assert!(f.dispatcher.sessions().get_or_create(13).await.state.is("STARTED"));
        assert!(matches!(
            f.sink.take().as_slice(),
            [Incident::DeliveryFailed { chat_id: 13, event_id: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn test_same_chat_never_runs_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let f = fixture(Handlers::new().on(
            "slow",
            Matcher::text(),
            Slow {
                running: running.clone(),
                peak: peak.clone(),
            },
        ));

        let tasks: Vec<_> = (1..=5)
            .map(|seq| {
                let dispatcher = Arc::clone(&f.dispatcher);
                tokio::spawn(async move {
                    dispatcher
                        .dispatch(event(seq, 21, Payload::Text("x".into())))
                        .await
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_chats_run_in_parallel() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let f = fixture(Handlers::new().on(
            "slow",
            Matcher::text(),
            Slow {
                running: running.clone(),
                peak: peak.clone(),
            },
        ));

        let a = f.dispatcher.dispatch(event(1, 1, Payload::Text("x".into())));
        let b = f.dispatcher.dispatch(event(1, 2, Payload::Text("y".into())));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a, DispatchOutcome::Handled("slow".into()));
        assert_eq!(b, DispatchOutcome::Handled("slow".into()));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(f.dispatcher.sessions().len().await, 2);
    }
}

//! Per-conversation state keyed by chat id.
//!
//! The store hands out owned snapshots; the only way to change a session is
//! `get_or_create` → modify the copy → `commit`. Dispatch of a chat is
//! serialized through [`SessionStore::begin`], which also defers evictions
//! that arrive while a handler is running.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::event::{ChatId, Seq};

/// Source of "now". Swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Application-defined state tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionState(String);

impl SessionState {
    pub const IDLE: &'static str = "IDLE";

    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn idle() -> Self {
        Self::new(Self::IDLE)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.0 == tag
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub chat_id: ChatId,
    pub state: SessionState,
    pub attributes: HashMap<String, Value>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(chat_id: ChatId, now: DateTime<Utc>) -> Self {
        Self {
            chat_id,
            state: SessionState::idle(),
            attributes: HashMap::new(),
            last_active: now,
        }
    }

    pub fn transition(&mut self, tag: &str) {
        self.state = SessionState::new(tag);
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(key.into(), value.into());
    }
}

struct Entry {
    session: Option<Session>,
    /// Last sequence number consumed for this chat (dispatched, failed or unhandled).
    last_seq: Option<Seq>,
    /// Dispatches that hold or wait for `gate`.
    holders: usize,
    evict_pending: bool,
    gate: Arc<Mutex<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            session: None,
            last_seq: None,
            holders: 0,
            evict_pending: false,
            gate: Arc::new(Mutex::new(())),
        }
    }
}

/// Exclusive right to dispatch for one chat. Hand it back via
/// [`SessionStore::release`].
pub struct ChatGuard {
    chat_id: ChatId,
    last_seq: Option<Seq>,
    _permit: OwnedMutexGuard<()>,
}

impl ChatGuard {
    /// True when `seq` was already consumed for this chat.
    pub fn is_duplicate(&self, seq: Seq) -> bool {
        self.last_seq.is_some_and(|last| seq <= last)
    }
}

pub struct SessionStore {
    entries: Mutex<HashMap<ChatId, Entry>>,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self::with_clock(idle_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(idle_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_timeout,
            clock,
        }
    }

    fn is_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        match (now - session.last_active).to_std() {
            Ok(idle) => idle > self.idle_timeout,
            // last_active in the future (clock skew): not idle
            Err(_) => false,
        }
    }

    /// Wait for exclusive dispatch access to `chat_id`.
    pub async fn begin(&self, chat_id: ChatId) -> ChatGuard {
        let gate = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(chat_id).or_insert_with(Entry::new);
            entry.holders += 1;
            Arc::clone(&entry.gate)
        };

        let permit = gate.lock_owned().await;

        // Entries with holders > 0 are never removed, so it is still there.
        let last_seq = self
            .entries
            .lock()
            .await
            .get(&chat_id)
            .and_then(|e| e.last_seq);

        ChatGuard {
            chat_id,
            last_seq,
            _permit: permit,
        }
    }

    /// Finish a dispatch: record the consumed sequence number and apply an
    /// eviction that was requested while the chat was busy.
    pub async fn release(&self, guard: ChatGuard, consumed: Option<Seq>) {
        let mut entries = self.entries.lock().await;
        let chat_id = guard.chat_id;
        let Some(entry) = entries.get_mut(&chat_id) else {
            return;
        };

        if let Some(seq) = consumed {
            entry.last_seq = Some(entry.last_seq.map_or(seq, |last| last.max(seq)));
        }
        entry.holders = entry.holders.saturating_sub(1);

        if entry.evict_pending {
            entry.evict_pending = false;
            entry.session = None;
            info!(chat_id, "Deferred eviction applied");
        }
        drop(guard);
    }

    /// Snapshot of the chat's session, creating a fresh `IDLE` one when
    /// there is none or the existing one has been idle too long.
    pub async fn get_or_create(&self, chat_id: ChatId) -> Session {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(chat_id).or_insert_with(Entry::new);

        if let Some(session) = &entry.session {
            if !self.is_expired(session, now) {
                return session.clone();
            }
            info!(chat_id, state = %session.state, "Session expired, starting fresh");
        } else {
            debug!(chat_id, "Creating session");
        }

        let session = Session::new(chat_id, now);
        entry.session = Some(session.clone());
        session
    }

    /// Replace the chat's session with `session`, stamping activity time.
    pub async fn commit(&self, chat_id: ChatId, mut session: Session) {
        session.chat_id = chat_id;
        session.last_active = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(chat_id).or_insert_with(Entry::new);
        entry.session = Some(session);
    }

    /// Drop the chat's session. Deferred while a dispatch holds the chat.
    pub async fn evict(&self, chat_id: ChatId) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&chat_id) else {
            return;
        };
        if entry.holders > 0 {
            debug!(chat_id, "Chat busy, deferring eviction");
            entry.evict_pending = true;
            return;
        }
        entry.session = None;
        info!(chat_id, "Session evicted");
    }

    /// Evict every idle session whose chat is not being dispatched.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.holders > 0 {
                return true;
            }
            match &entry.session {
                Some(session) => !self.is_expired(session, now),
                None => false,
            }
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            info!(evicted, remaining = entries.len(), "Session sweep finished");
        }
        evicted
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.session.is_some())
            .count()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualClock;
    use super::*;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn test_first_access_creates_idle_session() {
        let store = SessionStore::new(TEN_MINUTES);
        let session = store.get_or_create(42).await;
        assert_eq!(session.chat_id, 42);
        assert!(session.state.is(SessionState::IDLE));
        assert!(session.attributes.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_snapshot_mutation_is_invisible_until_commit() {
        let store = SessionStore::new(TEN_MINUTES);
        let mut draft = store.get_or_create(1).await;
        draft.transition("STARTED");
        draft.set_attribute("lang", "es");

        assert!(store.get_or_create(1).await.state.is(SessionState::IDLE));

        store.commit(1, draft).await;
        let stored = store.get_or_create(1).await;
        assert!(stored.state.is("STARTED"));
        assert_eq!(stored.attribute("lang"), Some(&Value::from("es")));
    }

    #[tokio::test]
    async fn test_idle_session_expires_lazily() {
        let clock = ManualClock::new();
        let store = SessionStore::with_clock(TEN_MINUTES, clock.clone());

        let mut draft = store.get_or_create(7).await;
        draft.transition("STARTED");
        store.commit(7, draft).await;

        clock.advance(Duration::from_secs(11 * 60));
        let fresh = store.get_or_create(7).await;
        assert!(fresh.state.is(SessionState::IDLE));
    }

    #[tokio::test]
    async fn test_recent_session_survives() {
        let clock = ManualClock::new();
        let store = SessionStore::with_clock(TEN_MINUTES, clock.clone());

        let mut draft = store.get_or_create(7).await;
        draft.transition("STARTED");
        store.commit(7, draft).await;

        clock.advance(Duration::from_secs(9 * 60));
        assert!(store.get_or_create(7).await.state.is("STARTED"));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_idle_sessions() {
        let clock = ManualClock::new();
        let store = SessionStore::with_clock(TEN_MINUTES, clock.clone());

        store.get_or_create(1).await;
        clock.advance(Duration::from_secs(8 * 60));
        store.get_or_create(2).await;
        clock.advance(Duration::from_secs(3 * 60));

        assert_eq!(store.sweep().await, 1);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_chat_in_dispatch() {
        let clock = ManualClock::new();
        let store = SessionStore::with_clock(TEN_MINUTES, clock.clone());

        store.get_or_create(3).await;
        let guard = store.begin(3).await;
        clock.advance(Duration::from_secs(20 * 60));

        assert_eq!(store.sweep().await, 0);
        store.release(guard, Some(1)).await;
        assert_eq!(store.sweep().await, 1);
    }

    #[tokio::test]
    async fn test_evict_during_dispatch_is_deferred() {
        let store = SessionStore::new(TEN_MINUTES);
        let guard = store.begin(5).await;
        let mut draft = store.get_or_create(5).await;
        draft.transition("STARTED");
        store.commit(5, draft).await;

        store.evict(5).await;
        assert!(store.get_or_create(5).await.state.is("STARTED"));

        store.release(guard, Some(10)).await;
        assert!(store.get_or_create(5).await.state.is(SessionState::IDLE));
    }

    #[tokio::test]
    async fn test_guard_reports_duplicates() {
        let store = SessionStore::new(TEN_MINUTES);
        let guard = store.begin(9).await;
        assert!(!guard.is_duplicate(1));
        store.release(guard, Some(4)).await;

        let guard = store.begin(9).await;
        assert!(guard.is_duplicate(4));
        assert!(guard.is_duplicate(2));
        assert!(!guard.is_duplicate(5));
        store.release(guard, None).await;
    }

    #[tokio::test]
    async fn test_begin_serializes_same_chat() {
        let store = Arc::new(SessionStore::new(TEN_MINUTES));
        let guard = store.begin(11).await;

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let guard = store.begin(11).await;
                store.release(guard, None).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        store.release(guard, None).await;
        contender.await.unwrap();
    }
}

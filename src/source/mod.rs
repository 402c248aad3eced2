//! Update ingestion.
//!
//! [`UpdateSource`] turns a [`Transport`] into an ordered, deduplicated
//! sequence of [`Event`]s. The cursor handed to the transport is the ack
//! watermark from [`AckTracker`], so nothing is acknowledged before it has
//! been dispatched.

pub mod polling;
pub mod webhook;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{EngineError, TransportError};
use crate::event::{Event, Seq};

/// One response from a transport.
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<Event>,
    /// Highest sequence number in the response, including updates that
    /// could not be normalized into events.
    pub high_water: Option<Seq>,
}

/// Underlying delivery mechanism.
#[async_trait]
pub trait Transport: Send {
    fn name(&self) -> &'static str;

    /// Fetch the next batch. Updates below `cursor` are acknowledged.
    async fn fetch(&mut self, cursor: Option<Seq>) -> Result<Batch, TransportError>;

    /// Acknowledge everything below `cursor` without fetching more.
    async fn acknowledge(&mut self, cursor: Seq) -> Result<(), TransportError>;

    /// True when the sender considers an update delivered as soon as we
    /// accept it, so it will never be redelivered.
    fn acknowledges_on_receipt(&self) -> bool {
        false
    }

    /// Stop accepting new updates.
    async fn close(&mut self) {}

    /// Updates already accepted but not fetched yet. Does not wait.
    fn drain(&mut self) -> Batch {
        Batch::default()
    }
}

/// Sliding window of sequence numbers already handed out.
#[derive(Debug, Default)]
pub struct Deduplicator {
    floor: Option<Seq>,
    seen: BTreeSet<Seq>,
}

impl Deduplicator {
    /// Returns true the first time `seq` is offered at or above the floor.
    pub fn admit(&mut self, seq: Seq) -> bool {
        if self.floor.is_some_and(|floor| seq < floor) {
            return false;
        }
        self.seen.insert(seq)
    }

    /// Forget everything below `floor`; it can no longer be redelivered.
    pub fn advance(&mut self, floor: Seq) {
        if self.floor.is_some_and(|current| current >= floor) {
            return;
        }
        self.floor = Some(floor);
        self.seen = self.seen.split_off(&floor);
    }

    pub fn seen_from(&self, from: Seq) -> impl Iterator<Item = Seq> + '_ {
        self.seen.range(from..).copied()
    }
}

#[derive(Debug, Default)]
struct AckState {
    outstanding: BTreeSet<Seq>,
    highest: Option<Seq>,
}

/// Tracks which handed-out events are still waiting for dispatch.
///
/// Shared between the source (which registers events) and the workers
/// (which complete them).
pub struct AckTracker {
    state: Mutex<AckState>,
    changed: watch::Sender<u64>,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTracker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(AckState::default()),
            changed,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    async fn observe(&self, high_water: Seq) {
        let mut state = self.state.lock().await;
        state.highest = Some(state.highest.map_or(high_water, |h| h.max(high_water)));
    }

    async fn register(&self, seq: Seq) {
        let mut state = self.state.lock().await;
        state.outstanding.insert(seq);
        state.highest = Some(state.highest.map_or(seq, |h| h.max(seq)));
    }

    /// Mark `seq` as dispatched.
    pub async fn complete(&self, seq: Seq) {
        let removed = self.state.lock().await.outstanding.remove(&seq);
        if removed {
            self.changed.send_modify(|v| *v = v.wrapping_add(1));
        }
    }

    /// Lowest sequence number that must not be acknowledged yet.
    pub async fn watermark(&self) -> Option<Seq> {
        let state = self.state.lock().await;
        match state.outstanding.first() {
            Some(first) => Some(*first),
            None => state.highest.map(|h| h + 1),
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.state.lock().await.outstanding.len()
    }
}

/// Exponential backoff with a consecutive-failure budget.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    budget: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, budget: u32) -> Self {
        Self {
            initial,
            max,
            budget,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.max_consecutive_failures,
        )
    }

    /// Delay before retry number `failures` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        if failures > self.budget {
            return None;
        }
        let exp = failures.saturating_sub(1).min(16);
        Some(self.initial.saturating_mul(1 << exp).min(self.max))
    }
}

/// What survives a restart of the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub watermark: Option<Seq>,
    /// Dispatched sequence numbers at or above the watermark.
    pub completed: Vec<Seq>,
    /// Accepted but never dispatched events the transport will not
    /// redeliver. Replayed first on the next start.
    pub stranded: Vec<Event>,
}

pub struct UpdateSource<T: Transport> {
    transport: T,
    dedup: Deduplicator,
    tracker: Arc<AckTracker>,
    changes: watch::Receiver<u64>,
    backoff: Backoff,
    buffer: VecDeque<Event>,
    resume_from: Option<Seq>,
    /// Copies of handed-out events, kept only when the transport
    /// acknowledges on receipt.
    held: Option<BTreeMap<Seq, Event>>,
    replay: Vec<Event>,
}

impl<T: Transport> UpdateSource<T> {
    pub fn new(transport: T, tracker: Arc<AckTracker>, backoff: Backoff) -> Self {
        let changes = tracker.subscribe();
        let held = transport.acknowledges_on_receipt().then(BTreeMap::new);
        Self {
            transport,
            dedup: Deduplicator::default(),
            tracker,
            changes,
            backoff,
            buffer: VecDeque::new(),
            resume_from: None,
            held,
            replay: Vec::new(),
        }
    }

    /// Resume from a checkpoint taken by a previous run.
    pub fn with_checkpoint(mut self, checkpoint: &Checkpoint) -> Self {
        if let Some(watermark) = checkpoint.watermark {
            self.dedup.advance(watermark);
            self.resume_from = Some(watermark);
        }
        for seq in &checkpoint.completed {
            self.dedup.admit(*seq);
        }
        self.replay = checkpoint.stranded.clone();
        if !checkpoint.completed.is_empty() || !checkpoint.stranded.is_empty() {
            info!(
                watermark = ?checkpoint.watermark,
                completed = checkpoint.completed.len(),
                stranded = checkpoint.stranded.len(),
                "Restored update checkpoint"
            );
        }
        self
    }

    pub fn tracker(&self) -> Arc<AckTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn acknowledges_on_receipt(&self) -> bool {
        self.held.is_some()
    }

    /// Register fresh events from `batch` and queue them for handing out.
    /// Returns how many were fresh.
    async fn admit(&mut self, batch: Batch) -> usize {
        if let Some(high) = batch.high_water {
            self.tracker.observe(high).await;
        }
        if let Some(held) = self.held.as_mut() {
            let state = self.tracker.state.lock().await;
            held.retain(|seq, _| state.outstanding.contains(seq));
        }

        let mut fresh = 0usize;
        for event in batch.events {
            if self.dedup.admit(event.seq) {
                self.tracker.register(event.seq).await;
                if let Some(held) = self.held.as_mut() {
                    held.insert(event.seq, event.clone());
                }
                self.buffer.push_back(event);
                fresh += 1;
            } else {
                debug!(seq = event.seq, chat_id = event.chat_id, "Dropping redelivered update");
            }
        }

        if let Some(watermark) = self.tracker.watermark().await {
            self.dedup.advance(watermark);
        }
        fresh
    }

    async fn admit_replay(&mut self) {
        if self.replay.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.replay);
        info!(count = events.len(), "Replaying updates stranded by the last shutdown");
        let high_water = events.iter().map(|e| e.seq).max();
        self.admit(Batch { events, high_water }).await;
    }

    async fn cursor(&self) -> Option<Seq> {
        match self.tracker.watermark().await {
            Some(w) => Some(w),
            None => self.resume_from,
        }
    }

    async fn fetch_with_retry(&mut self) -> Result<Batch, EngineError> {
        let mut failures = 0u32;
        loop {
            let cursor = self.cursor().await;
            match self.transport.fetch(cursor).await {
                Ok(batch) => {
                    if failures > 0 {
                        info!(transport = self.transport.name(), "Transport recovered");
                    }
                    return Ok(batch);
                }
                Err(err) if err.is_retriable() => {
                    failures += 1;
                    let Some(delay) = self.backoff.delay(failures) else {
                        return Err(EngineError::TransportUnavailable {
                            attempts: failures,
                            last: err,
                        });
                    };
                    let delay = err.retry_after().unwrap_or(delay);
                    warn!(
                        transport = self.transport.name(),
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "Transport error: {}",
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(EngineError::TransportUnavailable {
                        attempts: failures + 1,
                        last: err,
                    });
                }
            }
        }
    }

    /// Next fresh event. Waits on the transport as long as needed; fails only
    /// with [`EngineError::TransportUnavailable`].
    pub async fn next(&mut self) -> Result<Event, EngineError> {
        self.admit_replay().await;
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(event);
            }

            // Mark current progress as seen before fetching, so a completion
            // racing with the fetch still wakes us up below.
            self.changes.borrow_and_update();

            let batch = self.fetch_with_retry().await?;
            let fresh = self.admit(batch).await;

            if fresh == 0 && self.tracker.outstanding().await > 0 {
                // Only redeliveries of in-flight events; polling again right
                // away would return the same batch.
                if self.changes.changed().await.is_err() {
                    return Err(EngineError::TransportUnavailable {
                        attempts: 0,
                        last: TransportError::Closed,
                    });
                }
            }
        }
    }

    /// Stop the transport from accepting more updates.
    pub async fn close(&mut self) {
        self.transport.close().await;
    }

    /// Hand out everything already accepted without waiting for more.
    pub async fn drain(&mut self) -> Vec<Event> {
        self.admit_replay().await;
        let batch = self.transport.drain();
        self.admit(batch).await;
        self.buffer.drain(..).collect()
    }

    /// Stop pulling: acknowledge what was dispatched and return the
    /// checkpoint for the next run.
    pub async fn shutdown(mut self) -> Checkpoint {
        let watermark = self.tracker.watermark().await.or(self.resume_from);
        if let Some(cursor) = watermark {
            if let Err(e) = self.transport.acknowledge(cursor).await {
                warn!("Final acknowledge failed: {}", e);
            }
        }

        let outstanding = self.tracker.state.lock().await.outstanding.clone();
        let completed = match watermark {
            Some(w) => self
                .dedup
                .seen_from(w)
                .filter(|s| !outstanding.contains(s))
                .collect(),
            None => Vec::new(),
        };

        let mut stranded: Vec<Event> = self
            .held
            .take()
            .unwrap_or_default()
            .into_values()
            .filter(|e| outstanding.contains(&e.seq))
            .collect();
        stranded.append(&mut self.replay);

        info!(
            transport = self.transport.name(),
            watermark = ?watermark,
            unacknowledged = outstanding.len(),
            stranded = stranded.len(),
            "Update source stopped"
        );
        Checkpoint {
            watermark,
            completed,
            stranded,
        }
    }
}

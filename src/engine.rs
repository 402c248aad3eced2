//! Worker pool between the update source and the dispatcher.
//!
//! Events are sharded by chat id, so one chat always lands on the same
//! worker and keeps its order. Each worker owns a bounded queue; a full
//! queue stalls the source instead of buffering without limit.
//!
//! On shutdown, pulled events still queued are dropped and left
//! unacknowledged. Pushed events were confirmed on receipt, so intake is
//! closed and what was accepted is dispatched within the grace period;
//! the rest goes into the checkpoint.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::EngineError;
use crate::event::{ChatId, Event};
use crate::source::{AckTracker, Checkpoint, Transport, UpdateSource};

/// How a run ended.
#[derive(Debug)]
pub struct Stopped {
    pub checkpoint: Checkpoint,
    /// Set when the run ended because of a fatal condition rather than a
    /// shutdown request.
    pub error: Option<EngineError>,
}

pub struct Engine {
    dispatcher: Arc<Dispatcher>,
    workers: usize,
    queue_capacity: usize,
    grace: Duration,
}

fn shard(chat_id: ChatId, workers: usize) -> usize {
    chat_id.rem_euclid(workers as i64) as usize
}

async fn worker(
    index: usize,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<AckTracker>,
    mut queue: mpsc::Receiver<Event>,
    stop: watch::Receiver<bool>,
) {
    while let Some(event) = queue.recv().await {
        if *stop.borrow() {
            // Left outstanding, so it is not acknowledged and comes back.
            debug!(worker = index, seq = event.seq, "Dropping queued event at shutdown");
            continue;
        }

        let seq = event.seq;
        let chat_id = event.chat_id;
        match dispatcher.dispatch(event).await {
            DispatchOutcome::Handled(handler) => {
                debug!(worker = index, chat_id, seq, handler = %handler, "Event handled")
            }
            DispatchOutcome::Failed(_) => debug!(worker = index, chat_id, seq, "Event failed"),
            DispatchOutcome::Unhandled | DispatchOutcome::Duplicate => {}
        }
        tracker.complete(seq).await;
    }
    debug!(worker = index, "Worker stopped");
}

impl Engine {
    pub fn new(dispatcher: Arc<Dispatcher>, config: &DispatcherConfig) -> Self {
        Self {
            dispatcher,
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            grace: config.shutdown_grace(),
        }
    }

    /// Pull events from `source` until `shutdown` resolves or the transport
    /// becomes unavailable, then drain the workers and stop the source.
    pub async fn run<T, F>(&self, mut source: UpdateSource<T>, shutdown: F) -> Stopped
    where
        T: Transport,
        F: Future<Output = ()>,
    {
        let tracker = source.tracker();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut queues = Vec::with_capacity(self.workers);
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel(self.queue_capacity);
            queues.push(tx);
            handles.push(tokio::spawn(worker(
                index,
                Arc::clone(&self.dispatcher),
                Arc::clone(&tracker),
                rx,
                stop_rx.clone(),
            )));
        }
        info!(workers = self.workers, "Engine started");

        let mut shutdown = std::pin::pin!(shutdown);
        let mut carried: Option<Event> = None;
        let error = loop {
            let next = tokio::select! {
                _ = &mut shutdown => break None,
                next = source.next() => next,
            };
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    error!("{}", e);
                    break Some(e);
                }
            };

            let index = shard(event.chat_id, self.workers);
            tokio::select! {
                _ = &mut shutdown => {
                    carried = Some(event);
                    break None;
                }
                permit = queues[index].reserve() => match permit {
                    Ok(permit) => permit.send(event),
                    Err(_) => break Some(EngineError::WorkerStopped(index)),
                }
            }
        };

        let deadline = tokio::time::Instant::now() + self.grace;
        if source.acknowledges_on_receipt() {
            info!("Engine stopping, dispatching accepted updates for up to {:?}", self.grace);
            if tokio::time::timeout_at(deadline, source.close()).await.is_err() {
                warn!("Transport did not close within the grace period");
            }
            let mut pending: Vec<Event> = carried.take().into_iter().collect();
            pending.extend(source.drain().await);
            let (queues, workers) = (&queues, self.workers);
            let hand_off = async move {
                for event in pending {
                    let index = shard(event.chat_id, workers);
                    if queues[index].send(event).await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout_at(deadline, hand_off).await.is_err() {
                warn!("Grace period elapsed before every accepted update was queued");
            }
        } else {
            info!("Engine stopping, waiting up to {:?} for in-flight dispatches", self.grace);
            stop_tx.send_replace(true);
        }
        drop(queues);

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout_at(deadline, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Grace period elapsed, aborting remaining dispatches");
            for abort in aborts {
                abort.abort();
            }
        }

        let checkpoint = source.shutdown().await;
        Stopped { checkpoint, error }
    }
}

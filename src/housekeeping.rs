//! Periodic jobs that run beside the engine: idle-session sweep and an
//! hourly heartbeat with ack progress.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

use crate::session::SessionStore;
use crate::source::AckTracker;

const HEARTBEAT_CRON: &str = "0 0 * * * *";

pub struct Housekeeping {
    jobs: JobScheduler,
}

fn sweep_job(cron: &str, sessions: Arc<SessionStore>) -> Result<Job> {
    Job::new_async(cron, move |_uuid, _lock| {
        let sessions = Arc::clone(&sessions);
        Box::pin(async move {
            // chats mid-dispatch are skipped by the store
            let evicted = sessions.sweep().await;
            debug!(evicted, "Session sweep ran");
        })
    })
    .with_context(|| format!("Invalid cron expression for session sweep: {}", cron))
}

fn heartbeat_job(sessions: Arc<SessionStore>, tracker: Arc<AckTracker>) -> Result<Job> {
    Job::new_async(HEARTBEAT_CRON, move |_uuid, _lock| {
        let sessions = Arc::clone(&sessions);
        let tracker = Arc::clone(&tracker);
        Box::pin(async move {
            let sessions = sessions.len().await;
            let in_flight = tracker.outstanding().await;
            let watermark = tracker.watermark().await;
            info!(
                sessions,
                in_flight,
                watermark = ?watermark,
                "Heartbeat: bot is alive"
            );
        })
    })
    .context("Invalid heartbeat cron expression")
}

impl Housekeeping {
    /// Schedule the sweep on `sweep_cron` (six fields, seconds first) plus
    /// the heartbeat, and start running them.
    pub async fn start(
        sweep_cron: &str,
        sessions: Arc<SessionStore>,
        tracker: Arc<AckTracker>,
    ) -> Result<Self> {
        let jobs = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;

        jobs.add(sweep_job(sweep_cron, Arc::clone(&sessions))?)
            .await
            .context("Failed to add session sweep job")?;
        jobs.add(heartbeat_job(sessions, tracker)?)
            .await
            .context("Failed to add heartbeat job")?;

        jobs.start().await.context("Failed to start scheduler")?;
        info!("Housekeeping started, session sweep on '{}'", sweep_cron);
        Ok(Self { jobs })
    }

    pub async fn stop(mut self) -> Result<()> {
        self.jobs
            .shutdown()
            .await
            .context("Failed to shutdown scheduler")?;
        info!("Housekeeping stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sessions() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_starts_and_stops() {
        let housekeeping = Housekeeping::start("0 * * * * *", sessions(), Arc::new(AckTracker::new()))
            .await
            .unwrap();
        housekeeping.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_sweep_cron_is_an_error() {
        let err = Housekeeping::start("every minute", sessions(), Arc::new(AckTracker::new()))
            .await
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("session sweep"));
    }

    #[tokio::test]
    async fn test_heartbeat_schedule_parses() {
        assert!(heartbeat_job(sessions(), Arc::new(AckTracker::new())).is_ok());
    }
}

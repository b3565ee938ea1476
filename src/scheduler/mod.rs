pub mod recurring;
pub mod scheduled;
pub mod sequences;

pub use recurring::*;
pub use scheduled::*;
pub use sequences::*;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::campaigns::executor::CampaignError;
use crate::campaigns::queue::QueueProcessor;

const TICK_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cron error: {0}")]
    Cron(#[from] cron::error::Error),
    #[error("fetch error: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Owns the cron ticks. One minute loop drives scheduled promotion,
/// recurring dispatch and sequence advancement; the queue drain fires once
/// per UTC day at or after 00:01. A failed tick is logged and retried on the
/// next one.
pub struct Scheduler {
    scheduled: ScheduledDispatcher,
    recurring: RecurringDispatcher,
    sequences: SequenceProcessor,
    queue: QueueProcessor,
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.handle.abort();
    }
}

impl Scheduler {
    pub fn new(
        scheduled: ScheduledDispatcher,
        recurring: RecurringDispatcher,
        sequences: SequenceProcessor,
        queue: QueueProcessor,
    ) -> Self {
        Self {
            scheduled,
            recurring,
            sequences,
            queue,
        }
    }

    pub fn start(self) -> SchedulerHandle {
        let (tx, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(TICK_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_drain = initial_drain_marker(Utc::now());

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick(&mut last_drain).await;
                    }
                    _ = rx.changed() => {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        });

        SchedulerHandle {
            shutdown: tx,
            handle,
        }
    }

    /// One scheduler pass. Public so embedders and tests can drive ticks
    /// without waiting on wall-clock time.
    pub async fn tick(&self, last_drain: &mut NaiveDate) {
        if let Err(e) = self.scheduled.promote_due().await {
            error!(error = %e, "scheduled campaign promotion failed");
        }

        if let Err(e) = self.recurring.dispatch_due().await {
            error!(error = %e, "recurring dispatch failed");
        }

        if let Err(e) = self.sequences.process_due().await {
            error!(error = %e, "sequence processing failed");
        }

        let now = Utc::now();
        if now.date_naive() > *last_drain && past_drain_time(now) {
            match self.queue.drain().await {
                Ok(report) => {
                    *last_drain = now.date_naive();
                    info!(
                        processed = report.processed,
                        failed = report.failed,
                        "daily queue drain done"
                    );
                }
                // Not marking the date keeps the drain eligible next tick.
                Err(e) => error!(error = %e, "daily queue drain failed"),
            }
        }
    }
}

fn drain_time() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 1, 0).expect("valid drain time")
}

fn past_drain_time(now: DateTime<Utc>) -> bool {
    now.time() >= drain_time()
}

/// The date the drain is considered already done for, as of startup.
fn initial_drain_marker(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    if past_drain_time(now) {
        today
    } else {
        today.pred_opt().unwrap_or(today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn drain_window_opens_at_one_past_midnight() {
        let before = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 59).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 10, 0, 1, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 0).unwrap();

        assert!(!past_drain_time(before));
        assert!(past_drain_time(at));
        assert!(past_drain_time(after));
    }

    #[test]
    fn startup_before_drain_time_leaves_today_eligible() {
        let early = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 30).unwrap();
        assert_eq!(
            initial_drain_marker(early),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );

        let late = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        assert_eq!(
            initial_drain_marker(late),
            NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
    }
}

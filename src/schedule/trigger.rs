use crate::lifecycle::{CycleOutcome, Dispatcher};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },
}

/// Cron cadence on which dispatch cycles fire
#[derive(Debug, Clone)]
pub struct CronTrigger {
    schedule: Schedule,
}

impl CronTrigger {
    pub fn new(cron_expr: &str) -> Result<Self, TriggerError> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| TriggerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire one dispatch cycle per schedule tick until `shutdown` flips to true.
    /// Cycles run inline, so a slow cycle delays the next tick instead of
    /// overlapping it.
    pub async fn run(self, dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
        info!(schedule = %self.schedule, "Trigger loop started");

        loop {
            let now = Utc::now();
            let Some(next) = self.next_after(now) else {
                warn!("Cron schedule has no upcoming fire time, trigger loop stopping");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            debug!(next = %next, "Waiting for next dispatch cycle");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.wait_for(|&stop| stop) => {
                    info!("Trigger loop shutting down");
                    return;
                }
            }

            match dispatcher.run_cycle().await {
                Ok(CycleOutcome::Busy) => info!("Previous cycle still running, skipped"),
                Ok(CycleOutcome::Completed(report)) => info!(
                    batches = report.batches.len(),
                    "Scheduled dispatch cycle finished"
                ),
                Err(e) => error!(error = %e, "Scheduled dispatch cycle failed"),
            }
        }
    }
}

// src/engine/schedule.rs

//! Daily wall-clock schedule.

use chrono::{DateTime, Duration as TimeDelta, FixedOffset, NaiveTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::Ticker;
use crate::config::PipelineSettings;
use crate::controller::ScheduleTick;

/// Fires once a day at `at`, read in the fixed UTC offset `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    pub at: NaiveTime,
    pub offset: FixedOffset,
}

impl DailySchedule {
    pub fn new(at: NaiveTime, offset: FixedOffset) -> Self {
        Self { at, offset }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(settings.schedule, settings.utc_offset)
    }

    /// First fire instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.naive_utc() + TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        let mut candidate = local.date().and_time(self.at);
        if candidate <= local {
            candidate += TimeDelta::days(1);
        }
        let utc = candidate - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, Utc)
    }
}

/// Fire one tick per day, each with a fresh correlation id, until the
/// runtime goes away.
pub fn spawn_scheduler(schedule: DailySchedule, ticker: Ticker) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = schedule.next_after(now);
            info!(next = %next.with_timezone(&schedule.offset), "next scheduled run");

            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let tick = ScheduleTick::now();
            info!(correlation_id = %tick.correlation_id, "schedule fired");
            if let Err(e) = ticker.fire(tick).await {
                warn!(error = %e, "scheduler stopping");
                break;
            }
        }
    })
}

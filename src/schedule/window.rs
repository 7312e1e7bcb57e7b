use crate::config::types::WindowConfig;
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Offset, Utc, Weekday};

/// Daily sending window on a fixed-offset local clock
#[derive(Debug, Clone)]
pub struct SendingWindow {
    start: Option<NaiveTime>,
    end: NaiveTime,
    offset: FixedOffset,
    days: Vec<Weekday>,
}

impl SendingWindow {
    pub fn new(
        start: Option<NaiveTime>,
        end: NaiveTime,
        offset: FixedOffset,
        days: Vec<Weekday>,
    ) -> Self {
        Self {
            start,
            end,
            offset,
            days,
        }
    }

    pub fn from_config(config: &WindowConfig) -> Self {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self::new(config.start, config.end, offset, config.days.clone())
    }

    /// Seconds left until today's window end, as seen at `now`.
    ///
    /// Negative whenever sending is not allowed at `now`: after the end, before
    /// the start, or on a day outside the window. Recompute for every decision.
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> i64 {
        let local = now.with_timezone(&self.offset);

        if !self.days.contains(&local.weekday()) {
            return -1;
        }
        if let Some(start) = self.start {
            if local.time() < start {
                return -1;
            }
        }

        let end = local
            .date_naive()
            .and_time(self.end)
            .and_local_timezone(self.offset)
            .single();
        match end {
            Some(end) => (end.with_timezone(&Utc) - now).num_seconds(),
            None => -1,
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.seconds_remaining(now) >= 0
    }
}

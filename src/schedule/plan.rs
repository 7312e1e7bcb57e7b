use serde::{Deserialize, Serialize};

/// Share of the remaining window a split batch may use
pub const DEFAULT_SAFETY_FACTOR: f64 = 0.9;

/// What to do with a batch given the time left in the sending window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", content = "count", rename_all = "snake_case")]
pub enum SendPlan {
    /// The window is closed; nothing is sent this cycle
    PastDeadline,
    /// The whole batch fits in the window
    SendAll,
    /// Send this many leading records, defer the rest to the next window
    SendPrefix(usize),
}

impl SendPlan {
    /// Number of records this plan sends out of a batch of `batch_size`
    pub fn send_count(&self, batch_size: usize) -> usize {
        match self {
            SendPlan::PastDeadline => 0,
            SendPlan::SendAll => batch_size,
            SendPlan::SendPrefix(count) => (*count).min(batch_size),
        }
    }

    /// True when nothing will be sent, including a prefix that rounds to zero
    pub fn defers_everything(&self) -> bool {
        matches!(self, SendPlan::PastDeadline | SendPlan::SendPrefix(0))
    }
}

/// Seconds needed to push `batch_size` requests through a limiter releasing
/// `tps` per second: the first goes out at once, the rest wait their turn.
pub fn seconds_needed(batch_size: usize, tps: u32) -> i64 {
    let tps = tps.max(1) as i64;
    (batch_size as i64 - 1).max(0) / tps
}

/// Decide how much of a batch to send with the default safety factor
pub fn plan(batch_size: usize, tps: u32, seconds_remaining: i64) -> SendPlan {
    plan_with_margin(batch_size, tps, seconds_remaining, DEFAULT_SAFETY_FACTOR)
}

/// Decide how much of a batch to send.
///
/// A negative budget is past the deadline. A budget strictly larger than the
/// time the batch needs sends everything. Otherwise only
/// `floor(tps * seconds_remaining * safety_factor)` records go out.
pub fn plan_with_margin(
    batch_size: usize,
    tps: u32,
    seconds_remaining: i64,
    safety_factor: f64,
) -> SendPlan {
    if seconds_remaining < 0 {
        return SendPlan::PastDeadline;
    }

    if seconds_remaining > seconds_needed(batch_size, tps) {
        return SendPlan::SendAll;
    }

    let count = (tps as f64 * seconds_remaining as f64 * safety_factor).floor() as usize;
    SendPlan::SendPrefix(count)
}

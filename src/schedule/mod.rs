pub mod plan;
pub mod trigger;
pub mod window;

pub use plan::{plan, plan_with_margin, seconds_needed, SendPlan};
pub use trigger::{CronTrigger, TriggerError};
pub use window::SendingWindow;

//! Wall-clock source for timestamps written to the time card.
//!
//! Timers use tokio's clock; break start/end stamps and sleep-gap detection use
//! this one so tests can move the wall clock independently.

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

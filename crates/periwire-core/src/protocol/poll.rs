//! Status polling
//!
//! [`PollTracker`] turns the success or failure of each status poll into
//! attach/detach transitions. [`PollSchedule`] decides when the next poll is
//! due, including temporary suspension while a device is busy. It runs on
//! tokio's clock so paused test time drives it too.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

/// Transition produced by a poll result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Attached,
    Detached,
}

/// Consecutive-failure detach logic
#[derive(Debug, Clone)]
pub struct PollTracker {
    attached: bool,
    failures: u32,
    max_failures: u32,
}

impl PollTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            attached: false,
            failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record one poll result.
    ///
    /// A success attaches a detached device immediately. Failures only count
    /// while attached; reaching the threshold detaches and resets the count.
    pub fn record(&mut self, success: bool) -> Option<LinkEvent> {
        if success {
            self.failures = 0;
            if !self.attached {
                self.attached = true;
                info!("device attached");
                return Some(LinkEvent::Attached);
            }
            return None;
        }

        if !self.attached {
            return None;
        }
        self.failures += 1;
        debug!(failures = self.failures, max = self.max_failures, "status poll failed");
        if self.failures >= self.max_failures {
            self.attached = false;
            self.failures = 0;
            info!("device detached");
            return Some(LinkEvent::Detached);
        }
        None
    }
}

/// When the next status poll should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    interval: Option<Duration>,
    suspended_until: Option<Instant>,
}

impl PollSchedule {
    /// `None` disables polling
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            suspended_until: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Option<Duration>) {
        self.interval = interval;
    }

    /// Hold off polling for `duration` from `now`
    pub fn suspend(&mut self, duration: Duration, now: Instant) {
        self.suspended_until = Some(now + duration);
    }

    pub fn resume(&mut self) {
        self.suspended_until = None;
    }

    pub fn is_suspended(&self, now: Instant) -> bool {
        self.suspended_until.is_some_and(|until| now < until)
    }

    /// Delay until the next poll, or `None` when polling is disabled.
    /// A suspension pushes the next poll out to the end of the suspension
    /// when that is later than one interval.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        let interval = self.interval?;
        let held = self
            .suspended_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default();
        Some(interval.max(held))
    }
}

//! Batch timing for push mode.
//!
//! Every queued command kicks the scheduler, which arms a tick one interval
//! later if none is armed. Rebuilds extend the deadline so that a burst of
//! structural edits (dragging a slider, typing a value) is applied once it
//! settles. While the host saves its file, batches are suspended.
//!
//! Time is passed in explicitly, so tests drive the scheduler with synthetic
//! instants.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TickScheduler {
    interval: Duration,
    debounce: Duration,
    due: Option<Instant>,
    suspended: bool,
}

impl TickScheduler {
    #[must_use]
    pub fn new(interval: Duration, debounce: Duration) -> Self {
        Self {
            interval,
            debounce,
            due: None,
            suspended: false,
        }
    }

    /// Arms a tick one interval after `now`, unless one is already armed.
    pub fn kick(&mut self, now: Instant) {
        if self.due.is_none() {
            self.due = Some(now + self.interval);
        }
    }

    /// Pushes the armed tick to at least one debounce period after `now`.
    pub fn extend(&mut self, now: Instant) {
        let deferred = now + self.debounce;
        self.due = Some(self.due.map_or(deferred, |due| due.max(deferred)));
    }

    /// Returns `true` once, when the armed tick is due.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.suspended {
            return false;
        }
        match self.due {
            Some(due) if due <= now => {
                self.due = None;
                true
            }
            _ => false,
        }
    }

    /// Holds batches back until [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        if !self.suspended {
            log::debug!("Push batches suspended");
        }
        self.suspended = true;
    }

    /// Re-enables batches; pending work ticks one interval after `now`.
    pub fn resume(&mut self, now: Instant) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        if self.due.is_some_and(|due| due < now + self.interval) {
            self.due = Some(now + self.interval);
        }
        log::debug!("Push batches resumed");
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Deadline of the armed tick, if any.
    #[must_use]
    pub fn due(&self) -> Option<Instant> {
        self.due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn kick_arms_once() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), ms(200));
        assert!(!scheduler.poll(start + ms(100)));

        scheduler.kick(start);
        scheduler.kick(start + ms(40));
        assert!(!scheduler.poll(start + ms(49)));
        assert!(scheduler.poll(start + ms(50)));
        assert!(!scheduler.poll(start + ms(51)));
    }

    #[test]
    fn extend_debounces() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), ms(200));
        scheduler.kick(start);
        scheduler.extend(start + ms(10));
        assert!(!scheduler.poll(start + ms(60)));
        assert!(scheduler.poll(start + ms(210)));
    }

    #[test]
    fn suspension_holds_ticks() {
        let start = Instant::now();
        let mut scheduler = TickScheduler::new(ms(50), ms(200));
        scheduler.kick(start);
        scheduler.suspend();
        assert!(!scheduler.poll(start + ms(500)));

        scheduler.resume(start + ms(500));
        assert!(!scheduler.poll(start + ms(520)));
        assert!(scheduler.poll(start + ms(550)));
    }
}

//! Per-session inactivity timers
//!
//! Deadlines live in a table polled by the actor loop; there are no timer
//! threads. Re-arming always replaces the old timer with a new one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::session::ControllerKey;

/// Identity of one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy)]
struct Timer {
    id: TimerId,
    deadline: Instant,
}

/// Deadline table keyed by controller
#[derive(Debug, Default)]
pub struct TimeoutSupervisor {
    timers: HashMap<ControllerKey, Timer>,
    next_id: u64,
}

impl TimeoutSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `key`, replacing any existing one
    pub fn create(&mut self, key: ControllerKey, timeout: Duration, now: Instant) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = TimerId(self.next_id);
        let deadline = now.checked_add(timeout).unwrap_or(now);
        self.timers.insert(key, Timer { id, deadline });
        trace!(key = %key, timeout_ms = timeout.as_millis(), "Armed session timer");
        id
    }

    /// Cancel and recreate the timer for `key`
    pub fn update(&mut self, key: ControllerKey, timeout: Duration, now: Instant) -> TimerId {
        self.destroy(&key);
        self.create(key, timeout, now)
    }

    pub fn destroy(&mut self, key: &ControllerKey) -> bool {
        self.timers.remove(key).is_some()
    }

    pub fn is_scheduled(&self, key: &ControllerKey) -> bool {
        self.timers.contains_key(key)
    }

    pub fn timer_id(&self, key: &ControllerKey) -> Option<TimerId> {
        self.timers.get(key).map(|timer| timer.id)
    }

    pub fn deadline(&self, key: &ControllerKey) -> Option<Instant> {
        self.timers.get(key).map(|timer| timer.deadline)
    }

    /// Earliest deadline across all timers
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|timer| timer.deadline).min()
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn take_expired(&mut self, now: Instant) -> Vec<ControllerKey> {
        let mut expired: Vec<(Instant, ControllerKey)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(key, timer)| (timer.deadline, *key))
            .collect();
        expired.sort();

        for (_, key) in &expired {
            self.timers.remove(key);
        }
        expired.into_iter().map(|(_, key)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_replaces_timer() {
        let mut supervisor = TimeoutSupervisor::new();
        let key = ControllerKey::new(1, 1);
        let now = Instant::now();
        let first = supervisor.create(key, Duration::from_secs(5), now);
        let second = supervisor.update(key, Duration::from_secs(1), now);
        assert_ne!(first, second);
        assert_eq!(supervisor.len(), 1);
        assert_eq!(supervisor.deadline(&key), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_take_expired_in_deadline_order() {
        let mut supervisor = TimeoutSupervisor::new();
        let now = Instant::now();
        let a = ControllerKey::new(1, 1);
        let b = ControllerKey::new(1, 2);
        let c = ControllerKey::new(1, 3);
        supervisor.create(a, Duration::from_millis(20), now);
        supervisor.create(b, Duration::from_millis(10), now);
        supervisor.create(c, Duration::from_secs(60), now);

        assert_eq!(supervisor.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(supervisor.take_expired(now).is_empty());
        assert_eq!(supervisor.take_expired(now + Duration::from_millis(25)), vec![b, a]);
        assert!(supervisor.is_scheduled(&c));
        assert!(!supervisor.is_scheduled(&a));
    }

    #[test]
    fn test_destroy() {
        let mut supervisor = TimeoutSupervisor::new();
        let key = ControllerKey::new(2, 9);
        assert!(!supervisor.destroy(&key));
        supervisor.create(key, Duration::from_secs(1), Instant::now());
        assert!(supervisor.destroy(&key));
        assert!(supervisor.next_deadline().is_none());
    }
}

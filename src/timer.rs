//! One-shot timers keyed by service, driving kill escalation and respawn.
//!
//! Each service owns at most one pending timer; arming a new one replaces
//! the old. Entries are dispatched as `(SvcId, TimerKind)` and the state
//! machine looks the service up on fire, so a timer may harmlessly outlive
//! its record.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use crate::service::{SvcId, TimerKind};

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    r#gen: u64,
    svc: SvcId,
    kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.r#gen.cmp(&other.r#gen))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Pending one-shot timers for all services.
#[derive(Debug, Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    armed: HashMap<SvcId, u64>,
    next_gen: u64,
}

impl TimerWheel {
    /// Empty wheel.
    pub fn new() -> Self {
        TimerWheel::default()
    }

    /// Arms a timer for `svc`, cancelling any previously armed one.
    pub fn arm(&mut self, svc: SvcId, kind: TimerKind, delay: Duration) {
        self.next_gen += 1;
        let r#gen = self.next_gen;
        self.armed.insert(svc, r#gen);
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            r#gen,
            svc,
            kind,
        }));
    }

    /// Cancels the pending timer for `svc`, if any.
    pub fn cancel(&mut self, svc: SvcId) {
        self.armed.remove(&svc);
    }

    /// True when `svc` has a pending timer.
    pub fn is_armed(&self, svc: SvcId) -> bool {
        self.armed.contains_key(&svc)
    }

    /// Number of live (non-cancelled, non-fired) timers.
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    /// True when no timer is pending.
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.armed.get(&entry.svc) == Some(&entry.r#gen)
    }

    /// Deadline of the earliest live timer, for the poll timeout.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if self.is_live(entry) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every timer due at `now`, disarming each as it fires.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(SvcId, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !self.is_live(entry) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            self.armed.remove(&entry.svc);
            due.push((entry.svc, entry.kind));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SVC: SvcId = SvcId(7);

    #[test]
    fn armed_timer_fires_once() {
        let mut wheel = TimerWheel::new();
        wheel.arm(SVC, TimerKind::Kill, Duration::from_millis(0));
        assert!(wheel.is_armed(SVC));

        let due = wheel.pop_due(Instant::now());
        assert_eq!(due, vec![(SVC, TimerKind::Kill)]);
        assert!(!wheel.is_armed(SVC));
        assert!(wheel.pop_due(Instant::now()).is_empty());
    }

    #[test]
    fn rearming_replaces_the_previous_timer() {
        let mut wheel = TimerWheel::new();
        wheel.arm(SVC, TimerKind::Kill, Duration::from_millis(0));
        wheel.arm(SVC, TimerKind::Retry, Duration::from_millis(0));
        assert_eq!(wheel.len(), 1);

        let due = wheel.pop_due(Instant::now());
        assert_eq!(due, vec![(SVC, TimerKind::Retry)]);
    }

    #[test]
    fn cancel_suppresses_fire() {
        let mut wheel = TimerWheel::new();
        wheel.arm(SVC, TimerKind::Stable, Duration::from_millis(0));
        wheel.cancel(SVC);
        assert!(wheel.pop_due(Instant::now()).is_empty());
        assert!(wheel.next_deadline().is_none());
    }

    #[test]
    fn not_yet_due_timers_stay_queued() {
        let mut wheel = TimerWheel::new();
        wheel.arm(SVC, TimerKind::Retry, Duration::from_secs(60));
        assert!(wheel.pop_due(Instant::now()).is_empty());
        assert!(wheel.is_armed(SVC));
        assert!(wheel.next_deadline().unwrap() > Instant::now());
    }

    #[test]
    fn deadlines_order_across_services() {
        let mut wheel = TimerWheel::new();
        wheel.arm(SvcId(1), TimerKind::Retry, Duration::from_secs(60));
        wheel.arm(SvcId(2), TimerKind::Kill, Duration::from_millis(0));

        let due = wheel.pop_due(Instant::now());
        assert_eq!(due, vec![(SvcId(2), TimerKind::Kill)]);
        assert!(wheel.is_armed(SvcId(1)));
    }
}

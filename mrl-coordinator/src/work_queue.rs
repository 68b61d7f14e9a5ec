//! Unit bookkeeping for the active phase.
//!
//! A unit is unscheduled (waiting in FIFO order), in flight (handed to a
//! worker, no report yet) or done (gone from both collections). A phase is
//! over only when both collections are empty: while anything is in flight a
//! failure report can still put work back.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, Default)]
struct QueueState {
    unscheduled: VecDeque<String>,

    /// Units handed out, with the instant they were handed out.
    in_flight: HashMap<String, Instant>,

    /// Set when the run is being torn down; no more units are handed out.
    closed: bool,
}

impl QueueState {
    fn is_complete(&self) -> bool {
        self.unscheduled.is_empty() && self.in_flight.is_empty()
    }

    fn contains(&self, unit: &str) -> bool {
        self.in_flight.contains_key(unit) || self.unscheduled.iter().any(|u| u == unit)
    }

    /// Move units whose lease ran out to the back of `unscheduled`, oldest first.
    fn reclaim_expired(&mut self, lease: Duration, now: Instant) {
        let mut expired: Vec<(String, Instant)> = self
            .in_flight
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) >= lease)
            .map(|(unit, issued)| (unit.clone(), *issued))
            .collect();
        expired.sort_by_key(|(_, issued)| *issued);

        for (unit, _) in expired {
            warn!("Lease on \"{}\" expired, rescheduling", unit);
            self.in_flight.remove(&unit);
            self.unscheduled.push_back(unit);
        }
    }

    /// How long until the oldest in-flight lease runs out.
    fn next_expiry(&self, lease: Duration, now: Instant) -> Duration {
        self.in_flight
            .values()
            .map(|issued| (*issued + lease).saturating_duration_since(now))
            .min()
            .unwrap_or(lease)
    }
}

/// Counts of the two collections, for logging and progress checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub unscheduled: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,

    /// Broadcast whenever work appears or the phase completes.
    changed: Condvar,

    /// When set, in-flight units without a report for this long are reissued.
    lease: Option<Duration>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that reclaims units whose report has not arrived within `lease`.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease: Some(lease),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append units to the back of the unscheduled queue.
    ///
    /// Units already known to the queue are skipped. Returns how many were added.
    pub fn stage<I>(&self, units: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.lock();
        let mut added = 0;
        for unit in units {
            if state.contains(&unit) {
                debug!("Unit \"{}\" already staged", unit);
                continue;
            }
            state.unscheduled.push_back(unit);
            added += 1;
        }
        if added > 0 {
            self.changed.notify_all();
        }
        added
    }

    /// Hand out the next unit, blocking while the queue is empty but some
    /// unit is still in flight. Returns `None` once the phase is complete.
    pub fn next_unit(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }

            if let Some(lease) = self.lease {
                state.reclaim_expired(lease, Instant::now());
            }

            if let Some(unit) = state.unscheduled.pop_front() {
                state.in_flight.insert(unit.clone(), Instant::now());
                return Some(unit);
            }

            if state.in_flight.is_empty() {
                return None;
            }

            state = match self.lease {
                None => self
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(lease) => {
                    let timeout = state.next_expiry(lease, Instant::now());
                    self.changed
                        .wait_timeout(state, timeout)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Mark `unit` as done for good. Returns `false` if the report did not
    /// match any in-flight unit.
    pub fn report_success(&self, unit: &str) -> bool {
        let mut state = self.lock();
        let known = if state.in_flight.remove(unit).is_some() {
            true
        } else if let (Some(_), Some(position)) = (
            self.lease,
            state.unscheduled.iter().position(|u| u == unit),
        ) {
            // Late report for a unit whose lease was reclaimed.
            state.unscheduled.remove(position);
            true
        } else {
            false
        };

        if state.is_complete() {
            self.changed.notify_all();
        }
        known
    }

    /// Put an in-flight `unit` back at the end of the queue. Returns `false`
    /// if the report did not match any in-flight unit.
    pub fn report_failure(&self, unit: &str) -> bool {
        let mut state = self.lock();
        if state.in_flight.remove(unit).is_none() {
            return false;
        }
        state.unscheduled.push_back(unit.to_string());
        self.changed.notify_all();
        true
    }

    /// Release every blocked caller with `None` and refuse to hand out
    /// more units. Used when the master shuts down.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_all();
    }

    /// Both collections are empty.
    pub fn is_complete(&self) -> bool {
        self.lock().is_complete()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.lock();
        QueueStatus {
            unscheduled: state.unscheduled.len(),
            in_flight: state.in_flight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn units(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn empty_queue_is_complete() {
        let queue = WorkQueue::new();
        assert!(queue.is_complete());
        assert_eq!(queue.next_unit(), None);
    }

    #[test]
    fn failed_unit_is_reissued_before_completion() {
        let queue = WorkQueue::new();
        assert_eq!(queue.stage(units(&["a", "b", "c"])), 3);

        assert_eq!(queue.next_unit().as_deref(), Some("a"));
        assert_eq!(queue.next_unit().as_deref(), Some("b"));
        assert_eq!(queue.next_unit().as_deref(), Some("c"));

        assert!(queue.report_failure("b"));
        assert_eq!(queue.next_unit().as_deref(), Some("b"));

        assert!(queue.report_success("a"));
        assert!(queue.report_success("c"));
        assert!(!queue.is_complete());
        assert!(queue.report_success("b"));

        assert!(queue.is_complete());
        assert_eq!(queue.next_unit(), None);
    }

    #[test]
    fn failures_go_to_the_back() {
        let queue = WorkQueue::new();
        queue.stage(units(&["a", "b", "c"]));

        assert_eq!(queue.next_unit().as_deref(), Some("a"));
        queue.report_failure("a");

        assert_eq!(queue.next_unit().as_deref(), Some("b"));
        assert_eq!(queue.next_unit().as_deref(), Some("c"));
        assert_eq!(queue.next_unit().as_deref(), Some("a"));
    }

    #[test]
    fn duplicate_units_are_not_staged_twice() {
        let queue = WorkQueue::new();
        assert_eq!(queue.stage(units(&["a", "b"])), 2);
        assert_eq!(queue.stage(units(&["b", "c"])), 1);

        let next = queue.next_unit().unwrap();
        assert_eq!(queue.stage(vec![next]), 0);
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 2,
                in_flight: 1
            }
        );
    }

    #[test]
    fn stray_reports_leave_state_untouched() {
        let queue = WorkQueue::new();
        queue.stage(units(&["a"]));

        assert!(!queue.report_success("a"));
        assert!(!queue.report_failure("nope"));
        assert_eq!(
            queue.status(),
            QueueStatus {
                unscheduled: 1,
                in_flight: 0
            }
        );
    }

    #[test]
    fn waiter_is_not_released_while_units_are_in_flight() {
        let queue = Arc::new(WorkQueue::new());
        queue.stage(units(&["only"]));
        assert_eq!(queue.next_unit().as_deref(), Some("only"));

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.next_unit())
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        queue.report_failure("only");
        assert_eq!(waiter.join().unwrap().as_deref(), Some("only"));
    }

    #[test]
    fn every_waiter_is_released_on_completion() {
        let queue = Arc::new(WorkQueue::new());
        queue.stage(units(&["only"]));
        queue.next_unit();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || queue.next_unit())
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        queue.report_success("only");

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), None);
        }
    }

    #[test]
    fn concurrent_consumers_never_see_a_unit_twice_after_success() {
        let queue = Arc::new(WorkQueue::new());
        let staged: Vec<String> = (0..200).map(|i| format!("unit-{i}")).collect();
        queue.stage(staged.clone());

        let consumers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(unit) = queue.next_unit() {
                        queue.report_success(&unit);
                        seen.push(unit);
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.join().unwrap());
        }

        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), staged.len());
        assert_eq!(unique, staged.into_iter().collect());
        assert!(queue.is_complete());
    }

    #[test]
    fn flaky_consumers_still_drain_the_queue() {
        let queue = Arc::new(WorkQueue::new());
        queue.stage((0..50).map(|i| format!("unit-{i}")));

        let consumers: Vec<_> = (0..4)
            .map(|worker| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut attempts = 0usize;
                    while let Some(unit) = queue.next_unit() {
                        attempts += 1;
                        // Every third attempt fails.
                        if (attempts + worker) % 3 == 0 {
                            queue.report_failure(&unit);
                        } else {
                            queue.report_success(&unit);
                        }
                    }
                })
            })
            .collect();

        for consumer in consumers {
            consumer.join().unwrap();
        }
        assert!(queue.is_complete());
    }

    #[test]
    fn close_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        queue.stage(units(&["a"]));
        queue.next_unit();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.next_unit())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();

        assert_eq!(waiter.join().unwrap(), None);
        assert!(!queue.is_complete());
    }

    #[test]
    fn expired_lease_reissues_the_unit() {
        let queue = Arc::new(WorkQueue::with_lease(Duration::from_millis(100)));
        queue.stage(units(&["slow"]));
        assert_eq!(queue.next_unit().as_deref(), Some("slow"));

        // The first holder never reports; a second caller gets it after the lease.
        let started = Instant::now();
        assert_eq!(queue.next_unit().as_deref(), Some("slow"));
        assert!(started.elapsed() >= Duration::from_millis(90));

        assert!(queue.report_success("slow"));
        assert_eq!(queue.next_unit(), None);
    }

    #[test]
    fn late_success_after_reclaim_completes_the_unit() {
        let queue = WorkQueue::with_lease(Duration::from_millis(10));
        queue.stage(units(&["a", "b"]));
        assert_eq!(queue.next_unit().as_deref(), Some("a"));

        thread::sleep(Duration::from_millis(30));
        // Reclaims "a" behind "b".
        assert_eq!(queue.next_unit().as_deref(), Some("b"));

        assert!(queue.report_success("a"));
        assert!(queue.report_success("b"));
        assert!(queue.is_complete());
    }
}

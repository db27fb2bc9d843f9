//! Effect Wrapper — virtual-time timers
//!
//! Timer queue backing the wrapped `set_timeout` / `set_interval` /
//! `set_immediate` primitives on the host. Each entry carries an optional
//! owning dependency node; the host records owned handles in that node's
//! effect set so disposal can void every outstanding timer at once, which is
//! what guarantees a disposed module never runs a stale closure.
//!
//! Time is virtual: nothing fires until [`TimerQueue::advance`] moves the
//! clock, which keeps every ordering test deterministic.

use rustc_hash::FxHashSet as HashSet;
use std::cell::RefCell;
use std::rc::Rc;

use crate::graph::NodeId;

/// Handle returned by the wrapped timer primitives.
pub type TimerId = u64;

/// Shared timer callback. `Rc<RefCell<..>>` so a repeating timer can be
/// rescheduled while its callback is executing.
pub type TimerCallback = Rc<RefCell<dyn FnMut()>>;

struct Timer {
    id: TimerId,
    fire_at: u64,
    delay: u64,
    repeating: bool,
    owner: Option<NodeId>,
    callback: TimerCallback,
}

/// A timer that came due during [`TimerQueue::advance`]. The host executes
/// the callback outside any queue borrow.
pub struct DueTimer {
    pub id: TimerId,
    pub owner: Option<NodeId>,
    pub repeating: bool,
    pub callback: TimerCallback,
}

/// Virtual-time timer queue.
#[derive(Default)]
pub struct TimerQueue {
    timers: Vec<Timer>,
    /// Tombstones: cancelled ids, dropped lazily when encountered.
    cancelled: HashSet<TimerId>,
    virtual_time: u64,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.virtual_time
    }

    /// Schedule a timer. `delay` of zero fires on the next `advance` call,
    /// including `advance(0)`.
    pub fn schedule(
        &mut self,
        delay: u64,
        repeating: bool,
        owner: Option<NodeId>,
        callback: impl FnMut() + 'static,
    ) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.timers.push(Timer {
            id,
            fire_at: self.virtual_time + delay,
            delay,
            repeating,
            owner,
            callback: Rc::new(RefCell::new(callback)),
        });
        id
    }

    /// Cancel a timer by handle. Safe to call for already-fired or unknown
    /// handles.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.cancelled.contains(&id)
    }

    /// Whether any live timer is scheduled.
    pub fn has_pending(&self) -> bool {
        self.timers.iter().any(|t| !self.cancelled.contains(&t.id))
    }

    /// Virtual time of the next live timer, if any.
    pub fn next_fire_at(&self) -> Option<u64> {
        self.timers
            .iter()
            .filter(|t| !self.cancelled.contains(&t.id))
            .map(|t| t.fire_at)
            .min()
    }

    /// Advance the clock by `ms` and collect every timer that comes due, in
    /// chronological order. Repeating timers are rescheduled relative to
    /// their fire time so an interval catches up across a large advance.
    pub fn advance(&mut self, ms: u64) -> Vec<DueTimer> {
        let target = self.virtual_time + ms;
        let mut due = Vec::new();

        loop {
            // Drop tombstoned entries before selecting the next timer.
            let cancelled = std::mem::take(&mut self.cancelled);
            self.timers.retain(|t| !cancelled.contains(&t.id));

            let next_idx = self
                .timers
                .iter()
                .enumerate()
                .filter(|(_, t)| t.fire_at <= target)
                .min_by_key(|(_, t)| (t.fire_at, t.id))
                .map(|(i, _)| i);

            let Some(idx) = next_idx else { break };
            let timer = self.timers.remove(idx);
            self.virtual_time = self.virtual_time.max(timer.fire_at);

            if timer.repeating {
                self.timers.push(Timer {
                    id: timer.id,
                    fire_at: timer.fire_at + timer.delay.max(1),
                    delay: timer.delay,
                    repeating: true,
                    owner: timer.owner,
                    callback: Rc::clone(&timer.callback),
                });
            }

            due.push(DueTimer {
                id: timer.id,
                owner: timer.owner,
                repeating: timer.repeating,
                callback: timer.callback,
            });
        }

        self.virtual_time = target;
        due
    }
}

impl std::fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timers", &self.timers.len())
            .field("cancelled", &self.cancelled.len())
            .field("virtual_time", &self.virtual_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_fires_after_delay() {
        let mut q = TimerQueue::new();
        q.schedule(10, false, None, || {});

        assert!(q.advance(5).is_empty());
        let due = q.advance(5);
        assert_eq!(due.len(), 1);
        assert!(!q.has_pending());
    }

    #[test]
    fn test_cancelled_timer_never_comes_due() {
        let mut q = TimerQueue::new();
        let id = q.schedule(10, false, None, || {});
        q.cancel(id);

        assert!(q.advance(20).is_empty());
        assert!(!q.has_pending());
    }

    #[test]
    fn test_interval_catches_up() {
        let mut q = TimerQueue::new();
        q.schedule(10, true, None, || {});

        let due = q.advance(35);
        assert_eq!(due.len(), 3);
        assert_eq!(q.now(), 35);
        assert!(q.has_pending());
    }

    #[test]
    fn test_zero_delay_fires_on_zero_advance() {
        let mut q = TimerQueue::new();
        q.schedule(0, false, None, || {});
        assert_eq!(q.advance(0).len(), 1);
    }

    #[test]
    fn test_chronological_order() {
        let mut q = TimerQueue::new();
        let late = q.schedule(20, false, None, || {});
        let early = q.schedule(5, false, None, || {});

        let due = q.advance(25);
        assert_eq!(due.iter().map(|t| t.id).collect::<Vec<_>>(), vec![early, late]);
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Timer min-heap.
//!
//! Timers live in a generational slot table and are referenced externally
//! only through the opaque [`TimerId`]; the heap itself holds `(expiry, id)`
//! pairs. Deleting or re-arming a timer leaves its old heap entry behind as
//! a stale pair that no longer matches the slot, and stale pairs are
//! discarded lazily on pop. That makes deletion from inside the timer's own
//! callback safe: nothing is ever pulled out from under the heap mid-walk.

use crate::free_list::{FreeList, Idx};
use smallvec::SmallVec;
use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::BinaryHeap,
    rc::Rc,
    time::{Duration, Instant},
};

pub(crate) type TimerCallback = Rc<RefCell<dyn FnMut()>>;

pub(crate) type TimerId = Idx<TimerState>;

pub(crate) struct TimerState {
    interval: Duration,
    expiry: Instant,
    /// `None` repeats forever; `Some(n)` fires `n` more times.
    remaining: Option<u64>,
    callback: TimerCallback,
}

impl std::fmt::Debug for TimerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerState")
            .field("interval", &self.interval)
            .field("expiry", &self.expiry)
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// One expired timer, ready to fire. The heap has already been restored
/// (persistent timers re-armed, exhausted ones removed) by the time the
/// caller sees this, so the callback may add or delete timers freely.
pub(crate) struct Expired {
    pub(crate) id: TimerId,
    /// When the timer was scheduled to fire; lateness is `now - scheduled`.
    pub(crate) scheduled: Instant,
    pub(crate) callback: TimerCallback,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    slots: FreeList<TimerState>,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
}

impl Timers {
    /// `repeat`: `0` repeats forever, `1` fires once, `n` fires `n` times.
    pub(crate) fn add(
        &mut self,
        now: Instant,
        interval: Duration,
        repeat: u64,
        callback: TimerCallback,
    ) -> TimerId {
        let expiry = now + interval;
        let id = self.slots.alloc(TimerState {
            interval,
            expiry,
            remaining: (repeat != 0).then(|| repeat),
            callback,
        });
        self.heap.push(Reverse((expiry, id)));
        id
    }

    /// Returns `false` if `id` is stale (already deleted or exhausted).
    pub(crate) fn remove(&mut self, id: TimerId) -> bool {
        self.slots.dealloc(id).is_some()
    }

    /// Time until the earliest live expiry, clamped at zero; `None` when no
    /// timer is armed.
    pub(crate) fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.drop_stale_top();
        self.heap
            .peek()
            .map(|Reverse((expiry, _))| expiry.saturating_duration_since(now))
    }

    /// Pops every entry due at `now` and returns the batch in expiry order.
    ///
    /// Re-arming happens here, before any callback runs: the entire batch
    /// is collected first, so a persistent timer fires at most once per
    /// drain even when it is overdue by several intervals (it catches up
    /// across subsequent iterations instead of spinning inside one).
    pub(crate) fn expire(&mut self, now: Instant) -> SmallVec<[Expired; 4]> {
        // Collect the due entries before re-arming any of them: an entry
        // re-pushed with an expiry still in the past must wait for the
        // next drain, or an overdue timer would burn the whole backlog
        // (or, with a zero interval, spin forever) inside one call.
        let mut due: SmallVec<[(Instant, TimerId); 4]> = SmallVec::new();
        loop {
            self.drop_stale_top();
            match self.heap.peek() {
                Some(Reverse((expiry, _))) if *expiry <= now => {}
                _ => break,
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            due.push(entry);
        }

        let mut batch = SmallVec::new();
        for (scheduled, id) in due {
            let state = self.slots.get_mut(id).unwrap();
            let callback = Rc::clone(&state.callback);
            let rearm = match &mut state.remaining {
                None => true,
                Some(n) if *n > 1 => {
                    *n -= 1;
                    true
                }
                Some(_) => false,
            };
            if rearm {
                // `+= interval`, not `now + interval`: callback latency must
                // not accumulate as drift.
                state.expiry += state.interval;
                let expiry = state.expiry;
                self.heap.push(Reverse((expiry, id)));
            } else {
                self.slots.dealloc(id);
            }

            batch.push(Expired {
                id,
                scheduled,
                callback,
            });
        }
        batch
    }

    fn drop_stale_top(&mut self) {
        while let Some(Reverse((expiry, id))) = self.heap.peek() {
            match self.slots.get(*id) {
                Some(state) if state.expiry == *expiry => return,
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn noop() -> TimerCallback {
        Rc::new(RefCell::new(|| {}))
    }

    #[test]
    fn oneshot_fires_once_and_vanishes() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        let id = timers.add(t0, Duration::from_millis(10), 1, noop());

        assert!(timers.expire(t0).is_empty());
        let batch = timers.expire(t0 + Duration::from_millis(10));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);

        assert!(timers.expire(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_timeout(t0), None);
        assert!(!timers.remove(id));
    }

    #[test]
    fn persistent_rearm_is_drift_free() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        timers.add(t0, Duration::from_millis(10), 0, noop());

        // Drain late by 3ms each round; expiries stay on the 10ms grid.
        let batch = timers.expire(t0 + Duration::from_millis(13));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].scheduled, t0 + Duration::from_millis(10));

        let batch = timers.expire(t0 + Duration::from_millis(23));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].scheduled, t0 + Duration::from_millis(20));
    }

    #[test]
    fn counted_repeat_stops_after_n_fires() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        timers.add(t0, Duration::from_millis(1), 3, noop());

        let mut fired = 0;
        for ms in 1..10 {
            fired += timers.expire(t0 + Duration::from_millis(ms)).len();
        }
        assert_eq!(fired, 3);
    }

    #[test]
    fn expiry_order_is_preserved_within_a_batch() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        let late = timers.add(t0, Duration::from_millis(20), 1, noop());
        let early = timers.add(t0, Duration::from_millis(5), 1, noop());

        let batch = timers.expire(t0 + Duration::from_millis(30));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, early);
        assert_eq!(batch[1].id, late);
    }

    #[test]
    fn removed_timer_never_fires() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        let id = timers.add(t0, Duration::from_millis(5), 0, noop());

        assert!(timers.remove(id));
        assert!(!timers.remove(id));
        assert!(timers.expire(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_timeout(t0), None);
    }

    #[test]
    fn overdue_persistent_timer_fires_once_per_drain() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        timers.add(t0, Duration::from_millis(1), 0, noop());

        // 50ms overdue: one fire now, catch-up happens across later drains
        // rather than spinning inside this one.
        let now = t0 + Duration::from_millis(50);
        assert_eq!(timers.expire(now).len(), 1);
        assert_eq!(timers.next_timeout(now), Some(Duration::ZERO));
        assert_eq!(timers.expire(now).len(), 1);
    }

    #[test]
    fn next_timeout_skips_deleted_entries() {
        let mut timers = Timers::default();
        let t0 = Instant::now();
        let near = timers.add(t0, Duration::from_millis(5), 1, noop());
        timers.add(t0, Duration::from_millis(50), 1, noop());

        timers.remove(near);
        assert_eq!(
            timers.next_timeout(t0),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn callback_sees_consistent_heap() {
        // The batch is fully re-armed before callbacks run, so a callback
        // may delete its own timer mid-flight.
        let mut timers = Timers::default();
        let t0 = Instant::now();
        let hits = Rc::new(Cell::new(0u32));

        let h = Rc::clone(&hits);
        let cb: TimerCallback = Rc::new(RefCell::new(move || h.set(h.get() + 1)));
        let id = timers.add(t0, Duration::from_millis(1), 0, cb);

        let batch = timers.expire(t0 + Duration::from_millis(1));
        for expired in batch {
            (expired.callback.borrow_mut())();
            assert!(timers.remove(id));
        }
        assert_eq!(hits.get(), 1);
        assert!(timers.expire(t0 + Duration::from_secs(1)).is_empty());
    }
}

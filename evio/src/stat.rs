// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use std::time::{Duration, Instant};

/// Read-only statistics snapshot for one stat window.
///
/// Sample it from the loop's own thread via [`Loop::stat`]; the window
/// restarts on [`Loop::reset_stat`] and on loop entry.
///
/// [`Loop::stat`]: crate::Loop::stat
/// [`Loop::reset_stat`]: crate::Loop::reset_stat
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    /// Time elapsed since the stat window started.
    pub elapsed: Duration,
    /// Loop iterations completed in the window.
    pub loop_count: u64,
    /// Callbacks and deferred tasks dispatched in the window.
    pub dispatch_count: u64,
    /// Accumulated iteration cost.
    pub loop_cost: Duration,
    /// Most expensive single iteration.
    pub peak_loop_cost: Duration,
    /// Deepest the cross-thread run queue has been.
    pub run_in_loop_peak: usize,
    /// Deepest the loop-local run queue has been.
    pub run_next_peak: usize,
}

/// Diagnostic thresholds. Breaching one emits a `log::warn!` line and
/// nothing else; water lines never change control flow.
///
/// All time-like thresholds are plain [`Duration`]s.
#[derive(Debug, Clone, Copy)]
pub struct WaterLine {
    /// Cross-thread run queue depth.
    pub run_in_loop_queue_size: usize,
    /// Loop-local run queue depth.
    pub run_next_queue_size: usize,
    /// Delay between a cross-thread wake request and the queue drain.
    pub wake_delay: Duration,
    /// Cost of one full loop iteration.
    pub loop_cost: Duration,
    /// Cost of one event callback.
    pub event_cb_cost: Duration,
    /// Delay between enqueueing a deferred task and running it.
    pub run_cb_delay: Duration,
    /// Cost of one deferred task.
    pub run_cb_cost: Duration,
    /// Lateness of a timer callback relative to its scheduled expiry.
    pub timer_delay: Duration,
}

impl Default for WaterLine {
    fn default() -> WaterLine {
        WaterLine {
            run_in_loop_queue_size: 1000,
            run_next_queue_size: 1000,
            wake_delay: Duration::from_millis(10),
            loop_cost: Duration::from_millis(100),
            event_cb_cost: Duration::from_millis(50),
            run_cb_delay: Duration::from_millis(10),
            run_cb_cost: Duration::from_millis(50),
            timer_delay: Duration::from_millis(10),
        }
    }
}

/// Mutable accumulator behind [`Stat`]; lives in the loop core.
#[derive(Debug)]
pub(crate) struct StatAcc {
    start: Instant,
    loop_count: u64,
    dispatch_count: u64,
    loop_cost: Duration,
    peak_loop_cost: Duration,
    run_next_peak: usize,
}

impl StatAcc {
    pub(crate) fn new() -> StatAcc {
        StatAcc {
            start: Instant::now(),
            loop_count: 0,
            dispatch_count: 0,
            loop_cost: Duration::ZERO,
            peak_loop_cost: Duration::ZERO,
            run_next_peak: 0,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = StatAcc::new();
    }

    pub(crate) fn record_iteration(&mut self, cost: Duration) {
        self.loop_count += 1;
        self.loop_cost += cost;
        if cost > self.peak_loop_cost {
            self.peak_loop_cost = cost;
        }
    }

    pub(crate) fn record_dispatch(&mut self) {
        self.dispatch_count += 1;
    }

    pub(crate) fn record_next_depth(&mut self, depth: usize) {
        if depth > self.run_next_peak {
            self.run_next_peak = depth;
        }
    }

    /// `run_in_loop_peak` crosses threads and is tracked by the remote
    /// queue; the caller merges it in.
    pub(crate) fn snapshot(&self, run_in_loop_peak: usize) -> Stat {
        Stat {
            elapsed: self.start.elapsed(),
            loop_count: self.loop_count,
            dispatch_count: self.dispatch_count,
            loop_cost: self.loop_cost,
            peak_loop_cost: self.peak_loop_cost,
            run_in_loop_peak,
            run_next_peak: self.run_next_peak,
        }
    }
}

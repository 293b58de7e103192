// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Deferred-task plumbing shared between the loop core and the
//! cross-thread [`Remote`] handle.
//!
//! Two queues exist: the loop-local "next" queue (no locking, drained at
//! the end of every iteration) and the cross-thread "in-loop" queue
//! (mutex-guarded, drained by the wakeup descriptor's read handler). Task
//! ids carry their queue in the type instead of an even/odd convention, so
//! there is no reserved id and no parity arithmetic.

use crate::sys;
use log::{error, warn};
use std::{
    collections::VecDeque,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
    time::Instant,
};

/// Identifies a deferred task for [`Loop::cancel`].
///
/// The variant records which queue the task went to.
///
/// [`Loop::cancel`]: crate::Loop::cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunId {
    /// Submitted with `run_next`: runs after the current callback batch.
    Next(u64),
    /// Submitted with `run_in_loop`: runs at the next loop boundary.
    InLoop(u64),
}

/// A queued task, unified across both queues once it reaches the loop
/// thread.
pub(crate) struct Task {
    pub(crate) id: RunId,
    pub(crate) enqueued: Instant,
    pub(crate) label: String,
    pub(crate) f: Box<dyn FnOnce()>,
}

struct RemoteTask {
    id: u64,
    enqueued: Instant,
    label: String,
    f: Box<dyn FnOnce() + Send>,
}

impl RemoteTask {
    fn into_task(self) -> Task {
        Task {
            id: RunId::InLoop(self.id),
            enqueued: self.enqueued,
            label: self.label,
            f: self.f,
        }
    }
}

#[derive(Default)]
struct RemoteQueue {
    tasks: VecDeque<RemoteTask>,
    /// One wakeup write per drain; further submissions piggyback on it.
    wake_pending: bool,
    wake_sent: Option<Instant>,
}

/// The shared half of the in-loop queue. `Send + Sync`; everything the
/// loop thread does not own outright lives here.
pub(crate) struct RemoteShared {
    queue: Mutex<RemoteQueue>,
    event_fd: RawFd,
    loop_thread: Mutex<Option<ThreadId>>,
    next_id: AtomicU64,
    peak_depth: AtomicUsize,
    depth_water_line: AtomicUsize,
}

impl RemoteShared {
    pub(crate) fn new(depth_water_line: usize) -> std::io::Result<Arc<RemoteShared>> {
        let event_fd = sys::create_eventfd()?;
        Ok(Arc::new(RemoteShared {
            queue: Mutex::new(RemoteQueue::default()),
            event_fd,
            loop_thread: Mutex::new(None),
            next_id: AtomicU64::new(1),
            peak_depth: AtomicUsize::new(0),
            depth_water_line: AtomicUsize::new(depth_water_line),
        }))
    }

    pub(crate) fn event_fd(&self) -> RawFd {
        self.event_fd
    }

    pub(crate) fn submit(&self, f: Box<dyn FnOnce() + Send>, label: &str) -> RunId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut q = self.queue.lock().unwrap();
        q.tasks.push_back(RemoteTask {
            id,
            enqueued: Instant::now(),
            label: label.to_string(),
            f,
        });

        let depth = q.tasks.len();
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        let limit = self.depth_water_line.load(Ordering::Relaxed);
        if depth > limit {
            warn!(
                "run_in_loop queue depth {} exceeds water line {} (task {:?})",
                depth, limit, label
            );
        }

        if !q.wake_pending {
            q.wake_pending = true;
            q.wake_sent = Some(Instant::now());
            if let Err(e) = sys::write_eventfd(self.event_fd) {
                // Degraded but alive: the next natural wakeup drains us.
                error!("wakeup eventfd write failed: {}", e);
            }
        }
        RunId::InLoop(id)
    }

    /// Swaps the whole queue into `out`. Returns the timestamp of the wake
    /// request the drain is answering, if any.
    pub(crate) fn take_all(&self, out: &mut VecDeque<Task>) -> Option<Instant> {
        let mut q = self.queue.lock().unwrap();
        q.wake_pending = false;
        out.extend(q.tasks.drain(..).map(RemoteTask::into_task));
        q.wake_sent.take()
    }

    pub(crate) fn cancel(&self, id: u64) -> bool {
        let mut q = self.queue.lock().unwrap();
        match q.tasks.iter().position(|t| t.id == id) {
            Some(i) => {
                q.tasks.remove(i);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().tasks.is_empty()
    }

    pub(crate) fn set_loop_thread(&self, id: Option<ThreadId>) {
        *self.loop_thread.lock().unwrap() = id;
    }

    pub(crate) fn is_in_loop_thread(&self) -> bool {
        *self.loop_thread.lock().unwrap() == Some(thread::current().id())
    }

    /// Loop-thread-only APIs are also legal before the loop is bound to
    /// any thread (submissions queued ahead of `run_loop`).
    pub(crate) fn is_loop_thread_or_unbound(&self) -> bool {
        match *self.loop_thread.lock().unwrap() {
            None => true,
            Some(id) => id == thread::current().id(),
        }
    }

    pub(crate) fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_peak_depth(&self) {
        self.peak_depth.store(0, Ordering::Relaxed);
    }

    pub(crate) fn set_depth_water_line(&self, limit: usize) {
        self.depth_water_line.store(limit, Ordering::Relaxed);
    }
}

impl Drop for RemoteShared {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.event_fd);
    }
}

/// Cross-thread submitter for a [`Loop`], obtained from [`Loop::remote`].
///
/// Cloneable and `Send + Sync`; this is the only way to hand work to a
/// loop from another thread.
///
/// [`Loop`]: crate::Loop
/// [`Loop::remote`]: crate::Loop::remote
#[derive(Clone)]
pub struct Remote {
    shared: Arc<RemoteShared>,
}

impl Remote {
    pub(crate) fn new(shared: Arc<RemoteShared>) -> Remote {
        Remote { shared }
    }

    /// Appends `f` to the loop's cross-thread queue and wakes the loop if
    /// it is blocked in its wait call.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static, label: &str) -> RunId {
        self.shared.submit(Box::new(f), label)
    }

    /// Whether the calling thread is the thread currently running the loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Remote { .. }")
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! The reactor core.
//!
//! [`Loop`] composes the backend-independent engine room (run queues,
//! timer heap, signal fan-out, statistics) with one OS polling engine
//! chosen at construction time. A loop iteration is: wait (bounded by the
//! earliest timer, or not at all when sync work is queued), fire expired
//! timers, dispatch the ready-descriptor batch, then drain deferred tasks.
//!
//! One OS thread drives a `Loop`; dispatch is cooperative and callbacks
//! run to completion. The only cross-thread doors are [`Loop::remote`]
//! (mutex-guarded queue plus an eventfd wake) and the signal self-pipe.

use crate::{
    error::{Error, Result},
    events::{EventMode, FdEvent, FdEventInner, Readiness, SignalEvent, SignalEventInner, TimerEvent},
    runqueue::{Remote, RemoteShared, RunId, Task},
    signals,
    stat::{Stat, StatAcc, WaterLine},
    sys::{self, Engine, ReadyEvent},
    timers::{TimerCallback, TimerId, Timers},
};
use ahash::AHashMap;
use log::{error, warn};
use nix::sys::signal::Signal;
use smallvec::SmallVec;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt, io,
    os::unix::io::RawFd,
    rc::{Rc, Weak},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// How long [`Loop::run_loop`] keeps going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One pass through the iteration, then return.
    Once,
    /// Iterate until [`Loop::exit_loop`] stops the loop.
    Forever,
}

const CLEANUP_MAX_PASSES: usize = 100;

/// Per-descriptor aggregation shared by every event watching one fd.
///
/// The summed watcher counts, not any single event, decide what the engine
/// registers: a zero-to-nonzero transition adds the descriptor, nonzero to
/// nonzero modifies it, nonzero to zero removes it.
pub(crate) struct FdShared {
    fd: RawFd,
    read: Cell<u32>,
    write: Cell<u32>,
    except: Cell<u32>,
    watchers: RefCell<Vec<Weak<FdEventInner>>>,
}

impl FdShared {
    fn new(fd: RawFd) -> FdShared {
        FdShared {
            fd,
            read: Cell::new(0),
            write: Cell::new(0),
            except: Cell::new(0),
            watchers: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn aggregate(&self) -> Readiness {
        let mut mask = Readiness::empty();
        if self.read.get() > 0 {
            mask |= Readiness::READ;
        }
        if self.write.get() > 0 {
            mask |= Readiness::WRITE;
        }
        if self.except.get() > 0 {
            mask |= Readiness::EXCEPT;
        }
        mask
    }

    pub(crate) fn add_interest(&self, mask: Readiness) {
        if mask.contains(Readiness::READ) {
            self.read.set(self.read.get() + 1);
        }
        if mask.contains(Readiness::WRITE) {
            self.write.set(self.write.get() + 1);
        }
        if mask.contains(Readiness::EXCEPT) {
            self.except.set(self.except.get() + 1);
        }
    }

    pub(crate) fn remove_interest(&self, mask: Readiness) {
        if mask.contains(Readiness::READ) {
            self.read.set(self.read.get().saturating_sub(1));
        }
        if mask.contains(Readiness::WRITE) {
            self.write.set(self.write.get().saturating_sub(1));
        }
        if mask.contains(Readiness::EXCEPT) {
            self.except.set(self.except.get().saturating_sub(1));
        }
    }

    pub(crate) fn add_watcher(&self, watcher: &Rc<FdEventInner>) {
        self.watchers.borrow_mut().push(Rc::downgrade(watcher));
    }

    pub(crate) fn remove_watcher(&self, watcher: &Rc<FdEventInner>) {
        let target = Rc::downgrade(watcher);
        self.watchers
            .borrow_mut()
            .retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.borrow().iter().filter(|w| w.strong_count() > 0).count()
    }

    fn snapshot_watchers(&self) -> SmallVec<[Rc<FdEventInner>; 4]> {
        self.watchers.borrow().iter().filter_map(Weak::upgrade).collect()
    }
}

struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    event: Option<FdEvent>,
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        // The fd event must unregister before its descriptor dies.
        self.event.take();
        let _ = nix::unistd::close(self.read_fd);
        let _ = nix::unistd::close(self.write_fd);
    }
}

pub(crate) struct LoopInner {
    self_weak: Weak<LoopInner>,
    engine: RefCell<Box<dyn Engine>>,
    engine_name: &'static str,

    fd_table: RefCell<AHashMap<RawFd, Rc<FdShared>>>,
    timers: RefCell<Timers>,

    next_queue: RefCell<VecDeque<Task>>,
    /// The batch currently being drained. A reactor field, not a local:
    /// `cancel` must still find a task that was swapped out but has not
    /// executed yet.
    in_flight: RefCell<VecDeque<Task>>,
    next_seq: Cell<u64>,
    remote: Arc<RemoteShared>,
    wakeup_event: RefCell<Option<FdEvent>>,

    signal_pipe: RefCell<Option<SignalPipe>>,
    signal_subs: RefCell<AHashMap<i32, Vec<Weak<SignalEventInner>>>>,

    running: Cell<bool>,
    in_run_loop: Cell<bool>,
    exit_timer: Cell<Option<TimerId>>,

    stats: RefCell<StatAcc>,
    water_line: Cell<WaterLine>,
    /// Live user-created event handles; must reach zero before the loop
    /// may be dropped.
    handles: Cell<usize>,
}

impl LoopInner {
    pub(crate) fn count_handle(&self, created: bool) {
        let n = self.handles.get();
        self.handles.set(if created { n + 1 } else { n - 1 });
    }

    fn this(&self) -> Rc<LoopInner> {
        self.self_weak.upgrade().expect("loop core vanished mid-call")
    }

    // ---- deferred tasks ----

    pub(crate) fn run_next_inner(&self, f: Box<dyn FnOnce()>, label: &str) -> RunId {
        assert!(
            self.remote.is_loop_thread_or_unbound(),
            "run_next called from a thread that is not running this loop"
        );
        let seq = self.next_seq.get() + 1;
        self.next_seq.set(seq);
        let id = RunId::Next(seq);

        let depth = {
            let mut q = self.next_queue.borrow_mut();
            q.push_back(Task {
                id,
                enqueued: Instant::now(),
                label: label.to_string(),
                f,
            });
            q.len()
        };
        self.stats.borrow_mut().record_next_depth(depth);
        let limit = self.water_line.get().run_next_queue_size;
        if depth > limit {
            warn!(
                "run_next queue depth {} exceeds water line {} (task {:?})",
                depth, limit, label
            );
        }
        id
    }

    fn cancel(&self, id: RunId) -> bool {
        // The in-flight batch first: a running task may cancel a sibling
        // that was swapped out with it.
        {
            let mut batch = self.in_flight.borrow_mut();
            if let Some(i) = batch.iter().position(|t| t.id == id) {
                batch.remove(i);
                return true;
            }
        }
        match id {
            RunId::Next(_) => {
                let mut q = self.next_queue.borrow_mut();
                match q.iter().position(|t| t.id == id) {
                    Some(i) => {
                        q.remove(i);
                        true
                    }
                    None => false,
                }
            }
            RunId::InLoop(n) => self.remote.cancel(n),
        }
    }

    fn execute_task(&self, task: Task) {
        let wl = self.water_line.get();
        let delay = task.enqueued.elapsed();
        if delay > wl.run_cb_delay {
            warn!(
                "task {:?} ({:?}) waited {:?} before running, water line {:?}",
                task.id, task.label, delay, wl.run_cb_delay
            );
        }
        let start = Instant::now();
        (task.f)();
        let cost = start.elapsed();
        if cost > wl.run_cb_cost {
            warn!(
                "task {:?} ({:?}) ran for {:?}, water line {:?}",
                task.id, task.label, cost, wl.run_cb_cost
            );
        }
        self.stats.borrow_mut().record_dispatch();
    }

    /// Executes everything in the in-flight batch. Tasks submitted while
    /// the batch runs land in the live queues and wait for the next pass;
    /// a self-resubmitting task therefore runs once per iteration instead
    /// of starving the loop.
    fn run_in_flight(&self) {
        loop {
            let task = match self.in_flight.borrow_mut().pop_front() {
                Some(t) => t,
                None => break,
            };
            self.execute_task(task);
        }
    }

    fn drain_in_loop_queue(&self) {
        let wake_sent = {
            let mut batch = self.in_flight.borrow_mut();
            self.remote.take_all(&mut batch)
        };
        if let Some(sent) = wake_sent {
            let delay = sent.elapsed();
            let limit = self.water_line.get().wake_delay;
            if delay > limit {
                warn!("cross-thread wake took {:?}, water line {:?}", delay, limit);
            }
        }
        self.run_in_flight();
    }

    fn drain_next_queue(&self) {
        {
            let mut live = self.next_queue.borrow_mut();
            let mut batch = self.in_flight.borrow_mut();
            batch.extend(live.drain(..));
        }
        self.run_in_flight();
    }

    /// Repeated bounded drain so no queued task is silently dropped at
    /// shutdown, while an accidental resubmission cycle cannot hang it.
    fn cleanup(&self) {
        for pass in 0..CLEANUP_MAX_PASSES {
            let drained = {
                let mut batch = self.in_flight.borrow_mut();
                self.remote.take_all(&mut batch);
                let mut live = self.next_queue.borrow_mut();
                batch.extend(live.drain(..));
                batch.len()
            };
            if drained == 0 {
                return;
            }
            self.run_in_flight();
            if pass == CLEANUP_MAX_PASSES - 1 {
                warn!(
                    "task queues still refilling after {} cleanup passes; giving up",
                    CLEANUP_MAX_PASSES
                );
            }
        }
    }

    // ---- timers ----

    pub(crate) fn add_timer(
        &self,
        interval: Duration,
        repeat: u64,
        callback: TimerCallback,
    ) -> TimerId {
        self.timers.borrow_mut().add(Instant::now(), interval, repeat, callback)
    }

    pub(crate) fn delete_timer(&self, id: TimerId) -> bool {
        self.timers.borrow_mut().remove(id)
    }

    fn handle_expired_timers(&self) {
        let now = Instant::now();
        let batch = self.timers.borrow_mut().expire(now);
        if batch.is_empty() {
            return;
        }
        let wl = self.water_line.get();
        for expired in batch {
            let late = now.saturating_duration_since(expired.scheduled);
            if late > wl.timer_delay {
                warn!("timer fired {:?} late, water line {:?}", late, wl.timer_delay);
            }
            let start = Instant::now();
            (expired.callback.borrow_mut())();
            let cost = start.elapsed();
            if cost > wl.event_cb_cost {
                warn!("timer callback ran for {:?}, water line {:?}", cost, wl.event_cb_cost);
            }
            self.stats.borrow_mut().record_dispatch();
        }
    }

    fn exit_loop(&self, wait: Duration) {
        if let Some(old) = self.exit_timer.take() {
            self.delete_timer(old);
        }
        if wait.is_zero() {
            self.running.set(false);
            return;
        }
        let weak = self.self_weak.clone();
        let callback: TimerCallback = Rc::new(RefCell::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.exit_timer.set(None);
                inner.running.set(false);
            }
        }));
        let id = self.add_timer(wait, 1, callback);
        self.exit_timer.set(Some(id));
    }

    // ---- descriptor table ----

    pub(crate) fn fd_shared(&self, fd: RawFd) -> Rc<FdShared> {
        Rc::clone(
            self.fd_table
                .borrow_mut()
                .entry(fd)
                .or_insert_with(|| Rc::new(FdShared::new(fd))),
        )
    }

    /// Drops the table entry once nothing watches the descriptor anymore.
    pub(crate) fn release_fd_shared(&self, shared: &Rc<FdShared>) {
        if shared.watcher_count() == 0 {
            let mut table = self.fd_table.borrow_mut();
            if let Some(cur) = table.get(&shared.fd()) {
                if Rc::ptr_eq(cur, shared) {
                    table.remove(&shared.fd());
                }
            }
        }
    }

    pub(crate) fn update_fd_registration(
        &self,
        fd: RawFd,
        old: Readiness,
        new: Readiness,
    ) -> io::Result<()> {
        let mut engine = self.engine.borrow_mut();
        if old == new {
            Ok(())
        } else if old.is_empty() {
            engine.add(fd, new)
        } else if new.is_empty() {
            engine.remove(fd)
        } else {
            engine.modify(fd, new)
        }
    }

    fn dispatch_ready(&self, ev: &ReadyEvent) {
        let shared = match self.fd_table.borrow().get(&ev.fd) {
            Some(s) => Rc::clone(s),
            None => return,
        };
        // Snapshot before iterating: a callback may disable or drop a
        // sibling watcher of the same descriptor.
        let watchers = shared.snapshot_watchers();
        let wl = self.water_line.get();
        for watcher in watchers {
            if !watcher.wants(ev.readiness) {
                continue;
            }
            let start = Instant::now();
            watcher.dispatch(ev.readiness);
            let cost = start.elapsed();
            if cost > wl.event_cb_cost {
                warn!(
                    "fd {} callback ({:?}) ran for {:?}, water line {:?}",
                    ev.fd,
                    watcher.label(),
                    cost,
                    wl.event_cb_cost
                );
            }
            self.stats.borrow_mut().record_dispatch();
        }
    }

    /// The engine shed this descriptor (stale/closed); clear every watcher
    /// without touching the engine again.
    fn force_disable_fd(&self, fd: RawFd) {
        let shared = match self.fd_table.borrow_mut().remove(&fd) {
            Some(s) => s,
            None => return,
        };
        warn!("force-disabling watchers of invalid fd {}", fd);
        for watcher in shared.snapshot_watchers() {
            watcher.force_disable();
        }
    }

    // ---- signals ----

    fn ensure_signal_pipe(&self) -> Result<()> {
        if self.signal_pipe.borrow().is_some() {
            return Ok(());
        }
        let this = self.this();
        let (read_fd, write_fd) = sys::create_pipe()?;

        let event = FdEvent::new_internal(&this, "signal-pipe");
        let weak = self.self_weak.clone();
        event.set_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_signal();
            }
        });
        let armed = event
            .init(read_fd, Readiness::READ, EventMode::Persist)
            .and_then(|_| event.enable());
        if let Err(e) = armed {
            drop(event);
            let _ = nix::unistd::close(read_fd);
            let _ = nix::unistd::close(write_fd);
            return Err(e);
        }

        *self.signal_pipe.borrow_mut() = Some(SignalPipe {
            read_fd,
            write_fd,
            event: Some(event),
        });
        Ok(())
    }

    pub(crate) fn subscribe_signal(
        &self,
        signo: Signal,
        subscriber: &Rc<SignalEventInner>,
    ) -> Result<()> {
        self.ensure_signal_pipe()?;
        let write_fd = self.signal_pipe.borrow().as_ref().unwrap().write_fd;

        let mut subs = self.signal_subs.borrow_mut();
        let raw = signo as i32;
        // This loop's pipe goes into the global table once per signal
        // number, with the first local subscriber.
        if subs.get(&raw).map_or(true, |l| l.is_empty()) {
            signals::register(signo, write_fd)?;
        }
        subs.entry(raw).or_default().push(Rc::downgrade(subscriber));
        Ok(())
    }

    pub(crate) fn unsubscribe_signal(&self, signo: Signal, subscriber: &Rc<SignalEventInner>) {
        let target = Rc::downgrade(subscriber);
        let mut subs = self.signal_subs.borrow_mut();
        let mut emptied = false;
        if let Some(list) = subs.get_mut(&(signo as i32)) {
            list.retain(|w| w.strong_count() > 0 && !w.ptr_eq(&target));
            if list.is_empty() {
                subs.remove(&(signo as i32));
                emptied = true;
            }
        }
        if emptied {
            if let Some(pipe) = self.signal_pipe.borrow().as_ref() {
                signals::unregister(signo, pipe.write_fd);
            }
        }
        let none_left = subs.is_empty();
        drop(subs);

        if none_left && self.signal_pipe.borrow().is_some() {
            // Defer: this path is reachable from inside the pipe's own
            // read callback, which must not free the event under itself.
            let weak = self.self_weak.clone();
            self.run_next_inner(
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.teardown_signal_pipe();
                    }
                }),
                "signal-pipe-teardown",
            );
        }
    }

    fn teardown_signal_pipe(&self) {
        if !self.signal_subs.borrow().is_empty() {
            // Something re-subscribed between the unsubscribe and now.
            return;
        }
        let pipe = self.signal_pipe.borrow_mut().take();
        drop(pipe);
    }

    fn on_signal(&self) {
        let read_fd = match self.signal_pipe.borrow().as_ref() {
            Some(p) => p.read_fd,
            None => return,
        };

        // Drain the whole backlog in one batch; several signals may have
        // queued while the loop was busy.
        let mut pending: SmallVec<[i32; 8]> = SmallVec::new();
        let mut buf = [0i32; 32];
        loop {
            let n = unsafe {
                libc::read(
                    read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    std::mem::size_of_val(&buf),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("signal pipe read failed: {}", err);
                }
                break;
            }
            if n == 0 {
                break;
            }
            let count = n as usize / std::mem::size_of::<i32>();
            pending.extend_from_slice(&buf[..count]);
        }

        let wl = self.water_line.get();
        for raw in pending {
            let signo = match Signal::try_from(raw) {
                Ok(s) => s,
                Err(_) => continue,
            };
            // Snapshot: a subscriber may unsubscribe itself mid-dispatch.
            let snapshot: Vec<Weak<SignalEventInner>> =
                match self.signal_subs.borrow().get(&raw) {
                    Some(list) => list.clone(),
                    None => continue,
                };
            for weak in snapshot {
                let subscriber = match weak.upgrade() {
                    Some(s) => s,
                    None => continue,
                };
                let start = Instant::now();
                subscriber.on_signal(signo);
                let cost = start.elapsed();
                if cost > wl.event_cb_cost {
                    warn!(
                        "signal {:?} callback ran for {:?}, water line {:?}",
                        signo, cost, wl.event_cb_cost
                    );
                }
                self.stats.borrow_mut().record_dispatch();
            }
        }
    }

    // ---- the loop itself ----

    fn wait_timeout(&self) -> Option<Duration> {
        // Never block while sync work is queued.
        if !self.next_queue.borrow().is_empty() || !self.remote.is_empty() {
            return Some(Duration::ZERO);
        }
        self.timers.borrow_mut().next_timeout(Instant::now())
    }

    fn run_loop(&self, mode: RunMode) {
        assert!(!self.in_run_loop.get(), "run_loop called re-entrantly");
        self.in_run_loop.set(true);
        self.remote.set_loop_thread(Some(thread::current().id()));
        self.running.set(mode == RunMode::Forever);
        self.stats.borrow_mut().reset();
        self.remote.reset_peak_depth();

        let mut ready: Vec<ReadyEvent> = Vec::with_capacity(32);
        let mut dead: Vec<RawFd> = Vec::new();
        loop {
            let iteration_start = Instant::now();
            let timeout = self.wait_timeout();
            ready.clear();
            dead.clear();

            let res = {
                let mut engine = self.engine.borrow_mut();
                engine.wait(timeout, &mut ready, &mut dead)
            };
            if let Err(e) = res {
                error!("engine {} wait failed, stopping loop: {}", self.engine_name, e);
                break;
            }
            for fd in dead.drain(..) {
                self.force_disable_fd(fd);
            }

            self.handle_expired_timers();
            for ev in &ready {
                self.dispatch_ready(ev);
            }
            self.drain_next_queue();

            let cost = iteration_start.elapsed();
            let limit = self.water_line.get().loop_cost;
            if cost > limit {
                warn!("loop iteration took {:?}, water line {:?}", cost, limit);
            }
            self.stats.borrow_mut().record_iteration(cost);

            if !self.running.get() {
                break;
            }
        }

        self.running.set(false);
        self.cleanup();
        self.remote.set_loop_thread(None);
        self.in_run_loop.set(false);
    }
}

/// A single-threaded event reactor: descriptor readiness, timers, POSIX
/// signals and deferred tasks multiplexed into one dispatch loop.
///
/// Create event handles with [`new_fd_event`], [`new_timer_event`] and
/// [`new_signal_event`]; every handle must be dropped before the loop is.
/// `Loop` is not `Send`: other threads talk to it through [`remote`].
///
/// [`new_fd_event`]: Loop::new_fd_event
/// [`new_timer_event`]: Loop::new_timer_event
/// [`new_signal_event`]: Loop::new_signal_event
/// [`remote`]: Loop::remote
pub struct Loop {
    inner: Rc<LoopInner>,
}

impl Loop {
    /// A loop on the default engine.
    pub fn new() -> Result<Loop> {
        Loop::build(None)
    }

    /// A loop on a named engine; see [`Loop::engines`] for valid names.
    pub fn with_engine(name: &str) -> Result<Loop> {
        Loop::build(Some(name))
    }

    /// Engine names this build can construct.
    pub fn engines() -> &'static [&'static str] {
        sys::ENGINES
    }

    fn build(name: Option<&str>) -> Result<Loop> {
        let engine = sys::new_engine(name)?;
        let engine_name = engine.name();
        let water_line = WaterLine::default();
        let remote = RemoteShared::new(water_line.run_in_loop_queue_size)?;

        let inner = Rc::new_cyclic(|self_weak| LoopInner {
            self_weak: self_weak.clone(),
            engine: RefCell::new(engine),
            engine_name,
            fd_table: RefCell::new(AHashMap::new()),
            timers: RefCell::new(Timers::default()),
            next_queue: RefCell::new(VecDeque::new()),
            in_flight: RefCell::new(VecDeque::new()),
            next_seq: Cell::new(0),
            remote,
            wakeup_event: RefCell::new(None),
            signal_pipe: RefCell::new(None),
            signal_subs: RefCell::new(AHashMap::new()),
            running: Cell::new(false),
            in_run_loop: Cell::new(false),
            exit_timer: Cell::new(None),
            stats: RefCell::new(StatAcc::new()),
            water_line: Cell::new(water_line),
            handles: Cell::new(0),
        });

        // The wakeup descriptor is a permanent resident: its read handler
        // drains the eventfd and then the cross-thread queue.
        let wakeup = FdEvent::new_internal(&inner, "wakeup");
        wakeup.init(inner.remote.event_fd(), Readiness::READ, EventMode::Persist)?;
        let weak = Rc::downgrade(&inner);
        wakeup.set_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                sys::read_eventfd(inner.remote.event_fd());
                inner.drain_in_loop_queue();
            }
        });
        wakeup.enable()?;
        *inner.wakeup_event.borrow_mut() = Some(wakeup);

        Ok(Loop { inner })
    }

    /// The engine this loop runs on.
    pub fn engine_name(&self) -> &'static str {
        self.inner.engine_name
    }

    /// Blocks the calling thread dispatching events until the loop stops.
    pub fn run_loop(&self, mode: RunMode) {
        self.inner.run_loop(mode);
    }

    /// Stops the loop: immediately when `wait` is zero, otherwise through
    /// a private oneshot timer. Calling again re-arms (and cancels any
    /// previously armed stop).
    pub fn exit_loop(&self, wait: Duration) {
        self.inner.exit_loop(wait);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.inner.remote.is_in_loop_thread()
    }

    /// Thread-safe submission: runs `f` on the loop thread at the next
    /// loop boundary, waking the loop if it is blocked.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static, label: &str) -> RunId {
        self.inner.remote.submit(Box::new(f), label)
    }

    /// Loop-thread only: runs `f` right after the current callback batch.
    pub fn run_next(&self, f: impl FnOnce() + 'static, label: &str) -> RunId {
        self.inner.run_next_inner(Box::new(f), label)
    }

    /// Picks [`run_next`] when called on the running loop's own thread,
    /// [`run_in_loop`] otherwise. The right default when the calling
    /// context is uncertain.
    ///
    /// [`run_next`]: Loop::run_next
    /// [`run_in_loop`]: Loop::run_in_loop
    pub fn run(&self, f: impl FnOnce() + Send + 'static, label: &str) -> RunId {
        if self.inner.running.get() && self.inner.remote.is_in_loop_thread() {
            self.inner.run_next_inner(Box::new(f), label)
        } else {
            self.inner.remote.submit(Box::new(f), label)
        }
    }

    /// Best-effort removal of a queued task. `true` exactly when the task
    /// existed and will now never run; a task already executing cannot be
    /// cancelled.
    pub fn cancel(&self, id: RunId) -> bool {
        self.inner.cancel(id)
    }

    /// A cloneable `Send + Sync` submitter for other threads.
    pub fn remote(&self) -> Remote {
        Remote::new(Arc::clone(&self.inner.remote))
    }

    pub fn new_fd_event(&self, label: &str) -> FdEvent {
        FdEvent::new(&self.inner, label)
    }

    pub fn new_timer_event(&self, label: &str) -> TimerEvent {
        TimerEvent::new(&self.inner, label)
    }

    pub fn new_signal_event(&self, label: &str) -> SignalEvent {
        SignalEvent::new(&self.inner, label)
    }

    /// Statistics for the current stat window.
    pub fn stat(&self) -> Stat {
        self.inner.stats.borrow().snapshot(self.inner.remote.peak_depth())
    }

    /// Restarts the stat window.
    pub fn reset_stat(&self) {
        self.inner.stats.borrow_mut().reset();
        self.inner.remote.reset_peak_depth();
    }

    pub fn water_line(&self) -> WaterLine {
        self.inner.water_line.get()
    }

    pub fn set_water_line(&self, water_line: WaterLine) {
        self.inner.water_line.set(water_line);
        self.inner
            .remote
            .set_depth_water_line(water_line.run_in_loop_queue_size);
    }

    /// Drains both task queues (bounded), dropping nothing that was
    /// already submitted. Runs automatically when `run_loop` returns.
    pub fn cleanup(&self) {
        self.inner.cleanup();
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        assert_eq!(
            self.inner.handles.get(),
            0,
            "loop dropped while {} event handle(s) are still alive",
            self.inner.handles.get()
        );
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("engine", &self.inner.engine_name)
            .field("running", &self.inner.running.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering::SeqCst},
            Arc,
        },
        time::Duration,
    };

    fn for_each_engine(f: impl Fn(Rc<Loop>)) {
        for engine in Loop::engines() {
            let lp = Rc::new(Loop::with_engine(engine).unwrap());
            assert_eq!(lp.engine_name(), *engine);
            f(lp);
        }
    }

    #[test]
    fn engines_are_enumerable() {
        assert_eq!(Loop::engines(), &["epoll", "select"]);
        assert!(matches!(
            Loop::with_engine("kqueue"),
            Err(Error::UnknownEngine(_))
        ));
    }

    #[test]
    fn is_running_inside_and_outside() {
        for_each_engine(|lp| {
            let timer = lp.new_timer_event("probe");
            timer.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let fired = Rc::new(Cell::new(false));
            let f = Rc::clone(&fired);
            let lp2 = Rc::clone(&lp);
            timer.set_callback(move || {
                f.set(true);
                assert!(lp2.is_running());
                assert!(lp2.is_in_loop_thread());
            });
            timer.enable().unwrap();

            assert!(!lp.is_running());
            lp.exit_loop(Duration::from_millis(50));
            lp.run_loop(RunMode::Forever);

            assert!(fired.get());
            assert!(!lp.is_running());
        });
    }

    #[test]
    fn run_next_inside_loop_runs_before_later_timer() {
        for_each_engine(|lp| {
            let t1 = lp.new_timer_event("t1");
            let t2 = lp.new_timer_event("t2");
            let ran = Rc::new(Cell::new(false));

            t1.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let r = Rc::clone(&ran);
            t1.set_callback(move || {
                let r = Rc::clone(&r);
                lp2.run_next(move || r.set(true), "");
            });
            t1.enable().unwrap();

            t2.init(Duration::from_millis(20), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let r = Rc::clone(&ran);
            let checked = Rc::new(Cell::new(false));
            let c = Rc::clone(&checked);
            t2.set_callback(move || {
                assert!(r.get());
                c.set(true);
                lp2.exit_loop(Duration::ZERO);
            });
            t2.enable().unwrap();

            lp.run_loop(RunMode::Forever);
            assert!(checked.get());
        });
    }

    #[test]
    fn run_next_before_loop_waits_for_the_loop() {
        for_each_engine(|lp| {
            let ran = Rc::new(Cell::new(false));
            let r = Rc::clone(&ran);
            lp.run_next(move || r.set(true), "early");
            // Nothing runs before the loop thread drains it.
            assert!(!ran.get());

            lp.exit_loop(Duration::from_millis(10));
            lp.run_loop(RunMode::Forever);
            assert!(ran.get());
        });
    }

    #[test]
    fn run_in_loop_inside_loop() {
        for_each_engine(|lp| {
            let t1 = lp.new_timer_event("t1");
            let t2 = lp.new_timer_event("t2");
            let ran = Arc::new(AtomicBool::new(false));

            t1.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let r = Arc::clone(&ran);
            t1.set_callback(move || {
                let r = Arc::clone(&r);
                lp2.run_in_loop(move || r.store(true, SeqCst), "");
            });
            t1.enable().unwrap();

            t2.init(Duration::from_millis(25), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let r = Arc::clone(&ran);
            t2.set_callback(move || {
                assert!(r.load(SeqCst));
                lp2.exit_loop(Duration::ZERO);
            });
            t2.enable().unwrap();

            lp.run_loop(RunMode::Forever);
            assert!(ran.load(SeqCst));
        });
    }

    #[test]
    fn run_in_loop_before_loop_runs_in_first_iteration() {
        for_each_engine(|lp| {
            let ran = Arc::new(AtomicBool::new(false));
            let r = Arc::clone(&ran);
            lp.run_in_loop(move || r.store(true, SeqCst), "early");

            let timer = lp.new_timer_event("probe");
            timer.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let r = Arc::clone(&ran);
            timer.set_callback(move || assert!(r.load(SeqCst)));
            timer.enable().unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);
            assert!(ran.load(SeqCst));
        });
    }

    #[test]
    fn cross_thread_wake_beats_the_armed_timer() {
        for_each_engine(|lp| {
            // A distant timer keeps the wait long; the remote submission
            // must not sit out that wait.
            let never = lp.new_timer_event("distant");
            never.init(Duration::from_millis(500), EventMode::Oneshot).unwrap();
            let distant_fired = Arc::new(AtomicBool::new(false));
            let d = Arc::clone(&distant_fired);
            never.set_callback(move || d.store(true, SeqCst));
            never.enable().unwrap();

            let remote = lp.remote();
            assert!(!remote.is_in_loop_thread());
            let woke_after = Arc::new(AtomicU32::new(u32::MAX));
            let w = Arc::clone(&woke_after);
            let started = Instant::now();
            let submitter = thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                remote.run_in_loop(
                    move || {
                        w.store(started.elapsed().as_millis() as u32, SeqCst);
                    },
                    "wake",
                );
            });

            lp.exit_loop(Duration::from_millis(150));
            lp.run_loop(RunMode::Forever);
            submitter.join().unwrap();

            let woke = woke_after.load(SeqCst);
            assert!(woke != u32::MAX, "remote task never ran");
            assert!(woke < 100, "wake took {}ms", woke);
            assert!(!distant_fired.load(SeqCst));

            never.disable().unwrap();
        });
    }

    #[test]
    fn run_picks_the_queue_by_context() {
        for_each_engine(|lp| {
            // Outside the loop `run` must defer through the in-loop queue.
            let before = Arc::new(AtomicBool::new(false));
            let b = Arc::clone(&before);
            match lp.run(move || b.store(true, SeqCst), "before") {
                RunId::InLoop(_) => {}
                id => panic!("expected InLoop id, got {:?}", id),
            }

            // Inside a callback on the loop thread it short-circuits to
            // the next queue.
            let timer = lp.new_timer_event("probe");
            timer.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let inside = Arc::new(AtomicBool::new(false));
            let i = Arc::clone(&inside);
            timer.set_callback(move || {
                let i = Arc::clone(&i);
                match lp2.run(move || i.store(true, SeqCst), "inside") {
                    RunId::Next(_) => {}
                    id => panic!("expected Next id, got {:?}", id),
                }
            });
            timer.enable().unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);
            assert!(before.load(SeqCst));
            assert!(inside.load(SeqCst));
        });
    }

    #[test]
    fn run_order_next_batch_precedes_in_loop_batch() {
        for_each_engine(|lp| {
            let tag = Arc::new(AtomicI32::new(0));
            let timer = lp.new_timer_event("seed");
            timer.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();

            fn step(expect: i32, set: i32, t: &AtomicI32) {
                assert_eq!(t.load(SeqCst), expect);
                t.store(set, SeqCst);
            }

            let lp2 = Rc::clone(&lp);
            let t = Arc::clone(&tag);
            timer.set_callback(move || {
                let t1 = Arc::clone(&t);
                lp2.run_next(move || step(0, 1, &t1), "");
                let t2 = Arc::clone(&t);
                lp2.run_in_loop(move || step(2, 3, &t2), "");
                let t3 = Arc::clone(&t);
                lp2.run_in_loop(move || step(3, 4, &t3), "");
                let t4 = Arc::clone(&t);
                lp2.run_next(move || step(1, 2, &t4), "");
                let t5 = Arc::clone(&t);
                lp2.run_in_loop(move || step(4, 5, &t5), "");
            });
            timer.enable().unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);
            assert_eq!(tag.load(SeqCst), 5);
        });
    }

    #[test]
    fn self_resubmission_runs_once_per_iteration() {
        fn resubmit(lp: Rc<Loop>, count: Rc<Cell<u32>>) {
            let lp2 = Rc::clone(&lp);
            let c = Rc::clone(&count);
            lp.run_next(
                move || {
                    c.set(c.get() + 1);
                    if lp2.is_running() {
                        resubmit(Rc::clone(&lp2), Rc::clone(&c));
                    }
                },
                "resubmit",
            );
        }

        for_each_engine(|lp| {
            let count = Rc::new(Cell::new(0u32));
            resubmit(Rc::clone(&lp), Rc::clone(&count));

            lp.exit_loop(Duration::from_millis(25));
            lp.run_loop(RunMode::Forever);

            let stat = lp.stat();
            let count = count.get();
            assert!(count > 0);
            // One generation per drain: executions cannot outnumber the
            // iterations (plus the final shutdown drain).
            assert!(
                u64::from(count) <= stat.loop_count + 1,
                "{} runs in {} iterations",
                count,
                stat.loop_count
            );
        });
    }

    #[test]
    fn in_loop_self_resubmission_terminates() {
        for_each_engine(|lp| {
            let stop = Arc::new(AtomicBool::new(false));
            let count = Arc::new(AtomicU32::new(0));

            fn resubmit(remote: Remote, stop: Arc<AtomicBool>, count: Arc<AtomicU32>) {
                let r = remote.clone();
                remote.run_in_loop(
                    move || {
                        count.fetch_add(1, SeqCst);
                        if !stop.load(SeqCst) {
                            resubmit(r.clone(), stop, count);
                        }
                    },
                    "resubmit",
                );
            }
            resubmit(lp.remote(), Arc::clone(&stop), Arc::clone(&count));

            let timer = lp.new_timer_event("stopper");
            timer.init(Duration::from_millis(20), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            let s = Arc::clone(&stop);
            timer.set_callback(move || {
                s.store(true, SeqCst);
                lp2.exit_loop(Duration::ZERO);
            });
            timer.enable().unwrap();

            lp.run_loop(RunMode::Forever);
            assert!(count.load(SeqCst) > 0);
        });
    }

    #[test]
    fn cancel_is_precise_and_idempotent() {
        for_each_engine(|lp| {
            let in_loop_ran = Arc::new(AtomicBool::new(false));
            let next_ran = Rc::new(Cell::new(false));

            let r = Arc::clone(&in_loop_ran);
            let in_loop_id = lp.run_in_loop(move || r.store(true, SeqCst), "doomed");
            let r = Rc::clone(&next_ran);
            let next_id = lp.run_next(move || r.set(true), "doomed");

            assert!(lp.cancel(in_loop_id));
            assert!(!lp.cancel(in_loop_id));
            assert!(lp.cancel(next_id));
            assert!(!lp.cancel(next_id));
            assert!(!lp.cancel(RunId::Next(u64::MAX)));
            assert!(!lp.cancel(RunId::InLoop(u64::MAX)));

            lp.exit_loop(Duration::from_millis(10));
            lp.run_loop(RunMode::Forever);
            assert!(!in_loop_ran.load(SeqCst));
            assert!(!next_ran.get());
        });
    }

    #[test]
    fn cancel_reaches_a_sibling_already_swapped_out() {
        for_each_engine(|lp| {
            let victim_ran = Rc::new(Cell::new(false));
            let cancelled = Rc::new(Cell::new(false));

            let lp2 = Rc::clone(&lp);
            let victim_id = Rc::new(Cell::new(None));
            let v = Rc::clone(&victim_id);
            let c = Rc::clone(&cancelled);
            lp.run_next(
                move || {
                    // Both tasks are already in the drained batch here.
                    c.set(lp2.cancel(v.get().unwrap()));
                },
                "killer",
            );
            let r = Rc::clone(&victim_ran);
            victim_id.set(Some(lp.run_next(move || r.set(true), "victim")));

            lp.run_loop(RunMode::Once);
            assert!(cancelled.get());
            assert!(!victim_ran.get());
        });
    }

    #[test]
    fn timer_expiry_ordering() {
        for_each_engine(|lp| {
            let order = Rc::new(RefCell::new(Vec::new()));
            let t1 = lp.new_timer_event("first");
            let t2 = lp.new_timer_event("second");

            // Armed in reverse to make the point.
            t2.init(Duration::from_millis(30), EventMode::Oneshot).unwrap();
            let o = Rc::clone(&order);
            t2.set_callback(move || o.borrow_mut().push(2));
            t2.enable().unwrap();

            t1.init(Duration::from_millis(10), EventMode::Oneshot).unwrap();
            let o = Rc::clone(&order);
            t1.set_callback(move || o.borrow_mut().push(1));
            t1.enable().unwrap();

            lp.exit_loop(Duration::from_millis(60));
            lp.run_loop(RunMode::Forever);
            assert_eq!(*order.borrow(), vec![1, 2]);
        });
    }

    #[test]
    fn timer_self_disable_is_safe_and_final() {
        for_each_engine(|lp| {
            let timer = Rc::new(lp.new_timer_event("self-stopping"));
            timer.init(Duration::from_millis(5), EventMode::Persist).unwrap();
            let fired = Rc::new(Cell::new(0u32));
            let f = Rc::clone(&fired);
            let weak = Rc::downgrade(&timer);
            timer.set_callback(move || {
                f.set(f.get() + 1);
                weak.upgrade().unwrap().disable().unwrap();
            });
            timer.enable().unwrap();

            lp.exit_loop(Duration::from_millis(50));
            lp.run_loop(RunMode::Forever);
            assert_eq!(fired.get(), 1);
            assert!(!timer.is_enabled());
            // Disabling the already-stopped timer stays a no-op success.
            timer.disable().unwrap();
        });
    }

    #[test]
    fn end_to_end_persist_timer_with_delayed_exit() {
        for_each_engine(|lp| {
            let tick = lp.new_timer_event("tick");
            tick.init(Duration::from_millis(10), EventMode::Persist).unwrap();
            let count = Rc::new(Cell::new(0u32));
            let c = Rc::clone(&count);
            tick.set_callback(move || c.set(c.get() + 1));
            tick.enable().unwrap();

            assert!(!lp.is_running());
            lp.exit_loop(Duration::from_millis(100));
            lp.run_loop(RunMode::Forever);
            assert!(!lp.is_running());

            let n = count.get();
            assert!((9..=11).contains(&n), "expected ~10 ticks, got {}", n);

            let stat = lp.stat();
            assert!(stat.loop_count >= u64::from(n));
            assert!(stat.dispatch_count >= u64::from(n));
            assert!(stat.elapsed >= Duration::from_millis(100));

            lp.reset_stat();
            assert_eq!(lp.stat().loop_count, 0);
        });
    }

    #[test]
    fn exit_loop_rearm_replaces_the_armed_stop() {
        for_each_engine(|lp| {
            lp.exit_loop(Duration::from_millis(400));
            lp.exit_loop(Duration::from_millis(20));

            let started = Instant::now();
            lp.run_loop(RunMode::Forever);
            assert!(started.elapsed() < Duration::from_millis(200));
        });
    }

    #[test]
    fn run_loop_once_is_a_single_pass() {
        for_each_engine(|lp| {
            let ran = Rc::new(Cell::new(false));
            let r = Rc::clone(&ran);
            lp.run_next(move || r.set(true), "");

            let started = Instant::now();
            lp.run_loop(RunMode::Once);
            assert!(ran.get());
            assert!(started.elapsed() < Duration::from_millis(100));
        });
    }

    #[test]
    fn fd_events_aggregate_on_one_descriptor() {
        for_each_engine(|lp| {
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            use std::os::unix::io::AsRawFd;
            let watched = b.as_raw_fd();

            // Make `b` readable; its send buffer is empty so it is also
            // writable in the same poll cycle.
            nix::unistd::write(a.as_raw_fd(), b"x").unwrap();

            let reader = lp.new_fd_event("reader");
            reader.init(watched, Readiness::READ, EventMode::Persist).unwrap();
            let reads = Rc::new(Cell::new(0u32));
            let r = Rc::clone(&reads);
            reader.set_callback(move |hit| {
                assert_eq!(hit, Readiness::READ);
                r.set(r.get() + 1);
            });
            reader.enable().unwrap();

            let writer = lp.new_fd_event("writer");
            writer.init(watched, Readiness::WRITE, EventMode::Persist).unwrap();
            let writes = Rc::new(Cell::new(0u32));
            let w = Rc::clone(&writes);
            writer.set_callback(move |hit| {
                assert_eq!(hit, Readiness::WRITE);
                w.set(w.get() + 1);
            });
            writer.enable().unwrap();

            lp.exit_loop(Duration::from_millis(20));
            lp.run_loop(RunMode::Forever);
            assert!(reads.get() > 0);
            assert!(writes.get() > 0);

            // Disabling one watcher must not unhook the other.
            writer.disable().unwrap();
            let reads_before = reads.get();
            let writes_before = writes.get();
            lp.exit_loop(Duration::from_millis(20));
            lp.run_loop(RunMode::Forever);
            assert!(reads.get() > reads_before);
            assert_eq!(writes.get(), writes_before);

            drop(a);
            drop(b);
        });
    }

    #[test]
    fn fd_oneshot_fires_once_on_a_persistently_ready_fd() {
        for_each_engine(|lp| {
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            use std::os::unix::io::AsRawFd;
            nix::unistd::write(a.as_raw_fd(), b"x").unwrap();

            let once = lp.new_fd_event("once");
            once.init(b.as_raw_fd(), Readiness::READ, EventMode::Oneshot).unwrap();
            let hits = Rc::new(Cell::new(0u32));
            let h = Rc::clone(&hits);
            once.set_callback(move |_| h.set(h.get() + 1));
            once.enable().unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);
            assert_eq!(hits.get(), 1);
            assert!(!once.is_enabled());

            drop(a);
            drop(b);
        });
    }

    #[test]
    fn fd_reinit_moves_to_another_descriptor() {
        for_each_engine(|lp| {
            let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
            let (c, d) = std::os::unix::net::UnixStream::pair().unwrap();
            use std::os::unix::io::AsRawFd;

            let ev = lp.new_fd_event("roamer");
            ev.init(b.as_raw_fd(), Readiness::READ, EventMode::Persist).unwrap();
            ev.enable().unwrap();
            assert!(matches!(
                ev.init(d.as_raw_fd(), Readiness::READ, EventMode::Persist),
                Err(Error::AlreadyEnabled)
            ));
            ev.disable().unwrap();
            ev.init(d.as_raw_fd(), Readiness::READ, EventMode::Persist).unwrap();

            let hits = Rc::new(Cell::new(0u32));
            let h = Rc::clone(&hits);
            ev.set_callback(move |_| h.set(h.get() + 1));
            ev.enable().unwrap();

            // Only the *new* descriptor may trigger it.
            nix::unistd::write(a.as_raw_fd(), b"x").unwrap();
            lp.exit_loop(Duration::from_millis(20));
            lp.run_loop(RunMode::Forever);
            assert_eq!(hits.get(), 0);

            nix::unistd::write(c.as_raw_fd(), b"x").unwrap();
            lp.exit_loop(Duration::from_millis(20));
            lp.run_loop(RunMode::Forever);
            assert!(hits.get() > 0);

            drop((a, b, c, d));
        });
    }

    #[test]
    fn signal_fanout_delivers_to_every_subscriber() {
        for_each_engine(|lp| {
            let first = lp.new_signal_event("first");
            let second = lp.new_signal_event("second");
            first.init([Signal::SIGUSR1], EventMode::Persist).unwrap();
            second.init([Signal::SIGUSR1], EventMode::Persist).unwrap();

            let hits1 = Rc::new(Cell::new(0u32));
            let h = Rc::clone(&hits1);
            first.set_callback(move |signo| {
                assert_eq!(signo, Signal::SIGUSR1);
                h.set(h.get() + 1);
            });
            let hits2 = Rc::new(Cell::new(0u32));
            let h = Rc::clone(&hits2);
            second.set_callback(move |_| h.set(h.get() + 1));

            first.enable().unwrap();
            second.enable().unwrap();

            nix::sys::signal::raise(Signal::SIGUSR1).unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);

            assert_eq!(hits1.get(), 1);
            assert_eq!(hits2.get(), 1);

            first.disable().unwrap();
            second.disable().unwrap();
        });
    }

    #[test]
    fn signal_oneshot_survives_a_double_raise() {
        for_each_engine(|lp| {
            let ev = lp.new_signal_event("once");
            ev.init([Signal::SIGUSR2], EventMode::Oneshot).unwrap();
            let hits = Rc::new(Cell::new(0u32));
            let h = Rc::clone(&hits);
            ev.set_callback(move |_| h.set(h.get() + 1));
            ev.enable().unwrap();

            // Both deliveries are queued in the pipe before the loop gets
            // a chance to react; only one callback may come out.
            nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
            nix::sys::signal::raise(Signal::SIGUSR2).unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);
            assert_eq!(hits.get(), 1);
            assert!(!ev.is_enabled());
        });
    }

    #[test]
    fn one_event_spanning_two_signals() {
        for_each_engine(|lp| {
            let ev = lp.new_signal_event("pair");
            ev.init([Signal::SIGCHLD, Signal::SIGCONT], EventMode::Persist)
                .unwrap();
            let seen = Rc::new(RefCell::new(Vec::new()));
            let s = Rc::clone(&seen);
            ev.set_callback(move |signo| s.borrow_mut().push(signo));
            ev.enable().unwrap();

            nix::sys::signal::raise(Signal::SIGCHLD).unwrap();
            nix::sys::signal::raise(Signal::SIGCONT).unwrap();

            lp.exit_loop(Duration::from_millis(30));
            lp.run_loop(RunMode::Forever);

            let seen = seen.borrow();
            assert_eq!(seen.len(), 2);
            assert!(seen.contains(&Signal::SIGCHLD));
            assert!(seen.contains(&Signal::SIGCONT));

            ev.disable().unwrap();
        });
    }

    #[test]
    fn water_line_breaches_change_nothing() {
        for_each_engine(|lp| {
            let mut wl = lp.water_line();
            wl.run_next_queue_size = 0;
            wl.run_cb_delay = Duration::ZERO;
            wl.run_cb_cost = Duration::ZERO;
            wl.loop_cost = Duration::ZERO;
            lp.set_water_line(wl);

            let ran = Rc::new(Cell::new(0u32));
            for _ in 0..4 {
                let r = Rc::clone(&ran);
                lp.run_next(move || r.set(r.get() + 1), "noisy");
            }
            lp.exit_loop(Duration::from_millis(10));
            lp.run_loop(RunMode::Forever);
            assert_eq!(ran.get(), 4);
        });
    }

    #[test]
    fn stat_peaks_track_queue_depths() {
        for_each_engine(|lp| {
            // Submitted from inside the run: the stat window restarts on
            // loop entry.
            let r1 = lp.new_timer_event("seed");
            r1.init(Duration::from_millis(5), EventMode::Oneshot).unwrap();
            let lp2 = Rc::clone(&lp);
            r1.set_callback(move || {
                for _ in 0..3 {
                    lp2.run_in_loop(|| {}, "");
                }
                for _ in 0..5 {
                    lp2.run_next(|| {}, "");
                }
            });
            r1.enable().unwrap();

            lp.exit_loop(Duration::from_millis(20));
            lp.run_loop(RunMode::Forever);

            let stat = lp.stat();
            assert!(stat.run_in_loop_peak >= 3);
            assert!(stat.run_next_peak >= 5);
        });
    }
}


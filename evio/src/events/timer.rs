// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use super::EventMode;
use crate::{
    error::{Error, Result},
    reactor::LoopInner,
    timers::{TimerCallback, TimerId},
};
use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
    time::Duration,
};

pub(crate) struct TimerEventInner {
    label: String,
    owner: Weak<LoopInner>,
    interval: Cell<Duration>,
    oneshot: Cell<bool>,
    initialized: Cell<bool>,
    enabled: Cell<bool>,
    timer: Cell<Option<TimerId>>,
    callback: RefCell<Option<Rc<RefCell<dyn FnMut()>>>>,
    depth: Cell<u32>,
}

impl TimerEventInner {
    fn owner(&self) -> Rc<LoopInner> {
        self.owner.upgrade().expect("timer event outlived its loop")
    }

    fn on_fire(&self) {
        if self.oneshot.get() {
            // The underlying timer self-removed after its single shot.
            self.timer.set(None);
            self.enabled.set(false);
        }
        let callback = self.callback.borrow().clone();
        if let Some(callback) = callback {
            self.depth.set(self.depth.get() + 1);
            (callback.borrow_mut())();
            self.depth.set(self.depth.get() - 1);
        }
    }

    fn disable(&self) -> Result<()> {
        // Covers the already-fired oneshot: nothing to remove, still Ok.
        if !self.enabled.get() {
            return Ok(());
        }
        if let Some(id) = self.timer.take() {
            self.owner().delete_timer(id);
        }
        self.enabled.set(false);
        Ok(())
    }
}

/// Fires a callback after an interval, once or repeatedly.
///
/// Created by [`Loop::new_timer_event`]. A thin wrapper over the loop's
/// timer heap; disabling from inside the callback is safe.
///
/// [`Loop::new_timer_event`]: crate::Loop::new_timer_event
pub struct TimerEvent {
    inner: Rc<TimerEventInner>,
}

impl TimerEvent {
    pub(crate) fn new(owner: &Rc<LoopInner>, label: &str) -> TimerEvent {
        owner.count_handle(true);
        TimerEvent {
            inner: Rc::new(TimerEventInner {
                label: label.to_string(),
                owner: Rc::downgrade(owner),
                interval: Cell::new(Duration::ZERO),
                oneshot: Cell::new(false),
                initialized: Cell::new(false),
                enabled: Cell::new(false),
                timer: Cell::new(None),
                callback: RefCell::new(None),
                depth: Cell::new(0),
            }),
        }
    }

    /// Configures the interval and lifetime mode. Fails while enabled.
    pub fn init(&self, interval: Duration, mode: EventMode) -> Result<()> {
        if self.inner.enabled.get() {
            return Err(Error::AlreadyEnabled);
        }
        self.inner.interval.set(interval);
        self.inner.oneshot.set(mode == EventMode::Oneshot);
        self.inner.initialized.set(true);
        Ok(())
    }

    pub fn set_callback(&self, callback: impl FnMut() + 'static) {
        *self.inner.callback.borrow_mut() = Some(Rc::new(RefCell::new(callback)));
    }

    /// Arms the timer. Idempotent while armed.
    pub fn enable(&self) -> Result<()> {
        if !self.inner.initialized.get() {
            return Err(Error::NotInitialized);
        }
        if self.inner.enabled.get() {
            return Ok(());
        }
        let owner = self.inner.owner();
        let weak = Rc::downgrade(&self.inner);
        let callback: TimerCallback = Rc::new(RefCell::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_fire();
            }
        }));
        let repeat = if self.inner.oneshot.get() { 1 } else { 0 };
        let id = owner.add_timer(self.inner.interval.get(), repeat, callback);
        self.inner.timer.set(Some(id));
        self.inner.enabled.set(true);
        Ok(())
    }

    /// Disarms the timer. A no-op success when already fired or disabled.
    pub fn disable(&self) -> Result<()> {
        self.inner.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl Drop for TimerEvent {
    fn drop(&mut self) {
        assert_eq!(
            self.inner.depth.get(),
            0,
            "timer event {:?} dropped from inside its own callback",
            self.inner.label
        );
        if let Some(owner) = self.inner.owner.upgrade() {
            let _ = self.inner.disable();
            owner.count_handle(false);
        }
    }
}

impl std::fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEvent")
            .field("label", &self.inner.label)
            .field("interval", &self.inner.interval.get())
            .field("enabled", &self.inner.enabled.get())
            .finish()
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use super::EventMode;
use crate::{
    error::{Error, Result},
    reactor::LoopInner,
};
use nix::sys::signal::Signal;
use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

pub(crate) struct SignalEventInner {
    label: String,
    owner: Weak<LoopInner>,
    signals: RefCell<Vec<Signal>>,
    oneshot: Cell<bool>,
    initialized: Cell<bool>,
    enabled: Cell<bool>,
    callback: RefCell<Option<Rc<RefCell<dyn FnMut(Signal)>>>>,
    depth: Cell<u32>,
}

impl SignalEventInner {
    fn owner(&self) -> Rc<LoopInner> {
        self.owner.upgrade().expect("signal event outlived its loop")
    }

    /// Called by the loop while draining its signal pipe. Snapshotted
    /// dispatch means we may be invoked just after a self-unsubscribe;
    /// the enabled check filters that out.
    pub(crate) fn on_signal(self: &Rc<Self>, signo: Signal) {
        if !self.enabled.get() {
            return;
        }
        let callback = self.callback.borrow().clone();
        if let Some(callback) = callback {
            self.depth.set(self.depth.get() + 1);
            (callback.borrow_mut())(signo);
            self.depth.set(self.depth.get() - 1);
        }
        if self.oneshot.get() && self.enabled.get() {
            self.disable();
        }
    }

    fn disable(self: &Rc<Self>) {
        if !self.enabled.get() {
            return;
        }
        let owner = self.owner();
        for signo in self.signals.borrow().iter() {
            owner.unsubscribe_signal(*signo, self);
        }
        self.enabled.set(false);
    }
}

/// Watches one or more POSIX signals.
///
/// Created by [`Loop::new_signal_event`]. Delivery is loop-local: every
/// enabled `SignalEvent` subscribed to a raised signal number gets one
/// callback per delivery, and a previously installed OS handler keeps
/// running (the loop chains to it).
///
/// [`Loop::new_signal_event`]: crate::Loop::new_signal_event
pub struct SignalEvent {
    inner: Rc<SignalEventInner>,
}

impl SignalEvent {
    pub(crate) fn new(owner: &Rc<LoopInner>, label: &str) -> SignalEvent {
        owner.count_handle(true);
        SignalEvent {
            inner: Rc::new(SignalEventInner {
                label: label.to_string(),
                owner: Rc::downgrade(owner),
                signals: RefCell::new(Vec::new()),
                oneshot: Cell::new(false),
                initialized: Cell::new(false),
                enabled: Cell::new(false),
                callback: RefCell::new(None),
                depth: Cell::new(0),
            }),
        }
    }

    /// Configures the watched signal set: a single signal, an array, or
    /// anything iterable. Fails while enabled.
    pub fn init(
        &self,
        signals: impl IntoIterator<Item = Signal>,
        mode: EventMode,
    ) -> Result<()> {
        if self.inner.enabled.get() {
            return Err(Error::AlreadyEnabled);
        }
        let set: Vec<Signal> = signals.into_iter().collect();
        *self.inner.signals.borrow_mut() = set;
        self.inner.oneshot.set(mode == EventMode::Oneshot);
        self.inner.initialized.set(true);
        Ok(())
    }

    pub fn set_callback(&self, callback: impl FnMut(Signal) + 'static) {
        *self.inner.callback.borrow_mut() = Some(Rc::new(RefCell::new(callback)));
    }

    /// Subscribes every configured signal number. The first failure
    /// unsubscribes the numbers this call already registered and reports
    /// the error; an `Err` always means "not fully enabled".
    pub fn enable(&self) -> Result<()> {
        if !self.inner.initialized.get() {
            return Err(Error::NotInitialized);
        }
        if self.inner.enabled.get() {
            return Ok(());
        }
        let owner = self.inner.owner();
        let signals = self.inner.signals.borrow().clone();
        for (i, signo) in signals.iter().enumerate() {
            if let Err(e) = owner.subscribe_signal(*signo, &self.inner) {
                for done in &signals[..i] {
                    owner.unsubscribe_signal(*done, &self.inner);
                }
                return Err(e);
            }
        }
        self.inner.enabled.set(true);
        Ok(())
    }

    /// Unsubscribes everything. Idempotent.
    pub fn disable(&self) -> Result<()> {
        self.inner.disable();
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl Drop for SignalEvent {
    fn drop(&mut self) {
        assert_eq!(
            self.inner.depth.get(),
            0,
            "signal event {:?} dropped from inside its own callback",
            self.inner.label
        );
        if let Some(owner) = self.inner.owner.upgrade() {
            self.inner.disable();
            owner.count_handle(false);
        }
    }
}

impl std::fmt::Debug for SignalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalEvent")
            .field("label", &self.inner.label)
            .field("signals", &self.inner.signals.borrow())
            .field("enabled", &self.inner.enabled.get())
            .finish()
    }
}

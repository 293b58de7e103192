// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
use super::{EventMode, Readiness};
use crate::{
    error::{Error, Result},
    reactor::{FdShared, LoopInner},
};
use log::debug;
use std::{
    cell::{Cell, RefCell},
    os::unix::io::RawFd,
    rc::{Rc, Weak},
};

struct State {
    shared: Rc<FdShared>,
    mask: Readiness,
}

pub(crate) struct FdEventInner {
    label: String,
    owner: Weak<LoopInner>,
    state: RefCell<Option<State>>,
    enabled: Cell<bool>,
    oneshot: Cell<bool>,
    callback: RefCell<Option<Rc<RefCell<dyn FnMut(Readiness)>>>>,
    /// Nonzero while this event's own callback is on the stack.
    depth: Cell<u32>,
}

impl FdEventInner {
    fn owner(&self) -> Rc<LoopInner> {
        self.owner.upgrade().expect("fd event outlived its loop")
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn enable(&self) -> Result<()> {
        if self.enabled.get() {
            return Ok(());
        }
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(Error::NotInitialized)?;
        let owner = self.owner();

        let old = state.shared.aggregate();
        state.shared.add_interest(state.mask);
        let new = state.shared.aggregate();
        if let Err(source) = owner.update_fd_registration(state.shared.fd(), old, new) {
            state.shared.remove_interest(state.mask);
            return Err(Error::Register {
                fd: state.shared.fd(),
                source,
            });
        }
        self.enabled.set(true);
        Ok(())
    }

    pub(crate) fn disable(&self) -> Result<()> {
        if !self.enabled.get() {
            return Ok(());
        }
        let state = self.state.borrow();
        let state = state.as_ref().ok_or(Error::NotInitialized)?;
        let owner = self.owner();

        let old = state.shared.aggregate();
        state.shared.remove_interest(state.mask);
        let new = state.shared.aggregate();
        if let Err(e) = owner.update_fd_registration(state.shared.fd(), old, new) {
            // The descriptor may already be gone; local interest is clear
            // either way.
            debug!("deregistering fd {} failed: {}", state.shared.fd(), e);
        }
        self.enabled.set(false);
        Ok(())
    }

    /// True when an event of readiness `hit` should reach this watcher.
    pub(crate) fn wants(&self, hit: Readiness) -> bool {
        if !self.enabled.get() {
            return false;
        }
        match self.state.borrow().as_ref() {
            Some(state) => state.mask.intersects(hit),
            None => false,
        }
    }

    pub(crate) fn dispatch(&self, hit: Readiness) {
        let masked = match self.state.borrow().as_ref() {
            Some(state) => state.mask & hit,
            None => return,
        };
        let callback = self.callback.borrow().clone();
        if let Some(callback) = callback {
            self.depth.set(self.depth.get() + 1);
            (callback.borrow_mut())(masked);
            self.depth.set(self.depth.get() - 1);
        }
        if self.oneshot.get() && self.enabled.get() {
            let _ = self.disable();
        }
    }

    /// The engine already shed this descriptor; clear local interest
    /// without another engine round-trip.
    pub(crate) fn force_disable(&self) {
        if !self.enabled.get() {
            return;
        }
        if let Some(state) = self.state.borrow().as_ref() {
            state.shared.remove_interest(state.mask);
        }
        self.enabled.set(false);
    }
}

/// Watches a file descriptor for readiness.
///
/// Created by [`Loop::new_fd_event`]. Several `FdEvent`s may watch the
/// same descriptor; the loop aggregates their interest and each gets its
/// own callback.
///
/// [`Loop::new_fd_event`]: crate::Loop::new_fd_event
pub struct FdEvent {
    inner: Rc<FdEventInner>,
    counted: bool,
}

impl FdEvent {
    pub(crate) fn new(owner: &Rc<LoopInner>, label: &str) -> FdEvent {
        owner.count_handle(true);
        FdEvent::build(owner, label, true)
    }

    /// Loop-internal plumbing events (wakeup, signal pipe) are exempt from
    /// the live-handle accounting: the loop owns them outright.
    pub(crate) fn new_internal(owner: &Rc<LoopInner>, label: &str) -> FdEvent {
        FdEvent::build(owner, label, false)
    }

    fn build(owner: &Rc<LoopInner>, label: &str, counted: bool) -> FdEvent {
        FdEvent {
            inner: Rc::new(FdEventInner {
                label: label.to_string(),
                owner: Rc::downgrade(owner),
                state: RefCell::new(None),
                enabled: Cell::new(false),
                oneshot: Cell::new(false),
                callback: RefCell::new(None),
                depth: Cell::new(0),
            }),
            counted,
        }
    }

    /// Binds the event to `fd`, watching for `mask`. Fails while enabled;
    /// re-initializing a disabled event rebinds it (releasing its old
    /// descriptor reference if the fd changed).
    pub fn init(&self, fd: RawFd, mask: Readiness, mode: EventMode) -> Result<()> {
        if self.inner.enabled.get() {
            return Err(Error::AlreadyEnabled);
        }
        let owner = self.inner.owner();
        let mut slot = self.inner.state.borrow_mut();
        if let Some(old) = slot.take() {
            old.shared.remove_watcher(&self.inner);
            owner.release_fd_shared(&old.shared);
        }
        let shared = owner.fd_shared(fd);
        shared.add_watcher(&self.inner);
        *slot = Some(State { shared, mask });
        self.inner.oneshot.set(mode == EventMode::Oneshot);
        Ok(())
    }

    pub fn set_callback(&self, callback: impl FnMut(Readiness) + 'static) {
        *self.inner.callback.borrow_mut() = Some(Rc::new(RefCell::new(callback)));
    }

    /// Starts delivery. Idempotent; registers the descriptor with the
    /// engine if this watcher changes the aggregate interest.
    pub fn enable(&self) -> Result<()> {
        self.inner.enable()
    }

    /// Stops delivery. Idempotent.
    pub fn disable(&self) -> Result<()> {
        self.inner.disable()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    pub fn label(&self) -> &str {
        self.inner.label()
    }
}

impl Drop for FdEvent {
    fn drop(&mut self) {
        assert_eq!(
            self.inner.depth.get(),
            0,
            "fd event {:?} dropped from inside its own callback",
            self.inner.label
        );
        if let Some(owner) = self.inner.owner.upgrade() {
            let _ = self.inner.disable();
            if let Some(state) = self.inner.state.borrow_mut().take() {
                state.shared.remove_watcher(&self.inner);
                owner.release_fd_shared(&state.shared);
            }
            if self.counted {
                owner.count_handle(false);
            }
        }
    }
}

impl std::fmt::Debug for FdEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdEvent")
            .field("label", &self.inner.label)
            .field("enabled", &self.inner.enabled.get())
            .finish()
    }
}

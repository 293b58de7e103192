// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Event handles: the user-facing objects a [`Loop`] hands out.
//!
//! Handles are `!Send`, exclusively owned, and must be dropped before the
//! loop that created them. Each one tracks whether its own callback is on
//! the stack; dropping a handle from inside that callback is a bug in the
//! caller and asserts. Disabling from inside the callback is fine.
//!
//! [`Loop`]: crate::Loop

mod fd;
mod signal;
mod timer;

pub use fd::FdEvent;
pub use signal::SignalEvent;
pub use timer::TimerEvent;

pub(crate) use fd::FdEventInner;
pub(crate) use signal::SignalEventInner;

use bitflags::bitflags;

bitflags! {
    /// Handle-neutral descriptor readiness: what to watch for, and what a
    /// dispatch reports. Engines translate their native flags into this;
    /// hang-up conditions arrive folded into `READ`.
    pub struct Readiness: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXCEPT = 0b100;
    }
}

/// Event lifetime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// Fire once, then auto-disable.
    Oneshot,
    /// Keep firing until explicitly disabled.
    Persist,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_mask_algebra() {
        let rw = Readiness::READ | Readiness::WRITE;
        assert!(rw.contains(Readiness::READ));
        assert!(rw.intersects(Readiness::WRITE));
        assert!(!rw.contains(Readiness::EXCEPT));
        assert_eq!(rw & Readiness::READ, Readiness::READ);
        assert!((Readiness::EXCEPT & rw).is_empty());
    }
}

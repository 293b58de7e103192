// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! Process-wide signal registry.
//!
//! The process has exactly one delivery mechanism per signal number, so
//! some global coordination is unavoidable. The mutable side (install,
//! publish, restore) serializes on one mutex; the data the OS handler
//! touches is a fixed table of atomics, because async-signal context must
//! not lock, allocate, or log. The handler chains to whatever handler was
//! installed before ours, then writes the signal number to every
//! registered self-pipe.

use crate::error::{Error, Result};
use log::debug;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::{
    io,
    os::unix::io::RawFd,
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Mutex, OnceLock,
    },
};

/// Highest signal number we track, exclusive. Covers every classic signal.
const MAX_SIGNUM: usize = 32;
/// How many loops may watch one signal number at once.
const SLOTS_PER_SIGNAL: usize = 16;

#[allow(clippy::declare_interior_mutable_const)]
const VACANT: AtomicI32 = AtomicI32::new(-1);
#[allow(clippy::declare_interior_mutable_const)]
const NO_HANDLER: AtomicUsize = AtomicUsize::new(0);
#[allow(clippy::declare_interior_mutable_const)]
const SLOT_ROW: [AtomicI32; SLOTS_PER_SIGNAL] = [VACANT; SLOTS_PER_SIGNAL];

/// Self-pipe write ends, indexed by signal number. `-1` marks a vacant
/// slot. Read from the handler, written under [`registry`]'s lock.
static NOTIFY_FDS: [[AtomicI32; SLOTS_PER_SIGNAL]; MAX_SIGNUM] = [SLOT_ROW; MAX_SIGNUM];

/// Raw previous plain handler (`fn(c_int)`) per signal; 0 means none.
static PREV_HANDLER: [AtomicUsize; MAX_SIGNUM] = [NO_HANDLER; MAX_SIGNUM];
/// Raw previous `SA_SIGINFO` action per signal; 0 means none.
static PREV_SIGACTION: [AtomicUsize; MAX_SIGNUM] = [NO_HANDLER; MAX_SIGNUM];

struct Entry {
    /// The full original disposition, restored when the last loop leaves.
    prev: SigAction,
    /// How many pipe fds are currently published for this signal.
    pipes: usize,
}

fn registry() -> &'static Mutex<ahash::AHashMap<i32, Entry>> {
    static REGISTRY: OnceLock<Mutex<ahash::AHashMap<i32, Entry>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(ahash::AHashMap::new()))
}

/// The installed OS handler. Async-signal context: only atomics loads,
/// raw `write`, and a chained call to the previous handler.
extern "C" fn dispatch_handler(signo: libc::c_int) {
    let raw = signo as usize;
    if raw >= MAX_SIGNUM {
        return;
    }

    let prev = PREV_HANDLER[raw].load(Ordering::Acquire);
    if prev != 0 {
        let f: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(prev) };
        f(signo);
    }
    let prev_sa = PREV_SIGACTION[raw].load(Ordering::Acquire);
    if prev_sa != 0 {
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(prev_sa) };
        f(signo, std::ptr::null_mut(), std::ptr::null_mut());
    }

    for slot in &NOTIFY_FDS[raw] {
        let fd = slot.load(Ordering::Acquire);
        if fd >= 0 {
            unsafe {
                libc::write(fd, &signo as *const libc::c_int as *const libc::c_void, 4);
            }
        }
    }
}

fn with_signal_blocked<T>(signo: Signal, f: impl FnOnce() -> nix::Result<T>) -> nix::Result<T> {
    let mut mask = SigSet::empty();
    mask.add(signo);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
    let res = f();
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None)?;
    res
}

fn install(signo: Signal) -> Result<SigAction> {
    let raw = signo as i32 as usize;
    let action = SigAction::new(
        SigHandler::Handler(dispatch_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let prev = with_signal_blocked(signo, || unsafe { sigaction(signo, &action) }).map_err(
        |errno| Error::SignalInstall {
            signo: signo as i32,
            source: io::Error::from_raw_os_error(errno as i32),
        },
    )?;

    // Publish the chain target before any pipe fd appears, so the handler
    // never sees fds without the handler it must run first.
    match prev.handler() {
        SigHandler::Handler(f) => PREV_HANDLER[raw].store(f as usize, Ordering::Release),
        SigHandler::SigAction(f) => PREV_SIGACTION[raw].store(f as usize, Ordering::Release),
        SigHandler::SigDfl | SigHandler::SigIgn => {}
    }
    Ok(prev)
}

fn restore(signo: Signal, prev: &SigAction) {
    let raw = signo as i32 as usize;
    let res = with_signal_blocked(signo, || unsafe { sigaction(signo, prev) });
    if let Err(errno) = res {
        debug!("restoring handler for {:?} failed: {}", signo, errno);
    }
    PREV_HANDLER[raw].store(0, Ordering::Release);
    PREV_SIGACTION[raw].store(0, Ordering::Release);
}

/// Publishes `pipe_fd` as a delivery target for `signo`, installing the
/// process-wide handler if this is the first subscription anywhere. On
/// failure the registry is left exactly as found.
pub(crate) fn register(signo: Signal, pipe_fd: RawFd) -> Result<()> {
    let raw = signo as i32 as usize;
    assert!(raw < MAX_SIGNUM, "signal {:?} out of range", signo);

    let mut reg = registry().lock().unwrap();
    let installed_now = !reg.contains_key(&(signo as i32));
    if installed_now {
        let prev = install(signo)?;
        reg.insert(signo as i32, Entry { prev, pipes: 0 });
    }

    let published = NOTIFY_FDS[raw]
        .iter()
        .any(|slot| slot.compare_exchange(-1, pipe_fd, Ordering::AcqRel, Ordering::Acquire).is_ok());
    if !published {
        if installed_now {
            let entry = reg.remove(&(signo as i32)).unwrap();
            restore(signo, &entry.prev);
        }
        return Err(Error::SignalSlotsExhausted(signo as i32));
    }

    reg.get_mut(&(signo as i32)).unwrap().pipes += 1;
    Ok(())
}

/// Withdraws `pipe_fd` from `signo`'s delivery targets; restores the
/// previous OS handler once no loop anywhere subscribes to `signo`.
pub(crate) fn unregister(signo: Signal, pipe_fd: RawFd) {
    let raw = signo as i32 as usize;
    let mut reg = registry().lock().unwrap();

    for slot in &NOTIFY_FDS[raw] {
        if slot
            .compare_exchange(pipe_fd, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }

    if let Some(entry) = reg.get_mut(&(signo as i32)) {
        entry.pipes = entry.pipes.saturating_sub(1);
        if entry.pipes == 0 {
            let entry = reg.remove(&(signo as i32)).unwrap();
            restore(signo, &entry.prev);
        }
    }
}

// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! OS plumbing: raw syscall helpers and the backend (engine) contract.

use crate::{
    error::{Error, Result},
    events::Readiness,
};
use std::{io, os::unix::io::RawFd, time::Duration};

mod epoll;
mod select;

macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub(crate) fn create_eventfd() -> io::Result<RawFd> {
    syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))
}

pub(crate) fn write_eventfd(eventfd: RawFd) -> io::Result<()> {
    let buf = [1u64; 1];
    let ret = syscall!(write(eventfd, &buf as *const u64 as _, 8))?;
    debug_assert_eq!(ret, 8);
    Ok(())
}

/// Drains the eventfd counter. Spurious calls are fine: the descriptor is
/// nonblocking and `EAGAIN` simply means nothing was pending.
pub(crate) fn read_eventfd(eventfd: RawFd) {
    let mut buf = [0u64; 1];
    let _ = syscall!(read(eventfd, &mut buf as *mut u64 as _, 8));
}

pub(crate) fn create_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
    Ok((fds[0], fds[1]))
}

/// `true` if `fd` still names an open descriptor.
pub(crate) fn fd_is_valid(fd: RawFd) -> bool {
    syscall!(fcntl(fd, libc::F_GETFD)).is_ok()
}

/// Milliseconds for the OS wait call, rounded up so a sub-millisecond
/// deadline does not degrade into a busy spin.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = (d.as_nanos() + 999_999) / 1_000_000;
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// One ready descriptor out of a wait call, already translated to the
/// handle-neutral readiness mask.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub(crate) fd: RawFd,
    pub(crate) readiness: Readiness,
}

/// The backend contract: everything engine-specific the shared core needs.
///
/// Registration is driven purely by aggregate watcher-count transitions in
/// the core: zero to nonzero calls `add`, nonzero to nonzero calls
/// `modify`, nonzero to zero calls `remove`. `wait` blocks at most
/// `timeout` (`None` means
/// indefinitely), appends one [`ReadyEvent`] per ready descriptor, and
/// reports descriptors it had to forcibly drop (stale/closed ones it
/// recovered from) through `dead`; an interrupted wait is not an error.
pub(crate) trait Engine {
    fn name(&self) -> &'static str;
    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()>;
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;
    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<ReadyEvent>,
        dead: &mut Vec<RawFd>,
    ) -> io::Result<()>;
}

pub(crate) const ENGINES: &[&str] = &["epoll", "select"];

pub(crate) fn new_engine(name: Option<&str>) -> Result<Box<dyn Engine>> {
    match name {
        None | Some("epoll") => Ok(Box::new(epoll::EpollEngine::new()?)),
        Some("select") => Ok(Box::new(select::SelectEngine::new())),
        Some(other) => Err(Error::UnknownEngine(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_roundtrip() {
        let fd = create_eventfd().unwrap();
        write_eventfd(fd).unwrap();
        write_eventfd(fd).unwrap();
        read_eventfd(fd);
        // Counter fully drained by one read; a second drain is a no-op.
        read_eventfd(fd);
        let _ = nix::unistd::close(fd);
    }

    #[test]
    fn pipe_is_nonblocking() {
        let (r, w) = create_pipe().unwrap();
        let mut buf = [0u8; 16];
        let err = nix::unistd::read(r, &mut buf).unwrap_err();
        assert_eq!(err, nix::errno::Errno::EAGAIN);
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn validity_probe() {
        let (r, w) = create_pipe().unwrap();
        assert!(fd_is_valid(r));
        nix::unistd::close(r).unwrap();
        assert!(!fd_is_valid(r));
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(100))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(10))), 10);
    }

    #[test]
    fn engine_selection() {
        assert_eq!(ENGINES, &["epoll", "select"]);
        assert_eq!(new_engine(None).unwrap().name(), "epoll");
        assert_eq!(new_engine(Some("select")).unwrap().name(), "select");
        assert!(matches!(
            new_engine(Some("kqueue")),
            Err(Error::UnknownEngine(_))
        ));
    }
}

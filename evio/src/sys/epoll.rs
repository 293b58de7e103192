// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! The scalable descriptor-table engine: one `epoll_wait` yields a batch
//! of `(fd, mask)` pairs regardless of how many descriptors are watched.

use super::{Engine, ReadyEvent};
use crate::{error::Error, events::Readiness};
use log::debug;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::{io, os::unix::io::RawFd, time::Duration};

const INITIAL_BATCH: usize = 32;

pub(crate) struct EpollEngine {
    epfd: RawFd,
    /// Ready-event buffer; grows 1.5x whenever a wait fills it completely.
    events: Vec<EpollEvent>,
}

fn interest_to_flags(interest: Readiness) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.contains(Readiness::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if interest.contains(Readiness::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    if interest.contains(Readiness::EXCEPT) {
        flags |= EpollFlags::EPOLLPRI;
    }
    flags
}

fn flags_to_readiness(flags: EpollFlags) -> Readiness {
    let mut readiness = Readiness::empty();
    // Hang-up and error conditions are folded into READ: the reader
    // observes end-of-stream through a zero-length read instead of a
    // separate path, and epoll stops re-signalling a hang-up nobody
    // listens for.
    if flags.intersects(
        EpollFlags::EPOLLIN
            | EpollFlags::EPOLLRDHUP
            | EpollFlags::EPOLLHUP
            | EpollFlags::EPOLLERR,
    ) {
        readiness |= Readiness::READ;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        readiness |= Readiness::WRITE;
    }
    if flags.contains(EpollFlags::EPOLLPRI) {
        readiness |= Readiness::EXCEPT;
    }
    readiness
}

impl EpollEngine {
    pub(crate) fn new() -> Result<EpollEngine, Error> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(Error::from_errno)?;
        Ok(EpollEngine {
            epfd,
            events: vec![EpollEvent::empty(); INITIAL_BATCH],
        })
    }

    fn ctl(&self, op: EpollOp, fd: RawFd, interest: Readiness) -> io::Result<()> {
        let mut ev = EpollEvent::new(interest_to_flags(interest), fd as u64);
        epoll_ctl(self.epfd, op, fd, &mut ev)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }
}

impl Engine for EpollEngine {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(EpollOp::EpollCtlAdd, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.ctl(EpollOp::EpollCtlMod, fd, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<ReadyEvent>,
        _dead: &mut Vec<RawFd>,
    ) -> io::Result<()> {
        let timeout = super::timeout_millis(timeout);
        let n = match epoll_wait(self.epfd, &mut self.events, timeout as isize) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => {
                debug!("epoll_wait interrupted; continuing");
                return Ok(());
            }
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        };

        for ev in &self.events[..n] {
            let readiness = flags_to_readiness(ev.events());
            if !readiness.is_empty() {
                ready.push(ReadyEvent {
                    fd: ev.data() as RawFd,
                    readiness,
                });
            }
        }

        if n == self.events.len() {
            let grown = self.events.len() + self.events.len() / 2;
            self.events.resize(grown, EpollEvent::empty());
        }
        Ok(())
    }
}

impl Drop for EpollEngine {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::create_pipe;

    #[test]
    fn readiness_translation() {
        assert_eq!(
            interest_to_flags(Readiness::READ | Readiness::WRITE),
            EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT
        );
        assert_eq!(
            flags_to_readiness(EpollFlags::EPOLLOUT | EpollFlags::EPOLLPRI),
            Readiness::WRITE | Readiness::EXCEPT
        );
    }

    #[test]
    fn hangup_is_folded_into_read() {
        assert_eq!(flags_to_readiness(EpollFlags::EPOLLHUP), Readiness::READ);
        assert_eq!(flags_to_readiness(EpollFlags::EPOLLERR), Readiness::READ);
        assert_eq!(
            flags_to_readiness(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP),
            Readiness::READ
        );
    }

    #[test]
    fn wait_reports_readable_pipe() {
        let mut engine = EpollEngine::new().unwrap();
        let (r, w) = create_pipe().unwrap();
        engine.add(r, Readiness::READ).unwrap();

        nix::unistd::write(w, b"x").unwrap();

        let mut ready = Vec::new();
        let mut dead = Vec::new();
        engine
            .wait(Some(Duration::from_millis(100)), &mut ready, &mut dead)
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, r);
        assert!(ready[0].readiness.contains(Readiness::READ));
        assert!(dead.is_empty());

        engine.remove(r).unwrap();
        let _ = nix::unistd::close(r);
        let _ = nix::unistd::close(w);
    }

    #[test]
    fn wait_times_out_when_idle() {
        let mut engine = EpollEngine::new().unwrap();
        let mut ready = Vec::new();
        let mut dead = Vec::new();
        engine
            .wait(Some(Duration::from_millis(1)), &mut ready, &mut dead)
            .unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn full_batch_grows_the_buffer() {
        let mut engine = EpollEngine::new().unwrap();
        let before = engine.events.len();

        let mut fds = Vec::new();
        for _ in 0..before {
            let (r, w) = create_pipe().unwrap();
            nix::unistd::write(w, b"x").unwrap();
            engine.add(r, Readiness::READ).unwrap();
            fds.push((r, w));
        }

        let mut ready = Vec::new();
        let mut dead = Vec::new();
        engine
            .wait(Some(Duration::from_millis(100)), &mut ready, &mut dead)
            .unwrap();
        assert_eq!(ready.len(), before);
        assert_eq!(engine.events.len(), before + before / 2);

        for (r, w) in fds {
            let _ = nix::unistd::close(r);
            let _ = nix::unistd::close(w);
        }
    }
}

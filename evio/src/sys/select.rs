// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
//! The readiness-set engine: rebuilds the three `fd_set` bitmasks from the
//! interest table before every wait, then scans candidates on return.
//!
//! `select` cannot say *which* descriptor made it fail with `EBADF`, so
//! recovery probes every tracked descriptor for validity and drops the
//! ones that no longer exist.

use super::{Engine, ReadyEvent};
use crate::events::Readiness;
use ahash::AHashMap;
use log::{debug, warn};
use nix::sys::{
    select::{select, FdSet},
    time::{TimeVal, TimeValLike},
};
use std::{io, os::unix::io::RawFd, time::Duration};

pub(crate) struct SelectEngine {
    interests: AHashMap<RawFd, Readiness>,
}

impl SelectEngine {
    pub(crate) fn new() -> SelectEngine {
        SelectEngine {
            interests: AHashMap::new(),
        }
    }

    /// Probes every tracked descriptor and drops the invalid ones; the
    /// core force-disables their watchers.
    fn recover_from_bad_fd(&mut self, dead: &mut Vec<RawFd>) {
        let stale: Vec<RawFd> = self
            .interests
            .keys()
            .copied()
            .filter(|&fd| !super::fd_is_valid(fd))
            .collect();
        for fd in stale {
            warn!("select: dropping invalid fd {}", fd);
            self.interests.remove(&fd);
            dead.push(fd);
        }
    }
}

impl Engine for SelectEngine {
    fn name(&self) -> &'static str {
        "select"
    }

    fn add(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Readiness) -> io::Result<()> {
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<ReadyEvent>,
        dead: &mut Vec<RawFd>,
    ) -> io::Result<()> {
        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        let mut except_set = FdSet::new();
        let mut nfds = 0;
        for (&fd, &interest) in &self.interests {
            if interest.contains(Readiness::READ) {
                read_set.insert(fd);
            }
            if interest.contains(Readiness::WRITE) {
                write_set.insert(fd);
            }
            if interest.contains(Readiness::EXCEPT) {
                except_set.insert(fd);
            }
            nfds = nfds.max(fd + 1);
        }

        let mut tv;
        let tv_ref = match timeout {
            Some(d) => {
                tv = TimeVal::microseconds((d.as_nanos() / 1_000).min(i64::MAX as u128) as i64);
                Some(&mut tv)
            }
            None => None,
        };

        let n = match select(
            Some(nfds),
            Some(&mut read_set),
            Some(&mut write_set),
            Some(&mut except_set),
            tv_ref,
        ) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => {
                debug!("select interrupted; continuing");
                return Ok(());
            }
            Err(nix::errno::Errno::EBADF) => {
                self.recover_from_bad_fd(dead);
                return Ok(());
            }
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        };
        if n == 0 {
            return Ok(());
        }

        for (&fd, _) in &self.interests {
            let mut readiness = Readiness::empty();
            // A hung-up descriptor reads as ready here too: the zero-length
            // read is the EOF signal, same as the epoll engine.
            if read_set.contains(fd) {
                readiness |= Readiness::READ;
            }
            if write_set.contains(fd) {
                readiness |= Readiness::WRITE;
            }
            if except_set.contains(fd) {
                readiness |= Readiness::EXCEPT;
            }
            if !readiness.is_empty() {
                ready.push(ReadyEvent { fd, readiness });
            }
        }
        Ok(())
    }
}

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use crate::error::PollerError;

use super::interface::{AsPoller, Interest, Readiness};

const EVENT_BATCH: usize = 64;

pub struct EpollPoller {
    epoll: Epoll,
    event_buffer: Vec<EpollEvent>,
    interest: HashMap<RawFd, Interest>,
}

impl EpollPoller {
    pub fn new() -> Result<Self, PollerError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(PollerError::Setup)?;
        Ok(Self {
            epoll,
            event_buffer: vec![EpollEvent::empty(); EVENT_BATCH],
            interest: HashMap::new(),
        })
    }

    fn flags(interest: Interest) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if interest.read {
            flags |= EpollFlags::EPOLLIN;
        }
        if interest.write {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }

    /// Push the interest recorded for `fd` down to the kernel.
    fn sync(&mut self, fd: RawFd, previous: Interest) -> Result<(), PollerError> {
        let interest = self.interest.get(&fd).copied().unwrap_or_default();
        // The descriptor is only borrowed for the duration of the syscall.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

        let result = if interest.is_empty() {
            self.interest.remove(&fd);
            match self.epoll.delete(borrowed) {
                Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
                other => other,
            }
        } else {
            let mut event = EpollEvent::new(Self::flags(interest), fd as u64);
            let attempt = if previous.is_empty() {
                self.epoll.add(borrowed, event)
            } else {
                self.epoll.modify(borrowed, &mut event)
            };
            match attempt {
                // The kernel forgets a descriptor once its last reference is
                // closed, so our view can be stale in either direction.
                Err(Errno::EEXIST) => self.epoll.modify(borrowed, &mut event),
                Err(Errno::ENOENT) => self.epoll.add(borrowed, event),
                other => other,
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(Errno::EBADF) => {
                log::debug!("dropping bad descriptor {fd} from poller");
                self.interest.remove(&fd);
                Ok(())
            }
            Err(e) => Err(PollerError::Os(e)),
        }
    }

    fn update(&mut self, fd: RawFd, f: impl FnOnce(&mut Interest)) -> Result<(), PollerError> {
        let previous = self.interest.get(&fd).copied().unwrap_or_default();
        let mut next = previous;
        f(&mut next);
        if next == previous {
            return Ok(());
        }
        self.interest.insert(fd, next);
        self.sync(fd, previous)
    }
}

impl AsPoller for EpollPoller {
    fn register_readable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.update(fd, |i| i.read = true)
    }

    fn register_writable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.update(fd, |i| i.write = true)
    }

    fn unregister_readable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if !self.interest.contains_key(&fd) {
            return Ok(());
        }
        self.update(fd, |i| i.read = false)
    }

    fn unregister_writable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if !self.interest.contains_key(&fd) {
            return Ok(());
        }
        self.update(fd, |i| i.write = false)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if !self.interest.contains_key(&fd) {
            return Ok(());
        }
        self.update(fd, |i| *i = Interest::default())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Readiness, PollerError> {
        let timeout = EpollTimeout::try_from(timeout).unwrap_or(EpollTimeout::MAX);
        let num_fds = loop {
            match self.epoll.wait(&mut self.event_buffer, timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PollerError::Os(e)),
            }
        };

        let mut ready = Readiness::default();
        for event in &self.event_buffer[..num_fds] {
            let fd = event.data() as RawFd;
            let Some(interest) = self.interest.get(&fd).copied() else {
                continue;
            };
            let flags = event.events();
            let failed = flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP);
            if interest.read && (flags.contains(EpollFlags::EPOLLIN) || failed) {
                ready.readable.push(fd);
            }
            if interest.write && (flags.contains(EpollFlags::EPOLLOUT) || failed) {
                ready.writable.push(fd);
            }
        }
        Ok(ready)
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.interest.contains_key(&fd)
    }
}

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::BTreeMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

use crate::error::PollerError;

use super::interface::{AsPoller, Interest, Readiness};

/// Portable backend on top of `poll(2)`. The interest set is rebuilt into a
/// `pollfd` array on every call, so registration itself never fails.
#[derive(Default)]
pub struct PollPoller {
    interest: BTreeMap<RawFd, Interest>,
}

impl PollPoller {
    pub fn new() -> Result<Self, PollerError> {
        Ok(Self::default())
    }

    fn update(&mut self, fd: RawFd, f: impl FnOnce(&mut Interest)) {
        let entry = self.interest.entry(fd).or_default();
        f(entry);
        if entry.is_empty() {
            self.interest.remove(&fd);
        }
    }
}

impl AsPoller for PollPoller {
    fn register_readable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.update(fd, |i| i.read = true);
        Ok(())
    }

    fn register_writable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.update(fd, |i| i.write = true);
        Ok(())
    }

    fn unregister_readable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if self.interest.contains_key(&fd) {
            self.update(fd, |i| i.read = false);
        }
        Ok(())
    }

    fn unregister_writable(&mut self, fd: RawFd) -> Result<(), PollerError> {
        if self.interest.contains_key(&fd) {
            self.update(fd, |i| i.write = false);
        }
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> Result<(), PollerError> {
        self.interest.remove(&fd);
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Readiness, PollerError> {
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);
        let registered: Vec<(RawFd, Interest)> =
            self.interest.iter().map(|(fd, i)| (*fd, *i)).collect();

        let mut bad = Vec::new();
        let mut ready = Readiness::default();
        {
            let mut fds: Vec<PollFd> = registered
                .iter()
                .map(|(fd, interest)| {
                    let mut flags = PollFlags::empty();
                    if interest.read {
                        flags |= PollFlags::POLLIN | PollFlags::POLLPRI;
                    }
                    if interest.write {
                        flags |= PollFlags::POLLOUT;
                    }
                    // Borrowed only for this call; the owner keeps it open.
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, flags)
                })
                .collect();

            loop {
                match poll(&mut fds, timeout) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(PollerError::Os(e)),
                }
            }

            for ((fd, interest), pollfd) in registered.iter().zip(&fds) {
                let Some(revents) = pollfd.revents() else {
                    continue;
                };
                if revents.contains(PollFlags::POLLNVAL) {
                    bad.push(*fd);
                    continue;
                }
                let failed = revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP);
                if interest.read
                    && (revents.intersects(PollFlags::POLLIN | PollFlags::POLLPRI) || failed)
                {
                    ready.readable.push(*fd);
                }
                if interest.write && (revents.contains(PollFlags::POLLOUT) || failed) {
                    ready.writable.push(*fd);
                }
            }
        }

        for fd in bad {
            log::debug!("dropping bad descriptor {fd} from poller");
            self.interest.remove(&fd);
        }
        Ok(ready)
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.interest.contains_key(&fd)
    }
}

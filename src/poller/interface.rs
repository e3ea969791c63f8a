//! Abstraction over the kernel-backed readiness notification systems.
//!
//! Different operating environments provide different notification systems,
//! each with its own semantics. This interface restricts them to level
//! triggered readable/writable interest on raw descriptors, which every
//! backend can express. Two failure cases are absorbed by the backends:
//!
//! 1) interrupted waits are retried transparently
//! 2) a descriptor the kernel reports as bad is dropped from the interest
//!    set and never reported
//!
//! Anything else surfaces as a `PollerError`.
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::PollerError;

/// Descriptors reported ready by one `poll()`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub readable: Vec<RawFd>,
    pub writable: Vec<RawFd>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

pub trait AsPoller {
    fn register_readable(&mut self, fd: RawFd) -> Result<(), PollerError>;

    fn register_writable(&mut self, fd: RawFd) -> Result<(), PollerError>;

    fn unregister_readable(&mut self, fd: RawFd) -> Result<(), PollerError>;

    fn unregister_writable(&mut self, fd: RawFd) -> Result<(), PollerError>;

    /// Remove all interest in `fd`. Unknown descriptors are ignored.
    fn unregister(&mut self, fd: RawFd) -> Result<(), PollerError>;

    /// Block up to `timeout`; empty readiness means the timeout expired.
    fn poll(&mut self, timeout: Duration) -> Result<Readiness, PollerError>;

    fn is_registered(&self, fd: RawFd) -> bool;
}

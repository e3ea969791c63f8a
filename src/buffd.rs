//! An owned file descriptor with a co-located buffer attached.
//!
//! The supervisor holds the parent side of every child pipe as a `BufFd`.
//! Output pipes are drained into the buffer on readiness; the stdin pipe
//! accumulates pending bytes in the same buffer until the poller says the
//! descriptor is writable. All descriptors are non-blocking, so neither
//! direction can stall the loop.
use nix::errno::Errno;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub const IO_BUFSIZE: usize = 64 * 1024;

/// Result of a single non-blocking read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug)]
pub struct BufFd {
    fd: OwnedFd,
    buffer: Vec<u8>,
    curr_len: usize,
}

impl BufFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self::with_capacity(fd, IO_BUFSIZE)
    }

    pub fn with_capacity(fd: OwnedFd, capacity: usize) -> Self {
        Self {
            fd,
            buffer: vec![0; capacity],
            curr_len: 0,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.curr_len
    }

    pub fn is_empty(&self) -> bool {
        self.curr_len == 0
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.curr_len]
    }

    pub fn read(&mut self) -> Result<ReadOutcome, Errno> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), &mut self.buffer) {
                Ok(0) => {
                    self.curr_len = 0;
                    return Ok(ReadOutcome::Eof);
                }
                Ok(n) => {
                    self.curr_len = n;
                    return Ok(ReadOutcome::Data(n));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    // Readiness was spurious or already consumed; the poller
                    // will report the descriptor again when more arrives.
                    self.curr_len = 0;
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Queue bytes for the write side, growing the buffer as needed.
    pub fn queue(&mut self, data: &[u8]) {
        let end = self.curr_len + data.len();
        if end > self.buffer.len() {
            self.buffer.resize(end, 0);
        }
        self.buffer[self.curr_len..end].copy_from_slice(data);
        self.curr_len = end;
    }

    /// Write as much queued data as the pipe accepts. Returns the number of
    /// bytes still pending.
    pub fn flush(&mut self) -> Result<usize, Errno> {
        while self.curr_len > 0 {
            match nix::unistd::write(&self.fd, &self.buffer[..self.curr_len]) {
                Ok(n) => {
                    self.buffer.copy_within(n..self.curr_len, 0);
                    self.curr_len -= n;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(self.curr_len)
    }
}

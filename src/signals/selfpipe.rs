use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::utils::set_fd_nonblocking;

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // Async-signal-safe: a single write; a full pipe just drops the byte.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// Handlers only write the signal number into a pipe; the loop reads it back.
pub struct SignalReceiver {
    read: OwnedFd,
    _write: OwnedFd,
}

impl SignalReceiver {
    pub fn new(signals: &[Signal]) -> Result<Self, Errno> {
        let (read, write) = nix::unistd::pipe()?;
        set_fd_nonblocking(read.as_raw_fd())?;
        set_fd_nonblocking(write.as_raw_fd())?;
        WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in signals {
            unsafe { sigaction(*signal, &action) }?;
        }
        Ok(Self {
            read,
            _write: write,
        })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    pub fn drain(&mut self) -> Vec<Signal> {
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend(
                    buf[..n]
                        .iter()
                        .filter_map(|signo| Signal::try_from(*signo as i32).ok()),
                ),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    log::error!("failed to read from signal pipe: {e}");
                    break;
                }
            }
        }
        received
    }
}

impl Drop for SignalReceiver {
    fn drop(&mut self) {
        WRITE_FD.store(-1, Ordering::Relaxed);
    }
}

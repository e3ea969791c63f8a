use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use std::os::fd::{AsRawFd, RawFd};

/// Signals are blocked for the calling thread and surfaced through a
/// non-blocking signalfd, so they are only ever observed from the loop.
pub struct SignalReceiver {
    fd: SignalFd,
}

impl SignalReceiver {
    pub fn new(signals: &[Signal]) -> Result<Self, Errno> {
        let mut mask = SigSet::empty();
        for signal in signals {
            mask.add(*signal);
        }
        mask.thread_block()?;
        let fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn drain(&mut self) -> Vec<Signal> {
        let mut received = Vec::new();
        loop {
            match self.fd.read_signal() {
                Ok(Some(info)) => match Signal::try_from(info.ssi_signo as i32) {
                    Ok(signal) => received.push(signal),
                    Err(_) => log::warn!("ignoring unknown signal number {}", info.ssi_signo),
                },
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("failed to read from signalfd: {e}");
                    break;
                }
            }
        }
        received
    }
}

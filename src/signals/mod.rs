//! Signal intake for the supervisor loop.
//!
//! Handlers never touch the process table. Delivered signals become readable
//! bytes on a descriptor that the loop registers with the poller and drains
//! between polls.
use nix::sys::signal::Signal;

#[cfg(target_os = "linux")]
mod signalfd;

#[cfg(target_os = "linux")]
pub use signalfd::SignalReceiver;

#[cfg(not(target_os = "linux"))]
mod selfpipe;

#[cfg(not(target_os = "linux"))]
pub use selfpipe::SignalReceiver;

/// Every signal the supervisor reacts to.
pub const HANDLED: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
];

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::raise;

    #[test]
    fn raised_signal_is_drained() {
        let mut receiver = SignalReceiver::new(&[Signal::SIGUSR1]).unwrap();
        raise(Signal::SIGUSR1).unwrap();
        let received = receiver.drain();
        assert_eq!(received, vec![Signal::SIGUSR1]);
        assert!(receiver.drain().is_empty());
    }
}

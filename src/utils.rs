use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub fn set_fd_nonblocking(fd: RawFd) -> nix::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    let prev_flags = OFlag::from_bits_truncate(bits);
    fcntl(fd, FcntlArg::F_SETFL(prev_flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// A close-on-exec pipe whose parent-side end is non-blocking.
///
/// `parent_reads` picks which end stays with the supervisor: the read end for
/// stdout/stderr, the write end for stdin. Returns `(parent, child)`.
pub fn child_pipe(parent_reads: bool) -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
    let (parent, child) = if parent_reads {
        (read, write)
    } else {
        (write, read)
    };
    set_fd_nonblocking(parent.as_raw_fd())?;
    Ok((parent, child))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_end_is_nonblocking_child_end_is_not() {
        let (parent, child) = child_pipe(true).unwrap();
        let parent_flags = OFlag::from_bits_truncate(fcntl(parent.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        let child_flags = OFlag::from_bits_truncate(fcntl(child.as_raw_fd(), FcntlArg::F_GETFL).unwrap());
        assert!(parent_flags.contains(OFlag::O_NONBLOCK));
        assert!(!child_flags.contains(OFlag::O_NONBLOCK));
    }
}

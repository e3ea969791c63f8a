mod interface;
pub use interface::{AsPoller, Readiness};

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller as Poller;

pub mod poll;

#[cfg(not(target_os = "linux"))]
pub use poll::PollPoller as Poller;

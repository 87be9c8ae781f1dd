use std::io;
use std::os::fd::RawFd;

use nix::libc;

use crate::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use crate::utils::epoll_ctl;
use crate::Interest;

/// The readiness-polling instance owned by one handler.
///
/// Registration happens on whichever thread calls
/// [`Listener::add`](crate::Listener::add), waiting happens on the handler's
/// worker thread, so implementors must be `Send + Sync`.
///
/// # Primary Implementors
///
/// [`EpollPoller`] is used by [`Listener::new`](crate::Listener::new).
/// `MockPoller` (feature `mock`) lets tests script registration and wait
/// failures through [`Listener::with_pollers`](crate::Listener::with_pollers).
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait Poller: Send + Sync + 'static {
    /// Registers `fd`; `tag` comes back with every ready item for it.
    fn register(&self, fd: RawFd, tag: u64, interest: Interest) -> io::Result<()>;

    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks without timeout until at least one item is ready, and fills the
    /// front of `events` with the batch.
    fn wait(&self, events: &mut [EpollEvent]) -> io::Result<usize>;
}

/// A [`Poller`] backed by a Linux epoll instance.
#[derive(Debug)]
pub struct EpollPoller {
    epoll: Epoll,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?,
        })
    }
}

impl Poller for EpollPoller {
    fn register(&self, fd: RawFd, tag: u64, interest: Interest) -> io::Result<()> {
        let event = EpollEvent::new(interest.flags(), tag);
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_ADD, fd, Some(event))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(&self.epoll, libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&self, events: &mut [EpollEvent]) -> io::Result<usize> {
        self.epoll
            .wait(events, EpollTimeout::NONE)
            .map_err(io::Error::from)
    }
}

use std::{fmt, io};
use std::os::fd::{AsFd, AsRawFd, RawFd};

use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

/// An eventfd counter used to interrupt a handler blocked in `epoll_wait`.
///
/// Each handler owns one to request shutdown, and each registration owns one
/// to request its own removal.
pub(crate) struct Signal {
    eventfd: EventFd,
}

impl Signal {
    pub fn new() -> io::Result<Self> {
        let eventfd = EventFd::from_flags(EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)
            .map_err(io::Error::from)?;
        Ok(Self { eventfd })
    }

    /// Makes the signal readable.
    pub fn notify(&self) -> io::Result<()> {
        self.eventfd.write(1).map(drop).map_err(io::Error::from)
    }

    /// Consumes the pending count. Returns zero if nothing was pending.
    pub fn drain(&self) -> io::Result<u64> {
        match self.eventfd.read() {
            Ok(count) => Ok(count),
            Err(Errno::EAGAIN) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.eventfd.as_fd().as_raw_fd()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&self.raw_fd()).finish()
    }
}

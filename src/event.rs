use crate::epoll::EpollFlags;

/// Readiness of a watched descriptor, as seen by its callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Event(EpollFlags);

impl From<EpollFlags> for Event {
    fn from(flags: EpollFlags) -> Self {
        Event(flags)
    }
}

impl Event {
    pub const fn flags(&self) -> EpollFlags {
        self.0
    }

    /// Data can be read (`EPOLLIN`).
    pub const fn is_readable(&self) -> bool {
        self.has(EpollFlags::EPOLLIN)
    }

    /// `EPOLLERR`, which the kernel reports whether requested or not.
    pub const fn is_error(&self) -> bool {
        self.has(EpollFlags::EPOLLERR)
    }

    /// `EPOLLHUP`. On a pipe every write end is closed; data written before
    /// that is still readable until `read` returns zero.
    pub const fn is_hangup(&self) -> bool {
        self.has(EpollFlags::EPOLLHUP)
    }

    const fn has(&self, flag: EpollFlags) -> bool {
        self.0.bits() & flag.bits() != 0
    }
}

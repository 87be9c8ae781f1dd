//! Registration flags.
//!
//! The listener only ever uses two sets: [`Interest::RECORD`] for watched
//! descriptors and their private removal signals, and [`Interest::WAKE`] for
//! the stop signal of each handler. Both are built with the same `const`
//! chain a caller of [`interest`] would write.

use crate::epoll::EpollFlags;

/// A set of `epoll` flags a descriptor is registered with.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Interest(EpollFlags);

impl Interest {
    /// Edge-triggered readability.
    pub const RECORD: Interest = interest().read().edge_triggered();

    /// Level-triggered readability: a stop request stays visible to the
    /// handler until it is drained.
    pub const WAKE: Interest = interest().read();

    pub const fn flags(&self) -> EpollFlags {
        self.0
    }

    const fn with(self, flag: EpollFlags) -> Self {
        Interest(EpollFlags::from_bits_retain(self.0.bits() | flag.bits()))
    }

    /// `EPOLLIN`.
    pub const fn read(self) -> Self {
        self.with(EpollFlags::EPOLLIN)
    }

    /// `EPOLLET`. Without it the registration is level-triggered.
    pub const fn edge_triggered(self) -> Self {
        self.with(EpollFlags::EPOLLET)
    }
}

/// Starts an empty set, to be extended with the builder methods of
/// [`Interest`].
pub const fn interest() -> Interest {
    Interest(EpollFlags::empty())
}

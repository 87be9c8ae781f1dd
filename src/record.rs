use std::fmt;
use std::os::fd::RawFd;

use crate::signal::Signal;
use crate::{EpollPoller, Event, Poller, Registry, Result};

/// Epoll tag of a handler's own wake signal.
pub(crate) const WAKE_TAG: u64 = 0;

/// Identity of one registration.
///
/// Tokens are handed out from a monotonically increasing counter starting at
/// one and are never reused, so an item still sitting in a ready batch can
/// never be attributed to a record created after the one it was meant for.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Token(pub u64);

impl Token {
    /// Tag under which the watched descriptor is registered.
    pub const fn target_tag(self) -> u64 {
        self.0 << 1
    }

    /// Tag under which the record's private signal is registered.
    pub const fn signal_tag(self) -> u64 {
        (self.0 << 1) | 1
    }
}

/// What a ready item refers to, decoded from its epoll tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Tag {
    Wake,
    Target(Token),
    Signal(Token),
}

impl Tag {
    pub const fn decode(raw: u64) -> Self {
        if raw == WAKE_TAG {
            Tag::Wake
        } else if raw & 1 == 0 {
            Tag::Target(Token(raw >> 1))
        } else {
            Tag::Signal(Token(raw >> 1))
        }
    }
}

pub(crate) type BoxCallback<P> = Box<dyn FnMut(&Ready<'_, P>) + Send>;

/// Per-registration state, owned by the record map of one handler.
pub(crate) struct EventRecord<P: Poller> {
    pub fd: RawFd,
    /// Written once by `del`; the owning handler releases the record when it
    /// sees this signal become ready.
    pub signal: Signal,
    /// Holds the user context. Taken out while the callback runs so the
    /// record lock is not held across user code.
    pub callback: Option<BoxCallback<P>>,
    pub pending_removal: bool,
    pub removed: Option<oneshot::Sender<()>>,
}

impl<P: Poller> EventRecord<P> {
    pub fn new(fd: RawFd, signal: Signal, callback: BoxCallback<P>) -> Self {
        Self {
            fd,
            signal,
            callback: Some(callback),
            pending_removal: false,
            removed: None,
        }
    }

    /// Deregisters the watched descriptor and the private signal from `poller`.
    ///
    /// The watched descriptor may already be closed by its owner; that is not
    /// an error.
    pub fn deregister(&self, poller: &P) -> std::io::Result<()> {
        if let Err(e) = poller.deregister(self.fd) {
            if crate::utils::is_stale_fd(&e) {
                log::debug!("fd {} left epoll before its removal: {e}", self.fd);
            } else {
                log::warn!("Failed to deregister fd {}: {e}", self.fd);
            }
        }
        poller.deregister(self.signal.raw_fd())
    }

    /// Drops the record, which closes the signal and drops the callback
    /// together with its context, then completes a pending
    /// [`del_with_notify`](crate::Listener::del_with_notify).
    ///
    /// Runs user `Drop` code, so no lock may be held.
    pub fn finish(mut self) {
        let removed = self.removed.take();
        drop(self);
        if let Some(removed) = removed {
            let _ = removed.send(());
        }
    }
}

impl<P: Poller> fmt::Debug for EventRecord<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("fd", &self.fd)
            .field("signal", &self.signal)
            .field("pending_removal", &self.pending_removal)
            .finish_non_exhaustive()
    }
}

/// What a callback sees when its descriptor becomes ready.
///
/// Callbacks run on the worker thread of the handler owning the
/// registration. Watched descriptors are edge-triggered: read until the
/// descriptor reports `WouldBlock` or end of file, a level that is not
/// drained is not reported again.
pub struct Ready<'a, P: Poller = EpollPoller> {
    pub(crate) fd: RawFd,
    pub(crate) event: Event,
    pub(crate) registry: &'a Registry<P>,
}

impl<'a, P: Poller> Ready<'a, P> {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn event(&self) -> Event {
        self.event
    }

    /// The pool this registration belongs to. Lets a callback register or
    /// remove other descriptors.
    pub fn registry(&self) -> &'a Registry<P> {
        self.registry
    }

    /// Requests removal of this registration, see [`Registry::del`].
    ///
    /// The callback is not invoked again once this returns `Ok`.
    pub fn del(&self) -> Result<()> {
        self.registry.del(self.fd)
    }
}

impl<P: Poller> fmt::Debug for Ready<'_, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ready")
            .field("fd", &self.fd)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

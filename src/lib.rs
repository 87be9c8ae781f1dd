//! A multi-threaded readiness multiplexer over Linux `epoll`.
//!
//! A [`Listener`] owns a fixed pool of handlers. Each handler has its own
//! epoll instance and worker thread, and calls the user callback of a
//! registered descriptor whenever that descriptor becomes readable.
//! Registrations are routed to the least-loaded handler.
//!
//! Removal is split in two phases. [`Listener::del`] may run on any thread:
//! it only flags the registration and writes the registration's private
//! eventfd. The owning handler then deregisters and drops the registration on
//! its own thread, when that eventfd shows up in its ready batch. A ready item
//! already pulled out of the kernel therefore never refers to released state,
//! and a removal never races a callback of the same registration.

#![cfg_attr(docsrs, feature(doc_cfg))]

mod config;
mod error;
mod event;
mod gate;
mod handler;
mod interest;
mod listener;
mod poller;
mod record;
mod registry;
mod signal;
mod utils;

#[cfg(test)]
mod test_utils;

pub mod epoll {
    pub use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
}

pub use crate::config::{Config, DEFAULT_EVENT_CAPACITY, DEFAULT_HANDLERS, MAX_EVENT_CAPACITY};
pub use crate::error::{Error, Result};
pub use crate::event::Event;
pub use crate::handler::HandlerState;
pub use crate::interest::{interest, Interest};
pub use crate::listener::Listener;
#[cfg(feature = "mock")]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub use crate::poller::MockPoller;
pub use crate::poller::{EpollPoller, Poller};
pub use crate::record::Ready;
pub use crate::registry::Registry;

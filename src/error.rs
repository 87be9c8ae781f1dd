use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by [`Listener`](crate::Listener) operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("the listener needs at least one handler")]
    InvalidCapacity,

    /// A handler could not get its epoll instance or wake signal.
    #[error("failed to initialize handler {index}: {source}")]
    ResourceExhausted {
        index: usize,
        #[source]
        source: io::Error,
    },

    /// epoll or eventfd rejected one step of a registration or removal request.
    #[error("failed to register fd {fd}: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("fd {0} is not registered")]
    NotFound(RawFd),

    #[error("failed to spawn the worker of handler {index}: {source}")]
    ThreadSpawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to wake handler {index}: {source}")]
    Signal {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("the worker of handler {index} panicked")]
    Join { index: usize },

    /// `epoll_wait` failed; only the worker that observed it exits.
    #[error("epoll_wait failed on handler {index}: {source}")]
    Wait {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to tear down handler {index}: {source}")]
    Teardown {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("the listener is {0}")]
    InvalidState(&'static str),
}

impl Error {
    /// Returns the OS error code behind this error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::ResourceExhausted { source, .. }
            | Error::Registration { source, .. }
            | Error::ThreadSpawn { source, .. }
            | Error::Signal { source, .. }
            | Error::Wait { source, .. }
            | Error::Teardown { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

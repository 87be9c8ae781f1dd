use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::{fmt, io};

use log::{debug, error, warn};
use nix::libc;

use crate::handler::Handler;
use crate::record::{BoxCallback, EventRecord, Token};
use crate::signal::Signal;
use crate::utils::lock;
use crate::{Config, EpollPoller, Error, HandlerState, Poller, Ready, Result};

/// The fixed pool of handlers behind a [`Listener`](crate::Listener).
///
/// Shared between the listener and its worker threads. Callbacks reach it
/// through [`Ready::registry`], so they can add and remove descriptors
/// while running.
pub struct Registry<P: Poller = EpollPoller> {
    handlers: Box<[Handler<P>]>,
    /// Serializes `add`: the duplicate check and the least-loaded choice must
    /// see every registration made before.
    route: Mutex<()>,
    next_token: AtomicU64,
}

impl<P: Poller> Registry<P> {
    /// Builds one handler per configured slot.
    ///
    /// If handler `i` cannot be built, handlers `i - 1` down to `0` are torn
    /// down in that order.
    pub(crate) fn new<F>(config: &Config, mut factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> io::Result<P>,
    {
        if config.handlers() == 0 {
            return Err(Error::InvalidCapacity);
        }

        let mut handlers: Vec<Handler<P>> = Vec::new();
        if handlers.try_reserve_exact(config.handlers()).is_err() {
            error!("Cannot allocate {} handlers", config.handlers());
            return Err(Error::ResourceExhausted {
                index: 0,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        for index in 0..config.handlers() {
            let handler = factory(index)
                .map_err(|source| Error::ResourceExhausted { index, source })
                .and_then(|poller| Handler::new(index, poller, config.event_buf_capacity()));

            match handler {
                Ok(handler) => handlers.push(handler),
                Err(e) => {
                    error!("Failed to initialize handler {index}: {e}");
                    while let Some(handler) = handlers.pop() {
                        if let Err(e) = handler.teardown() {
                            warn!("Rollback of handler {}: {e}", handler.index());
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            handlers: handlers.into_boxed_slice(),
            route: Mutex::new(()),
            next_token: AtomicU64::new(1),
        })
    }

    pub(crate) fn handlers(&self) -> &[Handler<P>] {
        &self.handlers
    }

    /// Watches `fd` for readability and calls `callback` with `context` each
    /// time it becomes ready.
    ///
    /// The registration goes to the handler with the fewest registrations,
    /// the lowest index winning ties. `fd` is not owned; it must stay open
    /// until the registration is removed, or be owned by `context`, which is
    /// dropped on the handler's thread once the removal completes.
    ///
    /// # Errors
    ///
    /// [`Error::Registration`] if `fd` is already registered (`EEXIST`,
    /// including a registration whose removal is still pending) or if epoll
    /// or eventfd reject a step. Nothing stays registered in that case.
    pub fn add<C, F>(&self, fd: RawFd, context: C, mut callback: F) -> Result<()>
    where
        C: Send + 'static,
        F: FnMut(&Ready<'_, P>, &mut C) + Send + 'static,
    {
        let mut context = context;
        let callback: BoxCallback<P> =
            Box::new(move |ready: &Ready<'_, P>| callback(ready, &mut context));

        let _route = lock(&self.route);
        if self.handlers.iter().any(|handler| handler.contains(fd)) {
            return Err(Error::Registration {
                fd,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }

        let index = self.least_loaded();
        let signal = Signal::new().map_err(|source| Error::Registration { fd, source })?;
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));

        self.handlers[index]
            .insert(token, EventRecord::new(fd, signal, callback))
            .map_err(|source| {
                warn!("Failed to register fd {fd} with handler {index}: {source}");
                Error::Registration { fd, source }
            })?;

        debug!("Registered fd {fd} with handler {index}");
        Ok(())
    }

    /// Requests removal of `fd` and returns immediately.
    ///
    /// The owning handler deregisters `fd` and drops the callback and its
    /// context on its own thread, after any callback already running for
    /// `fd` has returned. The callback is not invoked for `fd` afterwards.
    /// Completion is not reported; use [`del_with_notify`](Self::del_with_notify)
    /// before registering the same descriptor again.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `fd` is not registered or its removal was
    /// already requested.
    pub fn del(&self, fd: RawFd) -> Result<()> {
        self.mark_removal(fd, None)
    }

    /// Like [`del`](Self::del), and returns a receiver completed once the
    /// removal is done.
    ///
    /// While the listener is stopped, removal waits for the next start or
    /// for [`destroy`](crate::Listener::destroy).
    pub fn del_with_notify(&self, fd: RawFd) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.mark_removal(fd, Some(tx))?;
        Ok(rx)
    }

    fn mark_removal(&self, fd: RawFd, mut removed: Option<oneshot::Sender<()>>) -> Result<()> {
        for handler in self.handlers.iter() {
            if let Some(result) = handler.mark_removal(fd, &mut removed) {
                return result;
            }
        }
        Err(Error::NotFound(fd))
    }

    fn least_loaded(&self) -> usize {
        self.handlers
            .iter()
            .enumerate()
            .min_by_key(|(_, handler)| handler.registered())
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registrations per handler, pending removals included.
    pub fn registered_counts(&self) -> Vec<usize> {
        self.handlers.iter().map(Handler::registered).collect()
    }

    pub fn handler_states(&self) -> Vec<HandlerState> {
        self.handlers.iter().map(Handler::state).collect()
    }
}

impl<P: Poller> fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::{fmt, io, mem};

use log::{error, info, warn};

use crate::gate::StartGate;
use crate::utils::lock;
use crate::{Config, EpollPoller, Error, HandlerState, Poller, Ready, Registry, Result};

type Worker = Box<dyn FnOnce() -> Result<()> + Send>;
type WorkerHandle = JoinHandle<Result<()>>;

enum Lifecycle {
    Idle,
    /// Join handles of the live workers, by handler index.
    Running(Vec<(usize, WorkerHandle)>),
}

/// A pool of epoll handlers, each driven by its own worker thread.
///
/// The listener is an explicit handle owned by the caller. Descriptors can be
/// added before [`start`](Self::start) and at any time afterwards, from any
/// thread, including from inside a callback (through [`Ready::registry`]).
///
/// # Examples
///
/// ```no_run
/// use std::fs::File;
/// use std::io::{self, Read};
/// use std::os::fd::AsRawFd;
///
/// use epoll_listener::Listener;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = Listener::new(4)?;
/// let file = File::open("/dev/input/event0")?;
///
/// listener.add(file.as_raw_fd(), file, |ready, file| {
///     let mut buf = [0u8; 4096];
///     loop {
///         match file.read(&mut buf) {
///             Ok(0) => {
///                 let _ = ready.del();
///                 break;
///             }
///             Ok(n) => println!("{n} bytes from fd {}", ready.fd()),
///             Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
///             Err(_) => break,
///         }
///     }
/// })?;
///
/// listener.start()?;
/// // ..
/// listener.stop()?;
/// listener.destroy()?;
/// # Ok(()) }
/// ```
pub struct Listener<P: Poller = EpollPoller> {
    registry: Arc<Registry<P>>,
    lifecycle: Mutex<Lifecycle>,
    config: Config,
}

impl Listener<EpollPoller> {
    /// Creates a listener with `capacity` handlers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidCapacity`] for zero, [`Error::ResourceExhausted`] if an
    /// epoll instance or wake signal cannot be created. Handlers built before
    /// the failure are torn down in reverse creation order.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(Config::new(capacity))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_pollers(config, |_| EpollPoller::new())
    }
}

impl<P: Poller> Listener<P> {
    /// Creates a listener whose handler `i` polls with `factory(i)`.
    pub fn with_pollers<F>(config: Config, factory: F) -> Result<Self>
    where
        F: FnMut(usize) -> io::Result<P>,
    {
        let registry = Registry::new(&config, factory)?;
        info!("Listener created with {} handlers", registry.handler_count());

        Ok(Self {
            registry: Arc::new(registry),
            lifecycle: Mutex::new(Lifecycle::Idle),
            config,
        })
    }

    /// See [`Registry::add`].
    ///
    /// # Errors
    ///
    /// See [`Registry::add`].
    pub fn add<C, F>(&self, fd: RawFd, context: C, callback: F) -> Result<()>
    where
        C: Send + 'static,
        F: FnMut(&Ready<'_, P>, &mut C) + Send + 'static,
    {
        self.registry.add(fd, context, callback)
    }

    /// See [`Registry::del`].
    ///
    /// # Errors
    ///
    /// See [`Registry::del`].
    pub fn del(&self, fd: RawFd) -> Result<()> {
        self.registry.del(fd)
    }

    /// See [`Registry::del_with_notify`].
    ///
    /// # Errors
    ///
    /// See [`Registry::del`].
    pub fn del_with_notify(&self, fd: RawFd) -> Result<oneshot::Receiver<()>> {
        self.registry.del_with_notify(fd)
    }

    pub fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn handler_count(&self) -> usize {
        self.registry.handler_count()
    }

    pub fn registered_counts(&self) -> Vec<usize> {
        self.registry.registered_counts()
    }

    pub fn handler_states(&self) -> Vec<HandlerState> {
        self.registry.handler_states()
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Running(_))
    }

    /// Spawns one worker thread per handler.
    ///
    /// All or nothing: workers are held at a start gate until every spawn has
    /// succeeded. If one fails, the workers already spawned are released
    /// without entering their loop and joined, and the listener can be
    /// started again or destroyed.
    ///
    /// # Errors
    ///
    /// [`Error::ThreadSpawn`], or [`Error::InvalidState`] if already running.
    pub fn start(&self) -> Result<()> {
        self.start_with(|_, builder, worker| builder.spawn(worker))
    }

    fn start_with<S>(&self, mut spawn: S) -> Result<()>
    where
        S: FnMut(usize, thread::Builder, Worker) -> io::Result<WorkerHandle>,
    {
        let mut lifecycle = lock(&self.lifecycle);
        if let Lifecycle::Running(_) = *lifecycle {
            return Err(Error::InvalidState("already running"));
        }

        let handlers = self.registry.handlers();
        let gate = Arc::new(StartGate::new());
        let mut workers = Vec::with_capacity(handlers.len());

        for (index, handler) in handlers.iter().enumerate() {
            handler.set_state(HandlerState::AwaitingStart);

            let registry = Arc::clone(&self.registry);
            let worker_gate = Arc::clone(&gate);
            let worker: Worker = Box::new(move || {
                if !worker_gate.wait() {
                    return Ok(());
                }
                registry.handlers()[index].run(&registry)
            });

            let mut builder = thread::Builder::new().name(self.config.worker_name(index));
            if let Some(size) = self.config.worker_stack_size() {
                builder = builder.stack_size(size);
            }

            match spawn(index, builder, worker) {
                Ok(handle) => workers.push((index, handle)),
                Err(source) => {
                    error!("Failed to spawn the worker of handler {index}: {source}");
                    gate.abort();
                    for (spawned, handle) in workers {
                        if handle.join().is_err() {
                            warn!("Worker {spawned} panicked while start was rolled back");
                        }
                    }
                    for handler in handlers {
                        handler.set_state(HandlerState::Constructed);
                    }
                    return Err(Error::ThreadSpawn { index, source });
                }
            }
        }

        gate.open();
        *lifecycle = Lifecycle::Running(workers);
        info!("Listener started {} workers", handlers.len());
        Ok(())
    }

    /// Wakes every handler once and joins every worker.
    ///
    /// Each handler finishes the batch it is dispatching; running callbacks
    /// are never interrupted. Must not be called from a callback.
    ///
    /// # Errors
    ///
    /// [`Error::Join`] if a worker panicked (the others are still joined), or
    /// [`Error::InvalidState`] if not running. A handler that already ended on
    /// a wait failure is logged, not reported here: see
    /// [`handler_states`](Self::handler_states).
    ///
    /// [`Error::Signal`] if a wake signal cannot be written. The handlers
    /// that were woken are still joined; only the others keep running, and
    /// the listener stays running until a later `stop` joins them.
    pub fn stop(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        let workers = match mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            Lifecycle::Running(workers) => workers,
            Lifecycle::Idle => return Err(Error::InvalidState("not running")),
        };

        let handlers = self.registry.handlers();
        let mut wake_error = None;
        let mut woken = Vec::with_capacity(workers.len());
        let mut unwoken = Vec::new();
        for (index, worker) in workers {
            match handlers[index].wake() {
                Ok(()) => woken.push((index, worker)),
                Err(e) => {
                    error!("Failed to stop handler {index}: {e}");
                    if wake_error.is_none() {
                        wake_error = Some(e);
                    }
                    unwoken.push((index, worker));
                }
            }
        }

        let mut result = Ok(());
        for (index, worker) in woken {
            let handler = &handlers[index];
            match worker.join() {
                Ok(Ok(())) => handler.set_state(HandlerState::Joined),
                Ok(Err(e)) => warn!("Handler {index} had already exited: {e}"),
                Err(_) => {
                    error!("The worker of handler {index} panicked");
                    handler.set_state(HandlerState::Failed);
                    if result.is_ok() {
                        result = Err(Error::Join { index });
                    }
                }
            }
            if let Err(e) = handler.drain_wake() {
                warn!("Handler {index}: failed to drain its wake signal: {e}");
            }
        }

        if let Some(e) = wake_error {
            warn!("{} handlers are still running", unwoken.len());
            *lifecycle = Lifecycle::Running(unwoken);
            return Err(e);
        }

        info!("Listener stopped");
        result
    }

    /// Releases every remaining registration, wake signal and epoll
    /// instance, handlers in reverse creation order.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if still running; the listener is then
    /// stopped and released by its `Drop`. Otherwise the first
    /// [`Error::Teardown`], reported after every handler was processed.
    pub fn destroy(self) -> Result<()> {
        if self.is_running() {
            error!("Listener destroyed while running");
            return Err(Error::InvalidState("running, stop it before destroying"));
        }

        let mut result = Ok(());
        for handler in self.registry.handlers().iter().rev() {
            if let Err(e) = handler.teardown() {
                error!("{e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        info!("Listener destroyed");
        result
    }
}

impl<P: Poller> Drop for Listener<P> {
    fn drop(&mut self) {
        if self.is_running() {
            if let Err(e) = self.stop() {
                error!("Failed to stop the listener on drop: {e}");
            }
        }
    }
}

impl<P: Poller> fmt::Debug for Listener<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("registry", &self.registry)
            .field("running", &self.is_running())
            .field("config", &self.config)
            .finish()
    }
}

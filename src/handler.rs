use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::{fmt, io};

use log::{debug, error, trace, warn};
use nix::libc;
use rustc_hash::FxHashMap;

use crate::epoll::EpollEvent;
use crate::record::{EventRecord, Tag, Token, WAKE_TAG};
use crate::signal::Signal;
use crate::utils::lock;
use crate::{Error, Event, Interest, Poller, Ready, Registry, Result};

/// Lifecycle of one handler and its worker thread.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum HandlerState {
    /// Epoll instance and wake signal exist, no worker thread.
    Constructed = 0,
    /// The worker is spawned and held at the start gate.
    AwaitingStart = 1,
    /// The worker is waiting for or dispatching ready items.
    Running = 2,
    /// The wake signal was seen; the current batch is being finished.
    Stopping = 3,
    /// The worker returned and was joined.
    Joined = 4,
    /// `epoll_wait` failed or a callback panicked; this handler no longer
    /// delivers events. Other handlers are unaffected.
    Failed = 5,
}

impl HandlerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandlerState::Constructed,
            1 => HandlerState::AwaitingStart,
            2 => HandlerState::Running,
            3 => HandlerState::Stopping,
            4 => HandlerState::Joined,
            _ => HandlerState::Failed,
        }
    }
}

/// One epoll instance, its wake signal and the registrations routed to it.
///
/// Everything but the mark phase of a removal runs on the worker thread that
/// calls [`run`](Self::run): records are released there and only there.
pub(crate) struct Handler<P: Poller> {
    index: usize,
    poller: P,
    wake: Signal,
    registered: AtomicUsize,
    records: Mutex<FxHashMap<Token, EventRecord<P>>>,
    state: AtomicU8,
    event_capacity: usize,
}

impl<P: Poller> Handler<P> {
    pub fn new(index: usize, poller: P, event_capacity: usize) -> Result<Self> {
        let wake = Signal::new().map_err(|source| Error::ResourceExhausted { index, source })?;
        poller
            .register(wake.raw_fd(), WAKE_TAG, Interest::WAKE)
            .map_err(|source| Error::ResourceExhausted { index, source })?;

        debug!("Handler {index} initialized, wake signal {}", wake.raw_fd());
        Ok(Self {
            index,
            poller,
            wake,
            registered: AtomicUsize::new(0),
            records: Mutex::new(FxHashMap::default()),
            state: AtomicU8::new(HandlerState::Constructed as u8),
            event_capacity,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registered(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    pub fn state(&self) -> HandlerState {
        HandlerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: HandlerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns `true` if `fd` is registered here, including a registration
    /// whose removal is still pending.
    pub fn contains(&self, fd: RawFd) -> bool {
        lock(&self.records).values().any(|record| record.fd == fd)
    }

    /// Registers the record's descriptor and private signal, then takes
    /// ownership of the record.
    ///
    /// The record lock is held across both registrations so the worker cannot
    /// see an item for a token it does not know yet. On failure nothing stays
    /// registered and the record is dropped, closing its signal.
    pub fn insert(&self, token: Token, record: EventRecord<P>) -> io::Result<()> {
        let mut records = lock(&self.records);

        self.poller
            .register(record.fd, token.target_tag(), Interest::RECORD)?;
        if let Err(e) = self.poller.register(
            record.signal.raw_fd(),
            token.signal_tag(),
            Interest::RECORD,
        ) {
            if let Err(undo) = self.poller.deregister(record.fd) {
                warn!(
                    "Handler {}: failed to undo the registration of fd {}: {undo}",
                    self.index, record.fd
                );
            }
            return Err(e);
        }

        records.insert(token, record);
        self.registered.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Mark phase of a removal: flags the live record for `fd` and writes its
    /// private signal once.
    ///
    /// Returns `None` if no live record for `fd` is owned by this handler.
    /// `removed`, if given and the record is found, is completed once the
    /// worker has released the record.
    pub fn mark_removal(
        &self,
        fd: RawFd,
        removed: &mut Option<oneshot::Sender<()>>,
    ) -> Option<Result<()>> {
        let mut records = lock(&self.records);
        let record = records
            .values_mut()
            .find(|record| record.fd == fd && !record.pending_removal)?;

        record.pending_removal = true;
        if let Err(source) = record.signal.notify() {
            record.pending_removal = false;
            return Some(Err(Error::Registration { fd, source }));
        }
        record.removed = removed.take();

        trace!("Handler {}: fd {fd} marked for removal", self.index);
        Some(Ok(()))
    }

    /// Asks the worker to stop after its current batch.
    pub fn wake(&self) -> Result<()> {
        self.wake.notify().map_err(|source| Error::Signal {
            index: self.index,
            source,
        })
    }

    #[cfg(test)]
    pub fn wake_fd(&self) -> RawFd {
        self.wake.raw_fd()
    }

    /// Consumes a stop request the worker left behind, so a later start does
    /// not stop right away.
    pub fn drain_wake(&self) -> io::Result<()> {
        self.wake.drain().map(drop)
    }

    /// The worker loop. Returns once the wake signal was observed, or with
    /// [`Error::Wait`] if `epoll_wait` fails.
    pub fn run(&self, registry: &Registry<P>) -> Result<()> {
        let mut events: Vec<EpollEvent> = Vec::new();
        if events.try_reserve_exact(self.event_capacity).is_err() {
            self.set_state(HandlerState::Failed);
            error!(
                "Handler {} cannot allocate {} event slots",
                self.index, self.event_capacity
            );
            return Err(Error::ResourceExhausted {
                index: self.index,
                source: io::Error::from_raw_os_error(libc::ENOMEM),
            });
        }
        events.resize(self.event_capacity, EpollEvent::empty());
        self.set_state(HandlerState::Running);
        debug!("Handler {} running", self.index);

        loop {
            let n = match self.poller.wait(&mut events) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    self.set_state(HandlerState::Failed);
                    error!(
                        "Handler {} stops delivering events, epoll_wait failed: {source}",
                        self.index
                    );
                    return Err(Error::Wait {
                        index: self.index,
                        source,
                    });
                }
            };

            if self.dispatch(&events[..n], registry) {
                break;
            }
        }

        debug!("Handler {} leaves its loop", self.index);
        Ok(())
    }

    /// Handles one batch in arrival order. Returns `true` if the batch held a
    /// stop request; the remaining items are still handled.
    fn dispatch(&self, batch: &[EpollEvent], registry: &Registry<P>) -> bool {
        let mut stopping = false;
        for ev in batch {
            match Tag::decode(ev.data()) {
                Tag::Wake => {
                    stopping = true;
                    self.set_state(HandlerState::Stopping);
                }
                Tag::Target(token) => {
                    self.on_ready(token, Some(Event::from(ev.events())), registry)
                }
                Tag::Signal(token) => self.on_ready(token, None, registry),
            }
        }
        stopping
    }

    fn on_ready(&self, token: Token, event: Option<Event>, registry: &Registry<P>) {
        let mut records = lock(&self.records);
        let Some(record) = records.get_mut(&token) else {
            // Released by an earlier item of the same batch.
            trace!("Handler {}: skipping released {token:?}", self.index);
            return;
        };

        if record.pending_removal {
            if let Some(record) = records.remove(&token) {
                self.registered.fetch_sub(1, Ordering::AcqRel);
                let result = record.deregister(&self.poller);
                drop(records);

                let fd = record.fd;
                record.finish();
                match result {
                    Ok(()) => debug!("Handler {}: released fd {fd}", self.index),
                    Err(e) => warn!(
                        "Handler {}: fd {fd} released, but its signal failed to deregister: {e}",
                        self.index
                    ),
                }
            }
            return;
        }

        let Some(event) = event else {
            return;
        };
        let fd = record.fd;
        let Some(mut callback) = record.callback.take() else {
            return;
        };
        drop(records);

        trace!("Handler {}: fd {fd} ready, {event:?}", self.index);
        callback(&Ready {
            fd,
            event,
            registry,
        });

        if let Some(record) = lock(&self.records).get_mut(&token) {
            record.callback = Some(callback);
        }
    }

    /// Releases every record and deregisters the wake signal. Only called
    /// while no worker runs.
    pub fn teardown(&self) -> Result<()> {
        let released: Vec<_> = {
            let mut records = lock(&self.records);
            records
                .drain()
                .map(|(_, record)| {
                    self.registered.fetch_sub(1, Ordering::AcqRel);
                    if let Err(e) = record.deregister(&self.poller) {
                        warn!("Handler {}: failed to release fd {}: {e}", self.index, record.fd);
                    }
                    record
                })
                .collect()
        };
        released.into_iter().for_each(EventRecord::finish);

        self.poller
            .deregister(self.wake.raw_fd())
            .map_err(|source| Error::Teardown {
                index: self.index,
                source,
            })
    }
}

impl<P: Poller> fmt::Debug for Handler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("index", &self.index)
            .field("wake", &self.wake)
            .field("registered", &self.registered())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

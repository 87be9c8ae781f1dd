use std::mem;

use crate::epoll::EpollEvent;

/// Number of handlers used by [`Config::default`].
pub const DEFAULT_HANDLERS: usize = 8;

/// Capacity of the per-handler buffer passed to `epoll_wait`.
pub const DEFAULT_EVENT_CAPACITY: usize = 128;

/// Largest batch `epoll_wait` accepts: its length argument is an `int` and
/// the kernel caps it at `INT_MAX / sizeof(struct epoll_event)`.
pub const MAX_EVENT_CAPACITY: usize = i32::MAX as usize / mem::size_of::<EpollEvent>();

const DEFAULT_THREAD_NAME: &str = "event-handler";

/// Tunables for a [`Listener`](crate::Listener).
///
/// Built fluently, in the same manner as [`Interest`](crate::Interest):
///
/// ```
/// use epoll_listener::Config;
///
/// let config = Config::new(4).event_capacity(64).thread_name("pipe-reader");
/// assert_eq!(config.handlers(), 4);
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    handlers: usize,
    event_capacity: usize,
    thread_name: String,
    stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLERS)
    }
}

impl Config {
    pub fn new(handlers: usize) -> Self {
        Self {
            handlers,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            stack_size: None,
        }
    }

    /// Sets how many ready items one `epoll_wait` call may return. Zero is
    /// raised to one, and values above [`MAX_EVENT_CAPACITY`] are lowered to
    /// it.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.clamp(1, MAX_EVENT_CAPACITY);
        self
    }

    /// Sets the prefix of worker thread names; worker `i` is named `"{prefix}-{i}"`.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn handlers(&self) -> usize {
        self.handlers
    }

    pub fn event_buf_capacity(&self) -> usize {
        self.event_capacity
    }

    pub(crate) fn worker_name(&self, index: usize) -> String {
        format!("{}-{index}", self.thread_name)
    }

    pub(crate) fn worker_stack_size(&self) -> Option<usize> {
        self.stack_size
    }
}

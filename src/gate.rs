use std::sync::{Condvar, Mutex};

use crate::utils::lock;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum GateState {
    Closed,
    Open,
    Aborted,
}

/// Holds freshly spawned workers until every spawn of one `start` succeeded.
///
/// Released exactly once, either with [`open`](Self::open) or with
/// [`abort`](Self::abort).
#[derive(Debug)]
pub(crate) struct StartGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl StartGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Closed),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the gate is released. Returns `true` if the worker should
    /// enter its loop, `false` if `start` gave up.
    pub fn wait(&self) -> bool {
        let guard = lock(&self.state);
        let guard = self
            .cond
            .wait_while(guard, |state| *state == GateState::Closed)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard == GateState::Open
    }

    pub fn open(&self) {
        self.release(GateState::Open);
    }

    pub fn abort(&self) {
        self.release(GateState::Aborted);
    }

    fn release(&self, to: GateState) {
        let mut state = lock(&self.state);
        debug_assert_eq!(*state, GateState::Closed, "start gate released twice");
        *state = to;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_open_releases_every_waiter() {
        let gate = Arc::new(StartGate::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.wait())
            })
            .collect();

        gate.open();
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn test_abort() {
        let gate = Arc::new(StartGate::new());
        let cloned = gate.clone();
        let waiter = thread::spawn(move || cloned.wait());

        gate.abort();
        assert!(!waiter.join().unwrap());
        // Late arrivals see the final state without blocking.
        assert!(!gate.wait());
    }
}

//! Cooperative run-state control and the one-shot handshake event.
//!
//! The three traffic gates (TCP accept, UDP name search, beacons) are shared
//! atomics that worker threads sample at their poll points.  There is no hard
//! preemption: pausing becomes effective within one poll interval.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use indicio::{clue, ERROR};

use crate::COLLECTOR;

////////////////////////////////////////////// CtlState ////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CtlState {
    #[default]
    Pause,
    Run,
    Shutdown,
}

impl CtlState {
    fn from_u8(x: u8) -> CtlState {
        match x {
            1 => CtlState::Run,
            2 => CtlState::Shutdown,
            _ => CtlState::Pause,
        }
    }
}

////////////////////////////////////////////// CtlFlag /////////////////////////////////////////////

/// One cooperative traffic gate.  Threads poll [CtlFlag::get] at their defined
/// poll points; [CtlFlag::set] is the only transition mechanism.
pub struct CtlFlag {
    state: AtomicU8,
}

impl CtlFlag {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    pub fn get(&self) -> CtlState {
        CtlState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set(&self, state: CtlState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Default for CtlFlag {
    fn default() -> Self {
        Self::new()
    }
}

/////////////////////////////////////////////// Event //////////////////////////////////////////////

/// A binary semaphore.  `signal` makes one `wait` return; the signal is
/// consumed by the waiter.  Used for the thread-startup handshakes and for
/// blocking a flow-controlled circuit until the sender drains.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Whether a signal is pending.  Introspection only; racing a waiter is
    /// inherent here.
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    /// Wait up to `timeout`.  Returns true iff the event was signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let (guard, result) = self.cond.wait_timeout(signaled, timeout).unwrap();
            signaled = guard;
            if result.timed_out() {
                if *signaled {
                    break;
                }
                return false;
            }
        }
        *signaled = false;
        true
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

///////////////////////////////////////////// fatalities ///////////////////////////////////////////

/// Park the calling thread forever.  Used for errors that must not be
/// silently survived but should not take the process down.
pub(crate) fn suspend_self() -> ! {
    clue!(COLLECTOR, ERROR, {
        suspended: true,
    });
    loop {
        std::thread::park();
    }
}

/// Abort for invariants that cannot hold.
pub(crate) fn cant_proceed(what: &str) -> ! {
    clue!(COLLECTOR, ERROR, {
        cant_proceed: what,
    });
    panic!("rsrv cannot proceed: {}", what);
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

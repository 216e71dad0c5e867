//! Emission Gates
//!
//! A [`Gate`] guards the hand-off from a producer (push client, poll task,
//! subscriber slot) to its consumer. The check "is this resource still live"
//! and the hand-off itself happen under one lock, so once [`Gate::close`]
//! returns nothing more passes through, even if the producer was mid-flight.
//!
//! The lock is reentrant: code running inside [`Gate::run`] may close the
//! same gate (a subscriber unsubscribing from its own callback).

use std::cell::Cell;

use parking_lot::ReentrantMutex;

/// Open/closed flag whose check-and-act is atomic with respect to `close`.
#[derive(Debug)]
pub struct Gate {
    open: ReentrantMutex<Cell<bool>>,
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Run `f` if the gate is open, holding the gate for the duration.
    ///
    /// Returns `None` without running `f` if the gate is closed.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = self.open.lock();
        if guard.get() { Some(f()) } else { None }
    }

    /// Close the gate. Blocks until any in-progress [`Gate::run`] on another
    /// thread has finished.
    ///
    /// Returns `true` if this call closed it, `false` if it was already closed.
    pub fn close(&self) -> bool {
        let guard = self.open.lock();
        guard.replace(false)
    }

    /// Whether the gate is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.lock().get()
    }
}

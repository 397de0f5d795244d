//! Superblock share/exclusive lock.
//!
//! Readers are counted under their own mutex; the first reader in takes a
//! binary gate and the last one out releases it. An exclusive holder takes
//! the exclusive mutex first (which stops new readers from entering) and
//! then the gate (which waits for in-flight readers to drain). Release is
//! in reverse order.

use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Binary semaphore.
#[derive(Debug, Default)]
struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct ShareLock {
    exclusive: Mutex<()>,
    readers: Mutex<usize>,
    gate: Gate,
}

impl ShareLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self) -> SharedGuard<'_> {
        let entry = self.exclusive.lock();
        let mut readers = self.readers.lock();
        if *readers == 0 {
            self.gate.acquire();
        }
        *readers += 1;
        drop(readers);
        drop(entry);
        SharedGuard { lock: self }
    }

    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        let entry = self.exclusive.lock();
        self.gate.acquire();
        ExclusiveGuard {
            lock: self,
            _entry: entry,
        }
    }

    /// Number of shared holders right now.
    #[must_use]
    pub fn readers(&self) -> usize {
        *self.readers.lock()
    }
}

#[must_use]
pub struct SharedGuard<'a> {
    lock: &'a ShareLock,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let mut readers = self.lock.readers.lock();
        match readers.checked_sub(1) {
            Some(0) => {
                *readers = 0;
                self.lock.gate.release();
            }
            Some(left) => *readers = left,
            None => error!(
                target: "hcfs::superblock",
                event = "share_lock_underflow"
            ),
        }
    }
}

/// Holds the exclusive mutex and the gate. Field order makes the gate go
/// first on drop.
#[must_use]
pub struct ExclusiveGuard<'a> {
    lock: &'a ShareLock,
    _entry: parking_lot::MutexGuard<'a, ()>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.lock.gate.release();
    }
}

//! Up/down lock protecting a node's directory tree.
//!
//! Creating intermediate directories or placeholder files holds the lock
//! "up" (shared, any number of holders). Pruning empty directories walks
//! upward holding it "down" (exclusive). A pruning pass therefore never
//! observes a half-built tree, and a pull never has its target directory
//! removed underneath it.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    up: usize,
    down: bool,
}

/// A shared/exclusive lock with RAII guards.
#[derive(Debug, Default)]
pub struct UpDownLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl UpDownLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock shared. Blocks while it is held down.
    pub fn up(&self) -> UpGuard<'_> {
        let mut state = self.state.lock();
        while state.down {
            self.cond.wait(&mut state);
        }
        state.up += 1;
        UpGuard { lock: self }
    }

    /// Acquires the lock exclusively. Blocks until there are no up holders
    /// and no other down holder.
    pub fn down(&self) -> DownGuard<'_> {
        let mut state = self.state.lock();
        while state.down || state.up > 0 {
            self.cond.wait(&mut state);
        }
        state.down = true;
        DownGuard { lock: self }
    }

    /// Attempts a shared acquisition without blocking.
    pub fn try_up(&self) -> Option<UpGuard<'_>> {
        let mut state = self.state.lock();
        if state.down {
            return None;
        }
        state.up += 1;
        Some(UpGuard { lock: self })
    }

    /// Attempts an exclusive acquisition without blocking.
    pub fn try_down(&self) -> Option<DownGuard<'_>> {
        let mut state = self.state.lock();
        if state.down || state.up > 0 {
            return None;
        }
        state.down = true;
        Some(DownGuard { lock: self })
    }

    /// Current number of up holders.
    pub fn up_count(&self) -> usize {
        self.state.lock().up
    }

    /// True while held down.
    pub fn is_down(&self) -> bool {
        self.state.lock().down
    }

    fn release_up(&self) {
        let mut state = self.state.lock();
        state.up -= 1;
        let wake = state.up == 0;
        drop(state);
        if wake {
            self.cond.notify_all();
        }
    }

    fn release_down(&self) {
        self.state.lock().down = false;
        self.cond.notify_all();
    }
}

/// Shared hold on an [`UpDownLock`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct UpGuard<'a> {
    lock: &'a UpDownLock,
}

impl Drop for UpGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_up();
    }
}

/// Exclusive hold on an [`UpDownLock`].
#[must_use = "the lock is released when the guard is dropped"]
pub struct DownGuard<'a> {
    lock: &'a UpDownLock,
}

impl Drop for DownGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_down();
    }
}

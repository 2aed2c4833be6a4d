//! Re-entrant core lock.
//!
//! All shared engine state sits behind one [`CoreLock`]. The lock may be
//! re-acquired by the thread that holds it, which is what lets listener
//! callbacks (always invoked with the lock held) call back into the engine.
//!
//! The state itself lives in a `RefCell`; code borrows it only for short
//! sections that never call out to user code, so nested acquisitions never
//! observe an outstanding borrow.
//!
//! A per-thread depth counter records how deeply the current thread holds
//! any core lock. Blocking submissions check it and refuse to wait while
//! the lock is held.

// ============================================================================
// Imports
// ============================================================================

use std::cell::{Cell, RefCell, RefMut};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use super::state::CoreState;

// ============================================================================
// Depth Tracking
// ============================================================================

thread_local! {
    static LOCK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Returns how many core lock guards the current thread holds.
#[inline]
pub(crate) fn lock_depth() -> u32 {
    LOCK_DEPTH.with(Cell::get)
}

/// Returns `true` if the current thread is inside engine context.
#[inline]
pub(crate) fn held_by_current_thread() -> bool {
    lock_depth() > 0
}

// ============================================================================
// CoreLock
// ============================================================================

/// Re-entrant lock around [`CoreState`].
pub(crate) struct CoreLock {
    mutex: ReentrantMutex<RefCell<CoreState>>,
}

impl CoreLock {
    pub(crate) fn new(state: CoreState) -> Self {
        Self {
            mutex: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    /// Acquires the lock, nesting if this thread already holds it.
    pub(crate) fn lock(&self) -> CoreGuard<'_> {
        let guard = self.mutex.lock();
        LOCK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        CoreGuard { guard }
    }
}

// ============================================================================
// CoreGuard
// ============================================================================

/// Held core lock. Dropping it releases one nesting level.
pub(crate) struct CoreGuard<'a> {
    guard: ReentrantMutexGuard<'a, RefCell<CoreState>>,
}

impl CoreGuard<'_> {
    /// Borrows the state.
    ///
    /// Must not be held while invoking listeners or anything else that can
    /// re-enter the engine.
    #[inline]
    pub(crate) fn state(&self) -> RefMut<'_, CoreState> {
        self.guard.borrow_mut()
    }
}

impl Drop for CoreGuard<'_> {
    fn drop(&mut self) {
        LOCK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// ============================================================================
// Tests
// ============================================================================

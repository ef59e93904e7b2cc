//! Reader-writer-guarded mutable slot (C2).
//!
//! [`ProtectedCell`] is the basis for shared state across the runtime: the
//! exclusivity registry, a group's operations list and error maps, and
//! retry counters are all, conceptually, a `ProtectedCell` over their
//! payload. It is a thin wrapper over [`std::sync::RwLock`] rather than a
//! bespoke synchronization primitive — the invariant that matters is not the
//! lock implementation but the discipline around it: never hold the guard
//! across a user callback.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A reader-writer-guarded mutable slot.
pub struct ProtectedCell<T> {
    inner: RwLock<T>,
}

impl<T> ProtectedCell<T> {
    /// Wrap `value` in a new cell.
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Acquire a read guard.
    ///
    /// # Panics
    /// Panics if the lock is poisoned by a panicking writer, matching the
    /// standard library's own `RwLock` semantics.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().expect("ProtectedCell poisoned")
    }

    /// Acquire a write guard.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().expect("ProtectedCell poisoned")
    }

    /// Read `value` under a read guard via `f`, releasing the guard before
    /// returning.
    pub fn with_read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.read())
    }

    /// Mutate `value` under a write guard via `f`, releasing the guard
    /// before returning.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.write())
    }
}

impl<T: Clone> ProtectedCell<T> {
    /// Return a clone of the current value.
    pub fn snapshot(&self) -> T {
        self.read().clone()
    }
}

impl<T: Default> Default for ProtectedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for ProtectedCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_read() {
            Ok(guard) => f.debug_tuple("ProtectedCell").field(&*guard).finish(),
            Err(_) => f.debug_tuple("ProtectedCell").field(&"<locked>").finish(),
        }
    }
}

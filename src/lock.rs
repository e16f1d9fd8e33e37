use std::ops::{Deref, DerefMut};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

/// Multi-reader/single-writer lock handed out as scoped RAII guards.
///
/// Read acquisition is recursive, so a thread already holding a read guard
/// may take another for a nested scope. Guards are move-only values that
/// release exactly once when dropped; a double release is unrepresentable.
/// At most one writer holds the lock at a time and readers never observe a
/// partial update. Guards are never held across a call into client callback
/// code.
pub struct ScopedRwLock<T> {
    inner: RwLock<T>,
}

impl<T> ScopedRwLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Acquires shared read access. Reentrant on the same thread.
    pub fn fetch_read(&self) -> ScopedReadGuard<'_, T> {
        ScopedReadGuard(self.inner.read_recursive())
    }

    /// Acquires exclusive write access.
    pub fn fetch_write(&self) -> ScopedWriteGuard<'_, T> {
        ScopedWriteGuard(self.inner.write())
    }

    /// Acquires exclusive write access without blocking, or returns `None`
    /// when a competing holder exists.
    pub fn try_fetch_write(&self) -> Option<ScopedWriteGuard<'_, T>> {
        self.inner.try_write().map(ScopedWriteGuard)
    }

    /// Acquires read access that can later be upgraded to write access
    /// without releasing the lock in between.
    pub fn fetch_upgradeable_read(&self) -> ScopedUpgradeableGuard<'_, T> {
        ScopedUpgradeableGuard(self.inner.upgradable_read())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for ScopedRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

pub struct ScopedReadGuard<'a, T>(RwLockReadGuard<'a, T>);

impl<T> Deref for ScopedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

pub struct ScopedWriteGuard<'a, T>(RwLockWriteGuard<'a, T>);

impl<T> Deref for ScopedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for ScopedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

pub struct ScopedUpgradeableGuard<'a, T>(RwLockUpgradableReadGuard<'a, T>);

impl<'a, T> ScopedUpgradeableGuard<'a, T> {
    /// Consumes the guard and upgrades it to exclusive write access.
    pub fn upgrade(this: Self) -> ScopedWriteGuard<'a, T> {
        ScopedWriteGuard(RwLockUpgradableReadGuard::upgrade(this.0))
    }
}

impl<T> Deref for ScopedUpgradeableGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

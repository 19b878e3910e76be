//! Spinlock used before any blocking primitive exists
//!
//! Capability operations run during bootstrap and inside scheduler critical
//! sections, where a thread cannot be put to sleep. `SpinLock` is a thin
//! wrapper around `spin::Mutex` that only hands out access through a closure,
//! so a guard can never escape and be held across a blocking operation.
//!
//! With the `loom` feature the lock is backed by `loom::sync::Mutex` so the
//! loom models drive the real capability space. Such builds only work inside
//! `loom::model`.

#[cfg(feature = "loom")]
use loom::sync::Mutex;
#[cfg(not(feature = "loom"))]
use spin::Mutex;

/// Busy-waiting lock with closure-scoped critical sections.
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

#[cfg(not(feature = "loom"))]
impl<T> SpinLock<T> {
    /// Create an unlocked lock protecting `value`.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access to the protected value.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Like [`SpinLock::with`] but gives up instead of spinning.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock()?;
        Some(f(&mut guard))
    }

    /// Whether some context currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Exclusive access without locking, checked by the borrow checker.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

#[cfg(feature = "loom")]
impl<T> SpinLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        // A panicking model thread fails the model anyway
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.try_lock().ok()?;
        Some(f(&mut guard))
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_with_returns_closure_result() {
        let lock = SpinLock::new(41u32);
        let v = lock.with(|n| {
            *n += 1;
            *n
        });
        assert_eq!(v, 42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_with_fails_while_held() {
        let lock = SpinLock::new(0u32);
        lock.with(|_| {
            assert!(lock.is_locked());
            assert!(lock.try_with(|_| ()).is_none());
        });
        assert_eq!(lock.try_with(|n| *n), Some(0));
    }
}

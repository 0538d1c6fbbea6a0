//! Safe global initialization
//!
//! The kernel's singletons (frame allocator, VMM, scheduler, syscall table)
//! are created once during bootstrap, in a fixed order, and read-mostly
//! thereafter. `GlobalState` gives them a home without `static mut`: a
//! `spin::Mutex<Option<T>>` that is filled exactly once and then borrowed
//! through closures.

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

extern crate alloc;

/// A write-once cell handing out `&'static` references with no lock held.
///
/// Read-mostly singletons (HAL, frame allocator, VMM) live here: after the
/// single `set` during bootstrap, `get` is a plain atomic load, so nested
/// access from trap handlers can never deadlock. Interior mutability inside
/// the stored value (its own mutexes/atomics) covers the mutable parts.
pub struct OnceCell<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceCell<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Fill the cell. Fails (and drops `value`) if already filled.
    pub fn set(&self, value: T) -> KernelResult<()> {
        let boxed = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            boxed,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // Lost the race; reclaim our allocation.
                // SAFETY: `boxed` came from Box::into_raw above and was
                // never published.
                drop(unsafe { alloc::boxed::Box::from_raw(boxed) });
                Err(KernelError::AlreadyExists {
                    what: "global state",
                })
            }
        }
    }

    /// Borrow the value for the rest of the program, if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was published by `set` with
            // Release ordering from a leaked Box; it is never freed while
            // the program runs (Drop only runs for owned cells in tests).
            Some(unsafe { &*ptr })
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.inner.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for OnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceCell<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: exclusive access in drop; the pointer came from
            // Box::into_raw in `set`.
            drop(unsafe { alloc::boxed::Box::from_raw(ptr) });
        }
    }
}

// SAFETY: the cell only publishes the value through an atomic pointer with
// Release/Acquire ordering; sharing &T across contexts needs T: Sync, and
// transferring the cell needs T: Send.
unsafe impl<T: Send> Send for OnceCell<T> {}
unsafe impl<T: Send + Sync> Sync for OnceCell<T> {}

/// A late-initialized global protected by a spin mutex.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    /// Create an empty, uninitialized cell.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Fill the cell. Fails if it was already initialized.
    pub fn init(&self, value: T) -> KernelResult<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            return Err(KernelError::AlreadyExists {
                what: "global state",
            });
        }
        *guard = Some(value);
        Ok(())
    }

    /// Whether the cell has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Borrow the value immutably. Returns `None` when uninitialized.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.inner.lock();
        guard.as_ref().map(f)
    }

    /// Borrow the value mutably. Returns `None` when uninitialized.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.inner.lock();
        guard.as_mut().map(f)
    }

    /// Take the value out, leaving the cell empty again.
    ///
    /// Only used by teardown paths in tests; the boot path never
    /// uninitializes a global.
    pub fn take(&self) -> Option<T> {
        self.inner.lock().take()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

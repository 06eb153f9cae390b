//! Read-copy-update slot holding the driver currently bound to an entity
//!
//! Writers publish a new `Arc` with a single atomic swap; readers load it
//! inside an [`EpochDomain`] read-side section, so they either see the old
//! driver or the new one and never a freed one. The swapped-out value is
//! retired into the domain instead of being dropped in place.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use super::epoch::EpochDomain;

/// Atomically swappable, possibly empty, shared pointer
pub struct DriverSlot<T: ?Sized + Send + Sync + 'static> {
    /// Boxed `Arc` so the atomic pointer stays thin for unsized drivers
    current: AtomicPtr<Arc<T>>,
    domain: Arc<EpochDomain>,
}

impl<T: ?Sized + Send + Sync + 'static> DriverSlot<T> {
    /// Create an empty slot reclaiming through `domain`
    pub fn new(domain: Arc<EpochDomain>) -> Self {
        Self {
            current: AtomicPtr::new(ptr::null_mut()),
            domain,
        }
    }

    /// Run `f` against the current value without blocking
    ///
    /// The value stays alive for the duration of `f` even if a writer detaches
    /// it concurrently.
    pub fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let _guard = self.domain.read();
        let current = self.current.load(Ordering::SeqCst);

        // SAFETY: non-null pointers come from Box::into_raw in `replace` and
        // are only freed after a grace period that includes this reader.
        let value = unsafe { current.as_ref() };
        f(value.map(|arc| &**arc))
    }

    /// Take a strong reference to the current value
    pub fn load(&self) -> Option<Arc<T>> {
        let _guard = self.domain.read();
        let current = self.current.load(Ordering::SeqCst);

        // SAFETY: see `with`
        unsafe { current.as_ref() }.cloned()
    }

    /// Whether a value is currently published
    pub fn is_set(&self) -> bool {
        !self.current.load(Ordering::SeqCst).is_null()
    }

    /// Publish `value`, returning the previous one
    ///
    /// Callers serialize writes with the owning protocol's lock. Once this
    /// returns no new reader can observe the previous value.
    pub(crate) fn replace(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let new = value.map_or(ptr::null_mut(), |arc| Box::into_raw(Box::new(arc)));
        let old = self.current.swap(new, Ordering::SeqCst);

        if old.is_null() {
            return None;
        }

        // SAFETY: `old` was produced by Box::into_raw and is now unpublished;
        // in-flight readers keep it alive until the domain reclaims it.
        let retired = unsafe { Box::from_raw(old) };
        let previous = Arc::clone(&retired);
        self.domain.defer_reclaim(retired);
        self.domain.try_reclaim();
        Some(previous)
    }

    /// Remove the current value
    pub(crate) fn clear(&self) -> Option<Arc<T>> {
        self.replace(None)
    }
}

impl<T: ?Sized + Send + Sync + 'static> Drop for DriverSlot<T> {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        if !current.is_null() {
            // SAFETY: exclusive access, no reader can be inside `with`/`load`
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> std::fmt::Debug for DriverSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

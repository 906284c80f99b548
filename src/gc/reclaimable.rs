// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared handles to objects owned by a [`DeferredCollector`].
//!
//! [`DeferredCollector`]: crate::gc::DeferredCollector

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// A reference-counted handle whose final release is deferred to the collector.
///
/// Handles can only be created by [`DeferredCollector::register`] or
/// [`DeferredCollector::adopt`], so the collector always holds one extra
/// reference. Cloning and dropping a handle is a single atomic operation and
/// never frees memory; the allocation is released by a later sweep on the
/// collector's thread.
///
/// Treat the contents as immutable once a handle has been sent to another
/// thread. Interior mutability must be lock-free and thread-safe (atomics).
///
/// [`DeferredCollector::register`]: crate::gc::DeferredCollector::register
/// [`DeferredCollector::adopt`]: crate::gc::DeferredCollector::adopt
pub struct Reclaimable<T: ?Sized> {
    inner: Arc<T>,
}

/// A type-erased [`Reclaimable`], used for object-valued tree properties.
pub type SharedObject = Reclaimable<dyn Any + Send + Sync>;

impl<T: ?Sized> Reclaimable<T> {
    /// Wrap an allocation the collector already holds a reference to.
    pub(crate) fn from_registered(inner: Arc<T>) -> Self {
        Self { inner }
    }

    /// The underlying allocation, for the collector's own reference.
    pub(crate) fn as_arc(&self) -> &Arc<T> {
        &self.inner
    }

    /// Address of the shared allocation, used as the registry key.
    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Whether two handles point at the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Number of live references, including the collector's own.
    pub fn strong_count(this: &Self) -> usize {
        Arc::strong_count(&this.inner)
    }
}

impl<T> Reclaimable<T> {
    /// Give up this handle's reference as a raw pointer.
    pub(crate) fn into_raw(self) -> *const T {
        Arc::into_raw(self.inner)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`into_raw`](Self::into_raw) and its reference
    /// must not have been reclaimed already.
    pub(crate) unsafe fn from_raw(ptr: *const T) -> Self {
        Self {
            inner: Arc::from_raw(ptr),
        }
    }
}

impl<T: Any + Send + Sync> Reclaimable<T> {
    /// Erase the concrete type so the object can be stored as a property.
    pub fn into_shared_object(self) -> SharedObject {
        let inner: Arc<dyn Any + Send + Sync> = self.inner;
        Reclaimable { inner }
    }
}

impl SharedObject {
    /// Borrow the object as `T` if that is its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.inner).downcast_ref::<T>()
    }
}

impl<T: ?Sized> Clone for Reclaimable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ?Sized> Deref for Reclaimable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: ?Sized> PartialEq for Reclaimable<T> {
    fn eq(&self, other: &Self) -> bool {
        Self::ptr_eq(self, other)
    }
}

impl<T: ?Sized> Eq for Reclaimable<T> {}

impl<T: ?Sized> fmt::Debug for Reclaimable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reclaimable")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("strong_count", &Arc::strong_count(&self.inner))
            .finish()
    }
}

use crate::{
    sptr::{addr, object_id},
    PromoteError, RefBase, RefObject, RefObjectExt, Sptr, WeakRefCounter,
};
use core::{fmt, mem, ptr::NonNull};

// The weak identity block and the object it was created for.
struct Target<T: ?Sized> {
    refs: NonNull<WeakRefCounter>,
    ptr: NonNull<T>,
}

impl<T: ?Sized> Clone for Target<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for Target<T> {}

impl<T: ?Sized> Target<T> {
    #[inline(always)]
    fn refs(&self) -> &WeakRefCounter {
        // SAFETY: a handle holding a target owns one subscription on the block
        unsafe { self.refs.as_ref() }
    }
}

/// Weak handle to a reference-counted object.
///
/// A `Wptr<T>` observes an object without keeping it alive and can be
/// [promoted](Wptr::promote) to an [`Sptr`] while the object still lives.
/// Weak handles work for objects that never had a strong owner: if the last
/// weak handle of such an object goes away, the object is destroyed.
///
/// Each handle built from a raw pointer or from an [`Sptr`] gets its own
/// weak identity, a [`WeakRefCounter`] that counts as one weak reference on
/// the object. Clones share the identity of their source.
///
/// # Examples
///
/// ```
/// use refbase::{RefBase, Sptr, Wptr};
///
/// let strong = Sptr::new(RefBase::new());
/// let weak = Wptr::from(&strong);
/// let again = weak.clone();
/// assert_eq!(weak.weak_ref_count(), 2);
/// // the strong owner plus one weak identity
/// assert_eq!(strong.wptr_ref_count(), 2);
///
/// let promoted = again.promote();
/// assert!(promoted == strong);
/// assert_eq!(strong.sptr_ref_count(), 2);
/// ```
pub struct Wptr<T: ?Sized + RefObject> {
    inner: Option<Target<T>>,
}

// SAFETY: `RefObject` requires `Send + Sync` and the counts are atomic
unsafe impl<T: ?Sized + RefObject> Send for Wptr<T> {}
unsafe impl<T: ?Sized + RefObject> Sync for Wptr<T> {}

impl<T: RefObject + 'static> Wptr<T> {
    /// Moves `value` to the heap and returns a weak handle to it. No strong
    /// owner exists until the handle is promoted.
    #[inline]
    pub fn new(value: T) -> Wptr<T> {
        Wptr::from_box(Box::new(value))
    }
}

impl<T: RefObject> Wptr<T> {
    /// Address of the object, null once it is gone or for an empty handle.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.get_ref_ptr()
            .map_or(core::ptr::null(), |ptr| ptr.as_ptr() as *const T)
    }
}

impl<T: ?Sized + RefObject> Wptr<T> {
    /// Creates an empty handle.
    #[inline]
    #[must_use]
    pub const fn null() -> Wptr<T> {
        Wptr { inner: None }
    }

    /// Moves a boxed object under counting and returns a weak handle to it.
    ///
    /// If the object's [`RefBase`] was already moved from, nothing frees the
    /// box; see [`RefBase::manage`].
    pub fn from_box(object: Box<T>) -> Wptr<T>
    where
        T: 'static,
    {
        let ptr = RefBase::manage(object);
        // SAFETY: `manage` returns a live, wired object
        unsafe { Wptr::from_raw(ptr.as_ptr()) }
    }

    /// Creates a weak handle with a new weak identity for the object at
    /// `ptr`. A null pointer, or an object whose [`RefBase`] was moved
    /// from, yields an empty handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object, normally one returned
    /// by [`RefBase::manage`] or obtained from another handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Wptr};
    ///
    /// let object = RefBase::manage(Box::new(RefBase::new()));
    /// let first = unsafe { Wptr::from_raw(object.as_ptr()) };
    /// let second = unsafe { Wptr::from_raw(object.as_ptr()) };
    /// // two identities, one subscriber each
    /// assert_eq!(first.weak_ref_count(), 1);
    /// assert_eq!(unsafe { second.get() }.unwrap().wptr_ref_count(), 2);
    /// assert!(first == second);
    /// ```
    pub unsafe fn from_raw(ptr: *const T) -> Wptr<T> {
        let Some(ptr) = NonNull::new(ptr as *mut T) else {
            return Wptr::null();
        };
        match ptr.as_ref().create_weak_ref(object_id(ptr)) {
            Some(refs) => {
                refs.as_ref().inc_weak_ref_count(object_id(ptr));
                Wptr {
                    inner: Some(Target { refs, ptr }),
                }
            }
            None => Wptr::null(),
        }
    }

    /// Replaces the target with a new weak identity for the object at
    /// `ptr`, acquired before the old one is released.
    ///
    /// # Safety
    ///
    /// Same as [`Wptr::from_raw`].
    #[inline]
    pub unsafe fn reset(&mut self, ptr: *const T) {
        *self = Wptr::from_raw(ptr);
    }

    /// Releases the target, leaving the handle empty.
    #[inline]
    pub fn clear(&mut self) {
        *self = Wptr::null();
    }

    /// Returns `true` if the handle holds nothing. A handle whose object is
    /// gone is not null; see [`get_ref_ptr`](Wptr::get_ref_ptr).
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Attempts to take a strong reference. Returns an empty [`Sptr`] if the
    /// handle is empty, the object was released, or its promotion gate
    /// refused.
    ///
    /// Promoting an object that never had a strong owner makes the returned
    /// handle its first owner.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Wptr};
    ///
    /// let weak = Wptr::new(RefBase::new());
    /// let strong = weak.promote();
    /// assert_eq!(strong.sptr_ref_count(), 1);
    /// drop(strong);
    /// assert!(weak.promote().is_null());
    /// ```
    pub fn promote(&self) -> Sptr<T> {
        self.try_promote().unwrap_or_default()
    }

    /// Like [`promote`](Wptr::promote), telling why promotion failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{PromoteError, RefBase, Wptr};
    ///
    /// assert_eq!(
    ///     Wptr::<RefBase>::null().try_promote().unwrap_err(),
    ///     PromoteError::Empty
    /// );
    /// ```
    pub fn try_promote(&self) -> Result<Sptr<T>, PromoteError> {
        let Some(target) = self.inner else {
            return Err(PromoteError::Empty);
        };
        // SAFETY: this handle's subscription keeps the block and the counter
        // alive through the call
        if unsafe { target.refs().attempt_inc_strong_ref(object_id(target.ptr)) } {
            // SAFETY: the promotion took the strong reference for us
            Ok(unsafe { Sptr::adopt(target.ptr) })
        } else {
            Err(PromoteError::Expired)
        }
    }

    /// The object pointer while the object is valid. `None` for an empty
    /// handle, and for good once the object was seen destroyed.
    #[inline]
    #[must_use]
    pub fn get_ref_ptr(&self) -> Option<NonNull<T>> {
        let target = self.inner?;
        if target.refs().get_ref_ptr().is_null() {
            None
        } else {
            Some(target.ptr)
        }
    }

    /// The object, if still valid.
    ///
    /// # Safety
    ///
    /// A weak handle does not keep the object alive: another thread may
    /// destroy it while the returned reference is in use. The caller must
    /// make sure a strong owner exists for as long as the reference lives,
    /// or that the object has extended lifetime.
    #[inline]
    pub unsafe fn get(&self) -> Option<&T> {
        self.get_ref_ptr().map(|ptr| &*ptr.as_ptr())
    }

    /// Number of handles sharing this handle's weak identity, zero for an
    /// empty handle.
    #[inline]
    #[must_use]
    pub fn weak_ref_count(&self) -> i32 {
        self.inner.map_or(0, |target| target.refs().weak_ref_count())
    }

    /// Reinterprets the handle as a handle to a related type, sharing the
    /// weak identity. Nothing is counted.
    ///
    /// # Safety
    ///
    /// `f` must return a pointer to the same object, viewed as `U`, whose
    /// [`RefObject`] implementation uses the same [`RefBase`]. It is not
    /// allowed to dereference its argument, as the object may be gone.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, RefObject, Wptr};
    /// use std::ptr::NonNull;
    ///
    /// let weak = Wptr::new(RefBase::new());
    /// let erased: Wptr<dyn RefObject> =
    ///     unsafe { Wptr::cast(weak, |ptr| ptr as NonNull<dyn RefObject>) };
    /// assert_eq!(erased.weak_ref_count(), 1);
    /// assert!(!erased.promote().is_null());
    /// ```
    pub unsafe fn cast<U, F>(this: Self, f: F) -> Wptr<U>
    where
        U: ?Sized + RefObject,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        let Some(target) = this.inner else {
            return Wptr::null();
        };
        let ptr = f(target.ptr);
        mem::forget(this);
        Wptr {
            inner: Some(Target {
                refs: target.refs,
                ptr,
            }),
        }
    }
}

impl<T: ?Sized + RefObject> Clone for Wptr<T> {
    /// Shares the weak identity of `self`.
    #[inline]
    fn clone(&self) -> Self {
        if let Some(target) = self.inner {
            target.refs().inc_weak_ref_count(object_id(target.ptr));
        }
        Wptr { inner: self.inner }
    }
}

impl<T: ?Sized + RefObject> Drop for Wptr<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(target) = self.inner {
            // SAFETY: this handle owns one subscription; the block, the
            // object and the counter may be gone afterwards
            unsafe { WeakRefCounter::dec_weak_ref_count(target.refs, object_id(target.ptr)) };
        }
    }
}

impl<T: ?Sized + RefObject> Default for Wptr<T> {
    #[inline]
    fn default() -> Wptr<T> {
        Wptr::null()
    }
}

impl<T: ?Sized + RefObject> From<&Sptr<T>> for Wptr<T> {
    /// Creates a weak handle with a new weak identity.
    #[inline]
    fn from(strong: &Sptr<T>) -> Self {
        match strong.get_ref_ptr() {
            // SAFETY: `strong` keeps the object alive
            Some(ptr) => unsafe { Wptr::from_raw(ptr.as_ptr()) },
            None => Wptr::null(),
        }
    }
}

impl<T: ?Sized + RefObject, U: ?Sized + RefObject> PartialEq<Wptr<U>> for Wptr<T> {
    #[inline]
    fn eq(&self, other: &Wptr<U>) -> bool {
        addr(self.get_ref_ptr()) == addr(other.get_ref_ptr())
    }
}

impl<T: ?Sized + RefObject, U: ?Sized + RefObject> PartialEq<Sptr<U>> for Wptr<T> {
    #[inline]
    fn eq(&self, other: &Sptr<U>) -> bool {
        addr(self.get_ref_ptr()) == addr(other.get_ref_ptr())
    }
}

impl<T: ?Sized + RefObject> PartialEq<*const T> for Wptr<T> {
    #[inline]
    fn eq(&self, other: &*const T) -> bool {
        addr(self.get_ref_ptr()) == *other as *const () as usize
    }
}

impl<T: ?Sized + RefObject> fmt::Debug for Wptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get_ref_ptr() {
            Some(ptr) => f.debug_tuple("Wptr").field(&ptr).finish(),
            None => f.write_str("Wptr(null)"),
        }
    }
}

impl<T: ?Sized + RefObject> fmt::Pointer for Wptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&(addr(self.get_ref_ptr()) as *const ()), f)
    }
}

impl<T: ?Sized + RefObject> Unpin for Wptr<T> {}

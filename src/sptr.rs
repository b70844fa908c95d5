use crate::{ObjectId, RefBase, RefObject, RefObjectExt, Wptr};
use core::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem,
    ops::Deref,
    ptr::{self, NonNull},
};

#[inline(always)]
pub(crate) fn object_id<T: ?Sized>(ptr: NonNull<T>) -> ObjectId {
    ptr.as_ptr() as *const ()
}

#[inline(always)]
pub(crate) fn addr<T: ?Sized>(ptr: Option<NonNull<T>>) -> usize {
    ptr.map_or(0, |ptr| object_id(ptr) as usize)
}

/// Strong handle to a reference-counted object.
///
/// An `Sptr<T>` owns one strong reference (and the weak reference that comes
/// with it) on an object embedding a [`RefBase`]. Cloning takes another
/// strong reference, dropping releases it; when the last one goes away the
/// object is told through [`RefObject::on_last_strong_ref`] and, unless its
/// lifetime was extended, destroyed.
///
/// Unlike `Arc`, an `Sptr` can be empty, and a handle can be created from a
/// raw object pointer at any time: the counter lives with the object, not
/// with the handle.
///
/// Handles compare, order and hash by object address.
///
/// # Examples
///
/// ```
/// use refbase::{RefBase, RefObject, Sptr};
///
/// struct Node {
///     base: RefBase,
///     value: u32,
/// }
///
/// impl RefObject for Node {
///     fn ref_base(&self) -> &RefBase {
///         &self.base
///     }
/// }
///
/// let a = Sptr::new(Node { base: RefBase::new(), value: 3 });
/// let b = a.clone();
/// assert!(a == b);
/// assert_eq!(b.value, 3);
/// assert_eq!(a.ref_base().sptr_ref_count(), 2);
/// ```
pub struct Sptr<T: ?Sized + RefObject> {
    ptr: Option<NonNull<T>>,
    phantom: PhantomData<T>,
}

// SAFETY: `RefObject` requires `Send + Sync` and the counts are atomic
unsafe impl<T: ?Sized + RefObject> Send for Sptr<T> {}
unsafe impl<T: ?Sized + RefObject> Sync for Sptr<T> {}

impl<T: RefObject + 'static> Sptr<T> {
    /// Moves `value` to the heap and returns the first strong handle to it.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Sptr};
    ///
    /// let base = Sptr::new(RefBase::new());
    /// assert_eq!(base.sptr_ref_count(), 1);
    /// assert_eq!(base.wptr_ref_count(), 1);
    /// ```
    #[inline]
    pub fn new(value: T) -> Sptr<T> {
        Sptr::from_box(Box::new(value))
    }
}

impl<T: RefObject> Sptr<T> {
    /// Address of the object, null for an empty handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Sptr};
    ///
    /// let x = Sptr::new(RefBase::new());
    /// let y = x.clone();
    /// assert_eq!(x.as_ptr(), y.as_ptr());
    /// assert!(Sptr::<RefBase>::null().as_ptr().is_null());
    /// ```
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        self.ptr.map_or(ptr::null(), |ptr| ptr.as_ptr() as *const T)
    }
}

impl<T: ?Sized + RefObject> Sptr<T> {
    /// Creates an empty handle.
    #[inline]
    #[must_use]
    pub const fn null() -> Sptr<T> {
        Sptr {
            ptr: None,
            phantom: PhantomData,
        }
    }

    /// Boxed counterpart of [`Sptr::new`], also usable for unsized objects.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, RefObject, Sptr};
    ///
    /// trait Named: RefObject {
    ///     fn name(&self) -> &str;
    /// }
    ///
    /// struct Service {
    ///     base: RefBase,
    /// }
    ///
    /// impl RefObject for Service {
    ///     fn ref_base(&self) -> &RefBase {
    ///         &self.base
    ///     }
    /// }
    ///
    /// impl Named for Service {
    ///     fn name(&self) -> &str {
    ///         "service"
    ///     }
    /// }
    ///
    /// let boxed: Box<dyn Named> = Box::new(Service { base: RefBase::new() });
    /// let named = Sptr::from_box(boxed);
    /// assert_eq!(named.name(), "service");
    /// ```
    ///
    /// If the object's [`RefBase`] was already moved from, nothing frees the
    /// box; see [`RefBase::manage`].
    pub fn from_box(object: Box<T>) -> Sptr<T>
    where
        T: 'static,
    {
        let ptr = RefBase::manage(object);
        // SAFETY: `manage` returns a live, wired object
        unsafe { Sptr::from_raw(ptr.as_ptr()) }
    }

    /// Takes a new strong reference on the object at `ptr`. A null pointer
    /// yields an empty handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to a live object, normally one returned
    /// by [`RefBase::manage`] or obtained from another handle. Objects that
    /// were never managed have no destruction callback and are not freed by
    /// the handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Sptr};
    ///
    /// let object = RefBase::manage(Box::new(RefBase::new()));
    /// let a = unsafe { Sptr::from_raw(object.as_ptr()) };
    /// let b = unsafe { Sptr::from_raw(object.as_ptr()) };
    /// assert_eq!(a.sptr_ref_count(), 2);
    /// assert_eq!(a, b);
    /// ```
    #[inline]
    pub unsafe fn from_raw(ptr: *const T) -> Sptr<T> {
        match NonNull::new(ptr as *mut T) {
            Some(ptr) => {
                ptr.as_ref().inc_strong_ref(object_id(ptr));
                Sptr {
                    ptr: Some(ptr),
                    phantom: PhantomData,
                }
            }
            None => Sptr::null(),
        }
    }

    // Wraps a pointer whose strong reference the caller already took.
    #[inline]
    pub(crate) unsafe fn adopt(ptr: NonNull<T>) -> Sptr<T> {
        Sptr {
            ptr: Some(ptr),
            phantom: PhantomData,
        }
    }

    /// Replaces the target with the object at `ptr`. The new object is
    /// acquired before the old one is released, so resetting a handle to
    /// its own target never destroys it.
    ///
    /// # Safety
    ///
    /// Same as [`Sptr::from_raw`].
    #[inline]
    pub unsafe fn reset(&mut self, ptr: *const T) {
        *self = Sptr::from_raw(ptr);
    }

    /// Releases the target, leaving the handle empty.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, Sptr};
    ///
    /// let mut x = Sptr::new(RefBase::new());
    /// x.clear();
    /// assert!(x.is_null());
    /// ```
    #[inline]
    pub fn clear(&mut self) {
        *self = Sptr::null();
    }

    /// Returns `true` if the handle holds nothing.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// The object, or `None` for an empty handle.
    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: the handle keeps the object alive
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// The object pointer, or `None` for an empty handle.
    #[inline]
    #[must_use]
    pub fn get_ref_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Creates a weak handle with its own weak identity.
    #[inline]
    pub fn downgrade(&self) -> Wptr<T> {
        Wptr::from(self)
    }

    /// Returns `true` if both handles point to the same object.
    #[inline]
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        addr(this.ptr) == addr(other.ptr)
    }

    /// Reinterprets the handle as a handle to a related type that embeds the
    /// same [`RefBase`], typically an upcast to a trait object or a downcast
    /// through [`Any`](core::any::Any). The strong reference moves over;
    /// nothing is counted.
    ///
    /// Fails, giving the handle back, if `f` returns `None` or a value with a
    /// different [`RefBase`]. An empty handle casts to an empty handle.
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefBase, RefObject, Sptr};
    /// use std::any::Any;
    ///
    /// trait Shape: RefObject {
    ///     fn area(&self) -> f64;
    ///     fn as_any(&self) -> &dyn Any;
    /// }
    ///
    /// struct Square {
    ///     base: RefBase,
    ///     side: f64,
    /// }
    ///
    /// impl RefObject for Square {
    ///     fn ref_base(&self) -> &RefBase {
    ///         &self.base
    ///     }
    /// }
    ///
    /// impl Shape for Square {
    ///     fn area(&self) -> f64 {
    ///         self.side * self.side
    ///     }
    ///     fn as_any(&self) -> &dyn Any {
    ///         self
    ///     }
    /// }
    ///
    /// let square = Sptr::new(Square { base: RefBase::new(), side: 2.0 });
    /// let shape = Sptr::cast(square, |s| Some(s as &dyn Shape)).ok().unwrap();
    /// assert_eq!(shape.area(), 4.0);
    ///
    /// let square = Sptr::cast(shape, |s| s.as_any().downcast_ref::<Square>()).ok().unwrap();
    /// assert_eq!(square.side, 2.0);
    /// assert_eq!(square.ref_base().sptr_ref_count(), 1);
    /// ```
    pub fn cast<U, F>(this: Self, f: F) -> Result<Sptr<U>, Self>
    where
        U: ?Sized + RefObject,
        F: FnOnce(&T) -> Option<&U>,
    {
        let Some(ptr) = this.ptr else {
            return Ok(Sptr::null());
        };
        // SAFETY: the handle keeps the object alive
        let source = unsafe { &*ptr.as_ptr() };
        let target = match f(source) {
            Some(target) if ptr::eq(target.ref_base(), source.ref_base()) => {
                NonNull::from(target)
            }
            _ => return Err(this),
        };
        mem::forget(this);
        // SAFETY: the strong reference of `this` moves over
        Ok(unsafe { Sptr::adopt(target) })
    }
}

#[cold]
#[inline(never)]
fn deref_null_panic() -> ! {
    panic!("dereferenced an empty Sptr");
}

impl<T: ?Sized + RefObject> Deref for Sptr<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[inline(always)]
    fn deref(&self) -> &T {
        match self.ptr {
            // SAFETY: the handle keeps the object alive
            Some(ptr) => unsafe { &*ptr.as_ptr() },
            None => deref_null_panic(),
        }
    }
}

impl<T: ?Sized + RefObject> Clone for Sptr<T> {
    #[inline]
    fn clone(&self) -> Self {
        if let Some(ptr) = self.ptr {
            // SAFETY: the handle keeps the object alive
            unsafe { ptr.as_ref() }.inc_strong_ref(object_id(ptr));
        }
        Sptr {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T: ?Sized + RefObject> Drop for Sptr<T> {
    #[inline]
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            // SAFETY: this handle owns one strong reference, the object may
            // be gone afterwards
            unsafe { T::dec_strong_ref(ptr, object_id(ptr)) };
        }
    }
}

impl<T: ?Sized + RefObject> Default for Sptr<T> {
    #[inline]
    fn default() -> Sptr<T> {
        Sptr::null()
    }
}

impl<T: RefObject + 'static> From<T> for Sptr<T> {
    #[inline(always)]
    fn from(value: T) -> Self {
        Sptr::new(value)
    }
}

impl<T: ?Sized + RefObject + 'static> From<Box<T>> for Sptr<T> {
    #[inline(always)]
    fn from(object: Box<T>) -> Self {
        Sptr::from_box(object)
    }
}

impl<T: ?Sized + RefObject> From<&Wptr<T>> for Sptr<T> {
    /// Promotes the weak handle, see [`Wptr::promote`].
    #[inline]
    fn from(weak: &Wptr<T>) -> Self {
        weak.promote()
    }
}

impl<T: ?Sized + RefObject, U: ?Sized + RefObject> PartialEq<Sptr<U>> for Sptr<T> {
    #[inline]
    fn eq(&self, other: &Sptr<U>) -> bool {
        addr(self.ptr) == addr(other.ptr)
    }
}

impl<T: ?Sized + RefObject> Eq for Sptr<T> {}

impl<T: ?Sized + RefObject, U: ?Sized + RefObject> PartialEq<Wptr<U>> for Sptr<T> {
    #[inline]
    fn eq(&self, other: &Wptr<U>) -> bool {
        addr(self.ptr) == addr(other.get_ref_ptr())
    }
}

impl<T: ?Sized + RefObject> PartialEq<*const T> for Sptr<T> {
    #[inline]
    fn eq(&self, other: &*const T) -> bool {
        addr(self.ptr) == *other as *const () as usize
    }
}

impl<T: ?Sized + RefObject> PartialOrd for Sptr<T> {
    #[inline]
    fn partial_cmp(&self, other: &Sptr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized + RefObject> Ord for Sptr<T> {
    #[inline]
    fn cmp(&self, other: &Sptr<T>) -> Ordering {
        addr(self.ptr).cmp(&addr(other.ptr))
    }
}

impl<T: ?Sized + RefObject> Hash for Sptr<T> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        addr(self.ptr).hash(state);
    }
}

impl<T: ?Sized + RefObject + fmt::Debug> fmt::Debug for Sptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => fmt::Debug::fmt(value, f),
            None => f.write_str("Sptr(null)"),
        }
    }
}

impl<T: ?Sized + RefObject> fmt::Pointer for Sptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&(addr(self.ptr) as *const ()), f)
    }
}

/// Borrows the object.
///
/// # Panics
///
/// Panics if the handle is empty.
impl<T: ?Sized + RefObject> AsRef<T> for Sptr<T> {
    #[inline(always)]
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: ?Sized + RefObject> Unpin for Sptr<T> {}

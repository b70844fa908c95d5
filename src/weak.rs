use crate::{AtomicCounter, ObjectId, RefCounter};
use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{fence, AtomicPtr, Ordering},
};

/// Per-identity weak reference block.
///
/// Every distinct weak identity of an object gets its own block: a handle
/// built from a raw object pointer or from a strong handle creates one,
/// clones of a weak handle share it. The block counts its own subscribers
/// and forwards to the object's [`RefCounter`] only on its first and last
/// subscriber, so the object sees one weak reference per block. It also
/// holds one reference on the counter, keeping it alive for as long as the
/// block exists.
///
/// Blocks free themselves when their own count drops from one to zero.
pub struct WeakRefCounter {
    weak: AtomicCounter,
    ref_counter: NonNull<RefCounter>,
    cookie: AtomicPtr<()>,
}

unsafe impl Send for WeakRefCounter {}
unsafe impl Sync for WeakRefCounter {}

impl WeakRefCounter {
    /// Allocates a block with no subscribers for the object at `cookie`.
    ///
    /// # Safety
    ///
    /// `ref_counter` must point to a live counter; the block takes one
    /// reference on it.
    pub(crate) unsafe fn create(
        ref_counter: NonNull<RefCounter>,
        cookie: *const (),
    ) -> NonNull<WeakRefCounter> {
        ref_counter.as_ref().inc_ref_count();
        NonNull::from(Box::leak(Box::new(WeakRefCounter {
            weak: AtomicCounter::new(0),
            ref_counter,
            cookie: AtomicPtr::new(cookie as *mut ()),
        })))
    }

    #[inline]
    fn counter(&self) -> &RefCounter {
        // SAFETY: the block holds a reference on the counter
        unsafe { self.ref_counter.as_ref() }
    }

    /// Number of handles sharing this block. A snapshot.
    #[inline]
    pub fn weak_ref_count(&self) -> i32 {
        self.weak.load(Ordering::Relaxed)
    }

    /// Adds a subscriber. The first one takes a weak reference on the
    /// object.
    pub fn inc_weak_ref_count(&self, object_id: ObjectId) {
        if self.weak.fetch_add(1, Ordering::Relaxed) == 0 {
            self.counter().inc_weak_ref_count(object_id);
        }
    }

    /// Removes a subscriber. The last one releases the block's weak
    /// reference on the object and frees the block.
    ///
    /// # Safety
    ///
    /// `this` must come from [`WeakRefCounter::create`] and the caller must
    /// own the subscription it releases. The block, the object and the
    /// counter may be freed by this call.
    pub unsafe fn dec_weak_ref_count(this: NonNull<WeakRefCounter>, object_id: ObjectId) {
        let ref_counter = {
            let block = this.as_ref();
            if block.weak.fetch_sub(1, Ordering::Release) != 1 {
                return;
            }
            block.ref_counter
        };
        fence(Ordering::Acquire);
        // the block still holds its counter reference here, the counter
        // survives the object's teardown
        RefCounter::dec_weak_ref_count(ref_counter, object_id);
        drop(Box::from_raw(this.as_ptr()));
    }

    /// The object address if the object is still valid, null otherwise.
    ///
    /// Once the object is seen as gone the cookie is cleared for good, so a
    /// block never reports an object again after reporting null.
    pub fn get_ref_ptr(&self) -> *const () {
        let cookie = self.cookie.load(Ordering::Acquire);
        if !cookie.is_null() && !self.counter().is_ref_ptr_valid() {
            self.cookie.store(ptr::null_mut(), Ordering::Release);
            return ptr::null();
        }
        cookie
    }

    /// The counter this block forwards to.
    #[inline]
    pub fn ref_counter(&self) -> NonNull<RefCounter> {
        self.ref_counter
    }

    /// Promotes through the object's counter. Returns `true` if the caller
    /// now owns a new strong reference (and the weak reference that comes
    /// with it).
    ///
    /// # Safety
    ///
    /// See [`RefCounter::attempt_inc_strong_ref`]. The caller should hold a
    /// subscription on this block so the counter outlives the call.
    pub unsafe fn attempt_inc_strong_ref(&self, object_id: ObjectId) -> bool {
        RefCounter::attempt_inc_strong_ref(self.ref_counter, object_id).is_some()
    }
}

impl Drop for WeakRefCounter {
    fn drop(&mut self) {
        // SAFETY: releases the reference taken in `create`
        unsafe { RefCounter::dec_ref_count(self.ref_counter) };
    }
}

impl fmt::Debug for WeakRefCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRefCounter")
            .field("weak", &self.weak_ref_count())
            .field("ref_counter", &self.ref_counter)
            .field("cookie", &self.cookie.load(Ordering::Relaxed))
            .finish()
    }
}

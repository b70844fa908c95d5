use crate::{
    diag::{report_fatal, FatalReport},
    ObjectId, RefCounter, Violation, WeakRefCounter, INITIAL_PRIMARY_VALUE,
};
use branches::unlikely;
use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{fence, Ordering},
};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle capability of a reference-counted object.
///
/// A shared type embeds a [`RefBase`] and hands it out through
/// [`ref_base`](RefObject::ref_base). Every other method is an optional hook
/// with a default that does nothing (or allows everything).
///
/// Hooks run on whichever thread performs the triggering operation and must
/// not block on other handles of the same object.
pub trait RefObject: Send + Sync {
    /// The embedded counter owner.
    fn ref_base(&self) -> &RefBase;

    /// Called once, when the first strong owner attaches.
    fn on_first_strong_ref(&self, _object_id: ObjectId) {}

    /// Called when the last strong owner leaves, right before a
    /// normal-lifetime object is destroyed.
    fn on_last_strong_ref(&self, _object_id: ObjectId) {}

    /// Never called by the counting engine itself; available to owners that
    /// manage weak lifecycles on their own.
    fn on_last_weak_ref(&self, _object_id: ObjectId) {}

    /// Consulted by [`RefObjectExt::attempt_inc_strong_ref`] before it tries
    /// to promote. Returning `false` refuses the promotion.
    fn on_attempt_promoted(&self, _object_id: ObjectId) -> bool {
        true
    }

    /// Promotion gate of extended-lifetime objects: a weak reference can
    /// only become strong while this returns `true`.
    fn can_promote(&self) -> bool {
        true
    }
}

// Object pointer moved into the destruction callback and the promotion gate.
struct SendPtr<T: ?Sized>(NonNull<T>);

impl<T: ?Sized> SendPtr<T> {
    fn as_ptr(&self) -> *mut T {
        self.0.as_ptr()
    }
}

impl<T: ?Sized> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for SendPtr<T> {}

// SAFETY: only created for `RefObject` types, which are `Send + Sync`
unsafe impl<T: ?Sized + Send + Sync> Send for SendPtr<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for SendPtr<T> {}

fn fresh_counter() -> NonNull<RefCounter> {
    let counter = RefCounter::create();
    // SAFETY: just created, nobody else sees it yet
    unsafe { counter.as_ref() }.inc_ref_count();
    counter
}

/// Owner of an object's [`RefCounter`].
///
/// Embed one in every shared type. A fresh `RefBase` owns a fresh counter:
/// strong count at [`INITIAL_PRIMARY_VALUE`], weak count zero, and one
/// reference on the counter held by the `RefBase` itself.
///
/// A `RefBase` may end up without a counter after [`take`](RefBase::take)
/// or [`move_from`](RefBase::move_from). Every operation on it is then a
/// no-op and every count reads as zero.
///
/// # Examples
///
/// ```
/// use refbase::{RefBase, INITIAL_PRIMARY_VALUE};
///
/// let mut base = RefBase::new();
/// assert_eq!(base.sptr_ref_count(), INITIAL_PRIMARY_VALUE);
/// assert_eq!(base.wptr_ref_count(), 0);
///
/// let moved = base.take();
/// assert_eq!(base.sptr_ref_count(), 0);
/// assert!(moved.ref_counter().is_some());
/// ```
pub struct RefBase {
    refs: Option<NonNull<RefCounter>>,
}

unsafe impl Send for RefBase {}
unsafe impl Sync for RefBase {}

impl RefBase {
    /// Creates a base owning a fresh counter.
    #[must_use]
    pub fn new() -> RefBase {
        RefBase {
            refs: Some(fresh_counter()),
        }
    }

    #[inline]
    pub(crate) fn counter(&self) -> Option<&RefCounter> {
        // SAFETY: the base holds a reference on its counter
        self.refs.map(|refs| unsafe { &*refs.as_ptr() })
    }

    /// The counter owned by this base, `None` once moved from.
    #[inline]
    pub fn ref_counter(&self) -> Option<NonNull<RefCounter>> {
        self.refs
    }

    /// Moves `object` to a stable heap address and wires it to its counter:
    /// the counter's destruction callback frees the box and its promotion
    /// gate asks [`RefObject::can_promote`].
    ///
    /// The returned pointer can be handed to [`Sptr::from_raw`] and
    /// [`Wptr::from_raw`]. Once a strong or weak handle attached, the object
    /// is freed by the counting engine; until then it is leaked unless the
    /// caller frees it.
    ///
    /// An object whose base was already moved from ([`take`](RefBase::take),
    /// [`move_from`](RefBase::move_from)) has no counter to wire. Nothing is
    /// installed and handles never free it: the box stays leaked until the
    /// caller reclaims it with [`Box::from_raw`].
    ///
    /// [`Sptr::from_raw`]: crate::Sptr::from_raw
    /// [`Wptr::from_raw`]: crate::Wptr::from_raw
    pub fn manage<T>(object: Box<T>) -> NonNull<T>
    where
        T: RefObject + ?Sized + 'static,
    {
        let object = NonNull::from(Box::leak(object));
        let target = SendPtr(object);
        // SAFETY: freshly leaked, valid until the callback frees it
        let Some(refs) = unsafe { object.as_ref() }.ref_base().counter() else {
            debug!(
                target: "refbase",
                object = ?object.cast::<()>(),
                "managed object has no counter, its handles will never free it"
            );
            return object;
        };
        refs.set_callback(Box::new(move || {
            // SAFETY: the callback runs at most once, and the object came
            // from `Box::leak`
            drop(unsafe { Box::from_raw(target.as_ptr()) });
        }));
        refs.set_can_promote(Arc::new(move || {
            // SAFETY: the gate is removed before the object goes away
            unsafe { &*target.as_ptr() }.can_promote()
        }));
        object
    }

    /// Current strong count, [`INITIAL_PRIMARY_VALUE`] before any strong
    /// owner attached, zero without a counter.
    pub fn sptr_ref_count(&self) -> i32 {
        self.counter().map_or(0, RefCounter::strong_ref_count)
    }

    /// Current weak count, zero without a counter.
    ///
    /// Every strong owner holds one weak reference, and every distinct weak
    /// identity ([`WeakRefCounter`]) holds one more.
    pub fn wptr_ref_count(&self) -> i32 {
        self.counter().map_or(0, RefCounter::weak_ref_count)
    }

    /// Decouples destruction from the strong count. One way and idempotent.
    pub fn extend_object_lifetime(&self) {
        if let Some(refs) = self.counter() {
            refs.extend_object_lifetime();
        }
    }

    /// Returns `true` if the lifetime was extended.
    pub fn is_extend_life_time_set(&self) -> bool {
        self.counter().map_or(false, RefCounter::is_life_time_extended)
    }

    /// Returns `true` if an attempt acquisition awaits its forced release.
    pub fn is_attempt_acquire_set(&self) -> bool {
        self.counter().map_or(false, RefCounter::is_attempt_acquire_set)
    }

    /// See [`RefCounter::enable_tracker`].
    pub fn enable_tracker(&self) {
        if let Some(refs) = self.counter() {
            refs.enable_tracker();
        }
    }

    /// See [`RefCounter::enable_tracker_with_domain_id`].
    pub fn enable_tracker_with_domain_id(&self, domain_id: u32) {
        if let Some(refs) = self.counter() {
            refs.enable_tracker_with_domain_id(domain_id);
        }
    }

    /// Moves the counter out, leaving this base without one.
    #[must_use]
    pub fn take(&mut self) -> RefBase {
        RefBase {
            refs: self.refs.take(),
        }
    }

    /// Move assignment: releases this base's counter and takes over
    /// `other`'s, leaving `other` without one. Does nothing if both already
    /// share a counter.
    pub fn move_from(&mut self, other: &mut RefBase) {
        if self.refs == other.refs {
            return;
        }
        if let Some(counter) = self.refs {
            // SAFETY: releases the reference this base held
            unsafe {
                counter.as_ref().remove_callback();
                RefCounter::dec_ref_count(counter);
            }
        }
        self.refs = other.refs.take();
    }
}

impl Default for RefBase {
    fn default() -> Self {
        RefBase::new()
    }
}

impl Clone for RefBase {
    /// Copies never share counting state: the clone gets its own fresh
    /// counter.
    fn clone(&self) -> Self {
        RefBase::new()
    }

    /// Copy assignment. The current counter loses its destruction callback
    /// and this base's reference, and a fresh counter takes its place. The
    /// callback and promotion gate move over to the fresh counter.
    ///
    /// Strong handles that attached through the old counter state are not
    /// carried over: their releases hit the fresh, unattached counter and
    /// are ignored, so the object is only destroyed through the fresh
    /// counter's own lifecycle.
    fn clone_from(&mut self, _source: &Self) {
        let fresh = fresh_counter();
        if let Some(old) = self.refs.take() {
            // SAFETY: this base holds a reference on `old` until released below
            let (callback, can_promote) = {
                let refs = unsafe { old.as_ref() };
                (refs.take_callback(), refs.take_can_promote())
            };
            unsafe { RefCounter::dec_ref_count(old) };

            let fresh = unsafe { fresh.as_ref() };
            if let Some(callback) = callback {
                fresh.set_callback(callback);
            }
            if let Some(can_promote) = can_promote {
                fresh.set_can_promote(can_promote);
            }
        }
        self.refs = Some(fresh);
    }
}

impl Drop for RefBase {
    fn drop(&mut self) {
        if let Some(counter) = self.refs.take() {
            // SAFETY: this base holds a reference on its counter
            let release = {
                let refs = unsafe { counter.as_ref() };
                refs.remove_callback();
                refs.remove_can_promote();
                // Destroyed by the weak path of an extended object, or before
                // any strong owner attached: nobody else releases the base's
                // reference in those cases.
                (refs.is_life_time_extended() && refs.weak_ref_count() == 0)
                    || refs.strong_ref_count() == INITIAL_PRIMARY_VALUE
            };
            if release {
                unsafe { RefCounter::dec_ref_count(counter) };
            }
        }
    }
}

impl fmt::Debug for RefBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.counter() {
            Some(refs) => f.debug_tuple("RefBase").field(refs).finish(),
            None => f.write_str("RefBase(<moved>)"),
        }
    }
}

impl RefObject for RefBase {
    fn ref_base(&self) -> &RefBase {
        self
    }
}

#[cold]
fn fatal(counter: NonNull<RefCounter>, object_id: ObjectId, violation: Violation) {
    // SAFETY: callers hold a weak reference, the counter is alive
    let refs = unsafe { counter.as_ref() };
    report_fatal(FatalReport {
        violation,
        counter: counter.as_ptr() as usize,
        object_id: object_id as usize,
        strong: refs.strong_ref_count(),
        weak: refs.weak_ref_count(),
    });
}

/// Reference operations of every [`RefObject`], driving its lifecycle hooks.
///
/// Handles call these for you. They are public for owners that build their
/// own handle types or acquisition guards on top of the counting engine.
/// Without a counter every operation is a no-op returning `false`.
///
/// Operations that may destroy the object take it by pointer, as in
/// `T::dec_strong_ref(ptr, id)`, never by reference: the object can be freed
/// before they return.
pub trait RefObjectExt: RefObject {
    /// Takes a strong reference, together with the weak reference every
    /// strong owner holds. Fires [`on_first_strong_ref`] on attach.
    ///
    /// Taking a strong reference on a normal-lifetime object whose strong
    /// count already dropped to zero is reported as
    /// [`Violation::IncAfterLastRelease`].
    ///
    /// [`on_first_strong_ref`]: RefObject::on_first_strong_ref
    fn inc_strong_ref(&self, object_id: ObjectId) {
        let Some(counter) = self.ref_base().ref_counter() else {
            return;
        };
        let refs = unsafe { counter.as_ref() };
        refs.inc_weak_ref_count(object_id);
        let count = refs.inc_strong_ref_count(object_id);
        if unlikely(!refs.is_life_time_extended() && count == 0) {
            fatal(counter, object_id, Violation::IncAfterLastRelease);
        }
        if count == INITIAL_PRIMARY_VALUE {
            self.on_first_strong_ref(object_id);
        }
    }

    /// Releases a strong reference and the weak reference that came with it.
    ///
    /// When the last strong reference leaves, [`on_last_strong_ref`] fires
    /// and a normal-lifetime object is destroyed. Releasing more strong
    /// references than were taken is reported as
    /// [`Violation::TooManyReleases`].
    ///
    /// # Safety
    ///
    /// `this` must point to a live object and the caller must own the strong
    /// reference. The object, and possibly its counter, may be gone when
    /// this returns.
    ///
    /// [`on_last_strong_ref`]: RefObject::on_last_strong_ref
    unsafe fn dec_strong_ref(this: NonNull<Self>, object_id: ObjectId) {
        let Some(counter) = this.as_ref().ref_base().ref_counter() else {
            return;
        };
        let count = counter.as_ref().dec_strong_ref_count(object_id);
        if unlikely(count <= 0) {
            fatal(counter, object_id, Violation::TooManyReleases);
        }
        if count == 1 {
            fence(Ordering::Acquire);
            this.as_ref().on_last_strong_ref(object_id);
            if !counter.as_ref().is_life_time_extended() {
                // the object is gone after this
                RefCounter::invoke_callback(counter);
            }
        }
        RefCounter::dec_weak_ref_count(counter, object_id);
    }

    /// Takes a weak reference.
    fn inc_weak_ref(&self, object_id: ObjectId) {
        if let Some(refs) = self.ref_base().counter() {
            refs.inc_weak_ref_count(object_id);
        }
    }

    /// Releases a weak reference.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object and the caller must own the weak
    /// reference. The object and its counter may be destroyed by this call.
    unsafe fn dec_weak_ref(this: NonNull<Self>, object_id: ObjectId) {
        if let Some(counter) = this.as_ref().ref_base().ref_counter() {
            RefCounter::dec_weak_ref_count(counter, object_id);
        }
    }

    /// Promotes and records the acquisition in the attempt-acquire side
    /// counter, so that [`check_is_attempt_acquire_set`] can later force the
    /// matching release. Fires [`on_first_strong_ref`] on attach.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object. See
    /// [`RefCounter::attempt_inc_strong_ref`].
    ///
    /// [`check_is_attempt_acquire_set`]: RefObjectExt::check_is_attempt_acquire_set
    /// [`on_first_strong_ref`]: RefObject::on_first_strong_ref
    unsafe fn attempt_acquire(this: NonNull<Self>, object_id: ObjectId) -> bool {
        let Some(counter) = this.as_ref().ref_base().ref_counter() else {
            return false;
        };
        match RefCounter::attempt_inc_strong_ref(counter, object_id) {
            Some(count) => {
                counter.as_ref().set_attempt_acquire();
                if count == INITIAL_PRIMARY_VALUE {
                    this.as_ref().on_first_strong_ref(object_id);
                }
                true
            }
            None => false,
        }
    }

    /// Promotes unless [`on_attempt_promoted`] refuses. Fires
    /// [`on_first_strong_ref`] on attach.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object. See
    /// [`RefCounter::attempt_inc_strong_ref`].
    ///
    /// [`on_attempt_promoted`]: RefObject::on_attempt_promoted
    /// [`on_first_strong_ref`]: RefObject::on_first_strong_ref
    unsafe fn attempt_inc_strong_ref(this: NonNull<Self>, object_id: ObjectId) -> bool {
        let Some(counter) = this.as_ref().ref_base().ref_counter() else {
            return false;
        };
        if !this.as_ref().on_attempt_promoted(object_id) {
            return false;
        }
        match RefCounter::attempt_inc_strong_ref(counter, object_id) {
            Some(count) => {
                if count == INITIAL_PRIMARY_VALUE {
                    this.as_ref().on_first_strong_ref(object_id);
                }
                true
            }
            None => false,
        }
    }

    /// Promotes only while the strong count is positive and records the
    /// acquisition in the attempt-acquire side counter. No hook fires.
    ///
    /// # Safety
    ///
    /// `this` must point to a live object. See
    /// [`RefCounter::attempt_inc_strong`].
    unsafe fn attempt_inc_strong(this: NonNull<Self>, object_id: ObjectId) -> bool {
        let Some(counter) = this.as_ref().ref_base().ref_counter() else {
            return false;
        };
        if RefCounter::attempt_inc_strong(counter, object_id) {
            counter.as_ref().set_attempt_acquire();
            return true;
        }
        false
    }

    /// Forced release matching an attempt acquisition: if one is
    /// outstanding, forgets it and drops one strong and one weak count
    /// straight on the counter. No hook fires and nothing is destroyed by
    /// the strong side.
    ///
    /// A side counter that goes negative is reported as
    /// [`Violation::IllegalAttemptRelease`].
    ///
    /// # Safety
    ///
    /// `this` must point to a live object. The weak release may destroy the
    /// object and its counter.
    unsafe fn check_is_attempt_acquire_set(this: NonNull<Self>, object_id: ObjectId) {
        let Some(counter) = this.as_ref().ref_base().ref_counter() else {
            return;
        };
        {
            let refs = counter.as_ref();
            if !refs.is_attempt_acquire_set() {
                return;
            }
            refs.clear_attempt_acquire();
            let attempts = refs.attempt_acquire_count();
            if unlikely(attempts < 0) {
                fatal(counter, object_id, Violation::IllegalAttemptRelease(attempts));
            }
            refs.dec_strong_ref_count(object_id);
        }
        RefCounter::dec_weak_ref_count(counter, object_id);
    }

    /// Allocates a new weak identity block for the object at `cookie`. The
    /// block starts without subscribers; it frees itself once its last
    /// subscriber leaves, so the caller must subscribe at least once.
    fn create_weak_ref(&self, cookie: *const ()) -> Option<NonNull<WeakRefCounter>> {
        let counter = self.ref_base().ref_counter()?;
        // SAFETY: the base keeps the counter alive
        Some(unsafe { WeakRefCounter::create(counter, cookie) })
    }
}

impl<T: RefObject + ?Sized> RefObjectExt for T {}

use crate::tracker::TraceOp;
#[cfg(feature = "tracker")]
use crate::tracker::{Counts, TraceRecord, Tracker};
use crate::{AtomicCounter, ObjectId};
use bitflags::bitflags;
use branches::{likely, unlikely};
use core::{
    fmt,
    ptr::NonNull,
    sync::atomic::{fence, AtomicU32, Ordering},
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Strong count of an object that never had a strong owner. It is large
/// enough that no real strong count reaches it, so any positive count other
/// than this one means "attached and alive".
pub const INITIAL_PRIMARY_VALUE: i32 = 1 << 28;

bitflags! {
    /// Lifetime policy bits of a [`RefCounter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RefFlags: u32 {
        /// Object destruction is not driven by the strong count.
        const EXTEND_LIFE_TIME = 0x0000_0002;
    }
}

/// Destruction thunk installed by the owning object. Runs at most once.
pub type RefPtrCallback = Box<dyn FnOnce() + Send>;

/// Promotion gate consulted before an extended-lifetime object is promoted
/// from a weak reference.
pub type CanPromote = Arc<dyn Fn() -> bool + Send + Sync>;

/// Shared control block of a reference-counted object.
///
/// It holds the strong and weak counts of the object, its own reference
/// count (how many parties keep the block itself alive), lifetime flags and
/// the destruction callback of the object. Counters are always heap allocated
/// through [`RefCounter::create`] and free themselves once
/// [`ref_count`](RefCounter::ref_count) drops to zero.
///
/// All count operations are lock free. Increments use relaxed ordering;
/// decrements that may lead to destruction use release ordering and the
/// destructive path is preceded by an acquire fence, so every access made
/// through the last handle happens before the object or the counter goes
/// away.
pub struct RefCounter {
    strong: AtomicCounter,
    weak: AtomicCounter,
    ref_count: AtomicCounter,
    flags: AtomicU32,
    attempt: AtomicCounter,
    callback: Mutex<Option<RefPtrCallback>>,
    can_promote: Mutex<Option<CanPromote>>,
    #[cfg(feature = "tracker")]
    tracker: Tracker,
}

// Result of the promotion state machine, before the attach fixup.
enum Promotion {
    // strong count before our increment
    Incremented(i32),
    // no increment happened; the observed strong count
    NotIncremented(i32),
    // extended lifetime and the gate said no
    Refused,
}

impl RefCounter {
    fn new() -> RefCounter {
        RefCounter {
            strong: AtomicCounter::new(INITIAL_PRIMARY_VALUE),
            weak: AtomicCounter::new(0),
            ref_count: AtomicCounter::new(0),
            flags: AtomicU32::new(0),
            attempt: AtomicCounter::new(0),
            callback: Mutex::new(None),
            can_promote: Mutex::new(None),
            #[cfg(feature = "tracker")]
            tracker: Tracker::new(),
        }
    }

    /// Allocates a new counter with every count at its initial value and a
    /// reference count of zero. The first [`inc_ref_count`] claims it; the
    /// matching [`dec_ref_count`] frees it.
    ///
    /// [`inc_ref_count`]: RefCounter::inc_ref_count
    /// [`dec_ref_count`]: RefCounter::dec_ref_count
    ///
    /// # Examples
    ///
    /// ```
    /// use refbase::{RefCounter, INITIAL_PRIMARY_VALUE};
    ///
    /// let counter = RefCounter::create();
    /// let refs = unsafe { counter.as_ref() };
    /// refs.inc_ref_count();
    /// assert_eq!(refs.strong_ref_count(), INITIAL_PRIMARY_VALUE);
    /// // frees the counter
    /// unsafe { RefCounter::dec_ref_count(counter) };
    /// ```
    #[must_use]
    pub fn create() -> NonNull<RefCounter> {
        NonNull::from(Box::leak(Box::new(RefCounter::new())))
    }

    #[cfg(feature = "tracker")]
    #[inline(always)]
    fn trace(&self, object_id: ObjectId, op: TraceOp, count: i32) {
        if unlikely(self.tracker.is_enabled()) {
            self.tracker.record(object_id, op, count, self.counts());
        }
    }

    #[cfg(not(feature = "tracker"))]
    #[inline(always)]
    fn trace(&self, _object_id: ObjectId, _op: TraceOp, _count: i32) {}

    #[cfg(feature = "tracker")]
    fn counts(&self) -> Counts {
        Counts {
            strong: self.strong_ref_count(),
            weak: self.weak_ref_count(),
            ref_count: self.ref_count(),
        }
    }

    /// Current reference count of the counter itself. A snapshot, it may be
    /// stale by the time it is read.
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Keeps the counter alive for one more party.
    #[inline]
    pub fn inc_ref_count(&self) {
        let count = self.ref_count.fetch_add(1, Ordering::Relaxed);
        self.trace(core::ptr::null(), TraceOp::IncRef, count);
    }

    /// Releases one party's hold on the counter and frees it when the last
    /// one leaves. Does nothing if the count is already zero.
    ///
    /// # Safety
    ///
    /// `this` must come from [`RefCounter::create`] and the caller must own
    /// one of the references it releases. The counter must not be used
    /// afterwards unless the caller holds another reference.
    pub unsafe fn dec_ref_count(this: NonNull<RefCounter>) {
        let count = {
            let refs = this.as_ref();
            if refs.ref_count.load(Ordering::Relaxed) <= 0 {
                return;
            }
            let count = refs.ref_count.fetch_sub(1, Ordering::Release);
            refs.trace(core::ptr::null(), TraceOp::DecRef, count);
            count
        };
        if count == 1 {
            fence(Ordering::Acquire);
            // SAFETY: `this` is the pointer leaked by `create`, and this was
            // the last reference, nobody else can reach the block anymore.
            drop(Box::from_raw(this.as_ptr()));
        }
    }

    /// Current strong count, [`INITIAL_PRIMARY_VALUE`] if no strong owner
    /// ever attached. A snapshot.
    #[inline]
    pub fn strong_ref_count(&self) -> i32 {
        self.strong.load(Ordering::Relaxed)
    }

    /// Adds a strong reference and returns the previous count. If the
    /// previous count was [`INITIAL_PRIMARY_VALUE`], this call attached the
    /// first strong owner and the sentinel is subtracted back out.
    pub fn inc_strong_ref_count(&self, object_id: ObjectId) -> i32 {
        let mut count = self.strong_ref_count();
        if likely(count >= 0) {
            count = self.strong.fetch_add(1, Ordering::Relaxed);
            if unlikely(count == INITIAL_PRIMARY_VALUE) {
                self.strong
                    .fetch_sub(INITIAL_PRIMARY_VALUE, Ordering::Release);
            }
        }
        self.trace(object_id, TraceOp::IncStrong, count);
        count
    }

    /// Removes a strong reference and returns the previous count.
    ///
    /// Decrementing before any strong owner attached is a caller bug; it is
    /// logged and the count is left alone. A count that is already zero is
    /// not decremented either.
    pub fn dec_strong_ref_count(&self, object_id: ObjectId) -> i32 {
        let mut count = self.strong_ref_count();
        if unlikely(count == INITIAL_PRIMARY_VALUE) {
            debug!(target: "refbase", "dec strong ref when there was never a strong reference");
        } else if likely(count > 0) {
            // reload through the rmw, it may have changed since the load
            count = self.strong.fetch_sub(1, Ordering::Release);
        }
        self.trace(object_id, TraceOp::DecStrong, count);
        count
    }

    /// Current weak count. A snapshot.
    #[inline]
    pub fn weak_ref_count(&self) -> i32 {
        self.weak.load(Ordering::Relaxed)
    }

    /// Adds a weak reference and returns the previous count.
    #[inline]
    pub fn inc_weak_ref_count(&self, object_id: ObjectId) -> i32 {
        let count = self.weak.fetch_add(1, Ordering::Relaxed);
        self.trace(object_id, TraceOp::IncWeak, count);
        count
    }

    /// Removes a weak reference and returns the previous count.
    ///
    /// When the weak count drops from one to zero:
    /// - with extended lifetime the destruction callback runs, whatever the
    ///   strong count is;
    /// - if no strong owner ever attached the callback runs as well, so an
    ///   object that only ever had observers does not leak;
    /// - otherwise the object is already gone and the counter releases its
    ///   own self-reference.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter and the caller must own the weak
    /// reference it releases. The object and the counter may be destroyed by
    /// this call.
    pub unsafe fn dec_weak_ref_count(this: NonNull<RefCounter>, object_id: ObjectId) -> i32 {
        let destroy = {
            let refs = this.as_ref();
            let mut count = refs.weak_ref_count();
            if likely(count > 0) {
                count = refs.weak.fetch_sub(1, Ordering::Release);
            }
            refs.trace(object_id, TraceOp::DecWeak, count);
            if count != 1 {
                return count;
            }
            fence(Ordering::Acquire);
            if refs.is_life_time_extended() {
                true
            } else if refs.strong_ref_count() == INITIAL_PRIMARY_VALUE {
                warn!(
                    target: "refbase",
                    "last weak ref released before any strong ref, destroying the object to avoid a leak"
                );
                true
            } else {
                false
            }
        };
        if destroy {
            RefCounter::invoke_callback(this);
        } else {
            RefCounter::dec_ref_count(this);
        }
        1
    }

    /// Installs the destruction callback, replacing any previous one.
    ///
    /// Not meant to race with count operations; call it while setting the
    /// object up or tearing it down.
    pub fn set_callback(&self, callback: RefPtrCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Clears the destruction callback. Weak references observe the object
    /// as gone from now on.
    pub fn remove_callback(&self) {
        *self.callback.lock() = None;
    }

    /// Returns `true` while a destruction callback is installed, i.e. while
    /// the object is neither destroyed nor being destroyed.
    pub fn is_ref_ptr_valid(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn take_callback(&self) -> Option<RefPtrCallback> {
        self.callback.lock().take()
    }

    /// Takes the destruction callback out and runs it. Returns `false` if no
    /// callback was installed.
    ///
    /// The callback is cleared before it runs, so the object sees itself as
    /// invalid during its own destruction and a second call does nothing.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter. Destroys the object: no handle
    /// may use it afterwards, and if the object's teardown releases the last
    /// reference on this counter the counter is freed too.
    pub unsafe fn invoke_callback(this: NonNull<RefCounter>) -> bool {
        // the borrow ends before the callback can free the counter
        let callback = this.as_ref().take_callback();
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Installs the promotion gate, replacing any previous one.
    pub fn set_can_promote(&self, can_promote: CanPromote) {
        *self.can_promote.lock() = Some(can_promote);
    }

    /// Clears the promotion gate. Extended-lifetime objects can no longer be
    /// promoted from weak references afterwards.
    pub fn remove_can_promote(&self) {
        *self.can_promote.lock() = None;
    }

    /// Returns `true` while a promotion gate is installed.
    pub fn is_can_promote_valid(&self) -> bool {
        self.can_promote.lock().is_some()
    }

    pub(crate) fn take_can_promote(&self) -> Option<CanPromote> {
        self.can_promote.lock().take()
    }

    fn can_promote_now(&self) -> bool {
        // the gate may call back into the object, don't hold the lock
        let gate = self.can_promote.lock().clone();
        gate.map_or(false, |gate| gate())
    }

    /// Sets the extended-lifetime flag. One way: there is no way to unset
    /// it, and setting it twice is the same as setting it once.
    #[inline]
    pub fn extend_object_lifetime(&self) {
        self.flags
            .fetch_or(RefFlags::EXTEND_LIFE_TIME.bits(), Ordering::Relaxed);
    }

    /// Returns `true` if the extended-lifetime flag is set.
    #[inline]
    pub fn is_life_time_extended(&self) -> bool {
        self.flags().contains(RefFlags::EXTEND_LIFE_TIME)
    }

    /// Current flag bits.
    #[inline]
    pub fn flags(&self) -> RefFlags {
        RefFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Current value of the attempt-acquire side counter.
    #[inline]
    pub fn attempt_acquire_count(&self) -> i32 {
        self.attempt.load(Ordering::Relaxed)
    }

    /// Records one attempt acquisition that will need a forced release.
    pub fn set_attempt_acquire(&self) {
        let count = self.attempt.fetch_add(1, Ordering::Relaxed);
        self.trace(core::ptr::null(), TraceOp::SetAttempt, count);
    }

    /// Returns `true` if at least one attempt acquisition is outstanding.
    #[inline]
    pub fn is_attempt_acquire_set(&self) -> bool {
        self.attempt_acquire_count() > 0
    }

    /// Forgets one attempt acquisition.
    pub fn clear_attempt_acquire(&self) {
        let count = self.attempt.fetch_sub(1, Ordering::Relaxed);
        self.trace(core::ptr::null(), TraceOp::ClearAttempt, count);
    }

    // The three promotion paths, in order: share an attached object, attach
    // a never-owned normal-lifetime object, resurrect an extended-lifetime
    // object if its gate allows.
    fn promote_strong(&self, mut count: i32) -> Promotion {
        while count > 0 && count != INITIAL_PRIMARY_VALUE {
            match self.strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Promotion::Incremented(count),
                Err(actual) => count = actual,
            }
        }

        if count == INITIAL_PRIMARY_VALUE && !self.is_life_time_extended() {
            while count > 0 {
                match self.strong.compare_exchange_weak(
                    count,
                    count + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Promotion::Incremented(count),
                    Err(actual) => count = actual,
                }
            }
        }

        if self.is_life_time_extended() {
            if !self.can_promote_now() {
                return Promotion::Refused;
            }
            return Promotion::Incremented(self.strong.fetch_add(1, Ordering::Relaxed));
        }

        Promotion::NotIncremented(count)
    }

    /// Promotes a weak reference into a strong one.
    ///
    /// A weak reference is taken first to pin the counter. On success the
    /// strong reference (and that weak reference) belong to the caller and
    /// the strong count before the increment is returned; it equals
    /// [`INITIAL_PRIMARY_VALUE`] when this call attached the first strong
    /// owner. On failure the pinning weak reference is released again and
    /// `None` is returned: the normal-lifetime object was already released,
    /// or the extended-lifetime object's gate refused.
    ///
    /// # Safety
    ///
    /// `this` must point to a live counter. If the caller holds no weak
    /// reference of its own, the failure path can release the last weak
    /// reference and destroy the object and the counter.
    pub unsafe fn attempt_inc_strong_ref(
        this: NonNull<RefCounter>,
        object_id: ObjectId,
    ) -> Option<i32> {
        let promoted = this.as_ref().promote_pinned(object_id);
        if promoted.is_none() {
            RefCounter::dec_weak_ref_count(this, object_id);
        }
        promoted
    }

    // Pins the counter with a weak reference and runs the promotion. On
    // `None` the pinning weak reference is still held and the caller must
    // release it.
    fn promote_pinned(&self, object_id: ObjectId) -> Option<i32> {
        let count = self.strong_ref_count();
        self.inc_weak_ref_count(object_id);

        let count = match self.promote_strong(count) {
            Promotion::Incremented(count) => {
                self.trace(object_id, TraceOp::IncStrong, count);
                count
            }
            Promotion::NotIncremented(count) => count,
            Promotion::Refused => return None,
        };

        if count == INITIAL_PRIMARY_VALUE {
            self.strong
                .fetch_sub(INITIAL_PRIMARY_VALUE, Ordering::Release);
            return Some(count);
        }

        if count < 0 || (!self.is_life_time_extended() && count == 0) {
            // the object was destroyed when its strong count reached zero
            return None;
        }

        Some(count)
    }

    /// Simpler promotion: succeeds only while the strong count is positive.
    ///
    /// Takes a weak reference, then adds a strong reference unless the count
    /// is zero, rolling the weak reference back on failure. An attach from
    /// [`INITIAL_PRIMARY_VALUE`] is fixed up like every other attach.
    ///
    /// # Safety
    ///
    /// Same as [`attempt_inc_strong_ref`](RefCounter::attempt_inc_strong_ref).
    pub unsafe fn attempt_inc_strong(this: NonNull<RefCounter>, object_id: ObjectId) -> bool {
        let count = {
            let refs = this.as_ref();
            refs.inc_weak_ref_count(object_id);
            let mut count = refs.strong_ref_count();
            while count > 0 {
                match refs.strong.compare_exchange_weak(
                    count,
                    count + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => count = actual,
                }
            }
            if count > 0 {
                refs.trace(object_id, TraceOp::IncStrong, count);
                // an attach from the sentinel leaves a plain count of one,
                // not INITIAL_PRIMARY_VALUE + 1
                if count == INITIAL_PRIMARY_VALUE {
                    refs.strong
                        .fetch_sub(INITIAL_PRIMARY_VALUE, Ordering::Release);
                }
            }
            count
        };
        if count <= 0 {
            RefCounter::dec_weak_ref_count(this, object_id);
            return false;
        }
        true
    }

    /// Starts recording every count operation into a bounded ring buffer.
    /// The buffer is printed when the counter is freed, or on
    /// [`print_tracker`](RefCounter::print_tracker).
    pub fn enable_tracker(&self) {
        #[cfg(feature = "tracker")]
        self.tracker.enable();
    }

    /// Emits every count operation as a `tracing` event tagged with
    /// `domain_id` as it happens, without buffering.
    pub fn enable_tracker_with_domain_id(&self, domain_id: u32) {
        #[cfg(feature = "tracker")]
        self.tracker.enable_with_domain_id(domain_id);
        #[cfg(not(feature = "tracker"))]
        let _ = domain_id;
    }

    /// Logs and drains the recorded operations, oldest first.
    pub fn print_tracker(&self) {
        #[cfg(feature = "tracker")]
        self.tracker.print(self as *const RefCounter as usize);
    }

    /// Drains the recorded operations, oldest first.
    #[cfg(feature = "tracker")]
    pub fn take_traces(&self) -> Vec<TraceRecord> {
        self.tracker.take()
    }
}

impl Drop for RefCounter {
    fn drop(&mut self) {
        #[cfg(feature = "tracker")]
        if self.tracker.is_enabled() {
            self.print_tracker();
        }
    }
}

impl fmt::Debug for RefCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounter")
            .field("strong", &self.strong_ref_count())
            .field("weak", &self.weak_ref_count())
            .field("ref_count", &self.ref_count())
            .field("flags", &self.flags())
            .field("attempt", &self.attempt_acquire_count())
            .field("valid", &self.is_ref_ptr_valid())
            .finish()
    }
}

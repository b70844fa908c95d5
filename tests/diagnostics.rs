use std::{
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    },
};

use parking_lot::{const_mutex, Mutex};
use refbase::{
    diag::{self, FatalReport},
    RefBase, RefCounter, RefObject, RefObjectExt, Sptr, Violation, Wptr, INITIAL_PRIMARY_VALUE,
};

// The fatal hook is process-wide, so everything that reports goes through
// this single test and reports are told apart by counter address.
static REPORTS: Mutex<Vec<FatalReport>> = const_mutex(Vec::new());

fn reports_for(base: &RefBase) -> Vec<Violation> {
    let counter = base.ref_counter().map_or(0, |refs| refs.as_ptr() as usize);
    REPORTS
        .lock()
        .iter()
        .filter(|report| report.counter == counter)
        .map(|report| report.violation)
        .collect()
}

struct Tracked {
    base: RefBase,
    drops: Arc<AtomicUsize>,
}

impl RefObject for Tracked {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.drops.fetch_add(1, SeqCst);
    }
}

#[test]
fn protocol_violations_are_reported() {
    diag::set_fatal_hook(|report| REPORTS.lock().push(*report));

    // one release too many on an extended object kept alive by a weak handle
    let drops = Arc::new(AtomicUsize::new(0));
    let strong = Sptr::new(Tracked {
        base: RefBase::new(),
        drops: drops.clone(),
    });
    strong.ref_base().extend_object_lifetime();
    let weak = strong.downgrade();
    let object = strong.get_ref_ptr().unwrap();
    drop(strong);
    let tracked = unsafe { object.as_ref() };
    assert_eq!(tracked.base.sptr_ref_count(), 0);
    tracked.inc_weak_ref(ptr::null());
    unsafe { Tracked::dec_strong_ref(object, ptr::null()) };
    assert_eq!(reports_for(&tracked.base), [Violation::TooManyReleases]);
    assert_eq!(tracked.base.sptr_ref_count(), 0);
    assert_eq!(tracked.base.wptr_ref_count(), 1);
    assert_eq!(drops.load(SeqCst), 0);
    drop(weak);
    assert_eq!(drops.load(SeqCst), 1);
    // freed counters may be reused at the same address
    REPORTS.lock().clear();

    // a strong reference taken after the last one was released
    let base = RefBase::new();
    let counter = base.ref_counter().unwrap();
    base.inc_weak_ref(ptr::null());
    base.inc_strong_ref(ptr::null());
    unsafe { RefBase::dec_strong_ref(NonNull::from(&base), ptr::null()) };
    assert!(reports_for(&base).is_empty());
    base.inc_strong_ref(ptr::null());
    assert_eq!(reports_for(&base), [Violation::IncAfterLastRelease]);
    assert_eq!(base.sptr_ref_count(), 1);
    unsafe { RefBase::dec_strong_ref(NonNull::from(&base), ptr::null()) };
    assert_eq!(base.wptr_ref_count(), 1);
    drop(base);
    unsafe { RefCounter::dec_weak_ref_count(counter, ptr::null()) };
    REPORTS.lock().clear();

    // releasing before any owner attached only logs, and takes the weak
    // reference along
    let base = RefBase::new();
    base.inc_weak_ref(ptr::null());
    unsafe { RefBase::dec_strong_ref(NonNull::from(&base), ptr::null()) };
    assert!(reports_for(&base).is_empty());
    assert_eq!(base.sptr_ref_count(), INITIAL_PRIMARY_VALUE);
    assert_eq!(base.wptr_ref_count(), 0);
    drop(base);

    diag::clear_fatal_hook();
    // the report still reaches the log, not the vector
    let len = REPORTS.lock().len();
    let stray = RefBase::new();
    stray.inc_strong_ref(ptr::null());
    stray.extend_object_lifetime();
    let this = NonNull::from(&stray);
    unsafe {
        RefBase::dec_strong_ref(this, ptr::null());
        stray.inc_weak_ref(ptr::null());
        RefBase::dec_strong_ref(this, ptr::null());
    }
    assert_eq!(REPORTS.lock().len(), len);
    assert_eq!(stray.wptr_ref_count(), 0);
}

#[test]
fn copy_assignment_strands_attached_owners() {
    let drops = Arc::new(AtomicUsize::new(0));
    let object = RefBase::manage(Box::new(Tracked {
        base: RefBase::new(),
        drops: drops.clone(),
    }));
    let strong = unsafe { Sptr::from_raw(object.as_ptr()) };
    assert_eq!(strong.ref_base().sptr_ref_count(), 1);

    unsafe { (*object.as_ptr()).base.clone_from(&RefBase::new()) };
    // the fresh counter never saw the owner
    assert_eq!(strong.ref_base().sptr_ref_count(), INITIAL_PRIMARY_VALUE);
    assert_eq!(strong.ref_base().wptr_ref_count(), 0);
    drop(strong);
    assert_eq!(drops.load(SeqCst), 0);

    // the moved callback still destroys the object through the fresh counter
    let weak = unsafe { Wptr::from_raw(object.as_ptr()) };
    assert!(weak.get_ref_ptr().is_some());
    drop(weak);
    assert_eq!(drops.load(SeqCst), 1);
}

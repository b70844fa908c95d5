use std::{
    any::Any,
    collections::{BTreeSet, HashSet},
    mem,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use refbase::{ObjectId, RefBase, RefObject, Sptr, Wptr, INITIAL_PRIMARY_VALUE};

#[cfg(miri)]
const THREAD_COUNT: usize = 2;
#[cfg(not(miri))]
const THREAD_COUNT: usize = 8;

fn tally() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn ref_count(base: &RefBase) -> i32 {
    unsafe { base.ref_counter().unwrap().as_ref() }.ref_count()
}

struct Tracked {
    base: RefBase,
    drops: Arc<AtomicUsize>,
    flag: AtomicBool,
}

impl Tracked {
    fn new(drops: &Arc<AtomicUsize>) -> Tracked {
        Tracked {
            base: RefBase::new(),
            drops: drops.clone(),
            flag: AtomicBool::new(false),
        }
    }
}

impl Clone for Tracked {
    fn clone(&self) -> Self {
        Tracked {
            base: self.base.clone(),
            drops: self.drops.clone(),
            flag: AtomicBool::new(self.flag.load(SeqCst)),
        }
    }
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
fn simple() {
    let a = Sptr::new(RefBase::new());
    drop(a);
}

#[test]
fn last_handle_frees_object_and_counter() {
    let drops = tally();
    let strong = Sptr::new(Tracked::new(&drops));
    drop(strong);
    assert_eq!(drops.load(SeqCst), 1);

    let weak = Wptr::new(Tracked::new(&drops));
    drop(weak);
    assert_eq!(drops.load(SeqCst), 2);

    drop(Sptr::new(RefBase::new()));
    drop(Wptr::new(RefBase::new()));
}

#[test]
fn moved_from_object_is_left_to_the_caller() {
    let drops = tally();
    let mut object = Box::new(Tracked::new(&drops));
    let moved = object.base.take();
    let strong = Sptr::from_box(object);
    let raw = strong.as_ptr() as *mut Tracked;
    let copy = strong.clone();
    drop(strong);
    drop(copy);
    assert_eq!(drops.load(SeqCst), 0);
    assert_eq!(moved.sptr_ref_count(), INITIAL_PRIMARY_VALUE);

    drop(unsafe { Box::from_raw(raw) });
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn multithread() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let handles: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let a = a.clone();
            thread::spawn(move || {
                for _ in 0..THREAD_COUNT {
                    let b = a.clone();
                    assert!(b.ref_base().sptr_ref_count() >= 2);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(a.ref_base().sptr_ref_count(), 1);
    drop(a);
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn destroyed_with_last_owner() {
    let drops = tally();
    {
        let a = Sptr::new(Tracked::new(&drops));
        assert_eq!(a.ref_base().sptr_ref_count(), 1);
        assert_eq!(a.ref_base().wptr_ref_count(), 1);
        assert_eq!(drops.load(SeqCst), 0);
    }
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn destroyed_while_weak_remains() {
    let drops = tally();
    let mut a = Sptr::new(Tracked::new(&drops));
    let weak = Wptr::from(&a);
    a.clear();
    assert_eq!(drops.load(SeqCst), 1);
    assert!(weak.get_ref_ptr().is_none());
    assert!(weak.promote().is_null());
}

#[test]
fn handles_from_raw_share_counts() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let b = unsafe { Sptr::from_raw(a.as_ptr()) };
    b.flag.store(true, SeqCst);
    assert!(a.flag.load(SeqCst));

    let c = a.clone();
    let d = c.clone();
    assert!(c == d);
    assert_eq!(a.ref_base().sptr_ref_count(), 4);

    let other = Sptr::new(Tracked::new(&drops));
    assert!(other != a);
    drop((a, b, c, d));
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn copied_object_gets_own_counter() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    a.flag.store(true, SeqCst);
    let copy = (*a).clone();
    assert!(copy.flag.load(SeqCst));
    assert_ne!(copy.base.ref_counter(), a.base.ref_counter());
    assert_eq!(copy.base.sptr_ref_count(), INITIAL_PRIMARY_VALUE);
    assert_eq!(copy.base.wptr_ref_count(), 0);

    let b = a.clone();
    drop(a);
    drop(b);
    assert_eq!(drops.load(SeqCst), 1);
    drop(copy);
    assert_eq!(drops.load(SeqCst), 2);
}

#[test]
fn strong_and_weak_counts() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let _weak = Wptr::from(&a);
    assert_eq!(a.ref_base().sptr_ref_count(), 1);
    // the owner and the weak identity
    assert_eq!(a.ref_base().wptr_ref_count(), 2);
}

#[test]
fn empty_handles() {
    let mut a: Sptr<Tracked> = Sptr::null();
    assert!(a.is_null());
    assert!(a.get().is_none());
    assert!(a.as_ptr().is_null());
    assert!(a == ptr::null::<Tracked>());

    let b = a.clone();
    assert!(b.is_null());
    assert!(b == Sptr::<Tracked>::default());

    let drops = tally();
    a = Sptr::new(Tracked::new(&drops));
    let c = a.clone();
    assert_eq!(c.ref_base().sptr_ref_count(), 2);
}

#[test]
fn moved_handle_is_empty() {
    let drops = tally();
    let mut a = Sptr::new(Tracked::new(&drops));
    let b = mem::take(&mut a);
    let c = b.clone();
    assert!(a.is_null());
    assert_eq!(b.as_ptr(), c.as_ptr());
    assert_eq!(b.ref_base().sptr_ref_count(), 2);
}

#[test]
fn assignment_moves_counts() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let mut target = Sptr::new(Tracked::new(&drops));
    target.clone_from(&a);
    assert_eq!(drops.load(SeqCst), 1);
    assert_eq!(target.as_ptr(), a.as_ptr());
    assert_eq!(a.ref_base().sptr_ref_count(), 2);

    let d = Sptr::new(Tracked::new(&drops));
    target.clone_from(&d);
    assert_eq!(target.as_ptr(), d.as_ptr());
    assert_eq!(d.ref_base().sptr_ref_count(), 2);
    assert_eq!(a.ref_base().sptr_ref_count(), 1);
}

#[test]
fn self_reset_keeps_object() {
    let drops = tally();
    let mut a = Sptr::new(Tracked::new(&drops));
    let raw = a.as_ptr();
    unsafe { a.reset(raw) };
    assert_eq!(drops.load(SeqCst), 0);
    assert_eq!(a.ref_base().sptr_ref_count(), 1);
    assert_eq!(a.ref_base().wptr_ref_count(), 1);
}

#[test]
fn extended_object_promotes_after_release() {
    let drops = tally();
    let mut a = Sptr::new(Tracked::new(&drops));
    a.ref_base().extend_object_lifetime();
    assert!(a.ref_base().is_extend_life_time_set());
    let weak = Wptr::from(&a);
    assert_eq!(a.ref_base().wptr_ref_count(), 2);
    a.clear();
    assert_eq!(drops.load(SeqCst), 0);

    let b = weak.promote();
    assert_eq!(b.ref_base().sptr_ref_count(), 1);
    drop(b);
    drop(weak);
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn clear_releases() {
    let drops = tally();
    let mut a = Sptr::new(Tracked::new(&drops));
    a.clear();
    assert!(a.get_ref_ptr().is_none());
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn from_weak_promotes() {
    let drops = tally();
    let weak = Wptr::new(Tracked::new(&drops));
    let strong = Sptr::from(&weak);
    assert_eq!(strong.ref_base().wptr_ref_count(), 2);
    assert_eq!(strong.ref_base().sptr_ref_count(), 1);
}

#[test]
fn compares_with_raw_and_weak() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let raw = a.as_ptr();
    assert!(a == raw);

    let other = Wptr::new(Tracked::new(&drops));
    assert!(a != other);
    let same = a.downgrade();
    assert!(a == same);
}

#[test]
fn orders_and_hashes_by_address() {
    let drops = tally();
    let a = Sptr::new(Tracked::new(&drops));
    let b = Sptr::new(Tracked::new(&drops));

    let set: HashSet<_> = [a.clone(), b.clone(), a.clone()].into_iter().collect();
    assert_eq!(set.len(), 2);
    let tree: BTreeSet<_> = [b.clone(), a.clone(), b.clone()].into_iter().collect();
    assert_eq!(tree.len(), 2);
    assert_eq!(a < b, (a.as_ptr() as usize) < (b.as_ptr() as usize));
    assert_eq!(format!("{:p}", a), format!("{:p}", a.as_ptr()));
}

#[test]
#[should_panic(expected = "dereferenced an empty Sptr")]
fn deref_empty_panics() {
    let a: Sptr<RefBase> = Sptr::null();
    let _ = a.sptr_ref_count();
}

#[test]
fn debug_format() {
    let a = Sptr::new(RefBase::new());
    assert!(format!("{:?}", a).starts_with("RefBase"));
    assert_eq!(format!("{:?}", Sptr::<RefBase>::null()), "Sptr(null)");
}

struct Hooked {
    base: RefBase,
    first: AtomicUsize,
    last: Arc<AtomicUsize>,
}

impl RefObject for Hooked {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }

    fn on_first_strong_ref(&self, _: ObjectId) {
        self.first.fetch_add(1, SeqCst);
    }

    fn on_last_strong_ref(&self, _: ObjectId) {
        self.last.fetch_add(1, SeqCst);
    }
}

#[test]
fn hooks_fire_once() {
    let last = tally();
    let a = Sptr::new(Hooked {
        base: RefBase::new(),
        first: AtomicUsize::new(0),
        last: last.clone(),
    });
    let b = a.clone();
    let c = unsafe { Sptr::from_raw(b.as_ptr()) };
    assert_eq!(a.first.load(SeqCst), 1);
    drop((a, b));
    assert_eq!(last.load(SeqCst), 0);
    drop(c);
    assert_eq!(last.load(SeqCst), 1);
}

struct Nested {
    base: RefBase,
    child: Mutex<Sptr<Nested>>,
    live: Arc<AtomicUsize>,
}

impl Nested {
    fn new(live: &Arc<AtomicUsize>) -> Nested {
        live.fetch_add(1, SeqCst);
        Nested {
            base: RefBase::new(),
            child: Mutex::new(Sptr::null()),
            live: live.clone(),
        }
    }
}

impl RefObject for Nested {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

impl Drop for Nested {
    fn drop(&mut self) {
        self.live.fetch_sub(1, SeqCst);
    }
}

#[test]
fn owned_children_released_with_parent() {
    let live = tally();
    {
        let root = Sptr::new(Nested::new(&live));
        *root.child.lock() = Sptr::new(Nested::new(&live));
        let grandchild = Sptr::new(Nested::new(&live));
        *root.child.lock().child.lock() = grandchild;
        assert_eq!(live.load(SeqCst), 3);
    }
    assert_eq!(live.load(SeqCst), 0);
}

#[test]
fn empty_children_released() {
    let live = tally();
    {
        let a = Sptr::new(Nested::new(&live));
        let b = Sptr::new(Nested::new(&live));
        assert_eq!(live.load(SeqCst), 2);
        assert!(a.child.lock().is_null());
        assert!(b.child.lock().is_null());
    }
    assert_eq!(live.load(SeqCst), 0);
}

#[test]
fn counter_held_by_base_and_weak_identity() {
    let a = Sptr::new(RefBase::new());
    assert_eq!(ref_count(&a), 1);
    let weak = Wptr::from(&a);
    assert_eq!(ref_count(&a), 2);
    drop(weak);
    assert_eq!(ref_count(&a), 1);
}

#[test]
fn base_move_assignment() {
    let mut first = RefBase::new();
    assert_eq!(ref_count(&first), 1);
    let mut second = RefBase::new();
    second.move_from(&mut first);
    assert_eq!(ref_count(&second), 1);
    assert!(first.ref_counter().is_none());
    assert_eq!(first.sptr_ref_count(), 0);
    assert_eq!(first.wptr_ref_count(), 0);

    let mut third = RefBase::new();
    third.move_from(&mut second);
    assert_eq!(ref_count(&third), 1);
    assert!(second.ref_counter().is_none());

    // both empty, nothing moves
    second.move_from(&mut first);
    assert_eq!(first.ref_counter(), second.ref_counter());
}

trait Shape: RefObject {
    fn area(&self) -> f64;
    fn as_any(&self) -> &dyn Any;
}

struct Square {
    base: RefBase,
    side: f64,
    drops: Arc<AtomicUsize>,
}

impl RefObject for Square {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

impl Shape for Square {
    fn area(&self) -> f64 {
        self.side * self.side
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Square {
    fn drop(&mut self) {
        self.drops.fetch_add(1, SeqCst);
    }
}

#[test]
fn cast_between_related_types() {
    let drops = tally();
    let square = Sptr::new(Square {
        base: RefBase::new(),
        side: 3.0,
        drops: drops.clone(),
    });
    let shape: Sptr<dyn Shape> = Sptr::cast(square, |s| Some(s as &dyn Shape)).ok().unwrap();
    assert_eq!(shape.area(), 9.0);
    assert_eq!(shape.ref_base().sptr_ref_count(), 1);

    let shape2 = shape.clone();
    assert!(shape2 == shape);
    let shape = match Sptr::cast(shape, |s| s.as_any().downcast_ref::<Tracked>()) {
        Ok(_) => panic!("not a tracked"),
        Err(shape) => shape,
    };
    let square = Sptr::cast(shape, |s| s.as_any().downcast_ref::<Square>())
        .ok()
        .unwrap();
    assert_eq!(square.side, 3.0);
    assert_eq!(square.ref_base().sptr_ref_count(), 2);

    drop(square);
    assert_eq!(drops.load(SeqCst), 0);
    drop(shape2);
    assert_eq!(drops.load(SeqCst), 1);
}

#[test]
fn cast_rejects_foreign_base() {
    let drops = tally();
    let other = Sptr::new(Tracked::new(&drops));
    let foreign: &'static Tracked = unsafe { &*other.as_ptr() };
    let a = Sptr::new(Tracked::new(&drops));
    let a = match Sptr::cast(a, |_| Some(foreign)) {
        Ok(_) => panic!("cast to a foreign object"),
        Err(a) => a,
    };
    assert_eq!(a.ref_base().sptr_ref_count(), 1);
    assert!(Sptr::cast(Sptr::<Tracked>::null(), |p| Some(p)).ok().unwrap().is_null());
}

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use refbase::{RefBase, RefObject, Sptr};
use std::sync::Arc;

// A small shared object, the counter lives next to it
struct TestStruct {
    base: RefBase,
    x: u8,
    y: u8,
}

impl TestStruct {
    fn new() -> Self {
        TestStruct {
            base: RefBase::new(),
            x: 0,
            y: 0,
        }
    }
}

impl RefObject for TestStruct {
    fn ref_base(&self) -> &RefBase {
        &self.base
    }
}

fn create_sptr_benchmark(c: &mut Criterion) {
    c.bench_function("refbase::Sptr::new", |b| {
        b.iter(|| Sptr::new(black_box(TestStruct::new())))
    });
    c.bench_function("std::sync::Arc::new", |b| {
        b.iter(|| Arc::new(black_box(TestStruct::new())))
    });
}

fn clone_sptr_benchmark(c: &mut Criterion) {
    let std_arc = Arc::new(TestStruct::new());
    let sptr = Sptr::new(TestStruct::new());
    c.bench_function("refbase::Sptr::clone", |b| b.iter(|| Sptr::clone(&sptr)));
    c.bench_function("std::sync::Arc::clone", |b| b.iter(|| Arc::clone(&std_arc)));
}

fn drop_sptr_benchmark(c: &mut Criterion) {
    let std_arc = Arc::new(TestStruct::new());
    let sptr = Sptr::new(TestStruct::new());
    c.bench_function("refbase::Sptr::drop", |b| {
        b.iter(|| {
            let cloned = Sptr::clone(&sptr);
            std::mem::drop(black_box(cloned));
        })
    });
    c.bench_function("std::sync::Arc::drop", |b| {
        b.iter(|| {
            let cloned = Arc::clone(&std_arc);
            std::mem::drop(black_box(cloned));
        })
    });
}

fn from_raw_benchmark(c: &mut Criterion) {
    let sptr = Sptr::new(TestStruct::new());
    let raw = sptr.as_ptr();
    c.bench_function("refbase::Sptr::from_raw", |b| {
        b.iter(|| unsafe { Sptr::from_raw(black_box(raw)) })
    });
}

fn access_sptr_benchmark(c: &mut Criterion) {
    let obj = Arc::new(black_box(TestStruct::new()));
    let sptr = Sptr::new(black_box(TestStruct::new()));
    c.bench_function("refbase::Sptr::access", |b| {
        b.iter(|| {
            let x = black_box(sptr.x);
            let y = black_box(sptr.y);
            assert_eq!(x, 0);
            assert_eq!(y, 0);
            (x, y)
        })
    });
    c.bench_function("std::sync::Arc::access", |b| {
        b.iter(|| {
            let x = black_box(obj.x);
            let y = black_box(obj.y);
            assert_eq!(x, 0);
            assert_eq!(y, 0);
            (x, y)
        })
    });
}

criterion_group!(
    sptr_bench,
    access_sptr_benchmark,
    create_sptr_benchmark,
    clone_sptr_benchmark,
    drop_sptr_benchmark,
    from_raw_benchmark
);
criterion_main!(sptr_bench);

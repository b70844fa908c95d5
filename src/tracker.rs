use crate::ObjectId;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
    thread::{self, ThreadId},
};
use tracing::{info, trace};

/// Number of records a tracker keeps before evicting the oldest one.
pub const TRACE_CAPACITY: usize = 256;

const MODE_OFF: u8 = 0;
const MODE_RING: u8 = 1;
const MODE_AT_ONCE: u8 = 2;

/// Counter operation recorded by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceOp {
    /// Strong count increment.
    IncStrong,
    /// Strong count decrement.
    DecStrong,
    /// Weak count increment.
    IncWeak,
    /// Weak count decrement.
    DecWeak,
    /// Counter self-reference increment.
    IncRef,
    /// Counter self-reference decrement.
    DecRef,
    /// Attempt-acquire side counter increment.
    SetAttempt,
    /// Attempt-acquire side counter decrement.
    ClearAttempt,
}

impl TraceOp {
    /// Short operation tag, `++` or `--`.
    pub fn operation(self) -> &'static str {
        match self {
            TraceOp::IncStrong | TraceOp::IncWeak | TraceOp::IncRef | TraceOp::SetAttempt => "++",
            _ => "--",
        }
    }

    /// Name of the count the operation touches.
    pub fn count_type(self) -> &'static str {
        match self {
            TraceOp::IncStrong | TraceOp::DecStrong => "strong",
            TraceOp::IncWeak | TraceOp::DecWeak => "weak",
            TraceOp::IncRef | TraceOp::DecRef => "ref",
            TraceOp::SetAttempt | TraceOp::ClearAttempt => "attempt",
        }
    }
}

impl fmt::Display for TraceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count_type(), self.operation())
    }
}

/// Snapshot of the counts of a [`RefCounter`][crate::RefCounter].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    /// Strong count.
    pub strong: i32,
    /// Weak count.
    pub weak: i32,
    /// Counter self-reference count.
    pub ref_count: i32,
}

/// One tracked counter operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    /// Identity passed by the caller.
    pub object_id: usize,
    /// What happened.
    pub op: TraceOp,
    /// Value of the touched count before the operation.
    pub count: i32,
    /// All counts right after the operation.
    pub counts: Counts,
    /// Process the operation ran in.
    pub pid: u32,
    /// Thread the operation ran on.
    pub tid: ThreadId,
}

// Either buffers records until they are printed (ring mode) or emits them
// right away tagged with a domain id (at-once mode).
#[cfg_attr(not(feature = "tracker"), allow(dead_code))]
pub(crate) struct Tracker {
    mode: AtomicU8,
    domain: AtomicU32,
    ring: Mutex<VecDeque<TraceRecord>>,
}

#[cfg_attr(not(feature = "tracker"), allow(dead_code))]
impl Tracker {
    pub(crate) fn new() -> Tracker {
        Tracker {
            mode: AtomicU8::new(MODE_OFF),
            domain: AtomicU32::new(0),
            ring: Mutex::new(VecDeque::new()),
        }
    }

    #[inline(always)]
    pub(crate) fn is_enabled(&self) -> bool {
        self.mode.load(Ordering::Relaxed) != MODE_OFF
    }

    pub(crate) fn enable(&self) {
        self.mode.store(MODE_RING, Ordering::Relaxed);
    }

    pub(crate) fn enable_with_domain_id(&self, domain: u32) {
        self.domain.store(domain, Ordering::Relaxed);
        self.mode.store(MODE_AT_ONCE, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, object_id: ObjectId, op: TraceOp, count: i32, counts: Counts) {
        match self.mode.load(Ordering::Relaxed) {
            MODE_RING => {
                let record = TraceRecord {
                    object_id: object_id as usize,
                    op,
                    count,
                    counts,
                    pid: std::process::id(),
                    tid: thread::current().id(),
                };
                let mut ring = self.ring.lock();
                if ring.len() == TRACE_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(record);
            }
            MODE_AT_ONCE => trace!(
                target: "refbase",
                domain = self.domain.load(Ordering::Relaxed),
                cur_count = count,
                operation = op.operation(),
                count_type = op.count_type()
            ),
            _ => {}
        }
    }

    pub(crate) fn take(&self) -> Vec<TraceRecord> {
        self.ring.lock().drain(..).collect()
    }

    pub(crate) fn print(&self, counter: usize) {
        let mut ring = self.ring.lock();
        if ring.is_empty() {
            return;
        }
        info!(target: "refbase", counter, "start backtrace");
        while let Some(record) = ring.pop_front() {
            info!(
                target: "refbase",
                op = %record.op,
                strong = record.counts.strong,
                weak = record.counts.weak,
                refcnt = record.counts.ref_count,
                pid = record.pid,
                tid = ?record.tid
            );
        }
        info!(target: "refbase", counter, "end backtrace");
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("mode", &self.mode.load(Ordering::Relaxed))
            .field("domain", &self.domain.load(Ordering::Relaxed))
            .field("records", &self.ring.lock().len())
            .finish()
    }
}

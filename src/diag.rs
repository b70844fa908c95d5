//! Fatal diagnostic channel.
//!
//! Invariant violations detected by the owned-object layer are logged at
//! error level with `fatal = true` and forwarded to an optional process-wide
//! hook. Nothing here aborts: the host decides what a fatal report means.

use crate::Violation;
use parking_lot::{const_rwlock, RwLock};
use std::{fmt, sync::Arc};
use tracing::error;

/// A single fatal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalReport {
    /// What went wrong.
    pub violation: Violation,
    /// Address of the [`RefCounter`][crate::RefCounter] involved.
    pub counter: usize,
    /// Identity passed by the caller of the failing operation.
    pub object_id: usize,
    /// Strong count observed when the violation was detected.
    pub strong: i32,
    /// Weak count observed when the violation was detected.
    pub weak: i32,
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (counter {:#x}, strong {}, weak {})",
            self.violation, self.counter, self.strong, self.weak
        )
    }
}

type FatalHook = Arc<dyn Fn(&FatalReport) + Send + Sync>;

static FATAL_HOOK: RwLock<Option<FatalHook>> = const_rwlock(None);

/// Installs `hook` as the receiver of every fatal report, replacing any
/// previous hook.
pub fn set_fatal_hook<F>(hook: F)
where
    F: Fn(&FatalReport) + Send + Sync + 'static,
{
    *FATAL_HOOK.write() = Some(Arc::new(hook));
}

/// Removes the installed hook. Reports are still logged.
pub fn clear_fatal_hook() {
    *FATAL_HOOK.write() = None;
}

#[cold]
#[inline(never)]
pub(crate) fn report_fatal(report: FatalReport) {
    error!(
        target: "refbase",
        fatal = true,
        counter = report.counter,
        object_id = report.object_id,
        strong = report.strong,
        weak = report.weak,
        "{}",
        report.violation
    );
    // the hook may itself take handles, so it runs outside the lock
    let hook = FATAL_HOOK.read().clone();
    if let Some(hook) = hook {
        hook(&report);
    }
}

//! # RefBase: intrusive strong/weak reference counting
//!
//! RefBase is an intrusive reference-counting solution for heap objects that
//! need more control over their lifetime than `std::sync::Arc` gives. Every
//! shared object embeds a [`RefBase`], which owns a shared [`RefCounter`]
//! control block. Strong handles ([`Sptr`]) keep the object alive, weak
//! handles ([`Wptr`]) observe it and can be promoted back into strong handles
//! while the object still lives.
//!
//! ## Why use RefBase?
//!
//! - Lifecycle hooks: an object is told when its first strong owner attaches
//!   and when its last strong owner leaves, and can veto promotions
//! - Extended lifetime: destruction can be decoupled from the strong count
//!   and driven by an external authority, e.g. a proxy table that resurrects
//!   objects from weak references
//! - Handles are created from raw object pointers, so the same object can be
//!   wrapped from several places without a shared `Arc` to clone from
//! - Weak references work for objects that never had a strong owner
//!
//! ## Why not use RefBase?
//!
//! - Every shared type has to embed a [`RefBase`] and implement
//!   [`RefObject`]
//! - The counter lives in its own allocation next to the object
//! - Cycles are not collected
//!
//! ## Comparison
//!
//! |                               | refbase::{Sptr,Wptr} | std::sync::{Arc,Weak} |
//! | ----------------------------- | :------------------: | :-------------------: |
//! | Intrusive counter             |          ✅          |          ❌           |
//! | Lifecycle hooks               |          ✅          |          ❌           |
//! | Extended lifetime             |          ✅          |          ❌           |
//! | Weak refs without owner       |          ✅          |          ❌           |
//! | Wrap from raw object pointer  |          ✅          |          ❌           |
//!
//! ## Example
//!
//! ```
//! use refbase::{RefBase, RefObject, Sptr, Wptr};
//!
//! struct Session {
//!     base: RefBase,
//!     id: u32,
//! }
//!
//! impl RefObject for Session {
//!     fn ref_base(&self) -> &RefBase {
//!         &self.base
//!     }
//! }
//!
//! let strong = Sptr::new(Session { base: RefBase::new(), id: 7 });
//! let weak = Wptr::from(&strong);
//! assert_eq!(strong.id, 7);
//! assert_eq!(strong.ref_base().wptr_ref_count(), 2);
//!
//! drop(strong);
//! assert!(weak.promote().is_null());
//! ```
//!
//! ### Features
//!
//! The `tracker` feature, enabled by default, gives every counter a debug
//! tracker, switched on with [`RefBase::enable_tracker`] or
//! [`RefBase::enable_tracker_with_domain_id`]. Without it those calls are
//! no-ops and counters carry no tracker state.

#![warn(missing_docs, missing_debug_implementations)]

// Counter definition. Counts are signed so that misuse shows up as negative
// values instead of wrapping around.
pub(crate) use core::sync::atomic::AtomicI32 as AtomicCounter;

/// Identity of the party performing a reference operation. Only used for
/// diagnostics; handles pass the address of the object they manage.
pub type ObjectId = *const ();

mod base;
mod counter;
pub mod diag;
mod error;
mod sptr;
mod tracker;
mod weak;
mod wptr;

pub use base::*;
pub use counter::*;
pub use error::*;
pub use sptr::*;
pub use tracker::*;
pub use weak::*;
pub use wptr::*;

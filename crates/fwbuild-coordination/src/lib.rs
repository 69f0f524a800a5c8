//! In-memory cross-process coordination: named locks and cancellation.
//!
//! The lock manager is the only synchronization primitive shared between
//! client processes; there are no file-based locks.

pub mod cancel;
pub mod locks;

pub use cancel::{CancelToken, CancellationRegistry};
pub use locks::{AcquireOutcome, LockBundle, LockManager, LockPolicy, LockStatus, PreemptionNotice};

//! Busy-wait synchronization primitives.
//!
//! Everything here is usable from interrupt context: acquisition either
//! spins or fails immediately, nothing ever sleeps. Critical sections are
//! expected to be short (pointer-collection mutation, flag checks) —
//! never I/O or unbounded work.

mod atomic_flag;
mod spinlock;

pub use atomic_flag::AtomicFlag;
pub use spinlock::{SpinLock, SpinLockGuard};

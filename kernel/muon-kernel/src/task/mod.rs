//! Thread and process records.
//!
//! A [`Process`] is an address-space-owning container for threads; a
//! [`Thread`] is an independently schedulable execution context with its
//! own saved register snapshot and kernel stack. Both kinds of record
//! are owned by the scheduler registry's arenas and referenced
//! everywhere else through generation-checked handles.

pub(crate) mod arena;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::addr::VirtAddr;

use crate::arch::x86_64::context::Context;
use crate::arch::x86_64::paging::AddressSpace;
use crate::config::KERNEL_STACK_SIZE;

pub use arena::Handle;

/// Handle to a [`Thread`] record in the registry.
pub type ThreadHandle = Handle<Thread>;

/// Handle to a [`Process`] record in the registry.
pub type ProcHandle = Handle<Process>;

/// Thread identifier. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process identifier. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Eligible for scheduling (once enqueued).
    Alive,
    /// Exited; the exit status slot is meaningful. Never returned by the
    /// next-runnable scan.
    Dead,
}

/// Privilege level a thread executes at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Ring 0, kernel code/data selectors.
    Kernel,
    /// Ring 3, user code/data selectors.
    User,
}

/// Per-thread dispatch lock.
///
/// Held exactly while the thread is executing on some core or while a
/// core is mid-way through deciding to dispatch it. This — not the
/// registry lock — is what prevents two cores from resuming the same
/// saved context simultaneously, and what destruction waits on before
/// reclaiming a thread's memory.
pub(crate) struct DispatchLock {
    held: AtomicBool,
}

impl DispatchLock {
    pub(crate) const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Attempts to claim the lock. Never blocks.
    pub(crate) fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the lock.
    pub(crate) fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Returns `true` while some core holds the lock.
    pub(crate) fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Aligned kernel stack backing a thread.
#[repr(align(16))]
pub(crate) struct KernelStack {
    bytes: [u8; KERNEL_STACK_SIZE],
}

impl KernelStack {
    /// Allocates a zeroed stack on the heap. Allocation failure aborts
    /// the kernel — there is no recovery policy below the allocator.
    pub(crate) fn allocate() -> Box<Self> {
        Box::new(Self {
            bytes: [0; KERNEL_STACK_SIZE],
        })
    }

    /// Returns the address one past the highest usable byte.
    pub(crate) fn top(&self) -> VirtAddr {
        VirtAddr::new(self.bytes.as_ptr() as u64 + KERNEL_STACK_SIZE as u64)
    }
}

/// An independently schedulable execution context.
pub struct Thread {
    pub(crate) tid: Tid,
    pub(crate) name: &'static str,
    /// Owning process. A back-reference, not ownership: the process's
    /// thread list points the other way.
    pub(crate) process: ProcHandle,
    pub(crate) state: ThreadState,
    /// Meaningful only once `state` is [`ThreadState::Dead`].
    pub(crate) exit_status: Option<i64>,
    pub(crate) enqueued: bool,
    pub(crate) dispatch_lock: DispatchLock,
    /// Saved register snapshot; valid whenever no core holds the
    /// dispatch lock.
    pub(crate) context: Context,
    /// Ticks to arm the preemption timer with when dispatched.
    pub(crate) time_slice: u32,
    /// Owned kernel stack. Freed only with the record itself, after the
    /// dispatch lock has been waited out.
    #[allow(dead_code, reason = "held for RAII cleanup when the record is freed")]
    pub(crate) stack: Box<KernelStack>,
}

impl Thread {
    /// Returns the thread id.
    #[must_use]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Returns the thread name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// An address-space-owning container for threads.
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) name: &'static str,
    /// Handles of threads ever enqueued under this process. Entries are
    /// not removed when a thread is dequeued or destroyed; stale handles
    /// resolve to `None` and are skipped.
    pub(crate) threads: Vec<ThreadHandle>,
    /// Mirror of `threads.len()` — a high-water mark, never decremented.
    pub(crate) thread_count: usize,
    /// All threads of this process execute with this address space
    /// active.
    pub(crate) space: AddressSpace,
    pub(crate) enqueued: bool,
}

impl Process {
    /// Returns the process id.
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the process name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Point-in-time snapshot of a thread, for diagnostics.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// Thread id.
    pub tid: Tid,
    /// Thread name.
    pub name: &'static str,
    /// Owning process handle.
    pub process: ProcHandle,
    /// Lifecycle state at snapshot time.
    pub state: ThreadState,
    /// Whether the thread was in the global run queue.
    pub enqueued: bool,
    /// Configured time slice in ticks.
    pub time_slice: u32,
}

/// Point-in-time snapshot of a process, for diagnostics.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Process id.
    pub pid: Pid,
    /// Process name.
    pub name: &'static str,
    /// High-water thread count.
    pub thread_count: usize,
    /// Whether the process was in the global process set.
    pub enqueued: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_lock_exclusive() {
        let lock = DispatchLock::new();
        assert!(!lock.is_held());
        assert!(lock.try_acquire());
        assert!(lock.is_held());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn kernel_stack_top_is_aligned() {
        let stack = KernelStack::allocate();
        assert!(stack.top().is_aligned(16));
    }
}

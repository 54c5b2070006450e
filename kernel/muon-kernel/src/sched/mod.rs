//! Kernel task scheduler.
//!
//! Round-robin, timer-preemptive, SMP-safe. The public surface is the
//! set of free functions below, operating on the kernel-wide registry —
//! this is what the program loader and other collaborators call to start
//! and clean up execution units. The preemption entry itself is
//! [`crate::arch::x86_64::context::timer_interrupt`], installed at
//! [`crate::config::SCHED_VECTOR`] by the interrupt-dispatch layer.
//!
//! Locking discipline, in one paragraph: one registry-wide spin lock
//! guards the thread/process collections and the dispatch decision; the
//! tick path only ever try-locks it and defers on contention. Each
//! thread additionally carries a dispatch lock held while any core runs
//! (or considers running) its context — destruction waits that lock out
//! before memory is reclaimed, so a thread is never freed while a core
//! can still touch it.

pub mod idle;
pub(crate) mod registry;
pub mod scheduler;

use alloc::vec::Vec;

use muon_core::addr::VirtAddr;

use registry::REGISTRY;

use crate::task::{Privilege, ProcHandle, ProcessInfo, ThreadHandle, ThreadInfo};

pub use idle::{bootstrap, scheduler_started, BootstrapInfo};
pub use scheduler::{tick, yield_now, Decision};

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use idle::{await_scheduler_start, park, scheduler_init, thread_exit};

/// Creates a process with the kernel's base address space and no
/// threads, registered into the global process set.
///
/// Always succeeds; allocation failure at this layer aborts the kernel.
pub fn create_process(name: &'static str) -> ProcHandle {
    REGISTRY.create_process(name)
}

/// Creates a thread under `process`, entering at `entry` with a fresh
/// kernel stack.
///
/// A `time_slice` of zero selects the default. With `auto_enqueue` the
/// thread becomes dispatchable immediately — the loader calls it this
/// way once the process image is mapped.
pub fn create_thread(
    process: ProcHandle,
    name: &'static str,
    entry: VirtAddr,
    time_slice: u32,
    privilege: Privilege,
    auto_enqueue: bool,
) -> ThreadHandle {
    REGISTRY.create_thread(process, name, entry, time_slice, privilege, auto_enqueue)
}

/// Creates an auto-enqueued ring-0 thread under `process`.
pub fn create_kernel_thread(
    process: ProcHandle,
    name: &'static str,
    entry: VirtAddr,
    time_slice: u32,
) -> ThreadHandle {
    REGISTRY.create_kernel_thread(process, name, entry, time_slice)
}

/// Makes a thread part of the global runnable set. Idempotent.
pub fn enqueue_thread(handle: ThreadHandle) {
    REGISTRY.enqueue_thread(handle);
}

/// Makes a process part of the global process set. Idempotent.
pub fn enqueue_process(handle: ProcHandle) {
    REGISTRY.enqueue_process(handle);
}

/// Removes a thread from the runnable set, waiting out any core still
/// running it. Returns `false` if it was not enqueued.
///
/// Must not be called from a context holding the registry lock.
pub fn dequeue_thread(handle: ThreadHandle) -> bool {
    REGISTRY.dequeue_thread(handle)
}

/// Removes a process and all of its threads from the global sets.
/// Returns `false` if it was not enqueued.
pub fn dequeue_process(handle: ProcHandle) -> bool {
    REGISTRY.dequeue_process(handle)
}

/// Dequeues a thread if needed, then frees it. The handle (and every
/// copy of it) is dead afterwards.
pub fn destroy_thread(handle: ThreadHandle) {
    REGISTRY.destroy_thread(handle);
}

/// Dequeues a process if needed, destroys its threads, then frees it.
pub fn destroy_process(handle: ProcHandle) {
    REGISTRY.destroy_process(handle);
}

/// Snapshots every live thread, for diagnostics.
#[must_use]
pub fn thread_infos() -> Vec<ThreadInfo> {
    REGISTRY.thread_infos()
}

/// Snapshots every live process, for diagnostics.
#[must_use]
pub fn process_infos() -> Vec<ProcessInfo> {
    REGISTRY.process_infos()
}

#[cfg(test)]
mod tests {
    // These exercise the kernel-wide registry, which is shared across
    // the test binary: assert only on handles owned by this test, never
    // on global counts.
    use super::*;

    #[test]
    fn collaborator_surface_round_trip() {
        let proc = create_process("loader-test");
        let t1 = create_thread(
            proc,
            "entry",
            VirtAddr::new(0x40_0000),
            0,
            Privilege::User,
            true,
        );
        let t2 = create_kernel_thread(proc, "service", VirtAddr::new(0x1000), 500);

        let infos = thread_infos();
        assert!(infos.iter().any(|t| t.process == proc && t.enqueued));
        assert!(process_infos().iter().any(|p| p.name == "loader-test"));

        assert!(dequeue_thread(t2));
        assert!(!dequeue_thread(t2));
        enqueue_thread(t2);

        destroy_process(proc);
        let infos = thread_infos();
        assert!(!infos.iter().any(|t| t.process == proc));
        let _ = (t1, t2); // handles are dead now
    }
}

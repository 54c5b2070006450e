//! Idle path, startup rendezvous, and scheduler bring-up.
//!
//! A core with nothing dispatchable parks: it arms its timer for the
//! idle interval and halts until the next interrupt. Parking is also the
//! pre-start state — application cores spin on the process-wide started
//! flag until the bootstrap core has populated the registry, then park
//! and wait for their first scheduling interrupt.

use muon_core::addr::VirtAddr;
use muon_core::kinfo;
use muon_core::sync::AtomicFlag;
use planck_noalloc::vec::ArrayVec;

use crate::config::MAX_CPUS;
use crate::sched::registry::{Registry, REGISTRY};
use crate::task::{ProcHandle, ThreadHandle};

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use crate::arch::x86_64::instructions;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use crate::arch::x86_64::lapic;
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
use crate::config;

/// Process-wide "scheduling has started" flag. Written once by the
/// bootstrap core, spun on by every other core.
static SCHED_STARTED: AtomicFlag = AtomicFlag::new(false);

/// Returns `true` once [`bootstrap`] has populated the registry.
#[must_use]
pub fn scheduler_started() -> bool {
    SCHED_STARTED.read()
}

/// Handles created by scheduler bring-up.
pub struct BootstrapInfo {
    /// The bootstrap kernel process.
    pub kernel_process: ProcHandle,
    /// The initial kernel thread.
    pub init_thread: ThreadHandle,
    /// One idle thread per core, so the circular scan always has a
    /// fallback.
    pub idle_threads: ArrayVec<ThreadHandle, MAX_CPUS>,
}

/// Body of the per-core idle threads: halt until something preempts us.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
extern "C" fn idle_main() -> ! {
    loop {
        instructions::halt();
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn idle_entry() -> VirtAddr {
    VirtAddr::new(idle_main as usize as u64)
}

/// Host stand-in: idle threads exist in the registry but never run.
#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
fn idle_entry() -> VirtAddr {
    VirtAddr::zero()
}

/// Populates `reg` for scheduling: the bootstrap kernel process, its
/// initial thread at `entry`, and one idle thread per core; then raises
/// the started flag that releases the parked application cores.
pub(crate) fn bootstrap_in(reg: &Registry, entry: VirtAddr, core_count: u32) -> BootstrapInfo {
    assert!(
        core_count as usize <= MAX_CPUS,
        "bootstrap: core_count exceeds MAX_CPUS"
    );

    let kernel_process = reg.create_process("kernel");
    let init_thread = reg.create_kernel_thread(kernel_process, "kmain", entry, 0);

    let mut idle_threads = ArrayVec::new();
    for _ in 0..core_count {
        idle_threads.push(reg.create_kernel_thread(kernel_process, "idle", idle_entry(), 0));
    }

    SCHED_STARTED.write(true);
    kinfo!(
        "sched: started, {} threads enqueued for {} cores",
        reg.run_queue_len(),
        core_count
    );

    BootstrapInfo {
        kernel_process,
        init_thread,
        idle_threads,
    }
}

/// Populates the global registry for scheduling and raises the started
/// flag. See [`scheduler_init`] for the variant that also parks the
/// calling core.
pub fn bootstrap(entry: VirtAddr, core_count: u32) -> BootstrapInfo {
    bootstrap_in(&REGISTRY, entry, core_count)
}

/// Parks the calling core: arm the timer for the idle interval, then
/// halt until an interrupt arrives. The terminal state for a core with
/// nothing runnable; every wake-up goes through the scheduler entry, so
/// this loop is left only by a context restore.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub extern "C" fn park() -> ! {
    instructions::disable_interrupts();
    lapic::arm_oneshot(config::IDLE_REARM_TICKS);
    instructions::enable_interrupts();
    loop {
        instructions::halt();
    }
}

/// Boot rendezvous for application cores: busy-wait until the bootstrap
/// core raises the started flag, then park and take scheduling
/// interrupts like everyone else.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn await_scheduler_start() -> ! {
    while !SCHED_STARTED.read() {
        core::hint::spin_loop();
    }
    park()
}

/// Initializes scheduling on the bootstrap core: populate the registry
/// ([`bootstrap`]), then park. The initial thread starts running when
/// some core's first timer interrupt dispatches it.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn scheduler_init(entry: VirtAddr, core_count: u32) -> ! {
    bootstrap(entry, core_count);
    park()
}

/// Terminates the calling thread with `status`. Never returns.
///
/// The thread is marked dead and removed from the runnable set, but its
/// dispatch lock — and therefore its stack — stays claimed until this
/// core has hopped onto its park stack; only then is the lock released
/// and the memory reclaimable by [`crate::sched::destroy_thread`].
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn thread_exit(status: i64) -> ! {
    use crate::arch::x86_64::context::retire_on;
    use crate::percpu;
    use crate::sched::scheduler::{retire_current, SCHED_LOCALS};

    // No preemption from here on: a tick would scan past the dead
    // thread and switch away with the exit half done.
    instructions::disable_interrupts();
    let Some(handle) = retire_current(&REGISTRY, SCHED_LOCALS.get(), status) else {
        panic!("thread_exit: no thread is running on this core");
    };
    let stack_top = percpu::park_stack_top(percpu::current_cpu_id());
    // SAFETY: The park stack is per-core and permanently allocated; the
    // handle is the retired thread returned above.
    unsafe { retire_on(handle.to_bits(), stack_top) }
}

/// Tail of [`thread_exit`], entered on the park stack: release the dead
/// thread's dispatch lock and park.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub(crate) extern "C" fn exit_epilogue(handle_bits: u64) -> ! {
    use crate::task::arena::Handle;

    REGISTRY.release_dispatch(Handle::from_bits(handle_bits));
    park()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_two_cores_three_threads() {
        let reg = Registry::new();
        let info = bootstrap_in(&reg, VirtAddr::new(0x1000), 2);

        // 1 bootstrap thread + 2 idle threads, all under one process.
        assert_eq!(reg.run_queue_len(), 3);
        assert_eq!(reg.process_queue_len(), 1);
        assert_eq!(info.idle_threads.len(), 2);
        assert!(scheduler_started());

        let procs = reg.process_infos();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].thread_count, 3);

        let threads = reg.thread_infos();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|t| t.enqueued));
        assert!(threads.iter().all(|t| t.process == info.kernel_process));
    }

    #[test]
    fn bootstrap_single_core() {
        let reg = Registry::new();
        let info = bootstrap_in(&reg, VirtAddr::new(0x2000), 1);
        assert_eq!(reg.run_queue_len(), 2);
        assert_eq!(info.idle_threads.len(), 1);
    }

    #[test]
    #[should_panic(expected = "core_count exceeds MAX_CPUS")]
    fn bootstrap_rejects_too_many_cores() {
        let reg = Registry::new();
        bootstrap_in(&reg, VirtAddr::new(0x1000), (MAX_CPUS + 1) as u32);
    }
}

//! The preemption entry point.
//!
//! Every arming of a core's one-shot timer ends up in [`tick`] with the
//! interrupted register snapshot; a voluntary [`yield_now`] takes the
//! same path through a software interrupt. The decision is made under a
//! *non-blocking* acquire of the registry lock — if another core is
//! mutating the registry, this core resumes the interrupted thread for a
//! fresh slice and defers to the next tick rather than risking a
//! cross-core deadlock inside an interrupt handler.
//!
//! On success the core persists the interrupted context into the
//! previously running thread, releases that thread's dispatch lock, and
//! scans the run queue circularly from its last dispatch position for
//! the first thread whose dispatch lock it can claim. Control leaves by
//! full context restore — never by returning to the interrupted code.

use muon_core::ktrace;

use crate::arch::x86_64::context::Context;
use crate::arch::x86_64::lapic;
use crate::config;
use crate::percpu::{CpuLocal, MAX_CPUS};
use crate::sched::registry::{Registry, RegistryInner, REGISTRY};
use crate::task::arena::Handle;
use crate::task::{ThreadHandle, ThreadState};

use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Sentinel for "no current thread" in [`SchedLocals::current`].
const NO_THREAD: u64 = u64::MAX;

/// Per-core scheduler state. Owned exclusively by one core; no other
/// core ever reads or writes it, which is why plain `Relaxed` atomics
/// suffice.
pub(crate) struct SchedLocals {
    /// Encoded handle of the thread this core is running.
    current: AtomicU64,
    /// Run-queue index of the last successful dispatch; the next scan
    /// starts just past it.
    last_index: AtomicUsize,
    /// Time slice of the current thread, cached so the contended tick
    /// path can re-arm without touching the registry.
    current_slice: AtomicU32,
}

impl SchedLocals {
    pub(crate) const fn new() -> Self {
        Self {
            current: AtomicU64::new(NO_THREAD),
            last_index: AtomicUsize::new(0),
            current_slice: AtomicU32::new(0),
        }
    }

    pub(crate) fn current(&self) -> Option<ThreadHandle> {
        match self.current.load(Ordering::Relaxed) {
            NO_THREAD => None,
            bits => Some(Handle::from_bits(bits)),
        }
    }

    pub(crate) fn set_current(&self, handle: Option<ThreadHandle>) {
        let bits = handle.map_or(NO_THREAD, Handle::to_bits);
        self.current.store(bits, Ordering::Relaxed);
    }

    fn last_index(&self) -> usize {
        self.last_index.load(Ordering::Relaxed)
    }

    fn set_last_index(&self, index: usize) {
        self.last_index.store(index, Ordering::Relaxed);
    }

    fn current_slice(&self) -> u32 {
        self.current_slice.load(Ordering::Relaxed)
    }

    fn set_current_slice(&self, ticks: u32) {
        self.current_slice.store(ticks, Ordering::Relaxed);
    }
}

/// Per-core scheduler state, one slot per core.
pub(crate) static SCHED_LOCALS: CpuLocal<SchedLocals> =
    CpuLocal::new([const { SchedLocals::new() }; MAX_CPUS]);

/// The outcome of a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Registry contended: resume the interrupted context unchanged,
    /// re-armed for `slice` ticks.
    Resume {
        /// Ticks the timer was re-armed with.
        slice: u32,
    },
    /// No dispatchable thread: transfer to the idle path.
    Idle,
    /// Dispatch `thread`: restore `context` with the timer armed for
    /// `slice` ticks.
    Switch {
        /// The chosen thread.
        thread: ThreadHandle,
        /// Copy of the chosen thread's saved context.
        context: Context,
        /// Ticks the timer was armed with.
        slice: u32,
    },
}

/// A dispatchable thread found by the circular scan, copied out of the
/// registry so the dispatch tail needs no further lookups.
struct Picked {
    queue_index: usize,
    handle: ThreadHandle,
    context: Context,
    space: crate::arch::x86_64::paging::AddressSpace,
    slice: u32,
}

/// Scans the run queue circularly starting just past `last`, returning
/// the first thread whose dispatch lock could be claimed.
///
/// Visits each queue position at most once, so it terminates even when
/// every thread is claimed by other cores. `last` may be out of range
/// (the queue shrinks under swap-remove); the modulo brings it back.
fn scan(inner: &RegistryInner, last: usize) -> Option<Picked> {
    let len = inner.run_queue.len();
    if len == 0 {
        return None;
    }
    for step in 1..=len {
        let index = (last + step) % len;
        let handle = inner.run_queue[index];
        let Some(thread) = inner.threads.get(handle) else {
            continue;
        };
        let Some(process) = inner.processes.get(thread.process) else {
            continue;
        };
        if thread.dispatch_lock.try_acquire() {
            return Some(Picked {
                queue_index: index,
                handle,
                context: thread.context,
                space: process.space,
                slice: thread.time_slice,
            });
        }
    }
    None
}

/// Makes one scheduling decision for the calling core.
///
/// `interrupted` is the register snapshot the timer interrupt (or yield)
/// captured. The timer is disarmed for the duration of the decision and
/// re-armed on every path that leaves with runnable work; the idle path
/// arms its own.
pub(crate) fn decide(reg: &Registry, locals: &SchedLocals, interrupted: &Context) -> Decision {
    lapic::disarm();

    let Some(mut guard) = reg.try_guard() else {
        // Another core is mutating the registry. Deciding anything now
        // would mean blocking inside an interrupt handler, so keep
        // running what we ran and try again next tick.
        let slice = if locals.current().is_some() {
            locals.current_slice()
        } else {
            config::FALLBACK_TIME_SLICE_TICKS
        };
        lapic::acknowledge();
        lapic::arm_oneshot(slice);
        return Decision::Resume { slice };
    };
    let inner = &mut *guard;

    // Persist the interrupted thread and make it eligible again. The
    // queue still contains it, so no reinsertion is needed.
    if let Some(previous) = locals.current() {
        if let Some(thread) = inner.threads.get_mut(previous) {
            thread.context = *interrupted;
            thread.dispatch_lock.release();
        }
    }

    match scan(inner, locals.last_index()) {
        None => {
            locals.set_current(None);
            locals.set_last_index(0);
            drop(guard);
            lapic::acknowledge();
            ktrace!("sched: nothing dispatchable, core going idle");
            Decision::Idle
        }
        Some(picked) => {
            locals.set_current(Some(picked.handle));
            locals.set_last_index(picked.queue_index);
            locals.set_current_slice(picked.slice);
            picked.space.switch_to();
            lapic::acknowledge();
            lapic::arm_oneshot(picked.slice);
            drop(guard);
            Decision::Switch {
                thread: picked.handle,
                context: picked.context,
                slice: picked.slice,
            }
        }
    }
}

/// The scheduling tick for the calling core.
///
/// Exposed for the architecture entry stub and for synchronous yields;
/// collaborators never call this directly.
pub fn tick(interrupted: &Context) -> Decision {
    decide(&REGISTRY, SCHED_LOCALS.get(), interrupted)
}

/// Applies a [`tick`] decision. Never returns.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub(crate) extern "C" fn dispatch(frame: *mut Context) -> ! {
    use crate::arch::x86_64::context::{park_on, resume};
    use crate::percpu;

    // SAFETY: `frame` points at the Context the entry stub just built on
    // this core's stack; it stays valid until we leave through resume.
    let decision = tick(unsafe { &*frame });
    match decision {
        // SAFETY: Resuming the frame we were handed restores exactly the
        // interrupted state.
        Decision::Resume { .. } => unsafe { resume(frame) },
        Decision::Switch { context, .. } => {
            // SAFETY: The context was copied out of a thread whose
            // dispatch lock this core now holds; its registers were
            // saved by a previous scheduler pass (or built at creation).
            unsafe { resume(&raw const context) }
        }
        // SAFETY: The park stack is per-core and permanently allocated.
        Decision::Idle => unsafe { park_on(percpu::park_stack_top(percpu::current_cpu_id())) },
    }
}

/// Voluntarily ends the calling thread's time slice.
///
/// Takes the same software-interrupt path as a timer expiry, so the
/// caller's full context is captured and it competes in the same
/// round-robin as everyone else.
pub fn yield_now() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: SCHED_VECTOR has the scheduler entry installed; raising it
    // is exactly a synchronous preemption.
    unsafe {
        core::arch::asm!("int {vector}", vector = const config::SCHED_VECTOR);
    }
}

/// Marks the calling core's current thread as exited.
///
/// Clears it out of the runnable set and records `status`. The caller
/// (the exit path) is responsible for leaving the dead thread's stack
/// and then releasing its dispatch lock via
/// [`Registry::release_dispatch`]. Returns the retired handle, or `None`
/// if the core was not running a thread.
pub(crate) fn retire_current(
    reg: &Registry,
    locals: &SchedLocals,
    status: i64,
) -> Option<ThreadHandle> {
    let handle = locals.current()?;
    {
        let mut guard = reg.guard();
        let inner = &mut *guard;
        if let Some(thread) = inner.threads.get_mut(handle) {
            thread.state = ThreadState::Dead;
            thread.exit_status = Some(status);
            if thread.enqueued {
                thread.enqueued = false;
                if let Some(pos) = inner.run_queue.iter().position(|&h| h == handle) {
                    inner.run_queue.swap_remove(pos);
                }
            }
        }
    }
    locals.set_current(None);
    Some(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Privilege, ProcHandle};
    use muon_core::addr::VirtAddr;

    fn setup() -> (Registry, SchedLocals, ProcHandle) {
        let reg = Registry::new();
        let proc = reg.create_process("test");
        (reg, SchedLocals::new(), proc)
    }

    fn spawn_at(reg: &Registry, proc: ProcHandle, entry: u64) -> ThreadHandle {
        reg.create_thread(
            proc,
            "worker",
            VirtAddr::new(entry),
            0,
            Privilege::Kernel,
            true,
        )
    }

    fn frame() -> Context {
        Context::initial(
            VirtAddr::new(0xF000),
            VirtAddr::new(0x10_0000),
            Privilege::Kernel,
        )
    }

    #[test]
    fn empty_queue_goes_idle() {
        let (reg, locals, _proc) = setup();
        assert_eq!(decide(&reg, &locals, &frame()), Decision::Idle);
        assert_eq!(locals.current(), None);
    }

    #[test]
    fn single_thread_is_resumed_every_tick() {
        let (reg, locals, proc) = setup();
        let t = spawn_at(&reg, proc, 0x1000);

        for _ in 0..5 {
            match decide(&reg, &locals, &frame()) {
                Decision::Switch { thread, .. } => assert_eq!(thread, t),
                other => panic!("expected Switch, got {other:?}"),
            }
            assert_eq!(locals.current(), Some(t));
            assert_eq!(locals.last_index(), 0);
        }
    }

    #[test]
    fn three_threads_rotate_round_robin() {
        let (reg, locals, proc) = setup();
        let t1 = spawn_at(&reg, proc, 0x1000);
        let t2 = spawn_at(&reg, proc, 0x2000);
        let t3 = spawn_at(&reg, proc, 0x3000);

        let mut order = Vec::new();
        for _ in 0..6 {
            match decide(&reg, &locals, &frame()) {
                Decision::Switch { thread, .. } => order.push(thread),
                other => panic!("expected Switch, got {other:?}"),
            }
        }
        // The scan starts just past the hint, so a fresh core (hint 0)
        // picks queue position 1 first; every thread still runs once per
        // revolution.
        assert_eq!(order, vec![t2, t3, t1, t2, t3, t1]);
    }

    #[test]
    fn interrupted_context_is_persisted() {
        let (reg, locals, proc) = setup();
        spawn_at(&reg, proc, 0x1000);
        spawn_at(&reg, proc, 0x2000);

        decide(&reg, &locals, &frame());
        let first = locals.current().unwrap();

        // The next tick preempts it; the snapshot we pass must land in
        // the thread that was running.
        let mut snapshot = frame();
        snapshot.rip = 0xDEAD_0000;
        snapshot.rax = 42;
        decide(&reg, &locals, &snapshot);
        assert_ne!(locals.current(), Some(first));

        let guard = reg.guard();
        let saved = guard.threads.get(first).unwrap().context;
        assert_eq!(saved.rip, 0xDEAD_0000);
        assert_eq!(saved.rax, 42);
    }

    #[test]
    fn switch_restores_the_saved_context() {
        let (reg, locals, proc) = setup();
        spawn_at(&reg, proc, 0x1000);
        match decide(&reg, &locals, &frame()) {
            Decision::Switch { context, .. } => {
                // A freshly created thread resumes at its entry point.
                assert_eq!(context.rip, 0x1000);
            }
            other => panic!("expected Switch, got {other:?}"),
        }
    }

    #[test]
    fn all_locked_goes_idle_and_resets_hint() {
        let (reg, locals, proc) = setup();
        let t1 = spawn_at(&reg, proc, 0x1000);
        let t2 = spawn_at(&reg, proc, 0x2000);
        {
            let guard = reg.guard();
            assert!(guard.threads.get(t1).unwrap().dispatch_lock.try_acquire());
            assert!(guard.threads.get(t2).unwrap().dispatch_lock.try_acquire());
        }
        locals.set_last_index(7); // stale hint on purpose

        assert_eq!(decide(&reg, &locals, &frame()), Decision::Idle);
        assert_eq!(locals.current(), None);
        assert_eq!(locals.last_index(), 0);
    }

    #[test]
    fn contended_registry_resumes_with_fallback_slice() {
        let (reg, locals, _proc) = setup();
        let _held = reg.guard();
        match decide(&reg, &locals, &frame()) {
            Decision::Resume { slice } => {
                assert_eq!(slice, config::FALLBACK_TIME_SLICE_TICKS);
            }
            other => panic!("expected Resume, got {other:?}"),
        }
    }

    #[test]
    fn contended_registry_resumes_with_current_slice() {
        let (reg, locals, proc) = setup();
        let t = reg.create_thread(
            proc,
            "sliced",
            VirtAddr::new(0x1000),
            1234,
            Privilege::Kernel,
            true,
        );
        decide(&reg, &locals, &frame());
        assert_eq!(locals.current(), Some(t));

        let _held = reg.guard();
        match decide(&reg, &locals, &frame()) {
            Decision::Resume { slice } => assert_eq!(slice, 1234),
            other => panic!("expected Resume, got {other:?}"),
        }
        // The deferred decision leaves the core's view unchanged.
        assert_eq!(locals.current(), Some(t));
    }

    #[test]
    fn scan_skips_threads_claimed_by_other_cores() {
        let (reg, locals, proc) = setup();
        let t1 = spawn_at(&reg, proc, 0x1000);
        let t2 = spawn_at(&reg, proc, 0x2000);
        // The scan would try t2 (queue position 1) first; another core
        // claims it, so the wrap-around must land on t1.
        {
            let guard = reg.guard();
            assert!(guard.threads.get(t2).unwrap().dispatch_lock.try_acquire());
        }
        match decide(&reg, &locals, &frame()) {
            Decision::Switch { thread, .. } => assert_eq!(thread, t1),
            other => panic!("expected Switch, got {other:?}"),
        }
    }

    #[test]
    fn retire_removes_from_queue_and_records_status() {
        let (reg, locals, proc) = setup();
        let t = spawn_at(&reg, proc, 0x1000);
        decide(&reg, &locals, &frame());
        assert_eq!(locals.current(), Some(t));

        let retired = retire_current(&reg, &locals, 3).unwrap();
        assert_eq!(retired, t);
        assert_eq!(locals.current(), None);
        assert_eq!(reg.run_queue_len(), 0);
        {
            let guard = reg.guard();
            let thread = guard.threads.get(t).unwrap();
            assert_eq!(thread.state, ThreadState::Dead);
            assert_eq!(thread.exit_status, Some(3));
            // The exit path still owns the context until it leaves the
            // dead thread's stack.
            assert!(thread.dispatch_lock.is_held());
        }

        // Next tick finds nothing and the dead thread is never resumed.
        assert_eq!(decide(&reg, &locals, &frame()), Decision::Idle);

        // After the epilogue releases, destruction can reclaim it.
        reg.release_dispatch(t);
        reg.destroy_thread(t);
        assert!(reg.guard().threads.get(t).is_none());
    }

    #[test]
    fn retire_without_current_returns_none() {
        let (reg, locals, _proc) = setup();
        assert_eq!(retire_current(&reg, &locals, 0), None);
    }

    #[test]
    fn dequeued_thread_is_not_rescheduled() {
        let (reg, locals, proc) = setup();
        let t1 = spawn_at(&reg, proc, 0x1000);
        let t2 = spawn_at(&reg, proc, 0x2000);

        decide(&reg, &locals, &frame());
        assert_eq!(locals.current(), Some(t2));

        // Another core dequeues the thread we are running. It blocks on
        // our dispatch lock, so do it from a helper thread while we take
        // our next tick.
        let reg = std::sync::Arc::new(reg);
        let dequeuer = {
            let reg = std::sync::Arc::clone(&reg);
            std::thread::spawn(move || reg.dequeue_thread(t2))
        };
        // Wait until the claim phase has pulled t2 out of the queue.
        while reg.run_queue_len() == 2 {
            std::thread::yield_now();
        }

        // Our next tick releases t2's dispatch lock and must pick t1.
        // The dequeuer's probes hold the registry lock in bursts, so a
        // tick may defer with Resume — retry as the next tick would.
        let decision = loop {
            match decide(&reg, &locals, &frame()) {
                Decision::Resume { .. } => std::thread::yield_now(),
                other => break other,
            }
        };
        match decision {
            Decision::Switch { thread, .. } => assert_eq!(thread, t1),
            other => panic!("expected Switch, got {other:?}"),
        }
        assert!(dequeuer.join().unwrap());
    }
}

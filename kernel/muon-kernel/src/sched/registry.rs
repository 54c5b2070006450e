//! Global thread/process registry.
//!
//! Two generation-checked arenas hold every thread and process record;
//! the run queue and process queue hold the handles that are currently
//! enqueued. One scheduler-wide spin lock guards all of it. The lock is
//! held only for collection mutation and the scan-and-dispatch decision
//! — never across a context switch, and never blockingly from interrupt
//! context (the tick path uses `try_lock` and defers on contention).
//!
//! Run-queue order is the round-robin scan order, nothing more: removal
//! swap-removes, so positions are not stable.

use alloc::vec::Vec;

use muon_core::addr::VirtAddr;
use muon_core::sync::{SpinLock, SpinLockGuard};
use muon_core::{kdebug, kwarn};

use crate::arch::x86_64::context::Context;
use crate::arch::x86_64::paging;
use crate::config;
use crate::task::arena::Arena;
use crate::task::{
    DispatchLock, KernelStack, Pid, Privilege, ProcHandle, Process, ProcessInfo, Thread,
    ThreadHandle, ThreadInfo, ThreadState, Tid,
};

/// The kernel-wide registry instance.
pub(crate) static REGISTRY: Registry = Registry::new();

/// Everything the registry lock guards.
pub(crate) struct RegistryInner {
    pub(crate) threads: Arena<Thread>,
    pub(crate) processes: Arena<Process>,
    /// Enqueued threads in round-robin scan order.
    pub(crate) run_queue: Vec<ThreadHandle>,
    /// Enqueued processes.
    pub(crate) proc_queue: Vec<ProcHandle>,
    next_tid: u64,
    next_pid: u32,
}

impl RegistryInner {
    const fn new() -> Self {
        Self {
            threads: Arena::new(),
            processes: Arena::new(),
            run_queue: Vec::new(),
            proc_queue: Vec::new(),
            next_tid: 0,
            next_pid: 0,
        }
    }
}

/// The thread/process registry.
pub(crate) struct Registry {
    inner: SpinLock<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    pub(crate) const fn new() -> Self {
        Self {
            inner: SpinLock::new(RegistryInner::new()),
        }
    }

    /// Acquires the registry lock, spinning. Thread context only.
    pub(crate) fn guard(&self) -> SpinLockGuard<'_, RegistryInner> {
        self.inner.lock()
    }

    /// Attempts to acquire the registry lock without blocking. The only
    /// acquisition form the tick path may use.
    pub(crate) fn try_guard(&self) -> Option<SpinLockGuard<'_, RegistryInner>> {
        self.inner.try_lock()
    }

    /// Creates a process with the kernel's base address space and no
    /// threads, and registers it into the global process set.
    pub(crate) fn create_process(&self, name: &'static str) -> ProcHandle {
        let handle = {
            let mut guard = self.guard();
            let inner = &mut *guard;
            let pid = Pid(inner.next_pid);
            inner.next_pid += 1;
            inner.processes.insert(Process {
                pid,
                name,
                threads: Vec::new(),
                thread_count: 0,
                space: paging::kernel_space(),
                enqueued: false,
            })
        };
        self.enqueue_process(handle);
        kdebug!("sched: created process {:?} ({})", handle, name);
        handle
    }

    /// Creates a thread under `process` with a fresh kernel stack and an
    /// initial context at `entry`.
    ///
    /// A `time_slice` of zero selects the default. If `auto_enqueue` the
    /// thread is immediately eligible for dispatch.
    pub(crate) fn create_thread(
        &self,
        process: ProcHandle,
        name: &'static str,
        entry: VirtAddr,
        time_slice: u32,
        privilege: Privilege,
        auto_enqueue: bool,
    ) -> ThreadHandle {
        // Allocate outside the lock; allocation failure aborts anyway.
        let stack = KernelStack::allocate();
        let context = Context::initial(entry, stack.top(), privilege);
        let time_slice = if time_slice == 0 {
            config::DEFAULT_TIME_SLICE_TICKS
        } else {
            time_slice
        };

        let handle = {
            let mut guard = self.guard();
            let inner = &mut *guard;
            assert!(
                inner.processes.get(process).is_some(),
                "create_thread: dead process handle"
            );
            let tid = Tid(inner.next_tid);
            inner.next_tid += 1;
            inner.threads.insert(Thread {
                tid,
                name,
                process,
                state: ThreadState::Alive,
                exit_status: None,
                enqueued: false,
                dispatch_lock: DispatchLock::new(),
                context,
                time_slice,
                stack,
            })
        };
        kdebug!("sched: created thread {:?} ({})", handle, name);
        if auto_enqueue {
            self.enqueue_thread(handle);
        }
        handle
    }

    /// Creates an auto-enqueued ring-0 thread. Convenience wrapper used
    /// for kernel service and idle threads.
    pub(crate) fn create_kernel_thread(
        &self,
        process: ProcHandle,
        name: &'static str,
        entry: VirtAddr,
        time_slice: u32,
    ) -> ThreadHandle {
        self.create_thread(process, name, entry, time_slice, Privilege::Kernel, true)
    }

    /// Makes a thread part of the global runnable set. Idempotent; a
    /// stale handle is ignored.
    pub(crate) fn enqueue_thread(&self, handle: ThreadHandle) {
        let mut guard = self.guard();
        let inner = &mut *guard;
        let Some(thread) = inner.threads.get_mut(handle) else {
            return;
        };
        if thread.enqueued {
            return;
        }
        thread.enqueued = true;
        let owner = thread.process;
        inner.run_queue.push(handle);
        if let Some(process) = inner.processes.get_mut(owner) {
            process.threads.push(handle);
            process.thread_count += 1;
        }
    }

    /// Makes a process part of the global process set. Idempotent; a
    /// stale handle is ignored.
    pub(crate) fn enqueue_process(&self, handle: ProcHandle) {
        let mut guard = self.guard();
        let inner = &mut *guard;
        let Some(process) = inner.processes.get_mut(handle) else {
            return;
        };
        if process.enqueued {
            return;
        }
        process.enqueued = true;
        inner.proc_queue.push(handle);
    }

    /// Removes a thread from the global runnable set.
    ///
    /// Returns `false` without mutating anything if the thread is not
    /// enqueued (or the handle is stale). Otherwise removes it from the
    /// run queue and then waits until no core holds the thread's
    /// dispatch lock — i.e. until the core that was running it has moved
    /// off its context — before returning `true`.
    ///
    /// Under concurrent calls exactly one caller wins the removal. Must
    /// not be called while holding the registry lock.
    pub(crate) fn dequeue_thread(&self, handle: ThreadHandle) -> bool {
        {
            let mut guard = self.guard();
            let inner = &mut *guard;
            let Some(thread) = inner.threads.get_mut(handle) else {
                return false;
            };
            if !thread.enqueued {
                return false;
            }
            thread.enqueued = false;
            if let Some(pos) = inner.run_queue.iter().position(|&h| h == handle) {
                inner.run_queue.swap_remove(pos);
            }
        }
        // The thread can no longer be picked up by a scan; wait out any
        // core still running or dispatching it. The registry lock is
        // re-taken per probe so that core's tick can get in and release.
        self.wait_dispatch_clear(handle);
        true
    }

    /// Removes a process and all of its threads from the global sets.
    ///
    /// Returns `false` if the process is not enqueued. Must not be
    /// called while holding the registry lock.
    pub(crate) fn dequeue_process(&self, handle: ProcHandle) -> bool {
        let threads = {
            let guard = self.guard();
            let Some(process) = guard.processes.get(handle) else {
                return false;
            };
            if !process.enqueued {
                return false;
            }
            process.threads.clone()
        };
        for thread in threads {
            self.dequeue_thread(thread);
        }
        let mut guard = self.guard();
        let inner = &mut *guard;
        if let Some(process) = inner.processes.get_mut(handle) {
            process.enqueued = false;
        }
        if let Some(pos) = inner.proc_queue.iter().position(|&h| h == handle) {
            inner.proc_queue.swap_remove(pos);
        }
        true
    }

    /// Dequeues a thread if needed, then frees its record and stack.
    ///
    /// The caller must not retain the handle; every copy of it is dead
    /// after this returns.
    pub(crate) fn destroy_thread(&self, handle: ThreadHandle) {
        self.dequeue_thread(handle);
        // A concurrent dequeuer may still be between claim and wait;
        // never free a context a core might be standing on.
        self.wait_dispatch_clear(handle);
        let mut guard = self.guard();
        if let Some(thread) = guard.threads.remove(handle) {
            kdebug!("sched: destroyed thread {} ({})", thread.tid, thread.name);
        }
    }

    /// Dequeues a process if needed, destroys every thread it ever
    /// owned, then frees the process record.
    pub(crate) fn destroy_process(&self, handle: ProcHandle) {
        self.dequeue_process(handle);
        let threads = {
            let guard = self.guard();
            let Some(process) = guard.processes.get(handle) else {
                return;
            };
            process.threads.clone()
        };
        for thread in threads {
            self.destroy_thread(thread);
        }
        let mut guard = self.guard();
        if let Some(process) = guard.processes.remove(handle) {
            kdebug!("sched: destroyed process {} ({})", process.pid, process.name);
        }
    }

    /// Releases a thread's dispatch lock through the registry.
    ///
    /// Used by the exit path, which can only drop the lock after hopping
    /// off the dead thread's stack.
    pub(crate) fn release_dispatch(&self, handle: ThreadHandle) {
        let guard = self.guard();
        if let Some(thread) = guard.threads.get(handle) {
            thread.dispatch_lock.release();
        }
    }

    /// Spins until no core holds the thread's dispatch lock (or the
    /// record is gone). Re-takes the registry lock per probe so the
    /// running core's scheduler pass can acquire it and release.
    fn wait_dispatch_clear(&self, handle: ThreadHandle) {
        let mut spins: u64 = 0;
        loop {
            {
                let guard = self.guard();
                match guard.threads.get(handle) {
                    None => return,
                    Some(thread) if !thread.dispatch_lock.is_held() => return,
                    Some(_) => {}
                }
            }
            spins += 1;
            if spins == 1_000_000 {
                kwarn!(
                    "sched: still waiting for dispatch lock of {:?} to clear",
                    handle
                );
            }
            core::hint::spin_loop();
        }
    }

    /// Snapshots every live thread record.
    pub(crate) fn thread_infos(&self) -> Vec<ThreadInfo> {
        let guard = self.guard();
        guard
            .threads
            .iter()
            .map(|(_, t)| ThreadInfo {
                tid: t.tid,
                name: t.name,
                process: t.process,
                state: t.state,
                enqueued: t.enqueued,
                time_slice: t.time_slice,
            })
            .collect()
    }

    /// Snapshots every live process record.
    pub(crate) fn process_infos(&self) -> Vec<ProcessInfo> {
        let guard = self.guard();
        guard
            .processes
            .iter()
            .map(|(_, p)| ProcessInfo {
                pid: p.pid,
                name: p.name,
                thread_count: p.thread_count,
                enqueued: p.enqueued,
            })
            .collect()
    }

    /// Number of threads currently in the run queue.
    pub(crate) fn run_queue_len(&self) -> usize {
        self.guard().run_queue.len()
    }

    /// Number of processes currently in the process set.
    pub(crate) fn process_queue_len(&self) -> usize {
        self.guard().proc_queue.len()
    }
}

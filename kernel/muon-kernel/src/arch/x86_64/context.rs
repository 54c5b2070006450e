//! Execution contexts and the context-switch primitive.
//!
//! [`Context`] is the full register snapshot of a suspended thread.
//! Conceptually every thread is always either running on some core or
//! fully described by its saved `Context`; there is no intermediate
//! state. The type is an opaque, copyable value everywhere else in the
//! kernel — this module is the only code allowed to interpret its bits.
//!
//! The memory layout mirrors what [`timer_interrupt`] builds on the
//! stack: the CPU pushes the `iretq` frame (rip/cs/rflags/rsp/ss), the
//! stub pushes the fifteen general-purpose registers below it, and the
//! resulting block *is* a `Context`. [`resume`] walks the same layout in
//! reverse and never returns.

use muon_core::addr::VirtAddr;

use crate::task::Privilege;

/// GDT selector for kernel code: index 1, RPL=0.
///
/// GDT layout: null(0), kernel_code(0x08), kernel_data(0x10),
/// user_data(0x18), user_code(0x20).
pub const KERNEL_CODE_SELECTOR: u64 = 0x08;

/// GDT selector for kernel data: index 2, RPL=0.
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;

/// GDT selector for user data: index 3, RPL=3. SS = 0x18 | 3.
pub const USER_DATA_SELECTOR: u64 = 0x1B;

/// GDT selector for user code: index 4, RPL=3. CS = 0x20 | 3.
pub const USER_CODE_SELECTOR: u64 = 0x23;

bitflags::bitflags! {
    /// CPU flags (RFLAGS register).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Carry flag.
        const CARRY          = 1 << 0;
        /// Reserved bit 1 — always set.
        const RESERVED_1     = 1 << 1;
        /// Parity flag.
        const PARITY         = 1 << 2;
        /// Zero flag.
        const ZERO           = 1 << 6;
        /// Sign flag.
        const SIGN           = 1 << 7;
        /// Trap flag (single-step).
        const TRAP           = 1 << 8;
        /// Interrupt enable flag.
        const INTERRUPT_FLAG = 1 << 9;
        /// Direction flag.
        const DIRECTION      = 1 << 10;
        /// Overflow flag.
        const OVERFLOW       = 1 << 11;
    }
}

/// A full saved register snapshot.
///
/// Field order is load-bearing: it matches the stack image built by
/// [`timer_interrupt`] (GPRs pushed below the hardware `iretq` frame)
/// and consumed by [`resume`]. Do not reorder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    /// R15 register.
    pub r15: u64,
    /// R14 register.
    pub r14: u64,
    /// R13 register.
    pub r13: u64,
    /// R12 register.
    pub r12: u64,
    /// R11 register.
    pub r11: u64,
    /// R10 register.
    pub r10: u64,
    /// R9 register.
    pub r9: u64,
    /// R8 register.
    pub r8: u64,
    /// RBP register.
    pub rbp: u64,
    /// RDI register.
    pub rdi: u64,
    /// RSI register.
    pub rsi: u64,
    /// RDX register.
    pub rdx: u64,
    /// RCX register.
    pub rcx: u64,
    /// RBX register.
    pub rbx: u64,
    /// RAX register.
    pub rax: u64,
    /// Instruction pointer (from the iretq frame).
    pub rip: u64,
    /// Code segment selector.
    pub cs: u64,
    /// RFLAGS.
    pub rflags: u64,
    /// Stack pointer.
    pub rsp: u64,
    /// Stack segment selector.
    pub ss: u64,
}

impl Context {
    /// Builds the initial context for a new thread.
    ///
    /// Instruction pointer at `entry`, stack pointer just below
    /// `stack_top` (the 8-byte bias gives the entry function the
    /// alignment it would see after a `call`), interrupts enabled, and
    /// code/stack selectors for the requested privilege level. All
    /// general-purpose registers start zeroed.
    #[must_use]
    pub fn initial(entry: VirtAddr, stack_top: VirtAddr, privilege: Privilege) -> Self {
        let (cs, ss) = match privilege {
            Privilege::Kernel => (KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR),
            Privilege::User => (USER_CODE_SELECTOR, USER_DATA_SELECTOR),
        };
        Self {
            rip: entry.as_u64(),
            cs,
            rflags: (RFlags::RESERVED_1 | RFlags::INTERRUPT_FLAG).bits(),
            rsp: stack_top.as_u64() - 8,
            ss,
            ..Self::default()
        }
    }

    /// Returns the saved RFLAGS as a typed value.
    #[must_use]
    pub fn rflags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.rflags)
    }
}

/// The scheduler interrupt entry point.
///
/// Installed by the interrupt-dispatch collaborator at
/// [`crate::config::SCHED_VECTOR`]. On entry the CPU has pushed the
/// `iretq` frame; the stub pushes the remaining registers so the stack
/// holds a complete [`Context`], then hands its address to the scheduler.
/// Control leaves through [`resume`] — this function never returns.
///
/// # Safety
///
/// Must only be entered through an interrupt gate (or `int` instruction)
/// so that a hardware `iretq` frame sits on the stack.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[unsafe(naked)]
pub unsafe extern "C" fn timer_interrupt() -> ! {
    core::arch::naked_asm!(
        // Complete the Context below the hardware frame. Push order is
        // the reverse of the struct's field order.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {dispatch}",
        "ud2",
        dispatch = sym crate::sched::scheduler::dispatch,
    )
}

/// Resumes execution at a saved context. Never returns.
///
/// # Safety
///
/// `ctx` must point to a valid [`Context`] whose rip/rsp/selectors are
/// executable in the current address space. The caller must not rely on
/// anything after this call; the entire register state and stack are
/// replaced.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[unsafe(naked)]
pub unsafe extern "C" fn resume(ctx: *const Context) -> ! {
    core::arch::naked_asm!(
        // Walk the Context in field order, then iretq consumes the
        // trailing rip/cs/rflags/rsp/ss frame.
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    )
}

/// Switches to the given stack and parks the core.
///
/// # Safety
///
/// `stack_top` must be the top of a stack that stays valid for as long
/// as the core may remain parked (in practice: a per-core park stack).
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[unsafe(naked)]
pub unsafe extern "C" fn park_on(stack_top: u64) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "call {park}",
        "ud2",
        park = sym crate::sched::idle::park,
    )
}

/// Switches to the given stack, then releases the exiting thread's
/// dispatch lock and parks.
///
/// The stack hop must happen before the release: the moment the dispatch
/// lock drops, another core may reclaim the dead thread's stack.
///
/// # Safety
///
/// Same stack requirements as [`park_on`]; `handle_bits` must be the
/// encoded handle of the thread being retired.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[unsafe(naked)]
pub unsafe extern "C" fn retire_on(handle_bits: u64, stack_top: u64) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rsi",
        "call {epilogue}",
        "ud2",
        epilogue = sym crate::sched::idle::exit_epilogue,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_kernel_context() {
        let ctx = Context::initial(
            VirtAddr::new(0x1000),
            VirtAddr::new(0x8000),
            Privilege::Kernel,
        );
        assert_eq!(ctx.rip, 0x1000);
        assert_eq!(ctx.rsp, 0x8000 - 8);
        assert_eq!(ctx.cs, KERNEL_CODE_SELECTOR);
        assert_eq!(ctx.ss, KERNEL_DATA_SELECTOR);
        assert!(ctx.rflags().contains(RFlags::INTERRUPT_FLAG));
        assert_eq!(ctx.rax, 0);
        assert_eq!(ctx.r15, 0);
    }

    #[test]
    fn initial_user_context_selectors() {
        let ctx = Context::initial(
            VirtAddr::new(0x40_0000),
            VirtAddr::new(0x7000_0000),
            Privilege::User,
        );
        assert_eq!(ctx.cs, USER_CODE_SELECTOR);
        assert_eq!(ctx.ss, USER_DATA_SELECTOR);
    }

    #[test]
    fn context_is_plain_data() {
        let a = Context::initial(
            VirtAddr::new(0x1000),
            VirtAddr::new(0x2000),
            Privilege::Kernel,
        );
        let b = a; // Copy
        assert_eq!(a, b);
    }
}

//! Privileged instruction wrappers.
//!
//! On non-bare targets these compile to no-ops so the scheduling policy
//! above them can run under the host test harness.

/// Disables maskable interrupts on this core.
#[inline]
pub fn disable_interrupts() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: `cli` is always safe in ring 0.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables maskable interrupts on this core.
#[inline]
pub fn enable_interrupts() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: `sti` is always safe in ring 0.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Halts this core until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    // SAFETY: `hlt` is always safe in ring 0; the core resumes on the
    // next interrupt.
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
    core::hint::spin_loop();
}

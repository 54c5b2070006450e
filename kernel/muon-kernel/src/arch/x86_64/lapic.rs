//! Local APIC one-shot timer.
//!
//! The preemption source: each core arms its own LAPIC timer in one-shot
//! mode for the dispatched thread's time slice, and the expiry delivers
//! [`crate::config::SCHED_VECTOR`] — the scheduler entry. The timer is
//! disarmed for the duration of every scheduling decision and re-armed
//! before control leaves the scheduler, so it is never left dead.
//!
//! The MMIO base is registered once at boot ([`set_lapic_base`]) from the
//! firmware-table collaborator; ticks that fire before registration are
//! ignored. On non-bare targets every operation is a no-op.

use core::sync::atomic::{AtomicU64, Ordering};

use muon_core::addr::VirtAddr;

use crate::config;

/// End-of-interrupt register.
const REG_EOI: u64 = 0x0B0;
/// LVT timer register.
const REG_LVT_TIMER: u64 = 0x320;
/// Timer initial-count register.
const REG_TIMER_INITIAL: u64 = 0x380;
/// Timer divide-configuration register.
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// LVT timer mask bit.
const TIMER_MASKED: u32 = 1 << 16;

/// Virtual base of the LAPIC MMIO window; 0 until registered.
static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);

/// Registers the LAPIC MMIO mapping.
///
/// # Safety
///
/// `base` must be a valid, permanent mapping of the LAPIC MMIO region
/// (at least 4 KiB), identical from every core's view.
pub unsafe fn set_lapic_base(base: VirtAddr) {
    LAPIC_BASE.store(base.as_u64(), Ordering::Release);
}

/// Converts a power-of-2 divide value to the divide-configuration
/// register encoding.
const fn divide_config(divide: u8) -> u32 {
    match divide {
        1 => 0b1011,
        2 => 0b0000,
        4 => 0b0001,
        8 => 0b0010,
        16 => 0b0011,
        32 => 0b1000,
        64 => 0b1001,
        128 => 0b1010,
        _ => 0b0011, // Default to divide by 16.
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn write_reg(offset: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Acquire);
    if base == 0 {
        return;
    }
    let reg = VirtAddr::new(base) + offset;
    // SAFETY: set_lapic_base guarantees the base maps the LAPIC MMIO
    // region; all register offsets used here are within its first 4 KiB.
    unsafe {
        reg.as_mut_ptr::<u32>().write_volatile(value);
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
fn write_reg(_offset: u64, _value: u32) {}

/// Arms this core's timer in one-shot mode for `ticks` timer ticks.
///
/// Expiry delivers [`config::SCHED_VECTOR`] exactly once.
pub fn arm_oneshot(ticks: u32) {
    write_reg(REG_TIMER_DIVIDE, divide_config(config::TIMER_DIVIDE));
    write_reg(REG_LVT_TIMER, u32::from(config::SCHED_VECTOR));
    write_reg(REG_TIMER_INITIAL, ticks);
}

/// Disarms this core's timer by masking the LVT entry.
pub fn disarm() {
    write_reg(REG_LVT_TIMER, TIMER_MASKED);
}

/// Acknowledges the pending interrupt (end-of-interrupt).
pub fn acknowledge() {
    write_reg(REG_EOI, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divide_encodings() {
        assert_eq!(divide_config(1), 0b1011);
        assert_eq!(divide_config(16), 0b0011);
        assert_eq!(divide_config(128), 0b1010);
        // Unknown values fall back to divide-by-16.
        assert_eq!(divide_config(3), 0b0011);
    }
}

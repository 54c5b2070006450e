//! Compile-time kernel configuration.

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 16;

/// Default thread time slice in LAPIC timer ticks, used when a thread is
/// created with a slice of zero.
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 5_000;

/// Re-arm interval when a scheduling tick finds the registry lock
/// contended and no thread is running on the core.
pub const FALLBACK_TIME_SLICE_TICKS: u32 = 20_000;

/// Re-arm interval used by a parked (idle) core.
pub const IDLE_REARM_TICKS: u32 = 20_000;

/// Kernel stack size for newly created threads (16 KiB).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Per-core stack used while parked, so a core never idles on a stack
/// owned by a thread that may be destroyed under it (4 KiB).
pub const PARK_STACK_SIZE: usize = 4096;

/// Interrupt vector the per-core one-shot timer (and voluntary yield)
/// delivers the scheduler entry on.
pub const SCHED_VECTOR: u8 = 0x40;

/// LAPIC timer divide value (power of two).
pub const TIMER_DIVIDE: u8 = 16;

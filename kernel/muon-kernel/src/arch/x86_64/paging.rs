//! Address-space capability.
//!
//! The scheduler needs exactly two things from memory management: a
//! per-process handle it can activate on dispatch ([`AddressSpace`],
//! wrapping the page-table root), and a way for the program loader to
//! populate a new process's memory before its first thread runs
//! ([`AddressSpace::map`]). Page-table walking itself belongs to the
//! memory-management collaborator, which registers its mapper with
//! [`set_map_fn`] at boot.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    /// Permission bits for a mapping request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PagePerms: u64 {
        /// Mapping is writable.
        const WRITABLE   = 1 << 0;
        /// Mapping is reachable from ring 3.
        const USER       = 1 << 1;
        /// Mapping may be executed.
        const EXECUTABLE = 1 << 2;
    }
}

/// A hardware address space, identified by its page-table root.
///
/// All threads of a process execute with the process's address space
/// active; the scheduler activates it on every dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    root: PhysAddr,
}

impl AddressSpace {
    /// Creates a handle from a page-table root.
    #[must_use]
    pub const fn new(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Returns the page-table root.
    #[must_use]
    pub const fn root(self) -> PhysAddr {
        self.root
    }

    /// Activates this address space on the calling core.
    pub fn switch_to(self) {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        // SAFETY: The root came from a registered address space; loading
        // CR3 with a valid page-table root is safe in ring 0.
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root.as_u64(),
                options(nostack, preserves_flags),
            );
        }
    }

    /// Maps `virt` to `phys` with the given permissions.
    ///
    /// Delegates to the mapper registered with [`set_map_fn`]; a no-op
    /// until one is registered. Used by the program loader to populate a
    /// process image before enqueueing its first thread.
    pub fn map(self, phys: PhysAddr, virt: VirtAddr, perms: PagePerms) {
        let ptr = MAP_FN.load(Ordering::Acquire);
        // SAFETY: We only ever store valid `MapFn` function pointers (or
        // the initial `null_map`) into MAP_FN.
        let f: MapFn = unsafe { core::mem::transmute(ptr) };
        f(self.root, phys, virt, perms);
    }
}

/// The signature of the registered mapper: (root, phys, virt, perms).
pub type MapFn = fn(PhysAddr, PhysAddr, VirtAddr, PagePerms);

fn null_map(_root: PhysAddr, _phys: PhysAddr, _virt: VirtAddr, _perms: PagePerms) {}

static MAP_FN: AtomicPtr<()> = AtomicPtr::new(null_map as *mut ());

/// Registers the page-table mapper.
///
/// # Safety
///
/// The provided function must be safe to call from any context and must
/// correctly interpret the page-table root it is handed.
pub unsafe fn set_map_fn(f: MapFn) {
    MAP_FN.store(f as *mut (), Ordering::Release);
}

/// Page-table root of the kernel's base address space; 0 until boot
/// registers it.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Registers the kernel's base address space root.
///
/// # Safety
///
/// `root` must be the physical address of the live kernel page tables.
pub unsafe fn set_kernel_space(root: PhysAddr) {
    KERNEL_ROOT.store(root.as_u64(), Ordering::Release);
}

/// Returns the kernel's base address space.
///
/// New processes start with this address space until the loader replaces
/// it.
#[must_use]
pub fn kernel_space() -> AddressSpace {
    AddressSpace::new(PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trips_root() {
        let space = AddressSpace::new(PhysAddr::new(0x1000));
        assert_eq!(space.root().as_u64(), 0x1000);
    }

    #[test]
    fn map_without_mapper_is_a_no_op() {
        let space = AddressSpace::new(PhysAddr::new(0x2000));
        space.map(
            PhysAddr::new(0x3000),
            VirtAddr::new(0x4000),
            PagePerms::WRITABLE | PagePerms::USER,
        );
    }

    #[test]
    fn switch_to_on_host_is_a_no_op() {
        AddressSpace::new(PhysAddr::new(0x5000)).switch_to();
    }
}

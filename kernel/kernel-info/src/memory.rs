//! # Memory Layout Constants

use kernel_memory_addresses::{PAGE_SIZE, PhysAddr, VirtAddr};

/// Total physical memory size in bytes.
pub const MEMSIZE_PHYSICAL: u64 = 0x20_0000;

/// Number of physical pages.
pub const NPAGES: usize = (MEMSIZE_PHYSICAL / PAGE_SIZE) as usize;

/// Total per-process virtual address space size in bytes.
///
/// Larger than physical memory: the top third of a process's space has no
/// identity-mapped backing and is always reached through fresh mappings.
pub const MEMSIZE_VIRTUAL: u64 = 0x30_0000;

/// First byte of the kernel image.
pub const KERNEL_START_ADDR: u64 = 0x4_0000;

/// Start of the kernel's writable data. Everything in
/// `[KERNEL_START_ADDR, KERNEL_DATA_START)` is kernel text and is mapped
/// read-only.
pub const KERNEL_DATA_START: u64 = 0x4_C000;

/// Physical location of the kernel's statically placed page-table node
/// pages (see [`KERNEL_PAGETABLE_COUNT`]). They sit at the top of the
/// kernel image, inside its data region.
pub const KERNEL_PAGETABLE_ADDR: u64 = 0x5_8000;

/// Number of statically placed kernel page-table node pages: one root, one
/// level-1 node, one level-2 node, and two leaf-level nodes (each leaf node
/// spans 2 MiB, and lookups must cover [`MEMSIZE_VIRTUAL`] = 3 MiB).
pub const KERNEL_PAGETABLE_COUNT: usize = 5;

/// One past the last byte of the kernel image.
pub const KERNEL_END_ADDR: u64 =
    KERNEL_PAGETABLE_ADDR + KERNEL_PAGETABLE_COUNT as u64 * PAGE_SIZE;

/// One past the top of the kernel stack; the stack occupies the single page
/// below this address.
pub const KERNEL_STACK_TOP: u64 = 0x8_0000;

/// Page within kernel text holding the interrupt-entry code. Every address
/// space must keep this identity-mapped or the next trap is unservable.
pub const INTERRUPT_ENTRY_ADDR: u64 = KERNEL_START_ADDR;

/// Page within kernel text holding the mapping-management code. Checked on
/// every address-space switch, like the interrupt entry.
pub const VMAP_CODE_ADDR: u64 = KERNEL_START_ADDR + PAGE_SIZE;

/// Start of the reserved I/O region (exclusive of process memory).
pub const IO_REGION_START: u64 = 0xA_0000;

/// Physical address of the console's character-cell grid.
pub const CONSOLE_ADDR: u64 = 0xB_8000;

/// First address available to process memory.
pub const PROC_START_ADDR: u64 = 0x10_0000;

/// Number of process-table slots. Slot 0 is permanently unused.
pub const NPROC: usize = 16;

/// Timer interrupt frequency (ticks per second).
pub const HZ: u64 = 100;

/// Console geometry: character cells per row.
pub const CONSOLE_COLUMNS: usize = 80;

/// Console geometry: rows.
pub const CONSOLE_ROWS: usize = 25;

/// Typed base of the kernel image.
#[must_use]
pub const fn kernel_start() -> PhysAddr {
    PhysAddr::new(KERNEL_START_ADDR)
}

/// Typed base of the kernel stack page.
#[must_use]
pub const fn kernel_stack_page() -> PhysAddr {
    PhysAddr::new(KERNEL_STACK_TOP - PAGE_SIZE)
}

/// Typed top of a process's virtual address space; the initial user stack
/// page sits immediately below.
#[must_use]
pub const fn virtual_top() -> VirtAddr {
    VirtAddr::new(MEMSIZE_VIRTUAL)
}

/// Whether a physical address lies in memory reserved for hardware: the
/// null page or the I/O region (which contains the console cells).
#[must_use]
pub const fn is_reserved(pa: u64) -> bool {
    pa < PAGE_SIZE || (pa >= IO_REGION_START && pa < PROC_START_ADDR)
}

/// Whether a physical address belongs to the kernel image or stack.
#[must_use]
pub const fn is_kernel(pa: u64) -> bool {
    (pa >= KERNEL_START_ADDR && pa < KERNEL_END_ADDR)
        || (pa >= KERNEL_STACK_TOP - PAGE_SIZE && pa < KERNEL_STACK_TOP)
}

const _: () = {
    assert!(MEMSIZE_PHYSICAL % PAGE_SIZE == 0);
    assert!(MEMSIZE_VIRTUAL % PAGE_SIZE == 0);
    assert!(MEMSIZE_VIRTUAL > MEMSIZE_PHYSICAL);
    assert!(KERNEL_START_ADDR % PAGE_SIZE == 0);
    assert!(KERNEL_DATA_START % PAGE_SIZE == 0);
    assert!(KERNEL_START_ADDR < KERNEL_DATA_START);
    assert!(KERNEL_DATA_START < KERNEL_PAGETABLE_ADDR);
    // The static page-table nodes live inside the kernel image data region.
    assert!(KERNEL_END_ADDR <= KERNEL_STACK_TOP - PAGE_SIZE);
    assert!(KERNEL_STACK_TOP <= IO_REGION_START);
    assert!(IO_REGION_START <= CONSOLE_ADDR && CONSOLE_ADDR < PROC_START_ADDR);
    assert!(PROC_START_ADDR < MEMSIZE_PHYSICAL);
    assert!(VMAP_CODE_ADDR < KERNEL_DATA_START);
    assert!(NPROC >= 2);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_classification() {
        assert!(is_reserved(0));
        assert!(is_reserved(CONSOLE_ADDR));
        assert!(is_reserved(IO_REGION_START));
        assert!(!is_reserved(PROC_START_ADDR));
        assert!(!is_reserved(KERNEL_START_ADDR));
        assert!(!is_reserved(KERNEL_STACK_TOP - PAGE_SIZE));
    }

    #[test]
    fn kernel_classification() {
        assert!(is_kernel(KERNEL_START_ADDR));
        assert!(is_kernel(KERNEL_PAGETABLE_ADDR));
        assert!(is_kernel(KERNEL_STACK_TOP - PAGE_SIZE));
        assert!(!is_kernel(KERNEL_END_ADDR));
        assert!(!is_kernel(0));
        assert!(!is_kernel(PROC_START_ADDR));
    }
}

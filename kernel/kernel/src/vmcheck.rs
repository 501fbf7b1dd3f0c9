//! The virtual-memory invariant checker.
//!
//! Advisory in the sense that the kernel calls it from the trap path for
//! debugging, but the invariants themselves are load-bearing: a kernel
//! that violates any of them is incorrect whether or not the checker runs.
//! Violations panic.

use kernel_alloc::{PageOwner, PhysicalMemory, Pid};
use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, VirtAddr};
use kernel_vmem::{AddressSpace, PagePerms};

use crate::kernel::Kernel;
use crate::process::ProcState;

/// Check every operating-system invariant about virtual memory.
pub(crate) fn check_virtual_memory(kernel: &Kernel) {
    // Process 0 must never be used.
    assert!(
        kernel.processes.get(Pid::IDLE).state() == ProcState::Free,
        "process slot 0 must stay free"
    );

    check_mappings(&kernel.mem, &kernel.kernel_space);
    check_ownership(kernel, &kernel.kernel_space, PageOwner::Kernel);

    for process in kernel.processes.iter() {
        if process.state() == ProcState::Free {
            continue;
        }
        let space = process
            .space()
            .expect("live process must own an address space");
        if space.root() != kernel.kernel_space.root() {
            check_mappings(&kernel.mem, &space);
            check_ownership(kernel, &space, PageOwner::Process(process.pid()));
        }
    }

    // Every page owned by a process must belong to a live one.
    for (pn, record) in kernel.mem.page_records() {
        if record.refcount > 0 {
            if let Some(pid) = record.owner.as_process() {
                assert!(
                    kernel.processes.get(pid).state() != ProcState::Free,
                    "page {pn:?} owned by dead pid {pid}"
                );
            }
        }
    }
}

/// Kernel memory must be identity-mapped in `space`, writable from the data
/// boundary up; the kernel stack page must be identity-mapped and writable.
fn check_mappings(mem: &PhysicalMemory, space: &AddressSpace) {
    let mut va = info::KERNEL_START_ADDR;
    while va < info::KERNEL_END_ADDR {
        let mapping = space.lookup(mem, VirtAddr::new(va));
        assert!(
            mapping.phys_addr().is_some_and(|pa| pa.as_u64() == va),
            "kernel memory not identity-mapped at {va:#x}"
        );
        if va >= info::KERNEL_DATA_START {
            assert!(
                mapping.perms().contains(PagePerms::WRITABLE),
                "kernel data not writable at {va:#x}"
            );
        }
        va += PAGE_SIZE;
    }

    let kstack = info::KERNEL_STACK_TOP - PAGE_SIZE;
    let mapping = space.lookup(mem, VirtAddr::new(kstack));
    assert!(
        mapping.phys_addr().is_some_and(|pa| pa.as_u64() == kstack),
        "kernel stack not identity-mapped"
    );
    assert!(
        mapping.perms().contains(PagePerms::WRITABLE),
        "kernel stack not writable"
    );
}

/// Every node page of `space` must be owned by `owner` with refcount 1,
/// except the kernel root, whose refcount is 1 plus the number of live
/// processes that run on the kernel's own space instead of a private one.
fn check_ownership(kernel: &Kernel, space: &AddressSpace, owner: PageOwner) {
    let root_refcount = if space.root() == kernel.kernel_space.root() {
        let sharers = kernel
            .processes
            .iter()
            .filter(|p| {
                p.state() != ProcState::Free
                    && p.space()
                        .is_some_and(|s| s.root() == kernel.kernel_space.root())
            })
            .count();
        1 + sharers as u16
    } else {
        1
    };

    space.walk_table_pages(&kernel.mem, &mut |pn, level| {
        let record = kernel.mem.record(pn);
        assert!(
            record.owner == owner,
            "node {pn:?} of {owner:?} space owned by {:?}",
            record.owner
        );
        let expected = if level == 0 { root_refcount } else { 1 };
        assert!(
            record.refcount == expected,
            "node {pn:?} at level {level} has refcount {} (expected {expected})",
            record.refcount
        );
    });
}

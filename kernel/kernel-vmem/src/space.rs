//! Address spaces: building, walking, and tearing down page-table trees.

use kernel_alloc::{PageOwner, PhysicalMemory};
use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, PageNumber, PhysAddr, TABLE_LEVELS, TableIndex, VirtAddr};
use log::{debug, trace};
use thiserror::Error;

use crate::entry::{PageEntryBits, PagePerms};
use crate::table::PageTableNode;

/// Interior nodes are linked with full permissions; the leaf entry alone
/// decides the effective capability of a mapping (intersection with these
/// bits is the identity).
const INTERIOR_PERMS: PagePerms = PagePerms::USER_RW;

/// Mapping failed because a page-table node was needed and none could be
/// allocated. The caller treats this as out-of-memory; entries already
/// written by the same call remain valid.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum MapError {
    #[error("no physical page available for a page-table node")]
    OutOfMemory,
}

/// Why an address space must not be activated. Any of these would make the
/// next trap unservable, so a violation is fatal at the activation site.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum ActivateError {
    #[error("interrupt entry code at {0:#x} is not identity-mapped")]
    TrapEntryUnmapped(u64),
    #[error("mapping-management code at {0:#x} is not identity-mapped")]
    VmapCodeUnmapped(u64),
    #[error("kernel space does not map this space's root node at {0:#x}")]
    RootNotVisible(u64),
    #[error("this space does not map the kernel's root node at {0:#x}")]
    KernelRootUnmapped(u64),
}

/// The result of a lookup: destination page, in-page offset, and the
/// intersected permissions. A value, never an alias into the tree.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Mapping {
    page: Option<PageNumber>,
    offset: u64,
    perms: PagePerms,
}

impl Mapping {
    const NOT_MAPPED: Self = Self {
        page: None,
        offset: 0,
        perms: PagePerms::empty(),
    };

    #[inline]
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.page.is_some()
    }

    /// Destination physical page, if mapped.
    #[inline]
    #[must_use]
    pub const fn page(&self) -> Option<PageNumber> {
        self.page
    }

    /// Destination physical address (page base plus the looked-up address's
    /// in-page offset), if mapped.
    #[inline]
    #[must_use]
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.page.map(|pn| pn.base() + self.offset)
    }

    /// Effective permissions: the intersection over all levels of the walk.
    #[inline]
    #[must_use]
    pub const fn perms(&self) -> PagePerms {
        self.perms
    }
}

/// One virtual address space: a four-level page-table tree rooted at a
/// single node page, plus the owner its node pages are accounted to.
#[derive(Copy, Clone, Debug)]
pub struct AddressSpace {
    root: PageNumber,
    owner: PageOwner,
}

impl AddressSpace {
    /// Allocate a fresh, empty space for `owner` (the root node comes from
    /// the free list and starts zeroed).
    pub fn new(mem: &mut PhysicalMemory, owner: PageOwner) -> Result<Self, MapError> {
        let root = mem.alloc(owner).ok_or(MapError::OutOfMemory)?;
        Ok(Self { root, owner })
    }

    /// Build the kernel's address space over the statically placed node
    /// pages inside the kernel image: pre-link the root→leaf chain, then
    /// identity-map physical memory with the text/data writability split
    /// and the user-accessible console page.
    ///
    /// # Panics
    /// Panics if the static node pages are not marked `Kernel`, which would
    /// mean the allocator's boot classification is wrong.
    #[must_use]
    pub fn kernel_space(mem: &mut PhysicalMemory) -> Self {
        let base = PhysAddr::new(info::KERNEL_PAGETABLE_ADDR).page_number();
        let node = |i: u64| PageNumber::new(base.as_u64() + i);
        for i in 0..info::KERNEL_PAGETABLE_COUNT as u64 {
            assert_eq!(
                mem.record(node(i)).owner,
                PageOwner::Kernel,
                "static kernel page-table nodes must lie inside the kernel image"
            );
        }

        // Pre-allocated chain: root → level 1 → level 2 → two leaf nodes
        // (each leaf node spans 2 MiB of virtual addresses).
        let root = PageTableNode::new(node(0));
        let l1 = PageTableNode::new(node(1));
        let l2 = PageTableNode::new(node(2));
        root.set(
            mem,
            TableIndex::new(0),
            PageEntryBits::make(l1.page(), INTERIOR_PERMS),
        );
        l1.set(
            mem,
            TableIndex::new(0),
            PageEntryBits::make(l2.page(), INTERIOR_PERMS),
        );
        l2.set(
            mem,
            TableIndex::new(0),
            PageEntryBits::make(node(3), INTERIOR_PERMS),
        );
        l2.set(
            mem,
            TableIndex::new(1),
            PageEntryBits::make(node(4), INTERIOR_PERMS),
        );

        let space = Self {
            root: root.page(),
            owner: PageOwner::Kernel,
        };

        // Identity map all of physical memory, then tighten: kernel text is
        // read-only, and only the console page is user-accessible.
        // The chain above already covers every address, so none of these
        // can need a new node.
        space
            .map(
                mem,
                VirtAddr::new(0),
                PhysAddr::new(0),
                info::MEMSIZE_PHYSICAL,
                PagePerms::KERNEL_RW,
            )
            .expect("kernel identity map uses only pre-allocated nodes");
        space
            .map(
                mem,
                VirtAddr::new(info::KERNEL_START_ADDR),
                PhysAddr::new(info::KERNEL_START_ADDR),
                info::KERNEL_DATA_START - info::KERNEL_START_ADDR,
                PagePerms::KERNEL_RO,
            )
            .expect("kernel text remap uses only pre-allocated nodes");
        space
            .map(
                mem,
                VirtAddr::new(info::CONSOLE_ADDR),
                PhysAddr::new(info::CONSOLE_ADDR),
                PAGE_SIZE,
                PagePerms::USER_RW,
            )
            .expect("console remap uses only pre-allocated nodes");

        debug!("kernel space built at root {:?}", space.root);
        space
    }

    /// The space's root node page.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PageNumber {
        self.root
    }

    /// The owner charged for this space's node pages.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> PageOwner {
        self.owner
    }

    #[inline]
    const fn root_node(&self) -> PageTableNode {
        PageTableNode::new(self.root)
    }

    /// Map every page of `[va, va + size)` to the corresponding page of
    /// `[pa, pa + size)` with `perms`.
    ///
    /// If `perms` lacks `PRESENT`, `pa` is ignored and the affected leaf
    /// entries are written as not-present guard markers (where a leaf node
    /// already exists; guard ranges never synthesize nodes).
    ///
    /// Interior nodes are created lazily, owned by this space's owner. If
    /// one is needed and cannot be allocated the call returns
    /// [`MapError::OutOfMemory`]; entries written before the failure remain.
    ///
    /// # Panics
    /// Misaligned or wrapping ranges, and present mappings beyond physical
    /// memory, are caller misuse and panic: the memory model has no safe
    /// continuation for them.
    pub fn map(
        &self,
        mem: &mut PhysicalMemory,
        va: VirtAddr,
        pa: PhysAddr,
        size: u64,
        perms: PagePerms,
    ) -> Result<(), MapError> {
        assert!(va.is_page_aligned(), "virtual address must be page-aligned");
        assert!(size % PAGE_SIZE == 0, "size must be a multiple of a page");
        assert!(va.checked_add(size).is_some(), "virtual range must not wrap");
        let present = perms.contains(PagePerms::PRESENT);
        if present {
            assert!(pa.is_page_aligned(), "physical address must be page-aligned");
            assert!(
                pa.checked_add(size).is_some_and(|end| end.as_u64() <= info::MEMSIZE_PHYSICAL),
                "physical range must exist"
            );
        }

        let mut va = va;
        let mut pa = pa;
        let mut remaining = size;
        while remaining != 0 {
            match self.leaf_node(mem, va, present)? {
                Some(leaf) => {
                    let entry = if present {
                        PageEntryBits::make(pa.page_number(), perms)
                    } else {
                        PageEntryBits::make_guard(perms)
                    };
                    leaf.set(mem, va.table_index(TABLE_LEVELS - 1), entry);
                }
                // Guard range over a hole in the tree: nothing to record.
                None => debug_assert!(!present),
            }
            va += PAGE_SIZE;
            pa += PAGE_SIZE;
            remaining -= PAGE_SIZE;
        }
        trace!(
            "map {:#x}..{:#x} -> {:#x} {perms:?} in root {:?}",
            va.as_u64() - size,
            va.as_u64(),
            pa.as_u64().wrapping_sub(size),
            self.root
        );
        Ok(())
    }

    /// Walk (and for present mappings, synthesize) the interior chain for
    /// `va`, returning the leaf-level node, or `None` when the chain has a
    /// hole and `create` is false.
    fn leaf_node(
        &self,
        mem: &mut PhysicalMemory,
        va: VirtAddr,
        create: bool,
    ) -> Result<Option<PageTableNode>, MapError> {
        let mut node = self.root_node();
        for level in 0..TABLE_LEVELS - 1 {
            let index = va.table_index(level);
            let entry = node.get(mem, index);
            if entry.present() {
                // Sanity: interior entries reference real pages and never
                // weaken below what any mapping may need.
                assert!((entry.page().as_u64() as usize) < info::NPAGES);
                assert!(entry.perms().contains(INTERIOR_PERMS & !PagePerms::PRESENT));
                node = PageTableNode::new(entry.page());
            } else {
                if !create {
                    return Ok(None);
                }
                let page = mem.alloc(self.owner).ok_or(MapError::OutOfMemory)?;
                node.set(mem, index, PageEntryBits::make(page, INTERIOR_PERMS));
                node = PageTableNode::new(page);
            }
        }
        Ok(Some(node))
    }

    /// Translate `va` by walking all four levels from the root.
    ///
    /// At each level the effective permissions are intersected with the
    /// entry's bits (weakest-link semantics). A hole at any level yields a
    /// not-mapped result.
    #[must_use]
    pub fn lookup(&self, mem: &PhysicalMemory, va: VirtAddr) -> Mapping {
        let mut node = self.root_node();
        let mut perms = PagePerms::USER_RW;
        for level in 0..TABLE_LEVELS {
            let entry = node.get(mem, va.table_index(level));
            if !entry.present() {
                return Mapping::NOT_MAPPED;
            }
            perms &= entry.perms();
            if level == TABLE_LEVELS - 1 {
                return Mapping {
                    page: Some(entry.page()),
                    offset: va.page_offset(),
                    perms,
                };
            }
            node = PageTableNode::new(entry.page());
        }
        unreachable!()
    }

    /// Copy every kernel-range mapping (`[0, PROC_START_ADDR)`) from
    /// `from` into this space, permissions included. Process spaces start
    /// with this clone so kernel code and the trap path stay mapped,
    /// supervisor-only except the console page.
    pub fn clone_kernel_range(
        &self,
        mem: &mut PhysicalMemory,
        from: &Self,
    ) -> Result<(), MapError> {
        let mut va = VirtAddr::new(0);
        while va.as_u64() < info::PROC_START_ADDR {
            let mapping = from.lookup(mem, va);
            if let Some(pa) = mapping.phys_addr() {
                self.map(mem, va, pa, PAGE_SIZE, mapping.perms())?;
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Re-validate that activating this space cannot strand the kernel:
    /// the interrupt entry and mapping-management code must be
    /// identity-mapped here, the kernel space must map this root, and this
    /// space must map the kernel root.
    pub fn check_activate(
        &self,
        mem: &PhysicalMemory,
        kernel_space: &Self,
    ) -> Result<(), ActivateError> {
        let identity = |space: &Self, addr: u64| {
            space
                .lookup(mem, VirtAddr::new(addr))
                .phys_addr()
                .is_some_and(|pa| pa.as_u64() == addr)
        };

        if !identity(self, info::INTERRUPT_ENTRY_ADDR) {
            return Err(ActivateError::TrapEntryUnmapped(info::INTERRUPT_ENTRY_ADDR));
        }
        if !identity(self, info::VMAP_CODE_ADDR) {
            return Err(ActivateError::VmapCodeUnmapped(info::VMAP_CODE_ADDR));
        }
        let own_root = self.root.base().as_u64();
        if !identity(kernel_space, own_root) {
            return Err(ActivateError::RootNotVisible(own_root));
        }
        let kernel_root = kernel_space.root.base().as_u64();
        if !identity(self, kernel_root) {
            return Err(ActivateError::KernelRootUnmapped(kernel_root));
        }
        Ok(())
    }

    /// Release every data page mapped in the user range
    /// `[PROC_START_ADDR, MEMSIZE_VIRTUAL)`, clearing the leaf entries.
    /// Kernel-range mappings reference kernel- or hardware-owned pages and
    /// are left alone; the node pages themselves go separately via
    /// [`release_table_pages`](Self::release_table_pages).
    pub fn release_user_mappings(&self, mem: &mut PhysicalMemory) {
        let mut va = VirtAddr::new(info::PROC_START_ADDR);
        while va.as_u64() < info::MEMSIZE_VIRTUAL {
            if let Some(page) = self.lookup(mem, va).page() {
                // The chain exists, so the leaf node is reachable.
                if let Ok(Some(leaf)) = self.leaf_node(mem, va, false) {
                    leaf.set(mem, va.table_index(TABLE_LEVELS - 1), PageEntryBits::new());
                }
                mem.release(page);
            }
            va += PAGE_SIZE;
        }
    }

    /// Release the tree's node pages bottom-up, consuming the space. Data
    /// pages must already have been released.
    pub fn release_table_pages(self, mem: &mut PhysicalMemory) {
        fn walk(mem: &mut PhysicalMemory, node: PageTableNode, level: usize) {
            if level < TABLE_LEVELS - 1 {
                let mut children = [None; kernel_memory_addresses::TABLE_ENTRIES];
                for (slot, (_, entry)) in children.iter_mut().zip(node.present_entries(mem)) {
                    *slot = Some(PageTableNode::new(entry.page()));
                }
                for child in children.into_iter().flatten() {
                    walk(mem, child, level + 1);
                }
            }
            mem.release(node.page());
        }
        walk(mem, self.root_node(), 0);
    }

    /// Visit every node page of this tree (root first), with its level.
    /// Used by the virtual-memory invariant checker.
    pub fn walk_table_pages(
        &self,
        mem: &PhysicalMemory,
        f: &mut impl FnMut(PageNumber, usize),
    ) {
        fn walk(
            mem: &PhysicalMemory,
            node: PageTableNode,
            level: usize,
            f: &mut impl FnMut(PageNumber, usize),
        ) {
            f(node.page(), level);
            if level < TABLE_LEVELS - 1 {
                for (_, entry) in node.present_entries(mem) {
                    walk(mem, PageTableNode::new(entry.page()), level + 1, f);
                }
            }
        }
        walk(mem, self.root_node(), 0, f);
    }
}

//! A page-table node: one physical page viewed as 512 entries.

use kernel_alloc::PhysicalMemory;
use kernel_memory_addresses::{PageNumber, TABLE_ENTRIES, TableIndex};

use crate::entry::PageEntryBits;

/// Handle to one page-table node. The node's 512 entries live in the page
/// arena at the node's physical page; this type only carries the page
/// number and goes through [`PhysicalMemory`] for every access.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PageTableNode(PageNumber);

impl PageTableNode {
    #[inline]
    #[must_use]
    pub const fn new(page: PageNumber) -> Self {
        Self(page)
    }

    /// The physical page holding this node.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PageNumber {
        self.0
    }

    /// Read the entry at `index`.
    #[inline]
    #[must_use]
    pub fn get(self, mem: &PhysicalMemory, index: TableIndex) -> PageEntryBits {
        mem.read_u64(self.0.base() + index.as_usize() as u64 * 8).into()
    }

    /// Write the entry at `index`.
    #[inline]
    pub fn set(self, mem: &mut PhysicalMemory, index: TableIndex, entry: PageEntryBits) {
        mem.write_u64(self.0.base() + index.as_usize() as u64 * 8, entry.into());
    }

    /// Iterate the indices of all present entries.
    pub fn present_entries(
        self,
        mem: &PhysicalMemory,
    ) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        (0..TABLE_ENTRIES).filter_map(move |i| {
            let index = TableIndex::new(i);
            let entry = self.get(mem, index);
            entry.present().then_some((index, entry))
        })
    }
}

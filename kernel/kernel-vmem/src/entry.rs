//! Page-table entry encoding and the typed permission set.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PageNumber;

/// One 64-bit page-table entry in its raw bitfield form.
///
/// The same layout is used at every level of the tree: an entry references
/// the next-level node (levels 0–2) or the destination data page (level 3),
/// by page number, together with its permission bits.
///
/// | Bits  | Name      | Meaning |
/// |-------|-----------|---------|
/// | 0     | `P`       | Entry is valid if set |
/// | 1     | `RW`      | Writable if set |
/// | 2     | `US`      | User-mode accessible if set |
/// | 3     | `PWT`     | Write-through caching |
/// | 4     | `PCD`     | Disable caching |
/// | 5     | `A`       | Accessed |
/// | 6     | `D`       | Dirty (leaf only) |
/// | 7–11  | -         | Unused here (PS/G/OS-available) |
/// | 12–51 | `page`    | Referenced page number |
/// | 52–63 | -         | Unused here |
///
/// A not-present entry may still carry permission bits; the dispatcher uses
/// such entries to mark guard ranges that are reserved but unmapped. Its
/// page field is ignored and kept zero.
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0). Clear means the walk ends here.
    pub present: bool,

    /// Writable (RW, bit 1). Clear makes the subtree read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Clear restricts the subtree to kernel
    /// mode.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3). Unused by this machine.
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Unused by this machine.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    pub accessed: bool,

    /// Dirty (D, bit 6); meaningful for leaf entries only.
    pub dirty: bool,

    /// Page-size / global / OS-available bits; always zero here.
    #[bits(5)]
    __zero0: u8,

    /// Referenced page number (bits 12..=51).
    #[bits(40)]
    page_number_bits: u64,

    /// High OS-available / reserved bits; always zero here.
    #[bits(12)]
    __zero1: u16,
}

impl PageEntryBits {
    /// The page this entry references.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PageNumber {
        PageNumber::new(self.page_number_bits())
    }

    /// The typed capability set carried by this entry.
    #[inline]
    #[must_use]
    pub const fn perms(self) -> PagePerms {
        let mut perms = PagePerms::empty();
        if self.present() {
            perms = perms.union(PagePerms::PRESENT);
        }
        if self.writable() {
            perms = perms.union(PagePerms::WRITABLE);
        }
        if self.user_access() {
            perms = perms.union(PagePerms::USER);
        }
        perms
    }

    /// A present entry referencing `page` with `perms` (which must contain
    /// `PRESENT`).
    #[inline]
    #[must_use]
    pub const fn make(page: PageNumber, perms: PagePerms) -> Self {
        debug_assert!(perms.contains(PagePerms::PRESENT));
        Self::new()
            .with_present(true)
            .with_writable(perms.contains(PagePerms::WRITABLE))
            .with_user_access(perms.contains(PagePerms::USER))
            .with_page_number_bits(page.as_u64())
    }

    /// A not-present marker entry: records `perms` (minus `PRESENT`) with a
    /// zero page field, for guard/reserved-but-unmapped ranges.
    #[inline]
    #[must_use]
    pub const fn make_guard(perms: PagePerms) -> Self {
        Self::new()
            .with_writable(perms.contains(PagePerms::WRITABLE))
            .with_user_access(perms.contains(PagePerms::USER))
    }
}

bitflags::bitflags! {
    /// The capability set of a mapping: present, writable, user-accessible.
    ///
    /// Lookup composes these across the four levels of a walk by set
    /// intersection, making the weakest-link rule explicit: intersect with
    /// the permissions of every entry seen so far.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct PagePerms: u8 {
        /// The mapping resolves at all.
        const PRESENT = 1 << 0;
        /// The mapping may be written.
        const WRITABLE = 1 << 1;
        /// User-mode code may use the mapping.
        const USER = 1 << 2;

        /// Kernel-only, read-only.
        const KERNEL_RO = Self::PRESENT.bits();
        /// Kernel-only, read-write.
        const KERNEL_RW = Self::PRESENT.bits() | Self::WRITABLE.bits();
        /// User-accessible, read-only.
        const USER_RO = Self::PRESENT.bits() | Self::USER.bits();
        /// User-accessible, read-write.
        const USER_RW =
            Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits();
    }
}

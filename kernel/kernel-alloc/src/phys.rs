//! The page-record table and the arena it governs.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, PageNumber, PhysAddr};
use log::{debug, trace};
use thiserror::Error;

/// A process identifier. Pid 0 is permanently reserved as a sentinel and
/// never owns memory or runs.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u8);

impl Pid {
    /// # Panics
    /// Panics if `pid` is outside the process table.
    #[inline]
    #[must_use]
    pub const fn new(pid: usize) -> Self {
        assert!(pid < info::NPROC);
        Self(pid as u8)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// The reserved sentinel slot.
    pub const IDLE: Self = Self(0);
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Who owns a physical page.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum PageOwner {
    /// Nobody; the page may be handed out by [`PhysicalMemory::alloc`].
    #[default]
    Free,
    /// Hardware-reserved memory (null page, I/O region, console cells).
    Reserved,
    /// Kernel image, kernel stack, or kernel page-table nodes.
    Kernel,
    /// Owned by the process with this pid.
    Process(Pid),
}

impl PageOwner {
    #[inline]
    #[must_use]
    pub const fn as_process(self) -> Option<Pid> {
        match self {
            Self::Process(pid) => Some(pid),
            _ => None,
        }
    }
}

/// Per-page ownership record.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct PageInfo {
    /// Number of live references to this page across all address spaces.
    /// Zero means free.
    pub refcount: u16,
    /// The page's owner; `Free` exactly when `refcount == 0`.
    pub owner: PageOwner,
}

impl PageInfo {
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.refcount == 0
    }
}

/// Why [`PhysicalMemory::reserve`] refused a page.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum ReserveError {
    #[error("physical address {0:#x} is not page-aligned")]
    Misaligned(u64),
    #[error("physical address {0:#x} is beyond physical memory")]
    OutOfRange(u64),
    #[error("physical page {0:#x} is already owned")]
    AlreadyOwned(u64),
}

/// The machine's physical memory: the byte arena plus one [`PageInfo`]
/// record per page.
pub struct PhysicalMemory {
    arena: Vec<u8>,
    records: Vec<PageInfo>,
}

impl PhysicalMemory {
    /// Build physical memory and classify every page, seeding the record
    /// table: hardware regions become `Reserved`, the kernel image/stack
    /// becomes `Kernel` (refcount 1 each), everything else starts `Free`.
    #[must_use]
    pub fn new() -> Self {
        let mut records = vec![PageInfo::default(); info::NPAGES];
        for (pn, record) in records.iter_mut().enumerate() {
            let pa = pn as u64 * PAGE_SIZE;
            let owner = if info::is_reserved(pa) {
                PageOwner::Reserved
            } else if info::is_kernel(pa) {
                PageOwner::Kernel
            } else {
                PageOwner::Free
            };
            *record = PageInfo {
                refcount: u16::from(!matches!(owner, PageOwner::Free)),
                owner,
            };
        }
        debug!(
            "physical memory: {} pages ({} free)",
            info::NPAGES,
            records.iter().filter(|r| r.is_free()).count()
        );
        Self {
            arena: vec![0; info::NPAGES * PAGE_SIZE as usize],
            records,
        }
    }

    /// The record for page `pn`.
    ///
    /// # Panics
    /// Panics if `pn` is beyond physical memory.
    #[inline]
    #[must_use]
    pub fn record(&self, pn: PageNumber) -> PageInfo {
        self.records[pn.as_usize()]
    }

    /// Claim the free page at `pa` for `owner`.
    ///
    /// This is the sole admission check guarding against double allocation:
    /// it fails on a misaligned or out-of-range address and on a page whose
    /// refcount is nonzero, and failure has no side effects.
    ///
    /// # Panics
    /// Panics if `owner` is `Free` (claiming a page for nobody is a bug in
    /// the caller, not an input error).
    pub fn reserve(&mut self, pa: PhysAddr, owner: PageOwner) -> Result<PageNumber, ReserveError> {
        assert!(
            !matches!(owner, PageOwner::Free),
            "reserve requires a real owner"
        );
        if !pa.is_page_aligned() {
            return Err(ReserveError::Misaligned(pa.as_u64()));
        }
        if pa.as_u64() >= info::MEMSIZE_PHYSICAL {
            return Err(ReserveError::OutOfRange(pa.as_u64()));
        }
        let pn = pa.page_number();
        let record = &mut self.records[pn.as_usize()];
        if record.refcount != 0 {
            return Err(ReserveError::AlreadyOwned(pa.as_u64()));
        }
        record.refcount = 1;
        record.owner = owner;
        trace!("reserve {pn:?} for {owner:?}");
        Ok(pn)
    }

    /// Add a reference to an owned page (sharing).
    ///
    /// # Panics
    /// Panics if the page is free: a reference to a free page cannot exist,
    /// so one being retained means the refcounts have already drifted.
    pub fn retain(&mut self, pn: PageNumber) {
        let record = &mut self.records[pn.as_usize()];
        assert!(record.refcount > 0, "retain of free page {pn:?}");
        record.refcount += 1;
    }

    /// Drop a reference; releasing the last one frees the page and zeroes
    /// its contents so reuse never leaks prior data.
    ///
    /// # Panics
    /// Panics if the page is already free (double release).
    pub fn release(&mut self, pn: PageNumber) {
        let record = &mut self.records[pn.as_usize()];
        assert!(record.refcount > 0, "release of free page {pn:?}");
        record.refcount -= 1;
        if record.refcount == 0 {
            record.owner = PageOwner::Free;
            self.page_mut(pn).fill(0);
            trace!("release {pn:?}: now free");
        }
    }

    /// Reassign an owned page to a new owner. Used when a process exits
    /// while other processes still reference pages it owned: ownership
    /// passes to a surviving referencer so no page is ever owned by a dead
    /// process.
    ///
    /// # Panics
    /// Panics on a free page or a `Free` new owner.
    pub fn chown(&mut self, pn: PageNumber, owner: PageOwner) {
        assert!(!matches!(owner, PageOwner::Free), "chown requires a real owner");
        let record = &mut self.records[pn.as_usize()];
        assert!(record.refcount > 0, "chown of free page {pn:?}");
        record.owner = owner;
    }

    /// Find any free page and reserve it for `owner`. `None` means physical
    /// memory is exhausted; callers surface that as an error result, never
    /// as a crash.
    pub fn alloc(&mut self, owner: PageOwner) -> Option<PageNumber> {
        let pn = self
            .records
            .iter()
            .position(PageInfo::is_free)
            .map(|pn| PageNumber::new(pn as u64))?;
        // The scan found it free, so this cannot fail.
        self.reserve(pn.base(), owner).ok()
    }

    /// Borrow the bytes of one page.
    #[inline]
    #[must_use]
    pub fn page(&self, pn: PageNumber) -> &[u8] {
        let start = pn.as_usize() * PAGE_SIZE as usize;
        &self.arena[start..start + PAGE_SIZE as usize]
    }

    /// Mutably borrow the bytes of one page.
    #[inline]
    #[must_use]
    pub fn page_mut(&mut self, pn: PageNumber) -> &mut [u8] {
        let start = pn.as_usize() * PAGE_SIZE as usize;
        &mut self.arena[start..start + PAGE_SIZE as usize]
    }

    /// Read a little-endian `u64` at a physical address (page-table entry
    /// access).
    #[inline]
    #[must_use]
    pub fn read_u64(&self, pa: PhysAddr) -> u64 {
        let at = pa.as_u64() as usize;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.arena[at..at + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Write a little-endian `u64` at a physical address.
    #[inline]
    pub fn write_u64(&mut self, pa: PhysAddr, value: u64) {
        let at = pa.as_u64() as usize;
        self.arena[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Copy the full contents of page `src` over page `dst`.
    pub fn copy_page(&mut self, src: PageNumber, dst: PageNumber) {
        let from = src.as_usize() * PAGE_SIZE as usize;
        let to = dst.as_usize() * PAGE_SIZE as usize;
        self.arena
            .copy_within(from..from + PAGE_SIZE as usize, to);
    }

    /// Read bytes starting at a physical address. The range must stay
    /// within physical memory.
    pub fn read_bytes(&self, pa: PhysAddr, buf: &mut [u8]) {
        let at = pa.as_u64() as usize;
        buf.copy_from_slice(&self.arena[at..at + buf.len()]);
    }

    /// Write bytes starting at a physical address.
    pub fn write_bytes(&mut self, pa: PhysAddr, bytes: &[u8]) {
        let at = pa.as_u64() as usize;
        self.arena[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// All page records, in page-number order.
    pub fn page_records(&self) -> impl Iterator<Item = (PageNumber, PageInfo)> + '_ {
        self.records
            .iter()
            .enumerate()
            .map(|(pn, record)| (PageNumber::new(pn as u64), *record))
    }

    /// Number of pages currently owned by `owner`.
    #[must_use]
    pub fn owned_page_count(&self, owner: PageOwner) -> usize {
        self.records.iter().filter(|r| r.owner == owner).count()
    }

    /// Number of free pages remaining.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_free()).count()
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_seeds_records() {
        let mem = PhysicalMemory::new();
        assert_eq!(
            mem.record(PhysAddr::new(0).page_number()).owner,
            PageOwner::Reserved
        );
        assert_eq!(
            mem.record(PhysAddr::new(info::CONSOLE_ADDR).page_number()).owner,
            PageOwner::Reserved
        );
        assert_eq!(
            mem.record(PhysAddr::new(info::KERNEL_START_ADDR).page_number()).owner,
            PageOwner::Kernel
        );
        assert_eq!(
            mem.record(PhysAddr::new(info::KERNEL_STACK_TOP - PAGE_SIZE).page_number()).owner,
            PageOwner::Kernel
        );
        assert_eq!(
            mem.record(PhysAddr::new(info::PROC_START_ADDR).page_number()).owner,
            PageOwner::Free
        );
        // Every non-free record carries refcount 1, every free one 0.
        for (_, record) in mem.page_records() {
            if record.owner == PageOwner::Free {
                assert_eq!(record.refcount, 0);
            } else {
                assert_eq!(record.refcount, 1);
            }
        }
    }

    #[test]
    fn reserve_admission_checks() {
        let mut mem = PhysicalMemory::new();
        let owner = PageOwner::Process(Pid::new(1));

        assert_eq!(
            mem.reserve(PhysAddr::new(info::PROC_START_ADDR + 0x10), owner),
            Err(ReserveError::Misaligned(info::PROC_START_ADDR + 0x10))
        );
        assert_eq!(
            mem.reserve(PhysAddr::new(info::MEMSIZE_PHYSICAL), owner),
            Err(ReserveError::OutOfRange(info::MEMSIZE_PHYSICAL))
        );
        assert_eq!(
            mem.reserve(PhysAddr::new(info::KERNEL_START_ADDR), owner),
            Err(ReserveError::AlreadyOwned(info::KERNEL_START_ADDR))
        );

        let pn = mem
            .reserve(PhysAddr::new(info::PROC_START_ADDR), owner)
            .unwrap();
        assert_eq!(mem.record(pn).refcount, 1);
        assert_eq!(mem.record(pn).owner, owner);
        // Double reservation of the same page must fail.
        assert_eq!(
            mem.reserve(PhysAddr::new(info::PROC_START_ADDR), owner),
            Err(ReserveError::AlreadyOwned(info::PROC_START_ADDR))
        );
    }

    #[test]
    fn retain_release_roundtrip_frees_and_zeroes() {
        let mut mem = PhysicalMemory::new();
        let pn = mem.alloc(PageOwner::Process(Pid::new(2))).unwrap();
        mem.page_mut(pn).fill(0xAB);

        mem.retain(pn);
        assert_eq!(mem.record(pn).refcount, 2);
        mem.release(pn);
        assert_eq!(mem.record(pn).refcount, 1);
        assert_eq!(mem.record(pn).owner, PageOwner::Process(Pid::new(2)));

        mem.release(pn);
        assert!(mem.record(pn).is_free());
        assert!(mem.page(pn).iter().all(|&b| b == 0));
    }

    #[test]
    #[should_panic(expected = "release of free page")]
    fn release_of_free_page_is_fatal() {
        let mut mem = PhysicalMemory::new();
        mem.release(PhysAddr::new(info::PROC_START_ADDR).page_number());
    }

    #[test]
    #[should_panic(expected = "retain of free page")]
    fn retain_of_free_page_is_fatal() {
        let mut mem = PhysicalMemory::new();
        mem.retain(PhysAddr::new(info::PROC_START_ADDR).page_number());
    }

    #[test]
    fn alloc_until_exhaustion() {
        let mut mem = PhysicalMemory::new();
        let free = mem.free_page_count();
        let owner = PageOwner::Process(Pid::new(3));
        for _ in 0..free {
            assert!(mem.alloc(owner).is_some());
        }
        assert_eq!(mem.free_page_count(), 0);
        assert!(mem.alloc(owner).is_none());
        assert_eq!(mem.owned_page_count(owner), free);
    }

    #[test]
    fn u64_and_page_copies() {
        let mut mem = PhysicalMemory::new();
        let a = mem.alloc(PageOwner::Kernel).unwrap();
        let b = mem.alloc(PageOwner::Kernel).unwrap();

        mem.write_u64(a.base(), 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(mem.read_u64(a.base()), 0xDEAD_BEEF_0BAD_F00D);

        mem.copy_page(a, b);
        assert_eq!(mem.read_u64(b.base()), 0xDEAD_BEEF_0BAD_F00D);
    }
}

//! Process descriptors and their lifecycle: create, fork, free, page-alloc.

use kernel_alloc::{PageOwner, PhysicalMemory, Pid};
use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, VirtAddr};
use kernel_syscall::TrapFrame;
use kernel_vmem::{AddressSpace, MapError, PagePerms};
use log::{debug, warn};
use thiserror::Error;

use crate::kernel::Kernel;
use crate::loader::{self, Program};

/// Lifecycle state of a process slot.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum ProcState {
    /// Slot unused; the only state slot 0 may ever hold.
    #[default]
    Free,
    /// Eligible for the scheduler.
    Runnable,
    /// Alive but not schedulable. No operation in the current syscall set
    /// produces this state; the scheduler skips it.
    Blocked,
}

/// One process-table slot.
#[derive(Copy, Clone, Debug)]
pub struct Process {
    pub(crate) pid: Pid,
    pub(crate) state: ProcState,
    /// The process's private address space; `None` while the slot is free.
    pub(crate) space: Option<AddressSpace>,
    /// Saved register snapshot, valid while the process is not executing.
    pub(crate) regs: TrapFrame,
    /// Whether the memory visualizer may show this process's space.
    pub(crate) display: bool,
}

impl Process {
    fn vacant(pid: Pid) -> Self {
        Self {
            pid,
            state: ProcState::Free,
            space: None,
            regs: TrapFrame::default(),
            display: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn state(&self) -> ProcState {
        self.state
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> Option<AddressSpace> {
        self.space
    }

    #[inline]
    #[must_use]
    pub const fn registers(&self) -> &TrapFrame {
        &self.regs
    }

    /// Whether the visualizer may show this process.
    #[inline]
    #[must_use]
    pub const fn display(&self) -> bool {
        self.display
    }
}

/// Fixed table of process slots. Slot 0 is structurally unusable: nothing
/// ever marks it non-free.
pub(crate) struct ProcessTable {
    slots: [Process; info::NPROC],
}

impl ProcessTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|pid| Process::vacant(Pid::new(pid))),
        }
    }

    #[inline]
    pub(crate) fn get(&self, pid: Pid) -> &Process {
        &self.slots[pid.as_usize()]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, pid: Pid) -> &mut Process {
        &mut self.slots[pid.as_usize()]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter()
    }

    /// Lowest free slot usable for a new process (never slot 0).
    pub(crate) fn free_slot(&self) -> Option<Pid> {
        self.slots[1..]
            .iter()
            .find(|p| p.state == ProcState::Free)
            .map(|p| p.pid)
    }
}

/// Why a lifecycle operation failed. All of these surface to the caller as
/// results; none of them corrupts kernel state.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Error)]
pub enum ProcessError {
    #[error("no free physical page")]
    OutOfMemory,
    #[error("no free process slot")]
    NoFreeSlot,
    #[error("process slot {0} is already in use")]
    SlotInUse(Pid),
    #[error("no program with id {0}")]
    UnknownProgram(usize),
    #[error("address {0:#x} is not page-aligned")]
    MisalignedAddress(u64),
    #[error("address {0:#x} is outside the process's virtual range")]
    AddressOutOfBounds(u64),
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(u64),
}

impl From<MapError> for ProcessError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Release everything a partially or fully built space holds: user data
/// pages first, then the tree's own node pages.
fn destroy_space(mem: &mut PhysicalMemory, space: AddressSpace) {
    space.release_user_mappings(mem);
    space.release_table_pages(mem);
}

impl Kernel {
    /// Load program `program_id` as process `pid`: build a private address
    /// space with the kernel range cloned in, map and populate every
    /// loadable segment, give the process one stack page at the top of its
    /// virtual range, and mark it runnable.
    ///
    /// On failure nothing is created: every page reserved on the way is
    /// released again and the slot stays free.
    ///
    /// # Panics
    /// Panics when asked to create pid 0; that slot is structurally
    /// reserved and no caller may ever target it.
    pub fn create(&mut self, pid: Pid, program_id: usize) -> Result<(), ProcessError> {
        assert!(pid != Pid::IDLE, "process slot 0 is reserved");
        if self.processes.get(pid).state != ProcState::Free {
            return Err(ProcessError::SlotInUse(pid));
        }
        let program = loader::program(program_id).ok_or(ProcessError::UnknownProgram(program_id))?;

        let space = AddressSpace::new(&mut self.mem, PageOwner::Process(pid))?;
        let entry = match self.build_image(space, pid, program) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("create pid {pid}: {err}");
                destroy_space(&mut self.mem, space);
                return Err(err);
            }
        };

        let slot = self.processes.get_mut(pid);
        slot.space = Some(space);
        slot.regs = TrapFrame {
            rip: entry,
            rsp: info::MEMSIZE_VIRTUAL,
            ..TrapFrame::default()
        };
        slot.display = true;
        slot.state = ProcState::Runnable;
        debug!("created pid {pid} running '{}'", program.name);
        Ok(())
    }

    /// The fallible middle of [`create`](Self::create): kernel mappings,
    /// program segments, stack page. Returns the program entry point.
    fn build_image(
        &mut self,
        space: AddressSpace,
        pid: Pid,
        program: &Program,
    ) -> Result<u64, ProcessError> {
        space.clone_kernel_range(&mut self.mem, &self.kernel_space)?;
        let entry = loader::load(&mut self.mem, &space, pid, program)?;

        let stack_page = self
            .mem
            .alloc(PageOwner::Process(pid))
            .ok_or(ProcessError::OutOfMemory)?;
        let stack_va = VirtAddr::new(info::MEMSIZE_VIRTUAL - PAGE_SIZE);
        if let Err(err) = space.map(
            &mut self.mem,
            stack_va,
            stack_page.base(),
            PAGE_SIZE,
            PagePerms::USER_RW,
        ) {
            self.mem.release(stack_page);
            return Err(err.into());
        }
        Ok(entry)
    }

    /// Fork `parent` into a fresh slot.
    ///
    /// Read-only pages are shared: the child references the same physical
    /// page and the refcount goes up; immutable content is never copied.
    /// Writable pages are duplicated into pages owned by the child. The
    /// child starts from the parent's trap-time snapshot with its result
    /// register forced to 0.
    ///
    /// On failure no child exists and every page reserved or retained on
    /// the way has been released again.
    pub fn fork(&mut self, parent: Pid) -> Result<Pid, ProcessError> {
        let parent_space = self
            .processes
            .get(parent)
            .space
            .expect("fork caller must be a live process");
        let child = self.processes.free_slot().ok_or(ProcessError::NoFreeSlot)?;
        let owner = PageOwner::Process(child);

        let space = AddressSpace::new(&mut self.mem, owner)?;
        if let Err(err) = self.copy_address_space(space, &parent_space, owner) {
            warn!("fork of pid {parent}: {err}");
            destroy_space(&mut self.mem, space);
            return Err(err);
        }

        let parent_regs = self.processes.get(parent).regs;
        let parent_display = self.processes.get(parent).display;
        let slot = self.processes.get_mut(child);
        slot.space = Some(space);
        slot.regs = TrapFrame {
            rax: 0,
            ..parent_regs
        };
        slot.display = parent_display;
        slot.state = ProcState::Runnable;
        debug!("forked pid {parent} -> pid {child}");
        Ok(child)
    }

    /// Populate a fork child's space from the parent's: kernel clone, then
    /// share-or-copy every user mapping.
    fn copy_address_space(
        &mut self,
        space: AddressSpace,
        parent: &AddressSpace,
        owner: PageOwner,
    ) -> Result<(), ProcessError> {
        space.clone_kernel_range(&mut self.mem, &self.kernel_space)?;

        let mut va = VirtAddr::new(info::PROC_START_ADDR);
        while va.as_u64() < info::MEMSIZE_VIRTUAL {
            let mapping = parent.lookup(&self.mem, va);
            if let Some(page) = mapping.page() {
                let perms = mapping.perms();
                let target = if perms.contains(PagePerms::WRITABLE) {
                    let copy = self.mem.alloc(owner).ok_or(ProcessError::OutOfMemory)?;
                    self.mem.copy_page(page, copy);
                    copy
                } else {
                    self.mem.retain(page);
                    page
                };
                if let Err(err) = space.map(&mut self.mem, va, target.base(), PAGE_SIZE, perms) {
                    // The entry was never written, so the rollback walk
                    // cannot see this reference; drop it here.
                    self.mem.release(target);
                    return Err(err.into());
                }
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Tear down process `pid`: release every user data page and every
    /// page-table node exactly once, then mark the slot free.
    ///
    /// # Panics
    /// Panics on pid 0 or a slot that is already free; both mean the
    /// process table has been corrupted.
    pub fn free(&mut self, pid: Pid) {
        assert!(pid != Pid::IDLE, "process slot 0 can never be freed");
        let slot = self.processes.get_mut(pid);
        assert!(slot.state != ProcState::Free, "double free of pid {pid}");
        let space = slot
            .space
            .take()
            .expect("live process must own an address space");
        slot.state = ProcState::Free;
        slot.regs = TrapFrame::default();
        slot.display = false;

        destroy_space(&mut self.mem, space);
        self.adopt_orphaned_pages(pid);
        debug!("freed pid {pid}");
    }

    /// Pages the dead process shared read-only with forked relatives are
    /// still referenced, but their records name a dead owner. Pass
    /// ownership to a live process that maps them, keeping the rule that a
    /// process-owned page always belongs to a live process.
    fn adopt_orphaned_pages(&mut self, dead: Pid) {
        let orphans: alloc::vec::Vec<_> = self
            .mem
            .page_records()
            .filter(|(_, record)| {
                record.refcount > 0 && record.owner == PageOwner::Process(dead)
            })
            .map(|(pn, _)| pn)
            .collect();

        for pn in orphans {
            let heir = self
                .processes
                .iter()
                .filter(|p| p.state != ProcState::Free)
                .find_map(|p| {
                    let space = p.space?;
                    let mut va = VirtAddr::new(info::PROC_START_ADDR);
                    while va.as_u64() < info::MEMSIZE_VIRTUAL {
                        if space.lookup(&self.mem, va).page() == Some(pn) {
                            return Some(p.pid);
                        }
                        va += PAGE_SIZE;
                    }
                    None
                })
                .expect("referenced page must be mapped by some live process");
            self.mem.chown(pn, PageOwner::Process(heir));
        }
    }

    /// Map one fresh writable, user-accessible page at `addr` in `pid`'s
    /// space.
    ///
    /// Rejects misaligned addresses, addresses outside
    /// `[PROC_START_ADDR, MEMSIZE_VIRTUAL)`, and addresses that already
    /// have a mapping. Exhaustion surfaces as an error; the process keeps
    /// running either way.
    pub fn page_alloc(&mut self, pid: Pid, addr: u64) -> Result<(), ProcessError> {
        if addr % PAGE_SIZE != 0 {
            return Err(ProcessError::MisalignedAddress(addr));
        }
        if !(info::PROC_START_ADDR..info::MEMSIZE_VIRTUAL).contains(&addr) {
            return Err(ProcessError::AddressOutOfBounds(addr));
        }
        let space = self
            .processes
            .get(pid)
            .space
            .expect("page_alloc caller must be a live process");
        if space.lookup(&self.mem, VirtAddr::new(addr)).is_mapped() {
            return Err(ProcessError::AlreadyMapped(addr));
        }

        let page = self
            .mem
            .alloc(PageOwner::Process(pid))
            .ok_or(ProcessError::OutOfMemory)?;
        if let Err(err) = space.map(
            &mut self.mem,
            VirtAddr::new(addr),
            page.base(),
            PAGE_SIZE,
            PagePerms::USER_RW,
        ) {
            self.mem.release(page);
            return Err(err.into());
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes of `pid`'s memory at virtual address
    /// `va`, stopping at the first unmapped page. Returns the bytes read.
    /// Used by the panic syscall and by embedders inspecting a process.
    pub fn read_user_memory(&self, pid: Pid, va: u64, buf: &mut [u8]) -> usize {
        let Some(space) = self.processes.get(pid).space else {
            return 0;
        };
        let mut done = 0;
        while done < buf.len() {
            let at = VirtAddr::new(va + done as u64);
            let Some(pa) = space.lookup(&self.mem, at).phys_addr() else {
                break;
            };
            let chunk = ((PAGE_SIZE - at.page_offset()) as usize).min(buf.len() - done);
            self.mem.read_bytes(pa, &mut buf[done..done + chunk]);
            done += chunk;
        }
        done
    }
}

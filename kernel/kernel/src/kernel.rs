//! Kernel state and boot.

use alloc::format;
use alloc::vec::Vec;

use kernel_alloc::{PhysicalMemory, Pid};
use kernel_info::memory as info;
use kernel_memory_addresses::PageNumber;
use kernel_syscall::TrapFrame;
use kernel_vmem::AddressSpace;
use log::info;

use crate::memshow::{self, AbortSignal, MemshowRotation};
use crate::process::{ProcState, Process, ProcessError, ProcessTable};
use crate::scheduler;
use crate::vmcheck;

/// What the hardware should do after the dispatcher returns.
///
/// Dispatch and scheduling are pure state-machine steps; the embedding
/// loop performs the actual context transfer described by this value.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum NextAction {
    /// Restore this process's saved snapshot (see [`Kernel::frame`]) and
    /// continue in user mode. Its address space has been activated.
    Resume(Pid),
    /// No process is runnable. Poll the abort signal and call
    /// [`Kernel::reschedule`] again; the kernel spins like this forever by
    /// design; there is no idle process.
    Spin,
    /// The kernel has stopped: operator abort, kernel panic, or a fault in
    /// kernel mode. Nothing may run anymore.
    Halt,
}

/// Boot configuration: which programs to set up in which process slots,
/// and whether the memory visualizer starts enabled.
pub struct BootSpec {
    /// `(process slot, program id)` pairs, set up in order.
    pub spawn: Vec<(Pid, usize)>,
    /// Initial state of the global display flag.
    pub display: bool,
}

impl Default for BootSpec {
    /// The classic arrangement: processes 1–4 running the four built-in
    /// programs.
    fn default() -> Self {
        Self {
            spawn: (1..=4).map(|pid| (Pid::new(pid), pid - 1)).collect(),
            display: true,
        }
    }
}

/// The whole kernel: physical memory, the kernel address space, the
/// process table, and the dispatcher state. Mutated only with interrupts
/// off, i.e. only inside [`exception`](Self::exception) and the methods
/// it calls.
pub struct Kernel {
    pub(crate) mem: PhysicalMemory,
    pub(crate) kernel_space: AddressSpace,
    pub(crate) processes: ProcessTable,
    pub(crate) current: Pid,
    pub(crate) active_root: PageNumber,
    pub(crate) ticks: u64,
    pub(crate) display_global: bool,
    pub(crate) rotation: MemshowRotation,
    pub(crate) abort: AbortSignal,
}

impl Kernel {
    /// Initialize the machine: classify physical memory, build the kernel
    /// address space, clear the console, and set up the requested
    /// processes.
    ///
    /// # Errors
    /// Fails if any process cannot be fully set up; the error names the
    /// reason and nothing of that process remains allocated.
    pub fn boot(spec: &BootSpec) -> Result<Self, ProcessError> {
        let mut mem = PhysicalMemory::new();
        let kernel_space = AddressSpace::kernel_space(&mut mem);
        memshow::clear(&mut mem);

        let mut kernel = Self {
            mem,
            kernel_space,
            processes: ProcessTable::new(),
            current: Pid::IDLE,
            active_root: kernel_space.root(),
            ticks: 0,
            display_global: spec.display,
            rotation: MemshowRotation::default(),
            abort: AbortSignal::new(),
        };

        for &(pid, program_id) in &spec.spawn {
            kernel.create(pid, program_id)?;
        }
        vmcheck::check_virtual_memory(&kernel);
        info!("booted with {} process(es)", spec.spawn.len());
        Ok(kernel)
    }

    /// Transfer control to the first runnable process.
    #[must_use]
    pub fn start(&mut self) -> NextAction {
        self.schedule_next()
    }

    /// Pick and activate the next runnable process. Called by the
    /// embedding loop whenever the previous action was
    /// [`NextAction::Spin`].
    #[must_use]
    pub fn reschedule(&mut self) -> NextAction {
        self.schedule_next()
    }

    pub(crate) fn schedule_next(&mut self) -> NextAction {
        // An operator abort terminates the spin promptly.
        if self.abort.is_raised() {
            return NextAction::Halt;
        }
        match scheduler::select(&self.processes, self.current) {
            Some(pid) => self.run(pid),
            None => NextAction::Spin,
        }
    }

    /// Make `pid` current: re-validate and install its address space, and
    /// hand its snapshot to the embedding loop.
    ///
    /// # Panics
    /// Panics if the space fails the activation checks: resuming it would
    /// crash irrecoverably at the next interrupt with no way to handle it.
    pub(crate) fn run(&mut self, pid: Pid) -> NextAction {
        let process = self.processes.get(pid);
        assert!(process.state() == ProcState::Runnable);
        let space = process
            .space()
            .expect("runnable process must own an address space");
        if let Err(err) = space.check_activate(&self.mem, &self.kernel_space) {
            panic!("activating address space of pid {pid}: {err}");
        }

        self.current = pid;
        self.active_root = space.root();

        // Show the running pid in the console's last cell.
        let color = memshow::pid_color(pid);
        memshow::print_at(
            &mut self.mem,
            info::CONSOLE_ROWS - 1,
            info::CONSOLE_COLUMNS - 1,
            color & 0xFF00,
            &format!("{}", pid.as_usize() % 10),
        );

        NextAction::Resume(pid)
    }

    /// Refresh the visualizer: physical map always, plus the rotating
    /// per-process virtual map.
    pub(crate) fn memshow_refresh(&mut self) {
        memshow::memshow_physical(&mut self.mem);
        if let Some(pid) = self.rotation.animate(self.ticks, &self.processes) {
            let space = self.processes.get(pid).space().expect("live process");
            let name = format!("{pid} ");
            memshow::memshow_virtual(&mut self.mem, &space, &name);
        }
    }

    /// The saved register snapshot the embedding loop restores when
    /// resuming `pid`.
    #[must_use]
    pub fn frame(&self, pid: Pid) -> TrapFrame {
        self.processes.get(pid).regs
    }

    /// The process descriptor for `pid`.
    #[must_use]
    pub fn process(&self, pid: Pid) -> &Process {
        self.processes.get(pid)
    }

    /// The currently selected process.
    #[must_use]
    pub const fn current(&self) -> Pid {
        self.current
    }

    /// Timer ticks since boot.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Root node of the address space the hardware is translating through.
    #[must_use]
    pub const fn active_root(&self) -> PageNumber {
        self.active_root
    }

    /// The kernel's own address space.
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    /// Physical memory: the page records and the arena.
    #[must_use]
    pub const fn mem(&self) -> &PhysicalMemory {
        &self.mem
    }

    /// Mutable physical memory. This is the machine's memory bus: an
    /// embedder uses it to play the role of user code writing to its own
    /// pages.
    #[must_use]
    pub fn mem_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.mem
    }

    /// Whether the global memory-visualizer flag is set.
    #[must_use]
    pub const fn display_enabled(&self) -> bool {
        self.display_global
    }

    /// A clonable handle to the operator abort signal.
    #[must_use]
    pub fn abort_handle(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// One console character cell, for inspection.
    #[must_use]
    pub fn console_cell(&self, row: usize, col: usize) -> u16 {
        memshow::cell(&self.mem, row, col)
    }

    /// Run the full virtual-memory invariant checker now.
    ///
    /// # Panics
    /// Panics on any invariant violation; see the module docs of the
    /// checker.
    pub fn check_virtual_memory(&self) {
        vmcheck::check_virtual_memory(self);
    }
}

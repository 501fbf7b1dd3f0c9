//! The interrupt/syscall dispatcher: the kernel's single entry point.

use alloc::format;
use alloc::string::String;

use kernel_info::memory as info;
use kernel_memory_addresses::{PAGE_SIZE, VirtAddr};
use kernel_syscall::{
    INT_GPF, INT_PAGE_FAULT, INT_TIMER, MappingRecord, PANIC_MESSAGE_MAX, SYSCALL_FAILURE,
    Syscall, TrapFrame,
};
use kernel_vmem::PagePerms;
use log::{error, warn};

use crate::kernel::{Kernel, NextAction};
use crate::memshow;
use crate::process::ProcState;
use crate::vmcheck;

/// Console row used for fault diagnostics and panic messages.
const FAULT_ROW: usize = info::CONSOLE_ROWS - 1;

impl Kernel {
    /// Handle one interrupt, trap, or fault.
    ///
    /// `frame` is the interrupted process's register snapshot together with
    /// the interrupt number and error code. Hardware interrupts stay
    /// disabled for the whole call; they are re-enabled only as a side
    /// effect of the context transfer the returned [`NextAction`]
    /// describes.
    ///
    /// # Panics
    /// Panics if no process is current (a trap cannot arrive from nowhere)
    /// and on structural invariant violations detected on the way.
    pub fn exception(&mut self, frame: TrapFrame) -> NextAction {
        let pid = self.current;
        assert!(
            self.processes.get(pid).state() != ProcState::Free,
            "trap from a free process slot"
        );

        // Save the snapshot into the current descriptor and run the kernel
        // under its own known-safe mapping, whatever the process had
        // active.
        self.processes.get_mut(pid).regs = frame;
        self.active_root = self.kernel_space.root();

        // Refresh the debug view and check invariants, but not on a
        // kernel-mode fault, where the memory model itself is suspect.
        let fault = frame.intno == INT_PAGE_FAULT || frame.intno == INT_GPF;
        let kernel_fault = fault && !frame.fault_code().user();
        if !kernel_fault {
            vmcheck::check_virtual_memory(self);
            if self.display_global {
                self.memshow_refresh();
            }
        }

        // Operator abort beats everything else.
        if self.abort.is_raised() {
            return NextAction::Halt;
        }

        if let Ok(call) = Syscall::try_from(frame.intno) {
            match call {
                Syscall::Panic => return self.syscall_panic(&frame),
                Syscall::GetPid => {
                    self.processes.get_mut(pid).regs.rax = pid.as_usize() as u64;
                }
                Syscall::Yield => return self.schedule_next(),
                Syscall::Exit => {
                    self.free(pid);
                    return self.schedule_next();
                }
                Syscall::Fork => {
                    let result = match self.fork(pid) {
                        Ok(child) => child.as_usize() as u64,
                        Err(err) => {
                            warn!("fork by pid {pid}: {err}");
                            SYSCALL_FAILURE
                        }
                    };
                    self.processes.get_mut(pid).regs.rax = result;
                }
                Syscall::PageAlloc => {
                    let result = match self.page_alloc(pid, frame.rdi) {
                        Ok(()) => 0,
                        Err(err) => {
                            warn!("page_alloc by pid {pid}: {err}");
                            SYSCALL_FAILURE
                        }
                    };
                    self.processes.get_mut(pid).regs.rax = result;
                }
                Syscall::QueryMapping => self.syscall_mapping(&frame),
                Syscall::ToggleDisplay => self.syscall_display_toggle(&frame),
            }
        } else {
            match frame.intno {
                INT_TIMER => {
                    self.ticks += 1;
                    return self.schedule_next();
                }
                INT_PAGE_FAULT | INT_GPF => return self.handle_fault(&frame),
                _ => return self.unexpected_exception(&frame),
            }
        }

        // Still runnable: resume directly instead of consulting the
        // scheduler. Observably identical to being scheduled again.
        if self.processes.get(pid).state() == ProcState::Runnable {
            self.run(pid)
        } else {
            self.schedule_next()
        }
    }

    /// A page or protection fault. Kernel-mode faults stop the kernel;
    /// user-mode faults terminate only the offending process with a
    /// diagnostic.
    fn handle_fault(&mut self, frame: &TrapFrame) -> NextAction {
        let code = frame.fault_code();
        let kind = if frame.intno == INT_GPF {
            "protection fault"
        } else {
            "page fault"
        };
        let operation = if code.write() { "write" } else { "read" };
        let problem = if code.protection() {
            "protection problem"
        } else {
            "missing page"
        };

        if !code.user() {
            return self.fatal(&format!(
                "Kernel {kind} for {:#x} ({operation} {problem}, rip={:#x})!",
                frame.fault_addr, frame.rip
            ));
        }

        let pid = self.current;
        let message = format!(
            "Process {pid} {kind} for {:#x} ({operation} {problem}, rip={:#x})",
            frame.fault_addr, frame.rip
        );
        error!("{message}");
        memshow::print_at(&mut self.mem, FAULT_ROW, 0, 0x0C00, &message);

        self.free(pid);
        self.schedule_next()
    }

    /// The default diagnostic/termination path for vectors the kernel does
    /// not recognize.
    fn unexpected_exception(&mut self, frame: &TrapFrame) -> NextAction {
        let pid = self.current;
        let message = format!("Process {pid} unexpected exception {}", frame.intno);
        error!("{message}");
        memshow::print_at(&mut self.mem, FAULT_ROW, 0, 0x0C00, &message);
        self.free(pid);
        self.schedule_next()
    }

    /// The panic syscall: read a bounded message from the caller's memory
    /// (absent pointer means no message) and stop the kernel.
    fn syscall_panic(&mut self, frame: &TrapFrame) -> NextAction {
        if frame.rdi == 0 {
            return self.fatal("process panic");
        }
        let mut buf = [0u8; PANIC_MESSAGE_MAX];
        let got = self.read_user_memory(self.current, frame.rdi, &mut buf);
        let len = buf[..got].iter().position(|&b| b == 0).unwrap_or(got);
        let message = String::from_utf8_lossy(&buf[..len]).into_owned();
        self.fatal(&message)
    }

    /// Stop the whole kernel with a message. Never resumes anything.
    fn fatal(&mut self, message: &str) -> NextAction {
        error!("kernel panic: {message}");
        // Long messages clip at the row end rather than wrapping.
        memshow::print_at(&mut self.mem, FAULT_ROW, 0, 0x0C00, "KERNEL PANIC: ");
        memshow::print_at(&mut self.mem, FAULT_ROW, 14, 0x0C00, message);
        NextAction::Halt
    }

    /// The query-mapping syscall: write the looked-up mapping of the
    /// address in `rsi` into the caller's buffer at `rdi`, after checking
    /// the caller has user write access to the whole buffer, including the
    /// second page when it straddles a boundary. On any check failure,
    /// silently write nothing.
    fn syscall_mapping(&mut self, frame: &TrapFrame) {
        let Some(space) = self.processes.get(self.current).space() else {
            return;
        };
        let out_va = frame.rdi;
        let needed = PagePerms::USER_RW;

        let first = space.lookup(&self.mem, VirtAddr::new(out_va));
        if !first.perms().contains(needed) {
            return;
        }
        let Some(first_pa) = first.phys_addr() else {
            return;
        };

        let record = {
            let mapping = space.lookup(&self.mem, VirtAddr::new(frame.rsi));
            match (mapping.page(), mapping.phys_addr()) {
                (Some(pn), Some(pa)) => MappingRecord {
                    pn: pn.as_u64() as i64,
                    pa: pa.as_u64(),
                    perm: u64::from(mapping.perms().bits()),
                },
                _ => MappingRecord::unmapped(),
            }
        };
        let bytes = record.to_bytes();

        let end_va = out_va + MappingRecord::SIZE as u64 - 1;
        if VirtAddr::new(out_va).page_offset() + MappingRecord::SIZE as u64 <= PAGE_SIZE {
            self.mem.write_bytes(first_pa, &bytes);
        } else {
            let second = space.lookup(&self.mem, VirtAddr::new(end_va));
            if !second.perms().contains(needed) {
                return;
            }
            let Some(second_page) = second.page() else {
                return;
            };
            let split = (PAGE_SIZE - VirtAddr::new(out_va).page_offset()) as usize;
            self.mem.write_bytes(first_pa, &bytes[..split]);
            self.mem.write_bytes(second_page.base(), &bytes[split..]);
        }
    }

    /// The toggle-display syscall: argument 0 flips the global visualizer
    /// flag; a process's own pid flips its per-process flag; anything else
    /// is ignored.
    fn syscall_display_toggle(&mut self, frame: &TrapFrame) {
        if frame.rdi == 0 {
            self.display_global = !self.display_global;
        } else if frame.rdi == self.current.as_usize() as u64 {
            let process = self.processes.get_mut(self.current);
            process.display = !process.display;
        }
    }
}

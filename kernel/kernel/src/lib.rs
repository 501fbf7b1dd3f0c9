//! # The Kernel
//!
//! A minimal multiprogramming kernel for a single-core 64-bit machine: it
//! owns physical memory, builds per-process virtual address spaces, loads
//! and schedules a fixed set of processes, and dispatches every interrupt,
//! trap, and fault through one entry point.
//!
//! ## Control flow
//!
//! The machine is simulated, so control flow is explicit: a trap arrives as
//! a [`TrapFrame`](kernel_syscall::TrapFrame) value passed to
//! [`Kernel::exception`], and the dispatcher answers with a [`NextAction`]
//! telling the embedding loop what the hardware would do next: resume a
//! process (restore its snapshot), spin waiting for work, or halt. All
//! kernel code runs with interrupts disabled by construction: nothing can
//! re-enter the kernel while `exception` executes.
//!
//! ```
//! use kernel::{BootSpec, Kernel, NextAction};
//! use kernel_syscall::{Syscall, TrapFrame};
//!
//! let mut kernel = Kernel::boot(&BootSpec::default()).unwrap();
//! let NextAction::Resume(pid) = kernel.start() else {
//!     panic!("nothing to run");
//! };
//!
//! // The running process asks for its pid; process 1 runs first.
//! let action = kernel.exception(TrapFrame::syscall(Syscall::GetPid, 0, 0));
//! assert_eq!(action, NextAction::Resume(pid));
//! assert_eq!(kernel.frame(pid).rax, 1);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod interrupts;
mod kernel;
mod loader;
mod memshow;
mod process;
mod scheduler;
mod vmcheck;

pub use kernel::{BootSpec, Kernel, NextAction};
pub use kernel_alloc::{PageInfo, PageOwner, PhysicalMemory, Pid};
pub use kernel_memory_addresses::{PAGE_SIZE, PageNumber, PhysAddr, VirtAddr};
pub use kernel_vmem::{AddressSpace, MapError, Mapping, PagePerms};
pub use loader::{PROGRAM_COUNT, Program, Segment, program};
pub use memshow::AbortSignal;
pub use process::{ProcState, Process, ProcessError};

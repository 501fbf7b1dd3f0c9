//! Round-robin process selection.

use kernel_alloc::Pid;
use kernel_info::memory as info;

use crate::process::{ProcState, ProcessTable};

/// Pick the next runnable process, scanning circularly starting just after
/// `from`. A full circuit without a runnable slot yields `None`; the
/// dispatcher then spins (polling only the abort signal); this system has
/// no idle process.
///
/// Pure selection: installing the chosen process's address space and
/// restoring its snapshot is the dispatcher's job.
pub(crate) fn select(table: &ProcessTable, from: Pid) -> Option<Pid> {
    (1..=info::NPROC)
        .map(|step| Pid::new((from.as_usize() + step) % info::NPROC))
        .find(|&pid| table.get(pid).state() == ProcState::Runnable)
}

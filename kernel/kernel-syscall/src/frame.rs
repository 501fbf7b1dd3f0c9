//! The saved register snapshot carried into and out of every trap.

use crate::{INT_GPF, INT_PAGE_FAULT, INT_TIMER, PageFaultCode, Syscall};

/// Register state of the interrupted execution, as delivered to the
/// dispatcher and restored when a process is resumed.
///
/// Field order follows the hardware push sequence plus the general-purpose
/// registers the entry stub saves, together with the interrupt metadata the
/// dispatcher decodes (`intno`, `err`, `fault_addr`).
#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    /// Interrupt/trap vector number.
    pub intno: u64,
    /// Error code pushed with the trap (page/protection faults).
    pub err: u64,
    /// Faulting address for page faults (the CR2 snapshot).
    pub fault_addr: u64,
}

impl TrapFrame {
    /// The snapshot a software interrupt for `call` would deliver, with
    /// arguments in `rdi`/`rsi`.
    #[must_use]
    pub fn syscall(call: Syscall, arg0: u64, arg1: u64) -> Self {
        Self {
            rdi: arg0,
            rsi: arg1,
            intno: call as u64,
            ..Self::default()
        }
    }

    /// A timer interrupt snapshot.
    #[must_use]
    pub fn timer() -> Self {
        Self {
            intno: INT_TIMER,
            ..Self::default()
        }
    }

    /// A page-fault snapshot for `fault_addr` with the given error code.
    #[must_use]
    pub fn page_fault(fault_addr: u64, code: PageFaultCode) -> Self {
        Self {
            intno: INT_PAGE_FAULT,
            err: u64::from(u32::from(code)),
            fault_addr,
            ..Self::default()
        }
    }

    /// A general-protection-fault snapshot. `user` marks a fault taken in
    /// user mode.
    #[must_use]
    pub fn general_protection_fault(user: bool) -> Self {
        Self {
            intno: INT_GPF,
            err: u64::from(u32::from(PageFaultCode::new().with_user(user))),
            ..Self::default()
        }
    }

    /// The decoded page-fault error code.
    #[inline]
    #[must_use]
    pub fn fault_code(&self) -> PageFaultCode {
        PageFaultCode::from(self.err as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_frame_carries_args() {
        let frame = TrapFrame::syscall(Syscall::PageAlloc, 0x20_0000, 7);
        assert_eq!(frame.intno, 51);
        assert_eq!(frame.rdi, 0x20_0000);
        assert_eq!(frame.rsi, 7);
        assert_eq!(frame.rax, 0);
    }

    #[test]
    fn fault_frame_decodes_its_code() {
        let code = PageFaultCode::new().with_user(true).with_write(true);
        let frame = TrapFrame::page_fault(0xdead_f000, code);
        assert_eq!(frame.intno, INT_PAGE_FAULT);
        assert_eq!(frame.fault_addr, 0xdead_f000);
        assert!(frame.fault_code().user());
        assert!(frame.fault_code().write());
        assert!(!frame.fault_code().protection());
    }
}
